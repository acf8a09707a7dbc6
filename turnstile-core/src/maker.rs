use parking_lot::Mutex;
use turnstile_crypto::{
    cookie_key, mac1_key, message_mac1, message_mac2, Cookie, CookieReply, Key, Mac, Macs,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::clock::Instant;
use crate::{Error, COOKIE_SECRET_LATENCY, COOKIE_SECRET_MAX_AGE};

/// Initiator-side state for one remote peer: stamps outgoing handshake
/// messages with their MAC pair and ingests the encrypted cookie replies
/// the peer may answer with.
pub struct CookieMaker {
    mac1_key: Key,
    cookie_key: Key,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// MAC1 of the last message stamped; the additional data a cookie
    /// reply must authenticate against. Cleared once a reply is consumed.
    last_mac1: Option<Mac>,
    cookie: Option<StoredCookie>,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct StoredCookie {
    value: Cookie,
    #[zeroize(skip)]
    birth: Instant,
}

impl CookieMaker {
    /// `input` is the remote peer's 32-byte identity value.
    pub fn new(input: &[u8; 32]) -> Self {
        Self {
            mac1_key: mac1_key(input),
            cookie_key: cookie_key(input),
            state: Mutex::new(State::default()),
        }
    }

    /// Stamp `msg` with its MAC pair. MAC2 stays zero until a cookie reply
    /// has been consumed, and reverts to zero once the stored cookie is too
    /// old for the responder to still accept it.
    pub fn mac(&self, msg: &[u8]) -> Macs {
        let mut macs = Macs::default();
        let mut state = self.state.lock();

        macs.mac1 = message_mac1(&self.mac1_key, msg);
        state.last_mac1 = Some(macs.mac1);

        if let Some(cookie) = state.fresh_cookie() {
            macs.mac2 = message_mac2(cookie, msg, &macs.mac1);
        }

        macs
    }

    /// Decrypt a cookie reply and keep the cookie for future MAC2s. Each
    /// emitted MAC1 can redeem at most one reply.
    pub fn consume_reply(&self, reply: &CookieReply) -> Result<(), Error> {
        let mut state = self.state.lock();
        let Some(mac1) = state.last_mac1 else {
            return Err(Error::StaleCookie);
        };

        let mut sealed = reply.cookie;
        let cookie = sealed
            .open(&self.cookie_key, &reply.nonce, &mac1)
            .map_err(|_| Error::InvalidCookie)?;

        state.cookie = Some(StoredCookie {
            value: *cookie,
            birth: Instant::now(),
        });
        state.last_mac1 = None;
        cookie.0.zeroize();

        Ok(())
    }
}

impl State {
    /// The stored cookie, if it is still inside the window the responder
    /// will accept. We stop using a cookie a few seconds before the
    /// responder rotates its secret so a MAC2 cannot expire in flight.
    fn fresh_cookie(&mut self) -> Option<&Cookie> {
        let expired = match &self.cookie {
            Some(stored) => stored.birth.elapsed() > COOKIE_SECRET_MAX_AGE - COOKIE_SECRET_LATENCY,
            None => return None,
        };
        if expired {
            self.cookie = None;
            return None;
        }
        self.cookie.as_ref().map(|stored| &stored.value)
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::FromZeroes;

    use super::*;

    #[test]
    fn mac2_is_zero_without_a_cookie() {
        let maker = CookieMaker::new(&[0x2f; 32]);
        let macs = maker.mac(b"handshake initiation");
        assert_ne!(macs.mac1, [0u8; 16]);
        assert_eq!(macs.mac2, [0u8; 16]);
    }

    #[test]
    fn reply_without_pending_mac1_is_stale() {
        let maker = CookieMaker::new(&[0x2f; 32]);
        let reply = CookieReply::new_zeroed();
        assert_eq!(maker.consume_reply(&reply), Err(Error::StaleCookie));
    }

    #[test]
    fn garbage_reply_is_invalid() {
        let maker = CookieMaker::new(&[0x2f; 32]);
        maker.mac(b"handshake initiation");
        let reply = CookieReply::new_zeroed();
        assert_eq!(maker.consume_reply(&reply), Err(Error::InvalidCookie));
    }
}
