use std::net::SocketAddr;

use parking_lot::{Mutex, RwLock};
use rand_core::{OsRng, RngCore};
use turnstile_crypto::{
    cookie_key, mac1_key, mac_eq, message_mac1, message_mac2, Cookie, CookieReply, CookieSecret,
    EncryptedCookie, Key, Mac, Macs, NONCE_LEN,
};
use zeroize::Zeroize;

use crate::clock::Instant;
use crate::ratelimit::RateLimiters;
use crate::{Error, COOKIE_SECRET_MAX_AGE};

/// Responder-side half of the cookie exchange: validates the MAC pair on
/// incoming handshake messages and manufactures encrypted cookie
/// challenges while the machine is under load.
pub struct CookieChecker {
    keys: RwLock<Keys>,
    secret: Mutex<RotatingSecret>,
}

#[derive(Default)]
struct Keys {
    mac1_key: Key,
    cookie_key: Key,
}

#[derive(Default)]
struct RotatingSecret {
    secret: CookieSecret,
    birth: Option<Instant>,
}

impl CookieChecker {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(Keys::default()),
            secret: Mutex::new(RotatingSecret::default()),
        }
    }

    /// Derive the MAC keys from the local identity input, or wipe them when
    /// `input` is `None` (everything is rejected until keys return).
    pub fn update(&self, input: Option<&[u8; 32]>) {
        let mut keys = self.keys.write();
        keys.mac1_key.zeroize();
        keys.cookie_key.zeroize();
        if let Some(input) = input {
            keys.mac1_key = mac1_key(input);
            keys.cookie_key = cookie_key(input);
        }
    }

    /// Check the MAC pair on an incoming handshake message. `msg` is the
    /// part of the message the MACs cover, i.e. everything before MAC1.
    ///
    /// `busy` turns on MAC2 enforcement and rate limiting; the caller
    /// decides when the responder counts as loaded.
    pub fn validate_macs(
        &self,
        msg: &[u8],
        macs: &Macs,
        busy: bool,
        src: SocketAddr,
        limiters: &RateLimiters,
    ) -> Result<(), Error> {
        {
            let keys = self.keys.read();
            let expected = message_mac1(&keys.mac1_key, msg);
            if !mac_eq(&expected, &macs.mac1) {
                tracing::trace!(%src, "message carries an invalid mac1");
                return Err(Error::InvalidMac);
            }
        }

        if !busy {
            return Ok(());
        }

        let mut cookie = self.make_cookie(src);
        let expected = message_mac2(&cookie, msg, &macs.mac1);
        cookie.0.zeroize();
        if !mac_eq(&expected, &macs.mac2) {
            tracing::trace!(%src, "mac2 does not match the current cookie");
            return Err(Error::CookieRequired);
        }

        if limiters.allow(src.ip()) {
            Ok(())
        } else {
            Err(Error::RateLimited)
        }
    }

    /// Build the encrypted cookie reply for a message whose MAC1 was just
    /// observed; the reply only opens against that same MAC1.
    pub fn create_reply(&self, mac1: &Mac, src: SocketAddr) -> CookieReply {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut cookie = self.make_cookie(src);
        let sealed = {
            let keys = self.keys.read();
            EncryptedCookie::seal(cookie, &keys.cookie_key, &nonce, mac1)
        };
        cookie.0.zeroize();

        CookieReply {
            nonce,
            cookie: sealed,
        }
    }

    /// Cookie for `src` under the current secret. The secret regrows once
    /// it passes two minutes; the lock is held only for the staleness check
    /// and a copy, never across the hashing.
    pub(crate) fn make_cookie(&self, src: SocketAddr) -> Cookie {
        let secret = {
            let mut guard = self.secret.lock();
            let stale = guard
                .birth
                .map_or(true, |birth| birth.elapsed() > COOKIE_SECRET_MAX_AGE);
            if stale {
                guard.secret.generate(&mut OsRng);
                guard.birth = Some(Instant::now());
                tracing::debug!("rotated the cookie secret");
            }
            guard.secret.clone()
        };
        secret.cookie_for(src)
    }
}

impl Default for CookieChecker {
    fn default() -> Self {
        Self::new()
    }
}
