#![no_std]

use core::net::{IpAddr, SocketAddr};

use blake2::digest::consts::U16;
use blake2::digest::Digest;
use blake2::Blake2s256;
use rand_core::{CryptoRng, RngCore};
use zerocopy::{AsBytes, FromBytes, FromZeroes};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(test)]
extern crate std;

pub const LABEL_MAC1: [u8; 8] = *b"mac1----";
pub const LABEL_COOKIE: [u8; 8] = *b"cookie--";

/// 32-byte key, used both for the keyed MACs and the cookie AEAD.
pub type Key = [u8; 32];
/// 16-byte message authentication tag.
pub type Mac = [u8; 16];

pub const NONCE_LEN: usize = 24;

#[derive(Debug, PartialEq, Eq)]
pub enum CryptoError {
    Decryption,
}

fn hash<const M: usize>(msg: [&[u8]; M]) -> [u8; 32] {
    let mut digest = Blake2s256::default();
    for msg in msg {
        digest.update(msg);
    }
    digest.finalize().into()
}

/// Keyed BLAKE2s with a 16-byte output over the concatenation of `msg`.
pub fn mac<const M: usize>(key: &[u8], msg: [&[u8]; M]) -> Mac {
    use blake2::digest::Mac;
    let mut mac = blake2::Blake2sMac::<U16>::new_from_slice(key).unwrap();
    for msg in msg {
        mac.update(msg);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time tag comparison.
pub fn mac_eq(a: &Mac, b: &Mac) -> bool {
    use subtle::ConstantTimeEq;
    a[..].ct_eq(&b[..]).into()
}

pub fn mac1_key(input: &[u8; 32]) -> Key {
    hash([&LABEL_MAC1, input])
}
pub fn cookie_key(input: &[u8; 32]) -> Key {
    hash([&LABEL_COOKIE, input])
}

/// First MAC of an outgoing message, keyed with the receiver's mac1 key.
pub fn message_mac1(key: &Key, msg: &[u8]) -> Mac {
    mac(key, [msg])
}

/// Second MAC, keyed with a cookie. The first MAC is absorbed after the
/// body, so a MAC2 never outlives the MAC1 it answers.
pub fn message_mac2(cookie: &Cookie, msg: &[u8], mac1: &Mac) -> Mac {
    mac(&cookie.0, [msg, mac1])
}

/// Proof of endpoint ownership handed out by a busy responder.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes, Zeroize)]
#[repr(transparent)]
pub struct Cookie(pub Mac);

#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Tag(pub [u8; 16]);

/// The two authentication tags trailing every handshake message.
#[derive(Clone, Copy, Default, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct Macs {
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Cookie ciphertext and its AEAD tag, as carried in a cookie reply.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct EncryptedCookie {
    msg: Cookie,
    tag: Tag,
}

/// Body of a cookie reply: the random nonce and the sealed cookie.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct CookieReply {
    pub nonce: [u8; NONCE_LEN],
    pub cookie: EncryptedCookie,
}

impl EncryptedCookie {
    /// Seal a cookie under XChaCha20-Poly1305, binding it via the
    /// additional data to the MAC1 it answers.
    pub fn seal(mut cookie: Cookie, key: &Key, nonce: &[u8; NONCE_LEN], aad: &[u8]) -> Self {
        use chacha20poly1305::{AeadInPlace, KeyInit, XChaCha20Poly1305};

        let tag = XChaCha20Poly1305::new(key.into())
            .encrypt_in_place_detached(nonce.into(), aad, &mut cookie.0)
            .expect("cookie should not be larger than max message size");

        Self {
            msg: cookie,
            tag: Tag(tag.into()),
        }
    }

    pub fn open(
        &mut self,
        key: &Key,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
    ) -> Result<&mut Cookie, CryptoError> {
        use chacha20poly1305::{AeadInPlace, KeyInit, XChaCha20Poly1305};

        XChaCha20Poly1305::new(key.into())
            .decrypt_in_place_detached(nonce.into(), aad, &mut self.msg.0, (&self.tag.0).into())
            .map_err(|_| CryptoError::Decryption)?;

        Ok(&mut self.msg)
    }
}

/// Rotating responder secret from which per-endpoint cookies are derived.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct CookieSecret {
    key: [u8; 32],
}

impl CookieSecret {
    pub fn generate(&mut self, rng: &mut (impl CryptoRng + RngCore)) {
        rng.fill_bytes(&mut self.key);
    }

    /// Cookie for a remote endpoint: keyed BLAKE2s over the raw address
    /// bytes followed by the port in network byte order.
    pub fn cookie_for(&self, addr: SocketAddr) -> Cookie {
        let port = addr.port().to_be_bytes();
        match addr.ip() {
            IpAddr::V4(ip) => Cookie(mac(&self.key, [&ip.octets()[..], &port[..]])),
            IpAddr::V6(ip) => Cookie(mac(&self.key, [&ip.octets()[..], &port[..]])),
        }
    }
}
