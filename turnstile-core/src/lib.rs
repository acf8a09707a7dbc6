//! Denial-of-service defense for a point-to-point tunnel handshake: MAC
//! validation with encrypted cookie challenges, plus per-source-prefix
//! rate limiting for a responder under load.

use std::time::Duration;

pub mod checker;
pub mod maker;
pub mod ratelimit;

mod pool;
mod timer;

pub use checker::CookieChecker;
pub use maker::CookieMaker;
pub use ratelimit::{RateLimiter, RateLimiters};
pub use turnstile_crypto::{Cookie, CookieReply, EncryptedCookie, Mac, Macs};

/// Cookie secrets (and with them, issued cookies) live this long.
pub(crate) const COOKIE_SECRET_MAX_AGE: Duration = Duration::from_secs(120);
/// Margin an initiator keeps so a cookie cannot expire in flight.
pub(crate) const COOKIE_SECRET_LATENCY: Duration = Duration::from_secs(5);

pub(crate) mod clock {
    #[cfg(feature = "mock-instant")]
    pub(crate) use mock_instant::Instant;
    #[cfg(not(feature = "mock-instant"))]
    pub(crate) use std::time::Instant;
}

/// Distinct outcomes the enclosing handshake machine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The first MAC did not verify; drop the message without a response.
    InvalidMac,
    /// A cookie reply failed to authenticate against the pending MAC1.
    InvalidCookie,
    /// A cookie reply arrived while no MAC1 was outstanding.
    StaleCookie,
    /// Second MAC missing or wrong under load; answer with a cookie reply.
    CookieRequired,
    /// The source prefix is over budget, or the table is out of room.
    RateLimited,
}
