use std::hash::Hasher;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use siphasher::sip::SipHasher13;

use crate::clock::Instant;
use crate::pool::Pool;
use crate::timer::GcTimer;

/// Sustained handshake initiations per second one source prefix may emit.
const INITIATIONS_PER_SECOND: u64 = 20;
/// Extra initiations a prefix may burst after idling.
const INITIATIONS_BURSTABLE: u64 = 5;
/// Tokens are elapsed time; one admission spends this much of it.
const INITIATION_COST: Duration = Duration::from_millis(1000 / INITIATIONS_PER_SECOND);
/// Accrual cap, sized so an idle prefix can afford exactly one burst.
const TOKEN_MAX: Duration =
    Duration::from_millis((1000 / INITIATIONS_PER_SECOND) * INITIATIONS_BURSTABLE);
/// Idle time after which an entry is collected.
const ELEMENT_TIMEOUT: Duration = Duration::from_secs(1);
/// Bucket count; must stay a power of two for mask indexing.
const TABLE_SIZE: usize = 8192;
/// Hard cap on live entries in one table, and on the shared pool.
const MAX_ENTRIES: usize = 65536;

/// Aggregation key: the full address for IPv4, the /64 for IPv6.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Prefix {
    V4([u8; 4]),
    V6([u8; 8]),
}

impl Prefix {
    fn bytes(&self) -> &[u8] {
        match self {
            Prefix::V4(bytes) => bytes,
            Prefix::V6(bytes) => bytes,
        }
    }
}

impl From<IpAddr> for Prefix {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Prefix::V4(ip.octets()),
            IpAddr::V6(ip) => {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&ip.octets()[..8]);
                Prefix::V6(prefix)
            }
        }
    }
}

pub(crate) struct Node {
    pub(crate) prefix: Prefix,
    pub(crate) last_time: Instant,
    pub(crate) tokens: Duration,
    pub(crate) next: Option<Box<Node>>,
}

struct Table {
    buckets: Box<[Option<Box<Node>>]>,
    len: usize,
    gc_armed: bool,
}

/// Token-bucket admission control, keyed by source prefix. One lock covers
/// the whole table: entries, the live count, and the gc arming flag.
pub struct RateLimiter {
    secret: [u8; 16],
    table: Arc<Mutex<Table>>,
    pool: Arc<Pool>,
    timer: GcTimer,
}

impl RateLimiter {
    fn new(pool: Arc<Pool>) -> Self {
        let mut secret = [0u8; 16];
        OsRng.fill_bytes(&mut secret);

        let table = Arc::new(Mutex::new(Table {
            buckets: (0..TABLE_SIZE).map(|_| None).collect(),
            len: 0,
            gc_armed: false,
        }));

        let timer = GcTimer::spawn({
            let table = Arc::clone(&table);
            let pool = Arc::clone(&pool);
            move |rearm| {
                if gc(&table, &pool, false) {
                    rearm.rearm(ELEMENT_TIMEOUT);
                }
            }
        });

        Self {
            secret,
            table,
            pool,
            timer,
        }
    }

    /// Admission check for one handshake initiation from `ip`.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.admit(Prefix::from(ip))
    }

    /// Live entries in the table.
    pub fn len(&self) -> usize {
        self.table.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn admit(&self, prefix: Prefix) -> bool {
        let index = self.bucket(prefix);
        let now = Instant::now();
        let mut guard = self.table.lock();
        let table = &mut *guard;

        let mut cur = table.buckets[index].as_deref_mut();
        while let Some(node) = cur {
            if node.prefix == prefix {
                // A bucket refills by merely existing, capped so an idle
                // source cannot hoard more than one burst.
                let accrued = now.duration_since(node.last_time);
                node.last_time = now;
                node.tokens = (node.tokens + accrued).min(TOKEN_MAX);
                return if node.tokens >= INITIATION_COST {
                    node.tokens -= INITIATION_COST;
                    true
                } else {
                    false
                };
            }
            cur = node.next.as_deref_mut();
        }

        if table.len >= MAX_ENTRIES {
            return false;
        }
        let Some(mut node) = self.pool.alloc(Node {
            prefix,
            last_time: now,
            tokens: TOKEN_MAX - INITIATION_COST,
            next: None,
        }) else {
            return false;
        };

        node.next = table.buckets[index].take();
        table.buckets[index] = Some(node);
        table.len += 1;
        if !table.gc_armed {
            table.gc_armed = true;
            self.timer.schedule(ELEMENT_TIMEOUT);
        }
        true
    }

    fn bucket(&self, prefix: Prefix) -> usize {
        let mut hasher = SipHasher13::new_with_key(&self.secret);
        hasher.write(prefix.bytes());
        (hasher.finish() & (TABLE_SIZE as u64 - 1)) as usize
    }

    #[cfg(all(test, feature = "mock-instant"))]
    pub(crate) fn sweep(&self, force: bool) {
        gc(&self.table, &self.pool, force);
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        // Timer first, so no pass can race the final sweep.
        self.timer.stop();
        gc(&self.table, &self.pool, true);
    }
}

/// One collection pass. Returns true when entries remain and the timer
/// must be re-armed.
fn gc(table: &Mutex<Table>, pool: &Pool, force: bool) -> bool {
    let now = Instant::now();
    let mut guard = table.lock();
    let table = &mut *guard;
    table.gc_armed = false;

    let mut evicted = 0usize;
    for slot in table.buckets.iter_mut() {
        let mut list = slot.take();
        while let Some(mut node) = list {
            list = node.next.take();
            let idle = now.checked_duration_since(node.last_time);
            if force || matches!(idle, Some(idle) if idle > ELEMENT_TIMEOUT) {
                pool.recycle(node);
                evicted += 1;
            } else {
                node.next = slot.take();
                *slot = Some(node);
            }
        }
    }
    table.len -= evicted;

    if evicted > 0 {
        tracing::debug!(evicted, remaining = table.len, "collected idle rate limit entries");
    }
    if table.len > 0 {
        table.gc_armed = true;
        true
    } else {
        false
    }
}

/// The per-family limiters behind a busy responder, sharing one bounded
/// node pool.
pub struct RateLimiters {
    v4: RateLimiter,
    v6: RateLimiter,
}

impl RateLimiters {
    pub fn new() -> Self {
        let pool = Arc::new(Pool::new(MAX_ENTRIES));
        Self {
            v4: RateLimiter::new(Arc::clone(&pool)),
            v6: RateLimiter::new(pool),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.v4.allow(ip),
            IpAddr::V6(_) => self.v6.allow(ip),
        }
    }

    /// Live entries across both families.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    #[cfg(all(test, feature = "mock-instant"))]
    pub(crate) fn sweep(&self, force: bool) {
        self.v4.sweep(force);
        self.v6.sweep(force);
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn v6_prefixes_keep_the_top_eight_bytes() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(
            Prefix::from(ip),
            Prefix::V6([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0])
        );
    }

    #[test]
    fn burst_then_refill() {
        let limiters = RateLimiters::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiters.allow(ip));
        }
        assert!(!limiters.allow(ip));

        #[cfg(not(feature = "mock-instant"))]
        std::thread::sleep(Duration::from_millis(60));
        #[cfg(feature = "mock-instant")]
        mock_instant::MockClock::advance(Duration::from_millis(50));

        assert!(limiters.allow(ip));
    }

    #[test]
    fn table_never_exceeds_its_cap() {
        let limiters = RateLimiters::new();
        let mut allowed = 0usize;
        for i in 0..(MAX_ENTRIES + 64) {
            let ip = IpAddr::V4(Ipv4Addr::from(0x0a00_0000u32 + i as u32));
            if limiters.allow(ip) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, MAX_ENTRIES);
        assert_eq!(limiters.len(), MAX_ENTRIES);

        // both families drain the same pool
        assert!(!limiters.allow("2001:db8::1".parse::<IpAddr>().unwrap()));
    }

    #[cfg(not(feature = "mock-instant"))]
    #[test]
    fn idle_entries_are_collected() {
        let limiters = RateLimiters::new();
        assert!(limiters.allow("10.1.2.3".parse::<IpAddr>().unwrap()));
        assert_eq!(limiters.len(), 1);

        std::thread::sleep(Duration::from_millis(1600));
        assert_eq!(limiters.len(), 0);
    }

    #[cfg(feature = "mock-instant")]
    #[test]
    fn idle_entries_are_swept() {
        let limiters = RateLimiters::new();
        assert!(limiters.allow("10.9.9.9".parse::<IpAddr>().unwrap()));

        mock_instant::MockClock::advance(Duration::from_secs(2));
        limiters.sweep(false);
        assert_eq!(limiters.len(), 0);
    }
}
