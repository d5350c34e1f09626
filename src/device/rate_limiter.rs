//! Handshake rate limiting
//!
//! Two gates, both applied only while the device is under load: a
//! per-source-IP packets-per-second token bucket, and the under-load latch
//! itself, driven by the handshake queue depth with one second of
//! hysteresis.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default sustained handshake rate per source IP
pub const DEFAULT_RATE_PPS: u64 = 20;

/// Default burst allowance per source IP
pub const DEFAULT_BURST: u64 = 5;

/// Buckets idle longer than this are garbage collected
const IDLE_EXPIRY: Duration = Duration::from_secs(10);

/// Stay under load for this long after the queue drains
const UNDER_LOAD_HOLD: Duration = Duration::from_secs(1);

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn take(&mut self, rate: u64, burst: u64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate as f64).min(burst as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-source-IP token buckets, split by address family
pub struct RateLimiter {
    rate_pps: u64,
    burst: u64,
    buckets_v4: Mutex<HashMap<IpAddr, TokenBucket>>,
    buckets_v6: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(rate_pps: u64, burst: u64) -> Self {
        Self {
            rate_pps,
            burst,
            buckets_v4: Mutex::new(HashMap::new()),
            buckets_v6: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self, ip: IpAddr) -> &Mutex<HashMap<IpAddr, TokenBucket>> {
        if ip.is_ipv4() {
            &self.buckets_v4
        } else {
            &self.buckets_v6
        }
    }

    /// Whether a handshake frame from `ip` is admitted right now
    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut table = self.table(ip).lock();
        let bucket = table.entry(ip).or_insert(TokenBucket {
            tokens: self.burst as f64,
            last_update: now,
        });
        bucket.take(self.rate_pps, self.burst, now)
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    /// Drop buckets that refilled completely and sat idle
    pub fn collect_garbage_at(&self, now: Instant) {
        for table in [&self.buckets_v4, &self.buckets_v6] {
            table
                .lock()
                .retain(|_, b| now.saturating_duration_since(b.last_update) < IDLE_EXPIRY);
        }
    }

    pub fn collect_garbage(&self) {
        self.collect_garbage_at(Instant::now());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_PPS, DEFAULT_BURST)
    }
}

/// Device-wide under-load latch
///
/// Set when the handshake queue fills past the high-water mark, and held for
/// at least [`UNDER_LOAD_HOLD`] after it last did.
pub struct LoadMonitor {
    high_water: usize,
    under_load_until: Mutex<Option<Instant>>,
}

impl LoadMonitor {
    pub fn new(high_water: usize) -> Self {
        Self {
            high_water,
            under_load_until: Mutex::new(None),
        }
    }

    /// Record the current handshake queue depth
    pub fn observe_at(&self, queue_len: usize, now: Instant) {
        if queue_len >= self.high_water {
            *self.under_load_until.lock() = Some(now + UNDER_LOAD_HOLD);
        }
    }

    pub fn observe(&self, queue_len: usize) {
        self.observe_at(queue_len, Instant::now());
    }

    pub fn is_under_load_at(&self, now: Instant) -> bool {
        self.under_load_until.lock().is_some_and(|until| now < until)
    }

    pub fn is_under_load(&self) -> bool {
        self.is_under_load_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn burst_then_refill() {
        // rate = 20 pps, burst = 5: of 14 instantaneous packets the first 5
        // pass; one more passes after 1/20 s.
        let limiter = RateLimiter::new(20, 5);
        let t0 = Instant::now();

        let sources: Vec<IpAddr> = (1..=14).map(ip).collect();
        for &src in &sources {
            let accepted = (0..14).filter(|_| limiter.allow_at(src, t0)).count();
            assert_eq!(accepted, 5);
        }

        let t1 = t0 + Duration::from_millis(50);
        for &src in &sources {
            assert!(limiter.allow_at(src, t1));
            assert!(!limiter.allow_at(src, t1));
        }
    }

    #[test]
    fn sources_are_independent() {
        let limiter = RateLimiter::new(20, 5);
        let t0 = Instant::now();

        for _ in 0..5 {
            assert!(limiter.allow_at(ip(1), t0));
        }
        assert!(!limiter.allow_at(ip(1), t0));

        // A different source still has its full burst
        assert!(limiter.allow_at(ip(2), t0));
    }

    #[test]
    fn refill_caps_at_burst() {
        let limiter = RateLimiter::new(20, 5);
        let t0 = Instant::now();
        assert!(limiter.allow_at(ip(1), t0));

        // A long quiet period refills to burst, not beyond
        let t1 = t0 + Duration::from_secs(3600);
        let accepted = (0..20).filter(|_| limiter.allow_at(ip(1), t1)).count();
        assert_eq!(accepted, 5);
    }

    #[test]
    fn garbage_collection_drops_idle() {
        let limiter = RateLimiter::new(20, 5);
        let t0 = Instant::now();
        limiter.allow_at(ip(1), t0);
        limiter.allow_at(ip(2), t0);

        limiter.collect_garbage_at(t0 + Duration::from_secs(60));
        assert!(limiter.buckets_v4.lock().is_empty());
    }

    #[test]
    fn load_latch_hysteresis() {
        let monitor = LoadMonitor::new(8);
        let t0 = Instant::now();

        assert!(!monitor.is_under_load_at(t0));

        monitor.observe_at(8, t0);
        assert!(monitor.is_under_load_at(t0));

        // Still latched shortly after the queue drained
        monitor.observe_at(0, t0 + Duration::from_millis(500));
        assert!(monitor.is_under_load_at(t0 + Duration::from_millis(900)));

        // Released after the hold expires
        assert!(!monitor.is_under_load_at(t0 + Duration::from_millis(1100)));
    }
}
