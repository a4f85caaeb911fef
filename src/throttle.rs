use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free gate capping the rate of outbound DNS resolutions. Unrelated to
/// host politeness: this protects the local resolver, not remote servers.
///
/// [`DnsThrottle::allow`] never blocks; a caller that is denied decides
/// itself whether to skip the resolution or retry later.
pub struct DnsThrottle {
    /// Minimum micros between permitted calls; 0 disables the gate.
    interval_micros: AtomicU64,
    /// Earliest permitted timestamp, micros since `start`.
    next_allowed_micros: AtomicU64,
    start: Instant,
}

impl DnsThrottle {
    pub fn new() -> Self {
        Self {
            interval_micros: AtomicU64::new(0),
            next_allowed_micros: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Set the cap. `rate_per_second == 0` or `enabled == false` disables it.
    pub fn configure(&self, enabled: bool, rate_per_second: u32) {
        let interval = if enabled && rate_per_second > 0 {
            1_000_000 / rate_per_second as u64
        } else {
            0
        };
        self.interval_micros.store(interval, Ordering::Relaxed);
    }

    /// Whether the caller may resolve now. On success the window is advanced
    /// atomically; losing a compare-and-swap race counts as a denial.
    pub fn allow(&self) -> bool {
        let interval = self.interval_micros.load(Ordering::Relaxed);
        if interval == 0 {
            return true;
        }
        let now = self.start.elapsed().as_micros() as u64;
        let next = self.next_allowed_micros.load(Ordering::Acquire);
        if now < next {
            return false;
        }
        self.next_allowed_micros
            .compare_exchange(next, now + interval, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for DnsThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_disabled_always_allows() {
        let gate = DnsThrottle::new();
        for _ in 0..100 {
            assert!(gate.allow());
        }
        gate.configure(false, 1000);
        assert!(gate.allow());
    }

    #[test]
    fn test_rate_is_enforced() {
        let gate = DnsThrottle::new();
        gate.configure(true, 10); // one permit per 100ms
        assert!(gate.allow());
        assert!(!gate.allow());
        std::thread::sleep(std::time::Duration::from_millis(120));
        assert!(gate.allow());
    }

    #[test]
    fn test_concurrent_callers_one_winner_per_window() {
        let gate = Arc::new(DnsThrottle::new());
        gate.configure(true, 1); // one permit per second
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(std::thread::spawn(move || gate.allow()));
        }
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(granted, 1);
    }
}
