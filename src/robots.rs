use url::Url;

/// Boundary to the robots.txt subsystem. Retrieval and parsing live outside
/// the scheduler; the balancers only need the crawl-delay answer and a way to
/// trigger a background prefetch when a new host shows up.
pub trait RobotsHints: Send + Sync {
    /// Crawl-delay for this URL's host from an already-fetched robots.txt,
    /// or `None` when no robots entry (or no delay directive) exists.
    fn crawl_delay_ms(&self, url: &Url, agent: &str) -> Option<u64>;

    /// Make sure a robots.txt record exists or is being fetched for this
    /// URL's host. Must not block; implementations typically hand the fetch
    /// to their own worker pool.
    fn ensure_exist(&self, _url: &Url, _agent: &str) {}
}

/// Robots boundary that knows nothing and fetches nothing.
pub struct NoRobots;

impl RobotsHints for NoRobots {
    fn crawl_delay_ms(&self, _url: &Url, _agent: &str) -> Option<u64> {
        None
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed per-host crawl delays, counting prefetch requests.
    pub struct FixedRobots {
        delays: HashMap<String, u64>,
        pub ensure_calls: AtomicUsize,
    }

    impl FixedRobots {
        pub fn new(delays: HashMap<String, u64>) -> Self {
            Self {
                delays,
                ensure_calls: AtomicUsize::new(0),
            }
        }
    }

    impl RobotsHints for FixedRobots {
        fn crawl_delay_ms(&self, url: &Url, _agent: &str) -> Option<u64> {
            url.host_str().and_then(|h| self.delays.get(h).copied())
        }

        fn ensure_exist(&self, _url: &Url, _agent: &str) {
            self.ensure_calls.fetch_add(1, Ordering::Relaxed);
        }
    }
}
