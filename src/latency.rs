use dashmap::DashMap;
use tracing::trace;
use url::Url;

use crate::config::Config;
use crate::profile::CrawlProfile;
use crate::request::HostHash;
use crate::robots::RobotsHints;

/// Remaining wait before a host may be fetched again. Negative millis mean
/// the host is overdue; `NeverSeen` means there is no access history at all,
/// which selection heuristics treat specially (new hosts cost a robots.txt
/// fetch before they yield throughput).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waiting {
    NeverSeen,
    Millis(i64),
}

/// Politeness oracle consumed by both balancer designs.
pub trait Politeness: Send + Sync {
    /// Remaining wait for a concrete URL, honoring the robots crawl-delay.
    fn waiting_remaining(&self, url: &Url, robots: &dyn RobotsHints, agent: &str) -> Waiting;

    /// Cheap estimate by host hash only, for working-set construction where
    /// no URL is at hand. May be negative (overdue); 0 for unseen hosts.
    fn waiting_remaining_guessed(&self, host_hash: HostHash) -> i64;

    /// Remaining wait attributable to the robots.txt crawl-delay alone.
    fn waiting_robots(&self, url: &Url, robots: &dyn RobotsHints, agent: &str) -> i64;

    /// Whether any access history exists for this host.
    fn seen(&self, host_hash: HostHash) -> bool;

    /// Record that a fetch for this URL was just scheduled.
    fn update_after_selection(&self, url: &Url, robots_delay_ms: i64);

    /// Sleep time a pop must enforce for this request. Cache policies that
    /// never touch the network force an immediate no-wait.
    fn domain_sleep_time(
        &self,
        robots: &dyn RobotsHints,
        profile: &CrawlProfile,
        url: &Url,
    ) -> u64 {
        if profile.cache_strategy.is_offline() {
            return 0;
        }
        match self.waiting_remaining(url, robots, &profile.agent) {
            Waiting::NeverSeen => 0,
            Waiting::Millis(ms) => ms.max(0) as u64,
        }
    }
}

/// Default oracle: tracks the last scheduled access per host and derives
/// waits from the configured minimum deltas plus the robots crawl-delay.
pub struct LatencyTracker {
    last_access_ms: DashMap<HostHash, u64>,
    min_local_delta_ms: u64,
    min_global_delta_ms: u64,
}

impl LatencyTracker {
    pub fn new(min_local_delta_ms: u64, min_global_delta_ms: u64) -> Self {
        Self {
            last_access_ms: DashMap::new(),
            min_local_delta_ms,
            min_global_delta_ms,
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn min_delta_for(&self, host: &str) -> u64 {
        if is_local_host(host) {
            self.min_local_delta_ms
        } else {
            self.min_global_delta_ms
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(Config::MIN_LOCAL_DELTA_MS, Config::MIN_GLOBAL_DELTA_MS)
    }
}

impl Politeness for LatencyTracker {
    fn waiting_remaining(&self, url: &Url, robots: &dyn RobotsHints, agent: &str) -> Waiting {
        let host_hash = HostHash::from_url(url);
        let last = match self.last_access_ms.get(&host_hash) {
            Some(entry) => *entry,
            None => return Waiting::NeverSeen,
        };
        let host = url.host_str().unwrap_or("localhost");
        let mut delta = self.min_delta_for(host);
        if let Some(robots_delay) = robots.crawl_delay_ms(url, agent) {
            delta = delta.max(robots_delay);
        }
        Waiting::Millis((last + delta) as i64 - Self::now_ms() as i64)
    }

    fn waiting_remaining_guessed(&self, host_hash: HostHash) -> i64 {
        match self.last_access_ms.get(&host_hash) {
            Some(entry) => (*entry + self.min_global_delta_ms) as i64 - Self::now_ms() as i64,
            None => 0,
        }
    }

    fn waiting_robots(&self, url: &Url, robots: &dyn RobotsHints, agent: &str) -> i64 {
        let robots_delay = match robots.crawl_delay_ms(url, agent) {
            Some(ms) => ms,
            None => return 0,
        };
        match self.last_access_ms.get(&HostHash::from_url(url)) {
            Some(entry) => ((*entry + robots_delay) as i64 - Self::now_ms() as i64).max(0),
            None => 0,
        }
    }

    fn seen(&self, host_hash: HostHash) -> bool {
        self.last_access_ms.contains_key(&host_hash)
    }

    fn update_after_selection(&self, url: &Url, robots_delay_ms: i64) {
        let host_hash = HostHash::from_url(url);
        trace!(host = ?url.host_str(), robots_delay_ms, "recording scheduled access");
        self.last_access_ms.insert(host_hash, Self::now_ms());
    }
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private(),
        Ok(std::net::IpAddr::V6(ip)) => ip.is_loopback(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::CacheStrategy;
    use crate::robots::NoRobots;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_never_seen_then_waiting() {
        let tracker = LatencyTracker::new(10, 500);
        let u = url("http://a.example/1");
        assert_eq!(tracker.waiting_remaining(&u, &NoRobots, "test"), Waiting::NeverSeen);

        tracker.update_after_selection(&u, 0);
        match tracker.waiting_remaining(&u, &NoRobots, "test") {
            Waiting::Millis(ms) => assert!(ms > 0 && ms <= 500),
            Waiting::NeverSeen => panic!("host was just selected"),
        }
    }

    #[test]
    fn test_guessed_wait_zero_for_unseen() {
        let tracker = LatencyTracker::default();
        let hash = HostHash::from_host_port("unseen.example", 80);
        assert_eq!(tracker.waiting_remaining_guessed(hash), 0);
        assert!(!tracker.seen(hash));
    }

    #[test]
    fn test_guessed_wait_counts_down() {
        let tracker = LatencyTracker::new(10, 100);
        let u = url("http://a.example/1");
        tracker.update_after_selection(&u, 0);
        let hash = HostHash::from_url(&u);
        assert!(tracker.seen(hash));
        let w = tracker.waiting_remaining_guessed(hash);
        assert!(w > 0 && w <= 100);
        std::thread::sleep(std::time::Duration::from_millis(120));
        assert!(tracker.waiting_remaining_guessed(hash) <= 0);
    }

    #[test]
    fn test_robots_delay_extends_wait() {
        let mut delays = std::collections::HashMap::new();
        delays.insert("a.example".to_string(), 5000u64);
        let robots = crate::robots::testing::FixedRobots::new(delays);

        let tracker = LatencyTracker::new(10, 100);
        let u = url("http://a.example/1");
        tracker.update_after_selection(&u, 0);
        match tracker.waiting_remaining(&u, &robots, "test") {
            Waiting::Millis(ms) => assert!(ms > 4000),
            Waiting::NeverSeen => panic!("host was just selected"),
        }
        assert!(tracker.waiting_robots(&u, &robots, "test") > 4000);
    }

    #[test]
    fn test_offline_cache_strategy_forces_no_wait() {
        let tracker = LatencyTracker::new(10, 60_000);
        let u = url("http://a.example/1");
        tracker.update_after_selection(&u, 0);

        let offline = CrawlProfile::new("p", "test", None, CacheStrategy::CacheOnly);
        assert_eq!(tracker.domain_sleep_time(&NoRobots, &offline, &u), 0);

        let online = CrawlProfile::new("p", "test", None, CacheStrategy::IfFresh);
        assert!(tracker.domain_sleep_time(&NoRobots, &online, &u) > 0);
    }

    #[test]
    fn test_local_hosts_use_short_delta() {
        let tracker = LatencyTracker::new(10, 60_000);
        let u = url("http://127.0.0.1/1");
        tracker.update_after_selection(&u, 0);
        match tracker.waiting_remaining(&u, &NoRobots, "test") {
            Waiting::Millis(ms) => assert!(ms <= 10),
            Waiting::NeverSeen => panic!("host was just selected"),
        }
    }
}
