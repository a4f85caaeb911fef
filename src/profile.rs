use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Cache policy attached to a crawl profile. `IfExist` and `CacheOnly` never
/// hit the network, so pops under those policies skip the politeness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStrategy {
    NoCache,
    IfFresh,
    IfExist,
    CacheOnly,
}

impl CacheStrategy {
    /// Whether a fetch under this policy is satisfied from cache and needs
    /// no inter-request delay.
    pub fn is_offline(&self) -> bool {
        matches!(self, CacheStrategy::IfExist | CacheStrategy::CacheOnly)
    }
}

/// Active crawl profile. The scheduler only consumes the fields that affect
/// scheduling: the agent string, the per-domain page limit and the cache
/// policy. Page counters are tracked here because pushes from many producer
/// threads increment them concurrently.
#[derive(Debug)]
pub struct CrawlProfile {
    pub handle: String,
    pub agent: String,
    /// Maximum pages to fetch per domain, `None` for unlimited.
    pub dom_max_pages: Option<u32>,
    pub cache_strategy: CacheStrategy,
    dom_counters: DashMap<String, u32>,
}

impl CrawlProfile {
    pub fn new(
        handle: impl Into<String>,
        agent: impl Into<String>,
        dom_max_pages: Option<u32>,
        cache_strategy: CacheStrategy,
    ) -> Self {
        Self {
            handle: handle.into(),
            agent: agent.into(),
            dom_max_pages,
            cache_strategy,
            dom_counters: DashMap::new(),
        }
    }

    /// Whether the per-domain page limit is active for this profile.
    pub fn enforces_dom_limit(&self) -> bool {
        matches!(self.dom_max_pages, Some(n) if n > 0)
    }

    /// Count one queued page for a host.
    pub fn dom_inc(&self, host: &str) {
        *self.dom_counters.entry(host.to_string()).or_insert(0) += 1;
    }

    pub fn dom_count(&self, host: &str) -> u32 {
        self.dom_counters.get(host).map(|c| *c).unwrap_or(0)
    }
}

/// Store of active crawl profiles. A `None` answer means the profile was
/// deleted mid-crawl; requests referencing it are discarded at pop time.
pub trait ProfileRegistry: Send + Sync {
    fn get_active(&self, handle: &str) -> Option<Arc<CrawlProfile>>;
}

/// In-memory registry, sufficient for embedding and tests.
pub struct InMemoryProfiles {
    profiles: DashMap<String, Arc<CrawlProfile>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
        }
    }

    pub fn insert(&self, profile: CrawlProfile) -> Arc<CrawlProfile> {
        let profile = Arc::new(profile);
        self.profiles.insert(profile.handle.clone(), profile.clone());
        profile
    }

    pub fn remove(&self, handle: &str) {
        self.profiles.remove(handle);
    }
}

impl Default for InMemoryProfiles {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegistry for InMemoryProfiles {
    fn get_active(&self, handle: &str) -> Option<Arc<CrawlProfile>> {
        self.profiles.get(handle).map(|p| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dom_counter() {
        let p = CrawlProfile::new("h", "agent", Some(100), CacheStrategy::IfFresh);
        assert!(p.enforces_dom_limit());
        assert_eq!(p.dom_count("a.example"), 0);
        p.dom_inc("a.example");
        p.dom_inc("a.example");
        assert_eq!(p.dom_count("a.example"), 2);
        assert_eq!(p.dom_count("b.example"), 0);
    }

    #[test]
    fn test_registry_deletion() {
        let reg = InMemoryProfiles::new();
        reg.insert(CrawlProfile::new("h", "agent", None, CacheStrategy::NoCache));
        assert!(reg.get_active("h").is_some());
        reg.remove("h");
        assert!(reg.get_active("h").is_none());
    }

    #[test]
    fn test_offline_strategies_skip_delay() {
        assert!(CacheStrategy::CacheOnly.is_offline());
        assert!(CacheStrategy::IfExist.is_offline());
        assert!(!CacheStrategy::IfFresh.is_offline());
        assert!(!CacheStrategy::NoCache.is_offline());
    }
}
