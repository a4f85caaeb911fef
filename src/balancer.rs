use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::blacklist::Blacklist;
use crate::host_balancer::{DepthCache, HostBalancer};
use crate::latency::Politeness;
use crate::legacy_balancer::LegacyBalancer;
use crate::profile::{CrawlProfile, ProfileRegistry};
use crate::request::{HostHash, Request, UrlHash};
use crate::robots::RobotsHints;
use crate::store::StoreError;

/// Why a push was not accepted. Soft rejections, not errors: the frontier is
/// unchanged and the caller typically just drops the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Hash found in the best-effort double-push set.
    DoubleInDedup,
    /// Hash found in the authoritative persisted table.
    DoubleInTable,
    /// Hash found in the shared depth cache.
    DoubleInDepthCache,
    /// The target queue was already closed.
    QueueClosed,
    /// The request URL could not be parsed.
    MalformedUrl,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::DoubleInDedup => write!(f, "double occurrence in double-push check"),
            RejectReason::DoubleInTable => write!(f, "double occurrence in url file index"),
            RejectReason::DoubleInDepthCache => write!(f, "double occurrence in depth cache"),
            RejectReason::QueueClosed => write!(f, "host queue is closed"),
            RejectReason::MalformedUrl => write!(f, "malformed url"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl PushOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted)
    }
}

/// Common interface of the two frontier scheduler designs. Producers push
/// admitted requests, crawl workers pop the next fetchable one; `pop` with
/// `delay = true` blocks until the host's politeness window has passed.
pub trait Balancer: Send + Sync {
    fn push(
        &self,
        entry: Request,
        profile: Option<&CrawlProfile>,
        robots: &dyn RobotsHints,
    ) -> Result<PushOutcome, StoreError>;

    fn pop(
        &self,
        delay: bool,
        profiles: &dyn ProfileRegistry,
        robots: &dyn RobotsHints,
    ) -> Result<Option<Request>, StoreError>;

    fn get(&self, hash: &UrlHash) -> Result<Option<Request>, StoreError>;

    /// Bulk delete; returns how many of the hashes were actually present.
    fn remove(&self, hashes: &HashSet<UrlHash>) -> Result<usize, StoreError>;

    /// Delete every request queued under a profile, within a time budget.
    fn remove_all_by_profile_handle(
        &self,
        handle: &str,
        timeout: Duration,
    ) -> Result<usize, StoreError>;

    /// Delete every request queued for the given hosts.
    fn remove_all_by_host_hashes(&self, host_hashes: &HashSet<HostHash>) -> usize;

    fn has(&self, hash: &UrlHash) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operator view: host label to (pending count, guessed wait millis).
    fn get_domain_stack_hosts(&self, robots: &dyn RobotsHints) -> BTreeMap<String, (usize, i64)>;

    /// Operator view: pending requests of one host, capped by count and time.
    fn get_domain_stack_references(
        &self,
        host: &str,
        max_count: usize,
        max_time: Duration,
    ) -> Vec<Request>;

    /// Drop all queued requests but keep the scheduler usable.
    fn clear(&self) -> Result<(), StoreError>;

    /// Shut down, waking any blocked pops and deleting empty backing files.
    fn close(&self);
}

/// Which scheduler design to run. The sharded design keeps one file per host
/// and narrows locking to host granularity; the legacy design keeps one
/// shared table and one global lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerKind {
    Sharded { on_demand_limit: usize },
    Legacy,
}

/// Build a balancer of the configured kind rooted at `path`.
pub fn open_balancer(
    kind: BalancerKind,
    path: &Path,
    stack_name: &str,
    politeness: Arc<dyn Politeness>,
    blacklist: Arc<dyn Blacklist>,
) -> Result<Box<dyn Balancer>, StoreError> {
    match kind {
        BalancerKind::Sharded { on_demand_limit } => {
            let depth_cache = Arc::new(DepthCache::new());
            Ok(Box::new(HostBalancer::open(
                path,
                on_demand_limit,
                depth_cache,
                politeness,
                blacklist,
            )?))
        }
        BalancerKind::Legacy => Ok(Box::new(LegacyBalancer::open(
            path,
            stack_name,
            politeness,
            blacklist,
        )?)),
    }
}
