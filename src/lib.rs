//! Crawl-frontier scheduler: persistent per-host queues with politeness-aware
//! selection.
//!
//! Producers push admitted [`request::Request`]s into a [`balancer::Balancer`];
//! crawl workers pop the next fetchable request, with the balancer enforcing
//! per-host minimum access deltas and robots.txt crawl-delays. Two scheduler
//! designs sit behind the same trait: the sharded [`host_balancer::HostBalancer`]
//! (one file and lock per host) and the single-table
//! [`legacy_balancer::LegacyBalancer`].

pub mod balancer;
pub mod blacklist;
pub mod config;
pub mod dedup;
pub mod host_balancer;
pub mod host_queue;
pub mod latency;
pub mod legacy_balancer;
pub mod logging;
pub mod profile;
pub mod request;
pub mod robots;
pub mod store;
pub mod throttle;

pub use balancer::{open_balancer, Balancer, BalancerKind, PushOutcome, RejectReason};
pub use blacklist::Blacklist;
pub use config::Config;
pub use host_balancer::HostBalancer;
pub use latency::{LatencyTracker, Politeness, Waiting};
pub use legacy_balancer::LegacyBalancer;
pub use profile::{CacheStrategy, CrawlProfile, ProfileRegistry};
pub use request::{HostHash, Request, UrlHash};
pub use robots::RobotsHints;
pub use store::StoreError;
pub use throttle::DnsThrottle;
