use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::balancer::{PushOutcome, RejectReason};
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::dedup::DedupSet;
use crate::latency::Politeness;
use crate::profile::CrawlProfile;
use crate::profile::ProfileRegistry;
use crate::request::{HostHash, Request, UrlHash};
use crate::robots::RobotsHints;
use crate::store::{RequestStore, StoreError};

/// All pending requests of exactly one host, persisted in a dedicated
/// on-disk table named `<hosthash-hex>.stack`.
///
/// One mutex guards the store and the dedup set; a pop that enforces a
/// politeness delay sleeps while holding it, deliberately serializing every
/// other caller for this host so two workers cannot split one wait window.
pub struct HostQueue {
    host_hash: HostHash,
    path: PathBuf,
    inner: Mutex<Option<QueueInner>>,
    wakeup: Condvar,
}

struct QueueInner {
    store: RequestStore,
    dedup: DedupSet,
    /// Clear-text `host:port`, recovered from the first available request.
    host_label: Option<String>,
}

impl HostQueue {
    /// Open (or create) the queue for one host hash inside `hosts_dir`.
    pub fn open(hosts_dir: &Path, host_hash: HostHash) -> Result<Self, StoreError> {
        let path = hosts_dir.join(format!("{}{}", host_hash.to_hex(), Config::STACK_SUFFIX));
        let store = RequestStore::open(&path)?;

        // Recover the host label from any persisted row after a restart.
        let mut host_label = None;
        store.scan(1, |_, request| {
            if let Some(r) = request {
                host_label = r.host_label();
            }
            false
        })?;

        let size = store.len()?;
        if size > 0 {
            info!(path = %path.display(), size, "opened host queue");
        }

        Ok(Self {
            host_hash,
            path,
            inner: Mutex::new(Some(QueueInner {
                store,
                dedup: DedupSet::new(Config::MAX_DOUBLE_PUSH_CHECK),
                host_label,
            })),
            wakeup: Condvar::new(),
        })
    }

    /// Parse a shard file name back into its host hash, if it is one.
    pub fn host_hash_from_file_name(name: &str) -> Option<HostHash> {
        let hex = name.strip_suffix(Config::STACK_SUFFIX)?;
        HostHash::from_hex(hex)
    }

    pub fn host_hash(&self) -> HostHash {
        self.host_hash
    }

    pub fn host_label(&self) -> Option<String> {
        self.inner.lock().as_ref().and_then(|i| i.host_label.clone())
    }

    /// Queue a request. Rejects duplicates against the dedup set first and
    /// the persisted table second, with no side effects on rejection.
    pub fn push(
        &self,
        entry: Request,
        profile: Option<&CrawlProfile>,
        robots: &dyn RobotsHints,
    ) -> Result<PushOutcome, StoreError> {
        let hash = entry.url_hash;
        let url = match entry.parsed_url() {
            Some(u) => u,
            None => return Ok(PushOutcome::Rejected(RejectReason::MalformedUrl)),
        };

        let mut guard = self.inner.lock();
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => return Ok(PushOutcome::Rejected(RejectReason::QueueClosed)),
        };

        if inner.dedup.contains(&hash) {
            return Ok(PushOutcome::Rejected(RejectReason::DoubleInDedup));
        }
        if inner.store.has(&hash)? {
            return Ok(PushOutcome::Rejected(RejectReason::DoubleInTable));
        }

        inner.dedup.insert(hash);

        if let Some(profile) = profile {
            if profile.enforces_dom_limit() {
                if let Some(host) = url.host_str() {
                    profile.dom_inc(host);
                }
            }
        }

        inner.store.put(&entry)?;
        if inner.host_label.is_none() {
            inner.host_label = entry.host_label();
        }

        // Kick off the robots.txt prefetch so the crawl-delay answer is
        // likely cached before this host gets popped.
        let agent = profile.map(|p| p.agent.as_str()).unwrap_or("crawler");
        robots.ensure_exist(&url, agent);

        Ok(PushOutcome::Accepted)
    }

    /// Remove and return the next acceptable request of this host.
    ///
    /// Entries whose URL became blacklisted after queueing, or whose crawl
    /// profile no longer exists, are discarded and the next one is tried.
    /// With `delay = true` the computed politeness sleep is enforced here,
    /// in interruptible whole-second slices, before returning.
    pub fn pop(
        &self,
        delay: bool,
        profiles: &dyn ProfileRegistry,
        robots: &dyn RobotsHints,
        politeness: &dyn Politeness,
        blacklist: &dyn Blacklist,
    ) -> Result<Option<Request>, StoreError> {
        let mut guard = self.inner.lock();

        let (entry, url, sleeptime, agent) = loop {
            let inner = match guard.as_mut() {
                Some(inner) => inner,
                None => return Ok(None),
            };

            let entry = match inner.store.take_any()? {
                Some(entry) => entry,
                None => return Ok(None),
            };
            inner.dedup.remove(&entry.url_hash);

            let url = match entry.parsed_url() {
                Some(u) => u,
                None => {
                    debug!(url = %entry.url, "discarding request with unparseable url");
                    continue;
                }
            };

            // Blacklist rules may have been added after enqueue.
            if blacklist.is_listed(&url) {
                debug!(url = %entry.url, "popped url is blacklisted, discarding");
                continue;
            }

            // A missing profile means it was deleted mid-crawl; the request
            // is stale and must never surface as crawlable work.
            let profile = match profiles.get_active(&entry.profile_handle) {
                Some(p) => p,
                None => {
                    debug!(handle = %entry.profile_handle, "no profile entry for handle");
                    continue;
                }
            };

            let sleeptime = politeness.domain_sleep_time(robots, &profile, &url);
            break (entry, url, sleeptime, profile.agent.clone());
        };

        let robots_time = politeness.waiting_robots(&url, robots, &agent);
        politeness.update_after_selection(&url, robots_time);

        if delay && sleeptime > 0 {
            info!(
                host = ?url.host_str(),
                sleeptime_ms = sleeptime,
                "forcing crawl-delay"
            );
            self.sleep_sliced(&mut guard, sleeptime, url.host_str().unwrap_or(""));
            politeness.update_after_selection(&url, robots_time);
        }

        Ok(Some(entry))
    }

    /// Wait in whole-second slices on the queue condvar, still holding the
    /// queue lock. A notification (close or explicit interrupt) aborts the
    /// remaining wait without error.
    fn sleep_sliced(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, Option<QueueInner>>,
        sleeptime_ms: u64,
        host: &str,
    ) {
        let mut loops = sleeptime_ms / 1000;
        let mut rest = sleeptime_ms % 1000;
        if loops < Config::SLEEP_SLICE_MIN_LOOPS {
            rest += 1000 * loops;
            loops = 0;
        }

        if rest > 0 {
            let result = self
                .wakeup
                .wait_for(guard, Duration::from_millis(rest));
            if !result.timed_out() {
                return;
            }
        }
        for i in 0..loops {
            info!(host, seconds_remaining = loops - i, "waiting for politeness window");
            let result = self.wakeup.wait_for(guard, Duration::from_secs(1));
            if !result.timed_out() {
                return;
            }
        }
    }

    /// Abort any in-progress politeness wait early.
    pub fn interrupt(&self) {
        self.wakeup.notify_all();
    }

    pub fn get(&self, hash: &UrlHash) -> Result<Option<Request>, StoreError> {
        match self.inner.lock().as_ref() {
            Some(inner) => inner.store.get(hash),
            None => Ok(None),
        }
    }

    /// The persisted table is authoritative; the dedup set only serves as a
    /// fast positive.
    pub fn has(&self, hash: &UrlHash) -> bool {
        match self.inner.lock().as_ref() {
            Some(inner) => {
                inner.dedup.contains(hash) || inner.store.has(hash).unwrap_or(false)
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock().as_ref() {
            Some(inner) => inner.store.len().unwrap_or(0),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete matching entries from the table and the dedup set.
    pub fn remove(&self, hashes: &HashSet<UrlHash>) -> Result<usize, StoreError> {
        let mut guard = self.inner.lock();
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => return Ok(0),
        };
        let mut removed = 0;
        for hash in hashes {
            if inner.store.remove(hash)? {
                removed += 1;
            }
            inner.dedup.remove(hash);
        }
        Ok(removed)
    }

    /// Delete every entry carrying the given profile handle, bounded by the
    /// deadline. Returns the hashes that were actually removed.
    pub fn remove_all_by_profile_handle(
        &self,
        handle: &str,
        deadline: Instant,
    ) -> Result<Vec<UrlHash>, StoreError> {
        let mut guard = self.inner.lock();
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => return Ok(Vec::new()),
        };
        let mut doomed = Vec::new();
        inner.store.scan(usize::MAX, |hash, request| {
            if let Some(r) = request {
                if r.profile_handle == handle {
                    doomed.push(hash);
                }
            }
            Instant::now() < deadline
        })?;
        let mut removed = Vec::new();
        for hash in doomed {
            if inner.store.remove(&hash)? {
                removed.push(hash);
            }
            inner.dedup.remove(&hash);
        }
        Ok(removed)
    }

    /// Pending requests of this host, capped by count and time budget.
    pub fn snapshot(&self, max_count: usize, deadline: Instant) -> Vec<Request> {
        let guard = self.inner.lock();
        let inner = match guard.as_ref() {
            Some(inner) => inner,
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        if let Err(e) = inner.store.scan(usize::MAX, |_, request| {
            if let Some(r) = request {
                out.push(r);
            }
            out.len() < max_count && Instant::now() < deadline
        }) {
            debug!(path = %self.path.display(), error = %e, "host queue snapshot failed");
        }
        out
    }

    /// Drop all queued entries but keep the queue open.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            inner.store.clear()?;
            inner.dedup.clear();
        }
        Ok(())
    }

    /// External memory-pressure hook: drop the advisory dedup set.
    pub fn clear_dedup(&self) {
        if let Some(inner) = self.inner.lock().as_mut() {
            inner.dedup.clear();
        }
    }

    /// Close the queue, waking blocked pops. An empty queue deletes its
    /// backing file so long-tail hosts do not accumulate files on disk.
    pub fn close(&self) {
        let inner = self.inner.lock().take();
        self.wakeup.notify_all();
        if let Some(inner) = inner {
            let empty = inner.store.is_empty().unwrap_or(false);
            if empty {
                if let Err(e) = inner.store.delete() {
                    debug!(path = %self.path.display(), error = %e, "failed to delete empty queue file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::{NoBlacklist, SubstringBlacklist};
    use crate::latency::LatencyTracker;
    use crate::profile::{CacheStrategy, InMemoryProfiles};
    use crate::robots::NoRobots;
    use tempfile::TempDir;
    use url::Url;

    fn req(url: &str) -> Request {
        Request::new(Url::parse(url).unwrap(), 0, "p".to_string(), None, None)
    }

    fn queue_for(dir: &TempDir, url: &str) -> HostQueue {
        let hash = Request::new(Url::parse(url).unwrap(), 0, "p".into(), None, None).host_hash();
        HostQueue::open(dir.path(), hash).unwrap()
    }

    fn profiles() -> InMemoryProfiles {
        let p = InMemoryProfiles::new();
        p.insert(CrawlProfile::new("p", "test-agent", None, CacheStrategy::IfFresh));
        p
    }

    #[test]
    fn test_push_pop_cycle() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");
        let profiles = profiles();
        let politeness = LatencyTracker::new(0, 0);

        let r = req("http://a.example/1");
        let hash = r.url_hash;
        assert!(q.push(r, None, &NoRobots).unwrap().is_accepted());
        assert!(q.has(&hash));
        assert_eq!(q.len(), 1);

        let popped = q
            .pop(false, &profiles, &NoRobots, &politeness, &NoBlacklist)
            .unwrap()
            .unwrap();
        assert_eq!(popped.url_hash, hash);
        assert!(!q.has(&hash));
        assert!(q.is_empty());
    }

    #[test]
    fn test_double_push_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");

        assert!(q.push(req("http://a.example/1"), None, &NoRobots).unwrap().is_accepted());
        let outcome = q.push(req("http://a.example/1"), None, &NoRobots).unwrap();
        assert_eq!(outcome, PushOutcome::Rejected(RejectReason::DoubleInDedup));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_duplicate_detected_by_table_after_dedup_cleared() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");

        assert!(q.push(req("http://a.example/1"), None, &NoRobots).unwrap().is_accepted());
        q.clear_dedup();
        let outcome = q.push(req("http://a.example/1"), None, &NoRobots).unwrap();
        assert_eq!(outcome, PushOutcome::Rejected(RejectReason::DoubleInTable));
    }

    #[test]
    fn test_pop_skips_blacklisted() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");
        let profiles = profiles();
        let politeness = LatencyTracker::new(0, 0);

        q.push(req("http://a.example/ads/1"), None, &NoRobots).unwrap();
        q.push(req("http://a.example/news"), None, &NoRobots).unwrap();

        let blacklist = SubstringBlacklist::new();
        blacklist.add("/ads/");

        let mut seen = Vec::new();
        while let Some(r) = q
            .pop(false, &profiles, &NoRobots, &politeness, &blacklist)
            .unwrap()
        {
            seen.push(r.url);
        }
        assert_eq!(seen, vec!["http://a.example/news".to_string()]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_pop_discards_requests_of_deleted_profile() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");
        let politeness = LatencyTracker::new(0, 0);

        q.push(req("http://a.example/1"), None, &NoRobots).unwrap();
        let empty_registry = InMemoryProfiles::new();
        let popped = q
            .pop(false, &empty_registry, &NoRobots, &politeness, &NoBlacklist)
            .unwrap();
        assert!(popped.is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_clears_table_and_dedup() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");

        let r1 = req("http://a.example/1");
        let r2 = req("http://a.example/2");
        let (h1, h2) = (r1.url_hash, r2.url_hash);
        q.push(r1, None, &NoRobots).unwrap();
        q.push(r2, None, &NoRobots).unwrap();

        let mut hashes = HashSet::new();
        hashes.insert(h1);
        // also a hash that was never pushed
        hashes.insert(UrlHash([9u8; crate::request::URL_HASH_LEN]));
        assert_eq!(q.remove(&hashes).unwrap(), 1);
        assert!(!q.has(&h1));
        assert!(q.has(&h2));
        assert_eq!(q.len(), 1);

        // re-push of a removed hash is accepted again
        assert!(q.push(req("http://a.example/1"), None, &NoRobots).unwrap().is_accepted());
    }

    #[test]
    fn test_close_deletes_empty_file() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");
        let path = dir
            .path()
            .join(format!("{}{}", q.host_hash().to_hex(), Config::STACK_SUFFIX));
        assert!(path.exists());
        q.close();
        assert!(!path.exists());
    }

    #[test]
    fn test_close_keeps_nonempty_file() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");
        q.push(req("http://a.example/1"), None, &NoRobots).unwrap();
        let path = dir
            .path()
            .join(format!("{}{}", q.host_hash().to_hex(), Config::STACK_SUFFIX));
        q.close();
        assert!(path.exists());

        // reopening recovers the pending entry and the host label
        let hash = HostQueue::host_hash_from_file_name(
            path.file_name().unwrap().to_str().unwrap(),
        )
        .unwrap();
        let q = HostQueue::open(dir.path(), hash).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.host_label().as_deref(), Some("a.example:80"));
    }

    #[test]
    fn test_close_aborts_blocked_politeness_wait() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let q = Arc::new(queue_for(&dir, "http://a.example/"));
        // 10s between fetches, so the second pop blocks in the sleep
        let politeness = Arc::new(LatencyTracker::new(10, 10_000));

        q.push(req("http://a.example/1"), None, &NoRobots).unwrap();
        q.push(req("http://a.example/2"), None, &NoRobots).unwrap();

        let profiles = profiles();
        let first = q
            .pop(true, &profiles, &NoRobots, politeness.as_ref(), &NoBlacklist)
            .unwrap();
        assert!(first.is_some(), "never-seen host must pop without waiting");

        let worker = {
            let q = q.clone();
            let politeness = politeness.clone();
            std::thread::spawn(move || {
                let profiles = self::profiles();
                let started = Instant::now();
                let popped = q
                    .pop(true, &profiles, &NoRobots, politeness.as_ref(), &NoBlacklist)
                    .unwrap();
                (popped, started.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(500));
        q.close();

        let (popped, elapsed) = worker.join().unwrap();
        // the entry was already taken from the table; closing must abort the
        // remaining wait, not swallow the request
        assert!(popped.is_some());
        assert!(
            elapsed < Duration::from_secs(5),
            "close() left the pop sleeping for {elapsed:?}"
        );
    }

    #[test]
    fn test_interrupt_aborts_wait_and_keeps_queue_open() {
        use std::sync::Arc;

        let dir = TempDir::new().unwrap();
        let q = Arc::new(queue_for(&dir, "http://a.example/"));
        let politeness = Arc::new(LatencyTracker::new(10, 10_000));

        q.push(req("http://a.example/1"), None, &NoRobots).unwrap();
        q.push(req("http://a.example/2"), None, &NoRobots).unwrap();

        let profiles = profiles();
        q.pop(true, &profiles, &NoRobots, politeness.as_ref(), &NoBlacklist)
            .unwrap()
            .unwrap();

        let worker = {
            let q = q.clone();
            let politeness = politeness.clone();
            std::thread::spawn(move || {
                let profiles = self::profiles();
                let started = Instant::now();
                let popped = q
                    .pop(true, &profiles, &NoRobots, politeness.as_ref(), &NoBlacklist)
                    .unwrap();
                (popped, started.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(500));
        q.interrupt();

        let (popped, elapsed) = worker.join().unwrap();
        assert!(popped.is_some());
        assert!(elapsed < Duration::from_secs(5));
        // unlike close, an interrupt leaves the queue usable
        assert!(q.push(req("http://a.example/3"), None, &NoRobots).unwrap().is_accepted());
    }

    #[test]
    fn test_robots_prefetch_on_push() {
        let dir = TempDir::new().unwrap();
        let q = queue_for(&dir, "http://a.example/");
        let robots = crate::robots::testing::FixedRobots::new(Default::default());
        q.push(req("http://a.example/1"), None, &robots).unwrap();
        assert_eq!(robots.ensure_calls.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
