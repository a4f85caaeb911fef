use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::balancer::{Balancer, PushOutcome, RejectReason};
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::dedup::DedupSet;
use crate::latency::{Politeness, Waiting};
use crate::profile::{CrawlProfile, ProfileRegistry};
use crate::request::{HostHash, Request, UrlHash};
use crate::robots::RobotsHints;
use crate::store::{RequestStore, StoreError};

/// Per-host slice of the in-memory view: the host's hash plus the pending
/// URL hashes known for it.
struct HostHandles {
    host_hash: HostHash,
    hashes: HashSet<UrlHash>,
}

struct LegacyInner {
    store: RequestStore,
    /// host label -> pending hashes; rebuilt periodically from the table.
    domain_stacks: HashMap<String, HostHandles>,
    dedup: DedupSet,
    /// Hosts pre-selected as immediately fetchable in a previous round.
    zero_waiting: Vec<(String, UrlHash)>,
    last_domain_stack_fill: Option<Instant>,
    dom_stack_init_size: usize,
    closed: bool,
}

/// Non-sharded frontier scheduler: one shared persisted table plus a
/// periodically rebuilt `host -> pending hashes` view. One lock guards the
/// whole frontier, including the politeness sleep inside `pop`; that
/// serialization is deliberate so two workers cannot share (and thereby
/// halve) one host's wait window.
pub struct LegacyBalancer {
    inner: Mutex<LegacyInner>,
    wakeup: Condvar,
    politeness: Arc<dyn Politeness>,
    blacklist: Arc<dyn Blacklist>,
}

impl LegacyBalancer {
    pub fn open(
        path: &Path,
        stack_name: &str,
        politeness: Arc<dyn Politeness>,
        blacklist: Arc<dyn Blacklist>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;
        let store =
            RequestStore::open(path.join(format!("{}{}", stack_name, Config::STACK_SUFFIX)))?;
        info!(
            entries = store.len().unwrap_or(0),
            path = %store.path().display(),
            "opened balancer stack"
        );
        Ok(Self {
            inner: Mutex::new(LegacyInner {
                store,
                domain_stacks: HashMap::new(),
                dedup: DedupSet::new(Config::MAX_DOUBLE_PUSH_CHECK),
                zero_waiting: Vec::new(),
                last_domain_stack_fill: None,
                dom_stack_init_size: usize::MAX,
                closed: false,
            }),
            wakeup: Condvar::new(),
            politeness,
            blacklist,
        })
    }

    fn host_label_of(url: &url::Url) -> String {
        let host = url.host_str().unwrap_or("localhost").to_lowercase();
        let port = url.port_or_known_default().unwrap_or(80);
        format!("{}:{}", host, port)
    }

    fn push_hash_to_domain_stacks(
        inner: &mut LegacyInner,
        label: String,
        host_hash: HostHash,
        url_hash: UrlHash,
    ) {
        inner
            .domain_stacks
            .entry(label)
            .or_insert_with(|| HostHandles {
                host_hash,
                hashes: HashSet::new(),
            })
            .hashes
            .insert(url_hash);
    }

    fn remove_hash_from_domain_stacks(inner: &mut LegacyInner, label: &str, url_hash: &UrlHash) {
        if let Some(handles) = inner.domain_stacks.get_mut(label) {
            handles.hashes.remove(url_hash);
            if handles.hashes.is_empty() {
                inner.domain_stacks.remove(label);
            }
        }
    }

    /// Rebuild the in-memory host view from a bounded sample of the table.
    /// A no-op while the current view is non-empty and fresh. Entries that
    /// turned out blacklisted are deleted from the table for good.
    fn fill_domain_stacks(
        &self,
        inner: &mut LegacyInner,
    ) -> Result<(), StoreError> {
        if !inner.domain_stacks.is_empty() {
            if let Some(last) = inner.last_domain_stack_fill {
                if last.elapsed() < Duration::from_millis(Config::DOMAIN_STACK_REFILL_MS) {
                    return Ok(());
                }
            }
        }
        inner.domain_stacks.clear();
        let fill_started = Instant::now();
        inner.last_domain_stack_fill = Some(fill_started);

        let deadline = fill_started + Duration::from_millis(Config::DOMAIN_FILL_TIME_BUDGET_MS);
        let mut black_handles: Vec<UrlHash> = Vec::new();
        let mut grouped: Vec<(String, HostHash, UrlHash)> = Vec::new();
        let mut count = 0usize;
        let mut hosts_seen: HashSet<String> = HashSet::new();

        inner.store.scan(Config::DOMAIN_SCAN_MAX_ENTRIES, |hash, request| {
            let Some(request) = request else { return true };
            let Some(url) = request.parsed_url() else { return true };

            // blacklist rules may have been added after the queue was filled
            if self.blacklist.is_listed(&url) {
                debug!(url = %request.url, "queued url is in blacklist, deleting");
                black_handles.push(hash);
                return true;
            }

            let label = Self::host_label_of(&url);
            hosts_seen.insert(label.clone());
            grouped.push((label, request.host_hash(), hash));
            count += 1;

            hosts_seen.len() < Config::DOMAIN_STACK_MAX_HOSTS
                && count < Config::DOMAIN_SCAN_MAX_ENTRIES
                && Instant::now() < deadline
        })?;

        for (label, host_hash, url_hash) in grouped {
            Self::push_hash_to_domain_stacks(inner, label, host_hash, url_hash);
        }
        for hash in &black_handles {
            inner.store.remove(hash)?;
            inner.dedup.remove(hash);
        }

        info!(
            table_size = inner.store.len().unwrap_or(0),
            hosts = inner.domain_stacks.len(),
            blacklisted = black_handles.len(),
            elapsed_ms = fill_started.elapsed().as_millis() as u64,
            "re-filled domain stacks"
        );
        inner.dom_stack_init_size = inner.domain_stacks.len();
        Ok(())
    }

    /// Pick a random zero-waiting candidate. Randomization is deliberate so
    /// equally ready hosts take turns instead of the same one winning every
    /// round.
    fn pick_from_zero_waiting(inner: &mut LegacyInner) -> Option<UrlHash> {
        while !inner.zero_waiting.is_empty() {
            let idx = rand::thread_rng().gen_range(0..inner.zero_waiting.len());
            let (label, hash) = inner.zero_waiting.remove(idx);
            if !inner.domain_stacks.contains_key(&label) {
                continue;
            }
            Self::remove_hash_from_domain_stacks(inner, &label, &hash);
            debug!(host = %label, "picked random zero-waiting host");
            return Some(hash);
        }
        None
    }

    /// The "best next host" heuristic. Drains the cached zero-waiting
    /// candidates first; otherwise rescans the host view, collecting hosts
    /// with no outstanding wait (scored by queue size, with a small reserved
    /// quota for never-seen hosts) and a failover set scored by wait time.
    fn getbest(
        &self,
        inner: &mut LegacyInner,
        profiles: &dyn ProfileRegistry,
        robots: &dyn RobotsHints,
    ) -> Result<Option<UrlHash>, StoreError> {
        if !inner.zero_waiting.is_empty() {
            if let Some(hash) = Self::pick_from_zero_waiting(inner) {
                return Ok(Some(hash));
            }
        }
        inner.zero_waiting.clear();

        self.fill_domain_stacks(inner)?;

        let mut next_zero: Vec<(String, UrlHash, usize)> = Vec::new();
        let mut failover: Vec<(String, UrlHash, i64)> = Vec::new();
        let mut new_host_slots = Config::NEW_HOST_FORWARD_SLOTS;
        let mut empty_hosts: Vec<String> = Vec::new();
        let mut orphans: Vec<(String, UrlHash)> = Vec::new();

        for (label, handles) in inner.domain_stacks.iter() {
            if next_zero.len() >= Config::ZERO_CANDIDATES_MAX {
                break;
            }
            if handles.hashes.is_empty() {
                empty_hosts.push(label.clone());
                continue;
            }
            let url_hash = match handles.hashes.iter().next() {
                Some(hash) => *hash,
                None => continue,
            };

            let request = match inner.store.get(&url_hash) {
                Ok(Some(request)) => request,
                Ok(None) => {
                    // view and table drifted apart; heal by dropping the orphan
                    orphans.push((label.clone(), url_hash));
                    continue;
                }
                Err(e) => {
                    // fail open: a single unreadable row must not stall the pop cycle
                    warn!(error = %e, "candidate evaluation failed, assuming overdue");
                    failover.push((label.clone(), url_hash, 0));
                    continue;
                }
            };
            let Some(url) = request.parsed_url() else {
                orphans.push((label.clone(), url_hash));
                continue;
            };
            let Some(profile) = profiles.get_active(&request.profile_handle) else {
                debug!(handle = %request.profile_handle, "no profile entry for handle");
                continue;
            };

            match self.politeness.waiting_remaining(&url, robots, &profile.agent) {
                Waiting::NeverSeen => {
                    // reserved quota so new hosts are not perpetually starved,
                    // but also do not flood the round with robots.txt fetches
                    if new_host_slots > 0 {
                        new_host_slots -= 1;
                        next_zero.push((label.clone(), url_hash, Config::NEW_HOST_SCORE));
                    } else {
                        failover.push((label.clone(), url_hash, 0));
                    }
                }
                Waiting::Millis(ms) if ms <= 0 => {
                    next_zero.push((label.clone(), url_hash, handles.hashes.len()));
                }
                Waiting::Millis(ms) => {
                    failover.push((label.clone(), url_hash, ms));
                }
            }
        }

        for label in empty_hosts {
            inner.domain_stacks.remove(&label);
        }
        for (label, hash) in orphans {
            Self::remove_hash_from_domain_stacks(inner, &label, &hash);
        }

        if !next_zero.is_empty() {
            // cache the best-scored third (capped) for the following rounds
            next_zero.sort_by(|a, b| b.2.cmp(&a.2));
            let pick = if next_zero.len() <= Config::ZERO_PICK_ALL_BELOW {
                next_zero.len()
            } else {
                (next_zero.len() / Config::ZERO_PICK_DIVISOR).max(1)
            };
            inner
                .zero_waiting
                .extend(next_zero.into_iter().take(pick).map(|(l, h, _)| (l, h)));
            return Ok(Self::pick_from_zero_waiting(inner));
        }

        if !failover.is_empty() {
            // bad luck: take the one with the least waiting
            failover.sort_by_key(|(_, _, wait)| *wait);
            let (label, hash, _) = failover.remove(0);
            Self::remove_hash_from_domain_stacks(inner, &label, &hash);
            return Ok(Some(hash));
        }

        Ok(None)
    }

    /// Sleep in whole-second slices on the balancer condvar while holding
    /// the frontier lock. A notification aborts the remaining wait.
    fn sleep_sliced(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, LegacyInner>,
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
            if !self.wakeup.wait_for(guard, Duration::from_millis(rest)).timed_out() {
                return;
            }
        }
        for i in 0..loops {
            info!(host, seconds_remaining = loops - i, "waiting for politeness window");
            if !self.wakeup.wait_for(guard, Duration::from_secs(1)).timed_out() {
                return;
            }
        }
    }

    fn remove_locked(
        inner: &mut LegacyInner,
        hashes: &HashSet<UrlHash>,
    ) -> Result<usize, StoreError> {
        let mut removed = 0;
        for hash in hashes {
            if inner.store.remove(hash)? {
                removed += 1;
            }
            inner.dedup.remove(hash);
        }
        if removed == 0 {
            return Ok(0);
        }
        inner.domain_stacks.retain(|_, handles| {
            for hash in hashes {
                handles.hashes.remove(hash);
            }
            !handles.hashes.is_empty()
        });
        inner.zero_waiting.retain(|(_, hash)| !hashes.contains(hash));
        Ok(removed)
    }
}

impl Balancer for LegacyBalancer {
    fn push(
        &self,
        entry: Request,
        profile: Option<&CrawlProfile>,
        robots: &dyn RobotsHints,
    ) -> Result<PushOutcome, StoreError> {
        let hash = entry.url_hash;
        let url = match entry.parsed_url() {
            Some(url) => url,
            None => return Ok(PushOutcome::Rejected(RejectReason::MalformedUrl)),
        };

        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(PushOutcome::Rejected(RejectReason::QueueClosed));
            }
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
        }

        // outside the lock: concurrently load robots.txt for new hosts
        let agent = profile.map(|p| p.agent.as_str()).unwrap_or("crawler");
        robots.ensure_exist(&url, agent);
        Ok(PushOutcome::Accepted)
    }

    fn pop(
        &self,
        delay: bool,
        profiles: &dyn ProfileRegistry,
        robots: &dyn RobotsHints,
    ) -> Result<Option<Request>, StoreError> {
        let mut guard = self.inner.lock();
        let mut fail_hash: Option<UrlHash> = None;

        let (entry, url, sleeptime, agent) = loop {
            if guard.closed || guard.store.is_empty()? {
                return Ok(None);
            }
            let next = match self.getbest(&mut guard, profiles, robots)? {
                Some(next) => next,
                None => return Ok(None),
            };
            // a single pathological entry must not loop this pop forever
            if fail_hash == Some(next) {
                return Ok(None);
            }

            let entry = match guard.store.take(&next)? {
                Some(entry) => entry,
                None => {
                    fail_hash = Some(next);
                    continue;
                }
            };
            guard.dedup.remove(&next);

            let Some(url) = entry.parsed_url() else {
                fail_hash = Some(next);
                continue;
            };
            // blacklist rules may have been added after the queue was filled
            if self.blacklist.is_listed(&url) {
                debug!(url = %entry.url, "popped url is blacklisted, discarding");
                fail_hash = Some(next);
                continue;
            }
            let Some(profile) = profiles.get_active(&entry.profile_handle) else {
                debug!(handle = %entry.profile_handle, "no profile entry for handle");
                fail_hash = Some(next);
                continue;
            };

            let sleeptime = self.politeness.domain_sleep_time(robots, &profile, &url);
            break (entry, url, sleeptime, profile.agent.clone());
        };

        let robots_time = self.politeness.waiting_robots(&url, robots, &agent);
        self.politeness.update_after_selection(&url, robots_time);

        if delay && sleeptime > 0 {
            // worst-case protection: the selection heuristic should rarely
            // leave a wait, but the minimum delta must hold regardless
            info!(
                host = ?url.host_str(),
                sleeptime_ms = sleeptime,
                domain_stacks = guard.domain_stacks.len(),
                domain_stacks_initial = guard.dom_stack_init_size,
                "forcing crawl-delay"
            );
            self.sleep_sliced(&mut guard, sleeptime, url.host_str().unwrap_or(""));
            self.politeness.update_after_selection(&url, robots_time);
        }

        Ok(Some(entry))
    }

    fn get(&self, hash: &UrlHash) -> Result<Option<Request>, StoreError> {
        self.inner.lock().store.get(hash)
    }

    fn remove(&self, hashes: &HashSet<UrlHash>) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, hashes)
    }

    fn remove_all_by_profile_handle(
        &self,
        handle: &str,
        timeout: Duration,
    ) -> Result<usize, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        let mut doomed = HashSet::new();
        inner.store.scan(usize::MAX, |hash, request| {
            if let Some(request) = request {
                if request.profile_handle == handle {
                    doomed.insert(hash);
                }
            }
            Instant::now() < deadline
        })?;
        Self::remove_locked(&mut inner, &doomed)
    }

    fn remove_all_by_host_hashes(&self, _host_hashes: &HashSet<HostHash>) -> usize {
        // not supported by the single-table design
        0
    }

    fn has(&self, hash: &UrlHash) -> bool {
        let inner = self.inner.lock();
        inner.dedup.contains(hash) || inner.store.has(hash).unwrap_or(false)
    }

    fn len(&self) -> usize {
        self.inner.lock().store.len().unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.inner.lock().store.is_empty().unwrap_or(true)
    }

    fn get_domain_stack_hosts(&self, _robots: &dyn RobotsHints) -> BTreeMap<String, (usize, i64)> {
        let inner = self.inner.lock();
        let mut map = BTreeMap::new();
        for (label, handles) in inner.domain_stacks.iter() {
            let delta = self.politeness.waiting_remaining_guessed(handles.host_hash);
            map.insert(label.clone(), (handles.hashes.len(), delta));
        }
        map
    }

    fn get_domain_stack_references(
        &self,
        host: &str,
        max_count: usize,
        max_time: Duration,
    ) -> Vec<Request> {
        let deadline = Instant::now() + max_time;
        let inner = self.inner.lock();
        let prefix = format!("{}:", host.to_lowercase());
        let Some(handles) = inner
            .domain_stacks
            .iter()
            .find(|(label, _)| *label == host || label.starts_with(&prefix))
            .map(|(_, handles)| handles)
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for hash in handles.hashes.iter().take(max_count) {
            match inner.store.get(hash) {
                Ok(Some(request)) => out.push(request),
                Ok(None) | Err(_) => continue,
            }
            if Instant::now() > deadline {
                break;
            }
        }
        out
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        info!(entries = inner.store.len().unwrap_or(0), "clearing balancer");
        inner.store.clear()?;
        inner.domain_stacks.clear();
        inner.dedup.clear();
        inner.zero_waiting.clear();
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.domain_stacks.clear();
        inner.zero_waiting.clear();
        self.wakeup.notify_all();
    }
}
