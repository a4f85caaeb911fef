use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::balancer::{Balancer, PushOutcome, RejectReason};
use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::host_queue::HostQueue;
use crate::latency::Politeness;
use crate::profile::{CrawlProfile, ProfileRegistry};
use crate::request::{HostHash, Request, UrlHash};
use crate::robots::RobotsHints;
use crate::store::StoreError;

/// Click-depth cache shared by every [`HostBalancer`] in the process.
///
/// Explicitly constructed and injected rather than kept as a global; its
/// lifetime is tied to the owning schedulers and it is cleared on `close`.
pub struct DepthCache {
    depths: DashMap<UrlHash, u16>,
}

impl DepthCache {
    pub fn new() -> Self {
        Self {
            depths: DashMap::new(),
        }
    }

    pub fn insert(&self, hash: UrlHash, depth: u16) {
        self.depths.insert(hash, depth);
    }

    pub fn has(&self, hash: &UrlHash) -> bool {
        self.depths.contains_key(hash)
    }

    pub fn depth(&self, hash: &UrlHash) -> Option<u16> {
        self.depths.get(hash).map(|d| *d)
    }

    pub fn remove(&self, hash: &UrlHash) {
        self.depths.remove(hash);
    }

    /// Evict every entry belonging to one of the given hosts.
    pub fn remove_hosts(&self, host_hashes: &HashSet<HostHash>) {
        self.depths.retain(|hash, _| !host_hashes.contains(&hash.host_hash()));
    }

    pub fn clear(&self) {
        self.depths.clear();
    }

    pub fn len(&self) -> usize {
        self.depths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }
}

impl Default for DepthCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Sharded frontier scheduler: one [`HostQueue`] per host, selected per pop
/// so that politeness windows are respected and no host is starved.
pub struct HostBalancer {
    hosts_path: PathBuf,
    on_demand_limit: usize,
    queues: DashMap<HostHash, Arc<HostQueue>>,
    /// Working set of hosts still eligible in the current selection round.
    round_robin: Mutex<HashSet<HostHash>>,
    depth_cache: Arc<DepthCache>,
    politeness: Arc<dyn Politeness>,
    blacklist: Arc<dyn Blacklist>,
}

impl HostBalancer {
    /// Open the balancer rooted at `hosts_path`, rescanning existing shard
    /// files from a previous run. Empty shards are deleted, unreadable ones
    /// are discarded.
    pub fn open(
        hosts_path: &Path,
        on_demand_limit: usize,
        depth_cache: Arc<DepthCache>,
        politeness: Arc<dyn Politeness>,
        blacklist: Arc<dyn Blacklist>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(hosts_path)?;
        let queues: DashMap<HostHash, Arc<HostQueue>> = DashMap::new();

        for dir_entry in std::fs::read_dir(hosts_path)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(host_hash) = HostQueue::host_hash_from_file_name(name) else {
                continue;
            };
            match HostQueue::open(hosts_path, host_hash) {
                Ok(queue) => {
                    if queue.is_empty() {
                        queue.close();
                    } else {
                        queues.insert(host_hash, Arc::new(queue));
                    }
                }
                Err(e) => {
                    // Unreadable shards will not get better; drop the file.
                    warn!(file = name, error = %e, "deleting unreadable host queue");
                    let _ = std::fs::remove_file(dir_entry.path());
                }
            }
        }
        if !queues.is_empty() {
            info!(hosts = queues.len(), path = %hosts_path.display(), "reopened host queues");
        }

        Ok(Self {
            hosts_path: hosts_path.to_path_buf(),
            on_demand_limit,
            queues,
            round_robin: Mutex::new(HashSet::new()),
            depth_cache,
            politeness,
            blacklist,
        })
    }

    pub fn on_demand_limit(&self) -> usize {
        self.on_demand_limit
    }

    pub fn depth_cache(&self) -> &Arc<DepthCache> {
        &self.depth_cache
    }

    fn queue_for(&self, host_hash: HostHash) -> Result<Arc<HostQueue>, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.queues.entry(host_hash) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let queue = Arc::new(HostQueue::open(&self.hosts_path, host_hash)?);
                entry.insert(queue.clone());
                Ok(queue)
            }
        }
    }

    /// Rebuild the round-robin working set from all shards.
    ///
    /// Wide crawls accumulate many tiny shards; when small or singleton
    /// stacks exist, hosts with a long guessed wait are pruned so the
    /// working set favors queues that can actually be served soon. A floor
    /// keeps the set from collapsing, and never-seen hosts are admitted at a
    /// bounded rate: each costs a robots.txt fetch before it yields work.
    fn refresh_round_robin(&self, round_robin: &mut HashSet<HostHash>) {
        for entry in self.queues.iter() {
            round_robin.insert(*entry.key());
        }

        let mut singleton_stacks = false;
        let mut small_stacks = false;
        for host in round_robin.iter() {
            if let Some(queue) = self.queues.get(host) {
                let size = queue.len();
                if size == 1 {
                    singleton_stacks = true;
                    break;
                }
                if size <= Config::SMALL_STACK_SIZE {
                    small_stacks = true;
                    break;
                }
            }
        }

        if singleton_stacks || small_stacks {
            let hosts: Vec<HostHash> = round_robin.iter().copied().collect();
            let mut unseen_admitted = 0usize;
            for host in hosts {
                if round_robin.len() <= Config::ROUND_ROBIN_FLOOR {
                    break;
                }
                let queue = match self.queues.get(&host) {
                    Some(queue) => queue.value().clone(),
                    None => {
                        round_robin.remove(&host);
                        continue;
                    }
                };
                if !self.politeness.seen(host) {
                    if unseen_admitted < Config::UNSEEN_HOSTS_PER_REFRESH {
                        unseen_admitted += 1;
                    } else {
                        round_robin.remove(&host);
                    }
                    continue;
                }
                let delta = self.politeness.waiting_remaining_guessed(host);
                if delta < 0 {
                    // keep all non-waiting stacks, they speed things up
                    continue;
                }
                if delta >= Config::PRUNE_WAIT_THRESHOLD_MS {
                    round_robin.remove(&host);
                    continue;
                }
                let size = queue.len();
                if singleton_stacks {
                    if size != 1 {
                        round_robin.remove(&host);
                    }
                } else if size > Config::SMALL_STACK_SIZE {
                    round_robin.remove(&host);
                }
            }
        }

        info!(hosts = round_robin.len(), "(re-)initialized the round-robin queue");
    }

    /// Mixed minimum-sleep-time / largest-queue strategy: bucket hosts by a
    /// coarse quantized guessed wait; if the lowest bucket holds several
    /// hosts, prefer the one with the largest queue for throughput. The top
    /// bucket is dropped from the working set so one refresh does not serve
    /// every host.
    fn select_mixed(&self, round_robin: &mut HashSet<HostHash>) -> Option<HostHash> {
        let mut fast_tree: BTreeMap<i64, Vec<HostHash>> = BTreeMap::new();
        let mut chosen: Option<HostHash> = None;

        for host in round_robin.iter() {
            if self.queues.get(host).is_none() {
                continue;
            }
            let mut delta =
                self.politeness.waiting_remaining_guessed(*host) / Config::WAIT_BUCKET_MS;
            if delta < 0 {
                delta = 0;
            }
            fast_tree.entry(delta).or_default().push(*host);

            let first_bucket = fast_tree.values().next().expect("just inserted");
            if first_bucket.len() > 1 {
                let mut largest = 0usize;
                for candidate in first_bucket {
                    if let Some(queue) = self.queues.get(candidate) {
                        let size = queue.len();
                        if chosen.is_none() || size > largest {
                            largest = size;
                            chosen = Some(*candidate);
                        }
                    }
                }
                break;
            }
        }

        if chosen.is_none() {
            // the lowest bucket never collected more than one host
            chosen = fast_tree.values().next().and_then(|hosts| hosts.first().copied());
        }

        if let Some(top_bucket) = fast_tree.values().next_back() {
            for host in top_bucket {
                round_robin.remove(host);
            }
        }

        chosen
    }

    /// After an unexpectedly long blocking wait, drop every host whose wait
    /// window has already opened: their deltas shifted while we slept and
    /// re-evaluating them now would repeat the stall.
    fn prune_ready_hosts(&self) {
        let mut round_robin = self.round_robin.lock();
        let hosts: Vec<HostHash> = round_robin.iter().copied().collect();
        for host in hosts {
            if round_robin.len() <= Config::POST_WAIT_PRUNE_FLOOR {
                break;
            }
            match self.queues.get(&host) {
                None => {
                    round_robin.remove(&host);
                }
                Some(_) => {
                    if self.politeness.waiting_remaining_guessed(host) >= 0 {
                        round_robin.remove(&host);
                    }
                }
            }
        }
    }

    fn host_hashes_for_label(host: &str) -> Vec<HostHash> {
        let default_port = if host.starts_with("ftp.") { 21 } else { 80 };
        vec![
            HostHash::from_host_port(host, default_port),
            HostHash::from_host_port(host, 443),
        ]
    }
}

impl Balancer for HostBalancer {
    fn push(
        &self,
        entry: Request,
        profile: Option<&CrawlProfile>,
        robots: &dyn RobotsHints,
    ) -> Result<PushOutcome, StoreError> {
        let hash = entry.url_hash;
        let depth = entry.depth;
        if self.depth_cache.has(&hash) {
            return Ok(PushOutcome::Rejected(RejectReason::DoubleInDepthCache));
        }
        let queue = self.queue_for(hash.host_hash())?;
        let outcome = queue.push(entry, profile, robots)?;
        if outcome.is_accepted() {
            // Depth is shared across all balancer instances so click-depth
            // ordering holds across the whole crawl, not just one host.
            self.depth_cache.insert(hash, depth);
        }
        Ok(outcome)
    }

    fn pop(
        &self,
        delay: bool,
        profiles: &dyn ProfileRegistry,
        robots: &dyn RobotsHints,
    ) -> Result<Option<Request>, StoreError> {
        loop {
            let selected = {
                let mut round_robin = self.round_robin.lock();
                if round_robin.is_empty() {
                    self.refresh_round_robin(&mut round_robin);
                }
                if round_robin.is_empty() {
                    return Ok(None);
                }

                let chosen = if round_robin.len() == 1 {
                    round_robin.iter().next().copied()
                } else {
                    self.select_mixed(&mut round_robin)
                };

                match chosen {
                    Some(host) => {
                        // Taken for this round; not re-selected before refresh.
                        round_robin.remove(&host);
                        match self.queues.get(&host) {
                            Some(queue) => Some((host, queue.value().clone())),
                            None => {
                                round_robin.clear();
                                None
                            }
                        }
                    }
                    None => {
                        round_robin.clear();
                        None
                    }
                }
            };

            let (host, queue) = match selected {
                Some(pair) => pair,
                None => continue,
            };

            // The blocking pop happens outside the working-set lock so
            // pushes and other shards stay serviceable during the wait.
            let started = Instant::now();
            let request = queue.pop(
                delay,
                profiles,
                robots,
                self.politeness.as_ref(),
                self.blacklist.as_ref(),
            )?;
            if started.elapsed().as_millis() > Config::LONG_WAIT_MS {
                self.prune_ready_hosts();
            }

            if queue.is_empty() {
                self.queues.remove(&host);
                queue.close();
            }

            match request {
                Some(request) => {
                    self.depth_cache.remove(&request.url_hash);
                    return Ok(Some(request));
                }
                None => continue,
            }
        }
    }

    fn get(&self, hash: &UrlHash) -> Result<Option<Request>, StoreError> {
        match self.queues.get(&hash.host_hash()) {
            Some(queue) => queue.get(hash),
            None => Ok(None),
        }
    }

    fn remove(&self, hashes: &HashSet<UrlHash>) -> Result<usize, StoreError> {
        let mut per_host: BTreeMap<HostHash, HashSet<UrlHash>> = BTreeMap::new();
        for hash in hashes {
            self.depth_cache.remove(hash);
            per_host.entry(hash.host_hash()).or_default().insert(*hash);
        }
        let mut removed = 0;
        for (host, host_hashes) in per_host {
            if let Some(queue) = self.queues.get(&host).map(|q| q.value().clone()) {
                removed += queue.remove(&host_hashes)?;
            }
        }
        Ok(removed)
    }

    fn remove_all_by_profile_handle(
        &self,
        handle: &str,
        timeout: Duration,
    ) -> Result<usize, StoreError> {
        let deadline = Instant::now() + timeout;
        let queues: Vec<Arc<HostQueue>> =
            self.queues.iter().map(|entry| entry.value().clone()).collect();
        let mut removed = 0;
        for queue in queues {
            let hashes = queue.remove_all_by_profile_handle(handle, deadline)?;
            for hash in &hashes {
                self.depth_cache.remove(hash);
            }
            removed += hashes.len();
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(removed)
    }

    fn remove_all_by_host_hashes(&self, host_hashes: &HashSet<HostHash>) -> usize {
        let mut removed = 0;
        for host in host_hashes {
            if let Some((_, queue)) = self.queues.remove(host) {
                removed += queue.len();
                let _ = queue.clear();
                queue.close();
            }
            self.round_robin.lock().remove(host);
        }
        self.depth_cache.remove_hosts(host_hashes);
        removed
    }

    fn has(&self, hash: &UrlHash) -> bool {
        if self.depth_cache.has(hash) {
            return true;
        }
        match self.queues.get(&hash.host_hash()) {
            Some(queue) => queue.has(hash),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }

    fn is_empty(&self) -> bool {
        self.queues.iter().all(|entry| entry.value().is_empty())
    }

    fn get_domain_stack_hosts(&self, _robots: &dyn RobotsHints) -> BTreeMap<String, (usize, i64)> {
        let mut map = BTreeMap::new();
        for entry in self.queues.iter() {
            let queue = entry.value();
            let label = queue
                .host_label()
                .unwrap_or_else(|| queue.host_hash().to_hex());
            let delta = self.politeness.waiting_remaining_guessed(queue.host_hash());
            map.insert(label, (queue.len(), delta));
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
        for candidate in Self::host_hashes_for_label(host) {
            if let Some(queue) = self.queues.get(&candidate).map(|q| q.value().clone()) {
                return queue.snapshot(max_count, deadline);
            }
        }
        Vec::new()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.depth_cache.clear();
        self.round_robin.lock().clear();
        let hosts: Vec<HostHash> = self.queues.iter().map(|entry| *entry.key()).collect();
        for host in hosts {
            if let Some((_, queue)) = self.queues.remove(&host) {
                queue.clear()?;
                queue.close();
            }
        }
        Ok(())
    }

    fn close(&self) {
        debug!(hosts = self.queues.len(), "closing host balancer");
        self.depth_cache.clear();
        self.round_robin.lock().clear();
        let hosts: Vec<HostHash> = self.queues.iter().map(|entry| *entry.key()).collect();
        for host in hosts {
            if let Some((_, queue)) = self.queues.remove(&host) {
                queue.interrupt();
                queue.close();
            }
        }
    }
}
