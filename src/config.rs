// Scheduler tuning constants - single source of truth

pub struct Config;

impl Config {
    // Double-push dedup set
    pub const MAX_DOUBLE_PUSH_CHECK: usize = 100_000;

    // Store sizing
    pub const STORE_CACHE_BYTES: usize = 64 * 1024 * 1024;
    pub const STORE_CACHE_FALLBACK_BYTES: usize = 1024 * 1024;
    pub const STACK_SUFFIX: &'static str = ".stack";

    // Sharded balancer round-robin working set
    pub const ROUND_ROBIN_FLOOR: usize = 100;
    pub const SMALL_STACK_SIZE: usize = 10;
    pub const PRUNE_WAIT_THRESHOLD_MS: i64 = 1000;
    pub const WAIT_BUCKET_MS: i64 = 200;
    pub const UNSEEN_HOSTS_PER_REFRESH: usize = 25;
    pub const POST_WAIT_PRUNE_FLOOR: usize = 3;
    pub const LONG_WAIT_MS: u128 = 1000;

    // Legacy balancer domain-stack view
    pub const DOMAIN_STACK_REFILL_MS: u64 = 60_000;
    pub const DOMAIN_STACK_MAX_HOSTS: usize = 1000;
    pub const DOMAIN_SCAN_MAX_ENTRIES: usize = 100_000;
    pub const DOMAIN_FILL_TIME_BUDGET_MS: u64 = 5000;
    pub const ZERO_CANDIDATES_MAX: usize = 1000;
    pub const ZERO_PICK_ALL_BELOW: usize = 10;
    pub const ZERO_PICK_DIVISOR: usize = 3;
    pub const NEW_HOST_FORWARD_SLOTS: usize = 1;
    pub const NEW_HOST_SCORE: usize = 10_000;

    // Politeness defaults (milliseconds between fetches to one host)
    pub const MIN_LOCAL_DELTA_MS: u64 = 10;
    pub const MIN_GLOBAL_DELTA_MS: u64 = 250;

    // Blocking pop: waits shorter than this many whole seconds are not sliced
    pub const SLEEP_SLICE_MIN_LOOPS: u64 = 3;
}
