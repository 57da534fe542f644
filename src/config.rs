use std::sync::OnceLock;
use std::thread;

/// Default upper bound on a per-thread stack, in handles.
pub const DEFAULT_MAX_CAPACITY_PER_THREAD: usize = 4096;

/// Default divisor applied to `max_capacity_per_thread` to size the
/// inbound handoff budget of a stack.
pub const DEFAULT_MAX_SHARED_CAPACITY_FACTOR: usize = 2;

/// Default admission ratio: one of every `ratio + 1` novel returns is kept.
pub const DEFAULT_RATIO: u32 = 8;

/// Smallest allowed link segment; also the floor of the shared budget.
pub const MIN_LINK_CAPACITY: usize = 16;

/// First allocation of a stack's element array, capped by the configured
/// maximum.
pub(crate) const INITIAL_CAPACITY: usize = 256;

/// Tunables for a [`Pool`](crate::Pool).
///
/// Every field is read once at pool construction. Defaults come from the
/// `RECYCLER_*` environment variables when set, otherwise from the
/// constants above.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on a per-thread stack (default: 4096). 0 disables
    /// pooling entirely: every get allocates and recycle drops.
    pub max_capacity_per_thread: usize,

    /// Divisor for the per-stack inbound handoff budget (default: 2,
    /// min 2). The budget is `max_capacity_per_thread / factor` slots,
    /// floored at the link capacity.
    pub max_shared_capacity_factor: usize,

    /// Admission ratio for novel handles returned on the owner thread
    /// (default: 8). 0 disables the filter.
    pub ratio: u32,

    /// Cap on distinct foreign stacks a thread will service
    /// (default: 2 x available parallelism). 0 disables cross-thread
    /// recycling.
    pub max_delayed_queues_per_thread: usize,

    /// Admission ratio applied at the enqueue side of handoff queues
    /// (default: same as `ratio`).
    pub delayed_queue_ratio: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let defaults = env_defaults();
        Self {
            max_capacity_per_thread: defaults.max_capacity_per_thread,
            max_shared_capacity_factor: defaults.max_shared_capacity_factor,
            ratio: defaults.ratio,
            max_delayed_queues_per_thread: defaults.max_delayed_queues_per_thread,
            delayed_queue_ratio: defaults.delayed_queue_ratio,
        }
    }
}

impl PoolConfig {
    /// Config with pooling disabled: every get allocates fresh.
    pub fn disabled() -> Self {
        Self {
            max_capacity_per_thread: 0,
            ..Default::default()
        }
    }

    /// Clamp fields into their legal ranges. Called once at pool
    /// construction.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_capacity_per_thread == 0 {
            self.max_shared_capacity_factor = 1;
            self.max_delayed_queues_per_thread = 0;
        } else {
            self.max_shared_capacity_factor = self.max_shared_capacity_factor.max(2);
        }
        self
    }

    /// Total handoff slots foreign threads may reserve against one stack.
    pub(crate) fn shared_capacity(&self) -> usize {
        (self.max_capacity_per_thread / self.max_shared_capacity_factor).max(link_capacity())
    }
}

/// Resolved defaults, read from the environment once per process.
struct Defaults {
    max_capacity_per_thread: usize,
    max_shared_capacity_factor: usize,
    ratio: u32,
    max_delayed_queues_per_thread: usize,
    delayed_queue_ratio: u32,
}

static DEFAULTS: OnceLock<Defaults> = OnceLock::new();

fn env_defaults() -> &'static Defaults {
    DEFAULTS.get_or_init(|| {
        let ratio = env_parse("RECYCLER_RATIO").unwrap_or(DEFAULT_RATIO);
        Defaults {
            max_capacity_per_thread: env_parse("RECYCLER_MAX_CAPACITY_PER_THREAD")
                .unwrap_or(DEFAULT_MAX_CAPACITY_PER_THREAD),
            max_shared_capacity_factor: env_parse("RECYCLER_MAX_SHARED_CAPACITY_FACTOR")
                .unwrap_or(DEFAULT_MAX_SHARED_CAPACITY_FACTOR),
            ratio,
            max_delayed_queues_per_thread: env_parse("RECYCLER_MAX_DELAYED_QUEUES_PER_THREAD")
                .unwrap_or_else(default_max_delayed_queues),
            delayed_queue_ratio: env_parse("RECYCLER_DELAYED_QUEUE_RATIO").unwrap_or(ratio),
        }
    })
}

/// One queue per potential producer, times two, like the event-loop count
/// heuristic of the workloads this pool serves.
fn default_max_delayed_queues() -> usize {
    thread::available_parallelism().map_or(2, usize::from) * 2
}

static LINK_CAPACITY: OnceLock<usize> = OnceLock::new();

/// Slots per handoff link segment. Process-global; overridable through
/// `RECYCLER_LINK_CAPACITY` before the first pool is built.
#[inline]
pub fn link_capacity() -> usize {
    *LINK_CAPACITY
        .get_or_init(|| normalize_link_capacity(env_parse("RECYCLER_LINK_CAPACITY").unwrap_or(MIN_LINK_CAPACITY)))
}

/// Round up to a power of two, floored at `MIN_LINK_CAPACITY`.
fn normalize_link_capacity(raw: usize) -> usize {
    raw.max(MIN_LINK_CAPACITY).next_power_of_two()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig {
            max_capacity_per_thread: DEFAULT_MAX_CAPACITY_PER_THREAD,
            max_shared_capacity_factor: DEFAULT_MAX_SHARED_CAPACITY_FACTOR,
            ratio: DEFAULT_RATIO,
            max_delayed_queues_per_thread: default_max_delayed_queues(),
            delayed_queue_ratio: DEFAULT_RATIO,
        };
        assert_eq!(config.max_capacity_per_thread, 4096);
        assert_eq!(config.ratio, 8);
        assert_eq!(config.delayed_queue_ratio, config.ratio);
        assert!(config.max_delayed_queues_per_thread >= 2);
    }

    #[test]
    fn test_normalized_clamps_factor() {
        let config = PoolConfig {
            max_shared_capacity_factor: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.max_shared_capacity_factor, 2);
    }

    #[test]
    fn test_disabled_pool_collapses() {
        let config = PoolConfig::disabled().normalized();
        assert_eq!(config.max_capacity_per_thread, 0);
        assert_eq!(config.max_shared_capacity_factor, 1);
        assert_eq!(config.max_delayed_queues_per_thread, 0);
    }

    #[test]
    fn test_shared_capacity_floor() {
        let config = PoolConfig {
            max_capacity_per_thread: 8,
            max_shared_capacity_factor: 2,
            ..Default::default()
        }
        .normalized();
        // 8 / 2 is below the link capacity floor.
        assert_eq!(config.shared_capacity(), link_capacity());

        let config = PoolConfig {
            max_capacity_per_thread: 4096,
            max_shared_capacity_factor: 2,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.shared_capacity(), 2048);
    }

    #[test]
    fn test_normalize_link_capacity() {
        assert_eq!(normalize_link_capacity(0), MIN_LINK_CAPACITY);
        assert_eq!(normalize_link_capacity(15), 16);
        assert_eq!(normalize_link_capacity(16), 16);
        assert_eq!(normalize_link_capacity(17), 32);
        assert_eq!(normalize_link_capacity(100), 128);
    }
}
