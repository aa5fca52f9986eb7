//! Engine configuration.

use std::time::Duration;

/// Tunables for the synchronization engine.
///
/// # Defaults
///
/// | Setting                   | Default | Description                                    |
/// |---------------------------|---------|------------------------------------------------|
/// | `store_capacity`          | 1000    | Max tasks retained before LRU eviction         |
/// | `pending_grace`           | 5 s     | How long to buffer events for an unknown task  |
/// | `pending_buffer_per_task` | 32      | Max buffered events per unknown task           |
/// | `quiet_period`            | 60 s    | Silence before an in-flight task is flagged    |
/// | `poll_interval`           | 2 s     | Interval for the polling fallback driver       |
/// | `default_page_limit`      | 50      | List page size when the caller gives none      |
///
/// # Examples
///
/// ```
/// use agent_tasks::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     store_capacity: 200,
///     pending_grace: Duration::from_secs(2),
///     ..EngineConfig::default()
/// };
/// assert_eq!(config.store_capacity, 200);
/// assert_eq!(config.default_page_limit, 50);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of tasks the store retains. When exceeded, the
    /// least-recently-touched task is silently evicted.
    pub store_capacity: usize,

    /// How long an event referencing an unknown task is buffered before
    /// being dropped. Covers the race where a status event for a
    /// just-created task arrives before its creation event. Tunable, not
    /// a contract.
    pub pending_grace: Duration,

    /// Cap on buffered events per unknown task id. Events past the cap
    /// are dropped and counted.
    pub pending_buffer_per_task: usize,

    /// Silence on an in-flight task after which the worker is reported
    /// as stalled. Diagnostic only: remote work is expected to be slow,
    /// so the task is never failed on timeout.
    pub quiet_period: Duration,

    /// Interval at which the polling fallback fetches task state from
    /// non-streaming workers.
    pub poll_interval: Duration,

    /// Page size used when a list request does not specify a limit.
    pub default_page_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_capacity: 1000,
            pending_grace: Duration::from_secs(5),
            pending_buffer_per_task: 32,
            quiet_period: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            default_page_limit: 50,
        }
    }
}
