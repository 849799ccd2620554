//! Options consumed by the Registry, Dispatcher and Health reporter.
use std::time::Duration;

/// What happens when a version is at its concurrency limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverloadPolicy {
    /// Fail with `Unavailable` immediately.
    Reject,
    /// Wait for a free slot, up to `queue_timeout` if set.
    Queue,
}

/// Which version serves a request that does not name one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Highest ready version
    Latest,
    /// Always this version
    Pinned(u64),
}

/// Dispatcher configuration
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Concurrent executor calls allowed per model version, None for unlimited.
    pub max_concurrent_requests_per_version: Option<usize>,
    /// Behavior at the limit
    pub overload_policy: OverloadPolicy,
    /// Longest a queued request waits, None to wait indefinitely.
    pub queue_timeout: Option<Duration>,
    /// Server is ready only when every registered model is ready.
    pub require_all_models_ready: bool,
    /// Version used when a request names none.
    pub default_model_version: VersionPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_concurrent_requests_per_version: None,
            overload_policy: OverloadPolicy::Reject,
            queue_timeout: None,
            require_all_models_ready: false,
            default_model_version: VersionPolicy::Latest,
        }
    }
}
