//! Pool configuration.
//!
//! On Linux the timer service (poller plus workers) is started lazily by the
//! first timer. [`configure_pool`] may be called once before that to size it.
//! On Windows the OS default thread pool is used and the configuration is
//! accepted but has no effect.

use std::sync::OnceLock;

/// Upper bound for the default worker count.
const MAX_DEFAULT_WORKERS: usize = 8;

/// Configuration for the callback pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads running callbacks. Clamped to at least 1.
    pub workers: usize,
    /// Prefix for worker thread names (`<prefix>-<index>`).
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(2, MAX_DEFAULT_WORKERS),
            thread_name: "tptimer-worker".into(),
        }
    }
}

impl PoolConfig {
    /// Returns the effective worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}

static POOL_CONFIG: OnceLock<PoolConfig> = OnceLock::new();

/// Installs the pool configuration.
///
/// # Errors
///
/// Returns the rejected configuration if one was already installed, either
/// explicitly or by starting a timer.
pub fn configure_pool(config: PoolConfig) -> Result<(), PoolConfig> {
    POOL_CONFIG.set(config)
}

/// Returns the installed configuration, installing the default if none was.
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn pool_config() -> &'static PoolConfig {
    POOL_CONFIG.get_or_init(PoolConfig::default)
}
