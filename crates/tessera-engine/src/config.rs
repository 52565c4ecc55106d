//! Dispatcher configuration.

use serde::Deserialize;

/// Settings for the dispatcher's worker pool.
///
/// Deserializable so a host can load it from its own config file; missing
/// fields fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker threads for multi-system stages. `0` lets rayon pick (one per
    /// logical CPU, or `RAYON_NUM_THREADS`).
    pub worker_threads: usize,
    /// Worker thread names are this prefix followed by `-<index>`.
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name_prefix: "tessera-worker".to_owned(),
        }
    }
}

impl DispatcherConfig {
    /// A config with a fixed number of worker threads.
    pub fn with_threads(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Self::default()
        }
    }
}
