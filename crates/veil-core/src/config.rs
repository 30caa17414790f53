//! Engine configuration.

use std::path::PathBuf;

/// Default limit on policy body nesting.
pub const DEFAULT_MAX_EXPRESSION_DEPTH: usize = 64;

/// Default row count below which the hook does not spawn workers.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1024;

fn default_hook_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
        .max(1)
}

/// Veil engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory of the durable log. `None` keeps all state in memory.
    pub data_path: Option<PathBuf>,

    /// Attaching to a column or table with an active attachment replaces it.
    /// When false the attach fails with `AttachmentConflict`.
    pub implicit_replace: bool,

    /// Deepest policy body the compiler accepts.
    pub max_expression_depth: usize,

    /// Worker threads used by the execution hook for large batches.
    pub hook_workers: usize,

    /// Batches smaller than this are applied on the calling thread.
    pub parallel_threshold: usize,
}

impl EngineConfig {
    /// Create an in-memory configuration.
    pub fn new() -> Self {
        Self {
            data_path: None,
            implicit_replace: true,
            max_expression_depth: DEFAULT_MAX_EXPRESSION_DEPTH,
            hook_workers: default_hook_workers(),
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    /// Create a configuration persisted under `path`.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self::new().with_data_path(path)
    }

    /// Set the durable log directory.
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Enable or disable implicit attachment replacement.
    pub fn with_implicit_replace(mut self, enabled: bool) -> Self {
        self.implicit_replace = enabled;
        self
    }

    /// Set the maximum policy body depth.
    pub fn with_max_expression_depth(mut self, depth: usize) -> Self {
        self.max_expression_depth = depth.max(1);
        self
    }

    /// Set the number of hook workers.
    pub fn with_hook_workers(mut self, workers: usize) -> Self {
        self.hook_workers = workers.max(1);
        self
    }

    /// Set the parallel threshold.
    pub fn with_parallel_threshold(mut self, rows: usize) -> Self {
        self.parallel_threshold = rows;
        self
    }

    /// Check if the engine keeps a durable log.
    pub fn is_persistent(&self) -> bool {
        self.data_path.is_some()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
