//! Runtime Configuration
//!
//! Sizes, offsets and worker settings for the persistent call runtime.
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `NVSTACK_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `NVSTACK_NUM_THREADS` | Number of worker threads | CPU count |
//! | `NVSTACK_QUEUE_CAPACITY` | Bounded task queue capacity | 64 |
//! | `NVSTACK_HEAP_SIZE` | Heap file size in bytes | 2097152 (2MB) |
//! | `NVSTACK_BLOCK_SIZE` | Allocator block size in bytes | 1 |
//! | `NVSTACK_MAX_BLOCKS` | Highest allocatable block index | 1000 |
//! | `NVSTACK_REGISTER_OFFSET` | CAS register offset in the heap | 2048 |
//! | `NVSTACK_MATRIX_OFFSET` | Notification matrix offset in the heap | 3008 |
//! | `NVSTACK_STACK_SIZE` | Per-thread stack file size in bytes | 2048 (2KB) |
//! | `NVSTACK_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use nvstack_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_threads(4)
//!     .heap_size(4 * 1024 * 1024)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

use crate::cas::matrix_len_bytes;
use crate::layout::{
    align_to_cache_line, CACHE_LINE_SIZE, DEFAULT_HEAP_SIZE, DEFAULT_STACK_SIZE,
};

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Filter directive for `tracing_subscriber::EnvFilter`, limited to the
    /// runtime's own crates.
    pub fn as_filter(&self) -> String {
        match self {
            LogLevel::Off => "off".to_string(),
            level => format!(
                "nvstack_runtime={0},nvstack_driver={0},nvstack={0}",
                level.as_str()
            ),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_threads: usize,

    /// Capacity of the bounded task queue.
    /// Default: 64.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_threads: num_cpus(),
            queue_capacity: 64,
        }
    }
}

/// Persistent heap configuration.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Heap file size in bytes.
    /// Default: 2MB.
    pub size: u64,

    /// Allocator block size in bytes.
    /// Default: 1.
    pub block_size: u64,

    /// Highest block index the allocator may hand out.
    /// Default: 1000.
    pub max_blocks: u64,

    /// Offset of the CAS register; must be cache-line aligned.
    /// Default: 2048.
    pub register_offset: u64,

    /// Offset of the notification matrix; must be 4-byte aligned.
    /// Default: 3008.
    pub matrix_offset: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_HEAP_SIZE,
            block_size: 1,
            max_blocks: 1000,
            register_offset: align_to_cache_line(2000),
            matrix_offset: align_to_cache_line(3000),
        }
    }
}

impl HeapConfig {
    /// Bytes managed by the allocator, block 0 included.
    pub fn allocator_span(&self) -> u64 {
        self.max_blocks
            .saturating_add(1)
            .saturating_mul(self.block_size.saturating_add(1))
    }
}

/// Per-thread stack configuration.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Stack file size in bytes.
    /// Default: 2KB.
    pub size: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_STACK_SIZE,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Worker pool configuration.
    pub workers: WorkerConfig,

    /// Heap configuration.
    pub heap: HeapConfig,

    /// Stack configuration.
    pub stack: StackConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set or do not parse keep their default values.
    pub fn from_env() -> Self {
        Self::from_env_with(|name| env::var(name).ok())
    }

    fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let number = |name: &str| lookup(name).and_then(|s| s.trim().parse::<u64>().ok());

        if let Some(val) = number("NVSTACK_NUM_THREADS") {
            if val > 0 {
                config.workers.num_threads = val as usize;
            }
        }

        if let Some(val) = number("NVSTACK_QUEUE_CAPACITY") {
            if val > 0 {
                config.workers.queue_capacity = val as usize;
            }
        }

        if let Some(val) = number("NVSTACK_HEAP_SIZE") {
            config.heap.size = val;
        }

        if let Some(val) = number("NVSTACK_BLOCK_SIZE") {
            if val > 0 {
                config.heap.block_size = val;
            }
        }

        if let Some(val) = number("NVSTACK_MAX_BLOCKS") {
            config.heap.max_blocks = val;
        }

        if let Some(val) = number("NVSTACK_REGISTER_OFFSET") {
            config.heap.register_offset = val;
        }

        if let Some(val) = number("NVSTACK_MATRIX_OFFSET") {
            config.heap.matrix_offset = val;
        }

        if let Some(val) = number("NVSTACK_STACK_SIZE") {
            config.stack.size = val;
        }

        if let Some(level) = lookup("NVSTACK_LOG_LEVEL").and_then(|s| LogLevel::from_str(&s)) {
            config.log.level = level;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.num_threads == 0 {
            return Err(invalid("workers.num_threads", "must be at least 1"));
        }
        if self.workers.num_threads > u32::MAX as usize - 1 {
            return Err(invalid("workers.num_threads", "must fit a 32-bit thread id"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(invalid("workers.queue_capacity", "must be at least 1"));
        }

        if self.stack.size < 2 * CACHE_LINE_SIZE {
            return Err(invalid("stack.size", "must hold at least two cache lines"));
        }

        let heap = &self.heap;
        if heap.block_size == 0 {
            return Err(invalid("heap.block_size", "must be at least 1"));
        }
        if heap.register_offset % CACHE_LINE_SIZE != 0 {
            return Err(invalid("heap.register_offset", "must be cache-line aligned"));
        }
        if heap.matrix_offset % 4 != 0 {
            return Err(invalid("heap.matrix_offset", "must be 4-byte aligned"));
        }

        let span = heap.allocator_span();
        let matrix_end = heap
            .matrix_offset
            .saturating_add(matrix_len_bytes(self.workers.num_threads as u32));
        if span > heap.size {
            return Err(invalid("heap.max_blocks", "allocator blocks exceed the heap size"));
        }
        if heap.register_offset < span || heap.register_offset.saturating_add(8) > heap.size {
            return Err(invalid(
                "heap.register_offset",
                "must lie inside the heap, past the allocator blocks",
            ));
        }
        if heap.matrix_offset < span || matrix_end > heap.size {
            return Err(invalid(
                "heap.matrix_offset",
                "must lie inside the heap, past the allocator blocks",
            ));
        }
        if heap.matrix_offset < heap.register_offset.saturating_add(8) && heap.register_offset < matrix_end {
            return Err(invalid("heap.matrix_offset", "overlaps the register"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_threads(mut self, n: usize) -> Self {
        self.config.workers.num_threads = n;
        self
    }

    /// Set the task queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.workers.queue_capacity = capacity;
        self
    }

    /// Set the heap file size in bytes.
    pub fn heap_size(mut self, size: u64) -> Self {
        self.config.heap.size = size;
        self
    }

    /// Set the allocator block size in bytes.
    pub fn block_size(mut self, size: u64) -> Self {
        self.config.heap.block_size = size;
        self
    }

    /// Set the highest allocatable block index.
    pub fn max_blocks(mut self, blocks: u64) -> Self {
        self.config.heap.max_blocks = blocks;
        self
    }

    /// Set the CAS register offset.
    pub fn register_offset(mut self, offset: u64) -> Self {
        self.config.heap.register_offset = offset;
        self
    }

    /// Set the notification matrix offset.
    pub fn matrix_offset(mut self, offset: u64) -> Self {
        self.config.heap.matrix_offset = offset;
        self
    }

    /// Set the per-thread stack file size in bytes.
    pub fn stack_size(mut self, size: u64) -> Self {
        self.config.stack.size = size;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.workers.num_threads >= 1);
        assert_eq!(config.heap.size, 2 * 1024 * 1024);
        assert_eq!(config.heap.block_size, 1);
        assert_eq!(config.heap.max_blocks, 1000);
        assert_eq!(config.heap.register_offset, 2048);
        assert_eq!(config.heap.matrix_offset, 3008);
        assert_eq!(config.stack.size, 2048);
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_threads(4)
            .queue_capacity(8)
            .heap_size(1024 * 1024)
            .stack_size(4096)
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.workers.num_threads, 4);
        assert_eq!(config.workers.queue_capacity, 8);
        assert_eq!(config.heap.size, 1024 * 1024);
        assert_eq!(config.stack.size, 4096);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_threads(0).build().is_err());
        assert!(RuntimeConfig::builder().queue_capacity(0).build().is_err());
        assert!(RuntimeConfig::builder().block_size(0).build().is_err());
        assert!(RuntimeConfig::builder().stack_size(64).build().is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder()
            .register_offset(100)
            .build_unchecked();
        assert_eq!(config.heap.register_offset, 100);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "heap.register_offset"
        ));
    }

    #[test]
    fn test_validation_of_heap_layout() {
        let err = RuntimeConfig::builder()
            .register_offset(2050)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("heap.register_offset"));

        // Register inside the allocator blocks.
        assert!(RuntimeConfig::builder().register_offset(1024).build().is_err());
        // Matrix past the end of the heap.
        assert!(RuntimeConfig::builder()
            .heap_size(3016)
            .num_threads(2)
            .build()
            .is_err());
        // Matrix overlapping the register.
        assert!(RuntimeConfig::builder()
            .matrix_offset(2052)
            .build()
            .is_err());
        // Allocator larger than the heap.
        assert!(RuntimeConfig::builder().max_blocks(1 << 30).build().is_err());
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("invalid"), None);
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Off.as_filter(), "off");
        assert!(LogLevel::Debug.as_filter().contains("nvstack_runtime=debug"));
    }

    #[test]
    fn test_config_error_display() {
        let err = invalid("num_threads", "must be positive");
        assert!(err.to_string().contains("num_threads"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_env_values() {
        let vars: HashMap<&str, &str> = [
            ("NVSTACK_NUM_THREADS", "3"),
            ("NVSTACK_HEAP_SIZE", "65536"),
            ("NVSTACK_BLOCK_SIZE", "0"),
            ("NVSTACK_STACK_SIZE", "not a number"),
            ("NVSTACK_LOG_LEVEL", "trace"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_env_with(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.workers.num_threads, 3);
        assert_eq!(config.heap.size, 65536);
        assert_eq!(config.heap.block_size, 1);
        assert_eq!(config.stack.size, DEFAULT_STACK_SIZE);
        assert_eq!(config.log.level, LogLevel::Trace);
    }

    #[test]
    fn test_from_env_with_no_vars() {
        let config = RuntimeConfig::from_env_with(|_| None);
        assert!(config.workers.num_threads >= 1);
        assert_eq!(config.heap.size, DEFAULT_HEAP_SIZE);
    }
}
