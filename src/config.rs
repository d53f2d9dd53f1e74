//! Runtime configuration and environment-variable overrides.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — fields set on [`RuntimeConfig`] directly
//! 2. **Environment variables** — `TASKGRID_*` overrides
//! 3. **Config file** — TOML (requires the `config-file` feature)
//! 4. **Defaults** — [`RuntimeConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `TASKGRID_SCHEDULING_POLICY` | `fifo`\|`lifo` | `scheduling_policy` |
//! | `TASKGRID_IMMEDIATE_SUCCESSOR` | `bool` | `immediate_successor` |
//! | `TASKGRID_PRIORITY` | `bool` | `priority` |
//! | `TASKGRID_SCHEDULER_POLLING_ITER` | `u32` | `polling_iterations` |
//! | `TASKGRID_QUEUE_THRESHOLD` | `usize` | `queue_threshold` |
//! | `TASKGRID_WORKER_STACK_SIZE` | `usize` | `worker_stack_size` |
//! | `TASKGRID_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `TASKGRID_TRANSFER_POLL_INTERVAL_US` | `u64` | `transfer_poll_interval_us` |
//! | `TASKGRID_VERBOSE_CLUSTER_MESSAGES` | `bool` | `verbose_cluster_messages` |

use core::fmt;
use thiserror::Error;

/// Environment variable name for the scheduling policy.
pub const ENV_SCHEDULING_POLICY: &str = "TASKGRID_SCHEDULING_POLICY";
/// Environment variable name for the immediate-successor fast-path toggle.
pub const ENV_IMMEDIATE_SUCCESSOR: &str = "TASKGRID_IMMEDIATE_SUCCESSOR";
/// Environment variable name for the priority-queue toggle.
pub const ENV_PRIORITY: &str = "TASKGRID_PRIORITY";
/// Environment variable name for the scheduler busy-poll budget.
pub const ENV_POLLING_ITERATIONS: &str = "TASKGRID_SCHEDULER_POLLING_ITER";
/// Environment variable name for the leaf queue overflow threshold.
pub const ENV_QUEUE_THRESHOLD: &str = "TASKGRID_QUEUE_THRESHOLD";
/// Environment variable name for the worker thread stack size.
pub const ENV_WORKER_STACK_SIZE: &str = "TASKGRID_WORKER_STACK_SIZE";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "TASKGRID_THREAD_NAME_PREFIX";
/// Environment variable name for the transfer poller cadence (microseconds).
pub const ENV_TRANSFER_POLL_INTERVAL_US: &str = "TASKGRID_TRANSFER_POLL_INTERVAL_US";
/// Environment variable name for verbose cluster instrumentation.
pub const ENV_VERBOSE_CLUSTER_MESSAGES: &str = "TASKGRID_VERBOSE_CLUSTER_MESSAGES";

/// Queue discipline applied at every level of the scheduler tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// First in, first out (arrival order preserved).
    #[default]
    Fifo,
    /// Last in, first out (arrival order reversed).
    Lifo,
}

impl SchedulingPolicy {
    /// Parses a policy name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "lifo" => Ok(Self::Lifo),
            _ => Err(ConfigError::InvalidValue {
                setting: ENV_SCHEDULING_POLICY,
                expected: "fifo or lifo",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => f.write_str("fifo"),
            Self::Lifo => f.write_str("lifo"),
        }
    }
}

/// A malformed or incompatible configuration value.
///
/// These are fatal: the runtime refuses to start with a diagnostic naming
/// the offending setting.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting was present but unparseable.
    #[error("invalid value for {setting}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// The setting (environment variable) name.
        setting: &'static str,
        /// Human description of the accepted values.
        expected: &'static str,
        /// The offending raw value.
        value: String,
    },
    /// A config file could not be read or parsed.
    #[cfg(feature = "config-file")]
    #[error("config file {path}: {message}")]
    File {
        /// Path of the file.
        path: String,
        /// Why it was rejected.
        message: String,
    },
}

/// Runtime configuration.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Queue discipline at every level of the scheduler tree.
    pub scheduling_policy: SchedulingPolicy,
    /// When true, a task unblocked by another task's release is preferred
    /// by the releasing CPU.
    pub immediate_successor: bool,
    /// When true, ready queues become priority-augmented.
    pub priority: bool,
    /// Busy-wait budget (slot polls) before a worker parks.
    pub polling_iterations: u32,
    /// Leaf queue overflow threshold; 0 selects an automatic value.
    pub queue_threshold: usize,
    /// Stack size per worker thread in bytes.
    pub worker_stack_size: usize,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// Cadence of the data-transfer completion poller, in microseconds.
    pub transfer_poll_interval_us: u64,
    /// Enable the verbose cluster instrumentation backend.
    pub verbose_cluster_messages: bool,
}

impl RuntimeConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_stack_size == 0 {
            self.worker_stack_size = 2 * 1024 * 1024;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "taskgrid-worker".to_string();
        }
        if self.transfer_poll_interval_us == 0 {
            self.transfer_poll_interval_us = 1;
        }
    }

    /// Builds a configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        apply_env_overrides(&mut config)?;
        config.normalize();
        Ok(config)
    }

    /// Effective leaf queue threshold for the given CPU count.
    #[must_use]
    pub fn effective_queue_threshold(&self, total_cpus: usize) -> usize {
        if self.queue_threshold != 0 {
            return self.queue_threshold;
        }
        // One batch worth of work per sibling keeps overflow rare on
        // balanced loads.
        (total_cpus * 2).max(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduling_policy: SchedulingPolicy::Fifo,
            immediate_successor: true,
            priority: true,
            polling_iterations: 100_000,
            queue_threshold: 0,
            worker_stack_size: 2 * 1024 * 1024,
            thread_name_prefix: "taskgrid-worker".to_string(),
            transfer_poll_interval_us: 50,
            verbose_cluster_messages: false,
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("scheduling_policy", &self.scheduling_policy)
            .field("immediate_successor", &self.immediate_successor)
            .field("priority", &self.priority)
            .field("polling_iterations", &self.polling_iterations)
            .field("queue_threshold", &self.queue_threshold)
            .field("verbose_cluster_messages", &self.verbose_cluster_messages)
            .finish_non_exhaustive()
    }
}

/// Apply environment variable overrides to a [`RuntimeConfig`].
///
/// Only variables that are set in the environment are applied. Returns an
/// error if a variable is set but contains an unparseable value.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_SCHEDULING_POLICY) {
        config.scheduling_policy = SchedulingPolicy::parse(&val)?;
    }
    if let Some(val) = read_env(ENV_IMMEDIATE_SUCCESSOR) {
        config.immediate_successor = parse_bool(ENV_IMMEDIATE_SUCCESSOR, &val)?;
    }
    if let Some(val) = read_env(ENV_PRIORITY) {
        config.priority = parse_bool(ENV_PRIORITY, &val)?;
    }
    if let Some(val) = read_env(ENV_POLLING_ITERATIONS) {
        config.polling_iterations = parse_num(ENV_POLLING_ITERATIONS, &val)?;
    }
    if let Some(val) = read_env(ENV_QUEUE_THRESHOLD) {
        config.queue_threshold = parse_num(ENV_QUEUE_THRESHOLD, &val)?;
    }
    if let Some(val) = read_env(ENV_WORKER_STACK_SIZE) {
        config.worker_stack_size = parse_num(ENV_WORKER_STACK_SIZE, &val)?;
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_TRANSFER_POLL_INTERVAL_US) {
        config.transfer_poll_interval_us = parse_num(ENV_TRANSFER_POLL_INTERVAL_US, &val)?;
    }
    if let Some(val) = read_env(ENV_VERBOSE_CLUSTER_MESSAGES) {
        config.verbose_cluster_messages = parse_bool(ENV_VERBOSE_CLUSTER_MESSAGES, &val)?;
    }
    Ok(())
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_num<T: std::str::FromStr>(setting: &'static str, val: &str) -> Result<T, ConfigError> {
    val.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            setting,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_bool(setting: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            setting,
            expected: "bool (true/false/1/0/yes/no)",
            value: val.to_string(),
        }),
    }
}

// =========================================================================
// TOML config file support (feature-gated)
// =========================================================================

/// TOML-deserializable runtime configuration.
///
/// Mirrors [`RuntimeConfig`] in a flat, serialization-friendly layout:
///
/// ```toml
/// [scheduler]
/// scheduling_policy = "lifo"
/// immediate_successor = true
/// priority = false
/// polling_iterations = 5000
/// queue_threshold = 8
///
/// [workers]
/// stack_size = 2097152
/// thread_name_prefix = "myapp-worker"
///
/// [cluster]
/// transfer_poll_interval_us = 50
/// verbose_messages = false
/// ```
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct RuntimeTomlConfig {
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerToml,
    /// Worker settings.
    #[serde(default)]
    pub workers: WorkersToml,
    /// Cluster settings.
    #[serde(default)]
    pub cluster: ClusterToml,
}

/// Scheduler section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct SchedulerToml {
    /// Queue discipline, `"fifo"` or `"lifo"`.
    pub scheduling_policy: Option<String>,
    /// Successor fast-path toggle.
    pub immediate_successor: Option<bool>,
    /// Priority queue toggle.
    pub priority: Option<bool>,
    /// Busy-poll budget before parking.
    pub polling_iterations: Option<u32>,
    /// Leaf overflow threshold.
    pub queue_threshold: Option<usize>,
}

/// Workers section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct WorkersToml {
    /// Stack size per worker thread in bytes.
    pub stack_size: Option<usize>,
    /// Name prefix for worker threads.
    pub thread_name_prefix: Option<String>,
}

/// Cluster section of the TOML config.
#[cfg(feature = "config-file")]
#[derive(serde::Deserialize, Default, Debug)]
pub struct ClusterToml {
    /// Transfer poller cadence in microseconds.
    pub transfer_poll_interval_us: Option<u64>,
    /// Verbose cluster instrumentation.
    pub verbose_messages: Option<bool>,
}

/// Apply a parsed TOML config to a [`RuntimeConfig`].
#[cfg(feature = "config-file")]
pub fn apply_toml_config(
    config: &mut RuntimeConfig,
    toml: &RuntimeTomlConfig,
) -> Result<(), ConfigError> {
    if let Some(ref v) = toml.scheduler.scheduling_policy {
        config.scheduling_policy = SchedulingPolicy::parse(v)?;
    }
    if let Some(v) = toml.scheduler.immediate_successor {
        config.immediate_successor = v;
    }
    if let Some(v) = toml.scheduler.priority {
        config.priority = v;
    }
    if let Some(v) = toml.scheduler.polling_iterations {
        config.polling_iterations = v;
    }
    if let Some(v) = toml.scheduler.queue_threshold {
        config.queue_threshold = v;
    }
    if let Some(v) = toml.workers.stack_size {
        config.worker_stack_size = v;
    }
    if let Some(ref v) = toml.workers.thread_name_prefix {
        config.thread_name_prefix.clone_from(v);
    }
    if let Some(v) = toml.cluster.transfer_poll_interval_us {
        config.transfer_poll_interval_us = v;
    }
    if let Some(v) = toml.cluster.verbose_messages {
        config.verbose_cluster_messages = v;
    }
    Ok(())
}

/// Parse a TOML string into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_str(toml_str: &str) -> Result<RuntimeTomlConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::File {
        path: "<inline>".to_string(),
        message: e.to_string(),
    })
}

/// Read and parse a TOML file into a [`RuntimeTomlConfig`].
#[cfg(feature = "config-file")]
pub fn parse_toml_file(path: &std::path::Path) -> Result<RuntimeTomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        message: format!("failed to read: {e}"),
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::File {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;

    fn with_env<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = env_lock();
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let result = f();
        for (k, _) in vars {
            std::env::remove_var(k);
        }
        result
    }

    #[test]
    fn policy_parse_accepts_both_cases() {
        assert_eq!(
            SchedulingPolicy::parse("FIFO").unwrap(),
            SchedulingPolicy::Fifo
        );
        assert_eq!(
            SchedulingPolicy::parse("lifo").unwrap(),
            SchedulingPolicy::Lifo
        );
        assert_eq!(
            SchedulingPolicy::parse(" lifo ").unwrap(),
            SchedulingPolicy::Lifo
        );
    }

    #[test]
    fn policy_parse_rejects_unknown_and_names_setting() {
        let err = SchedulingPolicy::parse("round-robin").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(ENV_SCHEDULING_POLICY), "{msg}");
        assert!(msg.contains("round-robin"), "{msg}");
    }

    #[test]
    fn parse_bool_all_values() {
        for val in &["true", "1", "yes", "on", "TRUE"] {
            assert!(parse_bool("TEST", val).unwrap());
        }
        for val in &["false", "0", "no", "off", "OFF"] {
            assert!(!parse_bool("TEST", val).unwrap());
        }
        assert!(parse_bool("TEST", "maybe").is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.scheduling_policy, SchedulingPolicy::Fifo);
        assert!(config.immediate_successor);
        assert!(config.priority);
        assert_eq!(config.polling_iterations, 100_000);
        assert!(!config.verbose_cluster_messages);
    }

    #[test]
    fn env_overrides_policy_and_budget() {
        with_env(
            &[
                (ENV_SCHEDULING_POLICY, "lifo"),
                (ENV_POLLING_ITERATIONS, "77"),
                (ENV_PRIORITY, "no"),
            ],
            || {
                let mut config = RuntimeConfig::default();
                apply_env_overrides(&mut config).unwrap();
                assert_eq!(config.scheduling_policy, SchedulingPolicy::Lifo);
                assert_eq!(config.polling_iterations, 77);
                assert!(!config.priority);
            },
        );
    }

    #[test]
    fn env_overrides_invalid_value_is_fatal() {
        with_env(&[(ENV_POLLING_ITERATIONS, "lots")], || {
            let mut config = RuntimeConfig::default();
            let err = apply_env_overrides(&mut config).unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains(ENV_POLLING_ITERATIONS), "{msg}");
            assert!(msg.contains("lots"), "{msg}");
        });
    }

    #[test]
    fn normalize_fills_safe_values() {
        let mut config = RuntimeConfig {
            worker_stack_size: 0,
            thread_name_prefix: String::new(),
            transfer_poll_interval_us: 0,
            ..RuntimeConfig::default()
        };
        config.normalize();
        assert_eq!(config.worker_stack_size, 2 * 1024 * 1024);
        assert_eq!(config.thread_name_prefix, "taskgrid-worker");
        assert_eq!(config.transfer_poll_interval_us, 1);
    }

    #[test]
    fn auto_queue_threshold_scales_with_cpus() {
        let config = RuntimeConfig::default();
        assert_eq!(config.effective_queue_threshold(4), 8);
        assert_eq!(config.effective_queue_threshold(0), 1);
        let fixed = RuntimeConfig {
            queue_threshold: 3,
            ..RuntimeConfig::default()
        };
        assert_eq!(fixed.effective_queue_threshold(64), 3);
    }
}

#[cfg(all(test, feature = "config-file"))]
mod toml_tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[scheduler]
scheduling_policy = "lifo"
priority = false
polling_iterations = 500
queue_threshold = 8

[workers]
stack_size = 4194304
thread_name_prefix = "myapp"

[cluster]
transfer_poll_interval_us = 10
verbose_messages = true
"#;
        let parsed = parse_toml_str(toml_str).unwrap();
        let mut config = RuntimeConfig::default();
        apply_toml_config(&mut config, &parsed).unwrap();
        assert_eq!(config.scheduling_policy, SchedulingPolicy::Lifo);
        assert!(!config.priority);
        assert_eq!(config.polling_iterations, 500);
        assert_eq!(config.queue_threshold, 8);
        assert_eq!(config.worker_stack_size, 4_194_304);
        assert_eq!(config.thread_name_prefix, "myapp");
        assert_eq!(config.transfer_poll_interval_us, 10);
        assert!(config.verbose_cluster_messages);
    }

    #[test]
    fn partial_config_leaves_defaults() {
        let parsed = parse_toml_str("[scheduler]\npolling_iterations = 3\n").unwrap();
        let mut config = RuntimeConfig::default();
        apply_toml_config(&mut config, &parsed).unwrap();
        assert_eq!(config.polling_iterations, 3);
        assert_eq!(
            config.scheduling_policy,
            RuntimeConfig::default().scheduling_policy
        );
    }

    #[test]
    fn invalid_syntax_is_rejected() {
        assert!(parse_toml_str("not valid {{{{").is_err());
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskgrid.toml");
        std::fs::write(&path, "[scheduler]\nscheduling_policy = \"lifo\"\n").unwrap();
        let parsed = parse_toml_file(&path).unwrap();
        let mut config = RuntimeConfig::default();
        apply_toml_config(&mut config, &parsed).unwrap();
        assert_eq!(config.scheduling_policy, SchedulingPolicy::Lifo);
    }

    #[test]
    fn missing_file_names_path() {
        let err = parse_toml_file(std::path::Path::new("/nonexistent/taskgrid.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/taskgrid.toml"));
    }
}
