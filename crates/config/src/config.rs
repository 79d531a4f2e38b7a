//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Coordinator-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Address the status/callback HTTP server binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Base URL workers use to reach the callback endpoint
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Directory holding the task ledger and the running-request snapshot
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Seconds between liveness sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Seconds between snapshot dumps
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Expected interval between task heartbeats; tasks silent for 5x this are requeued
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Workers not heard from for this long are evicted from the registry
    #[serde(default = "default_worker_stale_secs")]
    pub worker_stale_secs: u64,
    /// Non-fatal failures tolerated before a task fails permanently
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_public_url() -> String {
    "http://127.0.0.1:7878".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/conveyor")
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_worker_stale_secs() -> u64 {
    90
}

fn default_max_failed_attempts() -> u32 {
    5
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_url: default_public_url(),
            state_dir: default_state_dir(),
            sweep_interval_secs: default_sweep_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            worker_stale_secs: default_worker_stale_secs(),
            max_failed_attempts: default_max_failed_attempts(),
        }
    }
}

/// Admission pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    /// Sleep after a full revolution over the levels yields nothing
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// Minimum hits before a supported-channel request is released
    #[serde(default = "default_supported_min_hits")]
    pub supported_min_hits: u64,
    /// Minimum hits before a catch-all request is released
    #[serde(default = "default_common_min_hits")]
    pub common_min_hits: u64,
    /// Support amount at which a request qualifies for the supported level
    #[serde(default = "default_support_threshold")]
    pub support_threshold: f64,
    /// Seconds between channel directory refreshes
    #[serde(default = "default_channel_refresh_secs")]
    pub channel_refresh_secs: u64,
    /// Channels routed to the priority level
    #[serde(default)]
    pub high_priority_channels: Vec<String>,
    /// Channels routed to the enabled level
    #[serde(default)]
    pub normal_channels: Vec<String>,
}

fn default_idle_interval_ms() -> u64 {
    200
}

fn default_supported_min_hits() -> u64 {
    5
}

fn default_common_min_hits() -> u64 {
    10
}

fn default_support_threshold() -> f64 {
    1.0
}

fn default_channel_refresh_secs() -> u64 {
    300
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval_ms(),
            supported_min_hits: default_supported_min_hits(),
            common_min_hits: default_common_min_hits(),
            support_threshold: default_support_threshold(),
            channel_refresh_secs: default_channel_refresh_secs(),
            high_priority_channels: Vec::new(),
            normal_channels: Vec::new(),
        }
    }
}

/// Worker-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Concurrent task slots per worker (0 = auto-derive)
    #[serde(default)]
    pub concurrency: u32,
    /// Workers started inside the daemon process
    #[serde(default = "default_local_workers")]
    pub local_workers: u32,
    /// Seconds between worker status messages
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// Seconds between per-task heartbeats
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Scratch directory for downloads and encoder output
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Root of the filesystem object store
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
}

fn default_local_workers() -> u32 {
    1
}

fn default_status_interval_secs() -> u64 {
    10
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/conveyor")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/conveyor/streams")
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 0,
            local_workers: default_local_workers(),
            status_interval_secs: default_status_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            work_dir: default_work_dir(),
            storage_dir: default_storage_dir(),
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    /// Av1an workers per task (0 = auto-derive)
    #[serde(default)]
    pub workers_per_job: u32,
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
}

fn default_encoder_binary() -> String {
    "av1an".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            workers_per_job: 0,
            logical_cores: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - CONVEYOR_BIND_ADDR -> coordinator.bind_addr
    /// - CONVEYOR_PUBLIC_URL -> coordinator.public_url
    /// - CONVEYOR_STATE_DIR -> coordinator.state_dir
    /// - CONVEYOR_MAX_FAILED_ATTEMPTS -> coordinator.max_failed_attempts
    /// - CONVEYOR_WORKER_CONCURRENCY -> worker.concurrency
    /// - CONVEYOR_LOCAL_WORKERS -> worker.local_workers
    /// - CONVEYOR_ENCODER_WORKERS -> encoder.workers_per_job
    ///
    /// Values that fail to parse leave the file value in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CONVEYOR_BIND_ADDR") {
            if !val.is_empty() {
                self.coordinator.bind_addr = val;
            }
        }

        if let Ok(val) = env::var("CONVEYOR_PUBLIC_URL") {
            if !val.is_empty() {
                self.coordinator.public_url = val;
            }
        }

        if let Ok(val) = env::var("CONVEYOR_STATE_DIR") {
            if !val.is_empty() {
                self.coordinator.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CONVEYOR_MAX_FAILED_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.coordinator.max_failed_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("CONVEYOR_WORKER_CONCURRENCY") {
            if let Ok(slots) = val.parse::<u32>() {
                self.worker.concurrency = slots;
            }
        }

        if let Ok(val) = env::var("CONVEYOR_LOCAL_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.worker.local_workers = workers;
            }
        }

        if let Ok(val) = env::var("CONVEYOR_ENCODER_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.encoder.workers_per_job = workers;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests share process state
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("CONVEYOR_BIND_ADDR");
        env::remove_var("CONVEYOR_PUBLIC_URL");
        env::remove_var("CONVEYOR_STATE_DIR");
        env::remove_var("CONVEYOR_MAX_FAILED_ATTEMPTS");
        env::remove_var("CONVEYOR_WORKER_CONCURRENCY");
        env::remove_var("CONVEYOR_LOCAL_WORKERS");
        env::remove_var("CONVEYOR_ENCODER_WORKERS");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_attempts in 1u32..20,
            heartbeat in 1u64..600,
            common_hits in 0u64..100,
            threshold in 0.0f64..1000.0,
            concurrency in 0u32..64,
            encoder_workers in 0u32..32,
        ) {
            let toml_str = format!(
                r#"
[coordinator]
max_failed_attempts = {}
heartbeat_interval_secs = {}

[admission]
common_min_hits = {}
support_threshold = {}

[worker]
concurrency = {}

[encoder]
workers_per_job = {}
"#,
                max_attempts, heartbeat, common_hits, threshold, concurrency, encoder_workers
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.coordinator.max_failed_attempts, max_attempts);
            prop_assert_eq!(config.coordinator.heartbeat_interval_secs, heartbeat);
            prop_assert_eq!(config.admission.common_min_hits, common_hits);
            prop_assert!((config.admission.support_threshold - threshold).abs() < 1e-9);
            prop_assert_eq!(config.worker.concurrency, concurrency);
            prop_assert_eq!(config.encoder.workers_per_job, encoder_workers);
        }

        #[test]
        fn prop_env_overrides_worker_concurrency(
            initial in 0u32..32,
            override_slots in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\nconcurrency = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CONVEYOR_WORKER_CONCURRENCY", override_slots.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.concurrency, override_slots);
        }

        #[test]
        fn prop_env_overrides_max_failed_attempts(
            initial in 1u32..10,
            override_attempts in 1u32..50,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[coordinator]\nmax_failed_attempts = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CONVEYOR_MAX_FAILED_ATTEMPTS", override_attempts.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.coordinator.max_failed_attempts, override_attempts);
        }
    }

    #[test]
    fn test_invalid_env_value_keeps_file_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config =
            Config::parse_toml("[worker]\nlocal_workers = 3\n").expect("Valid TOML");
        env::set_var("CONVEYOR_LOCAL_WORKERS", "lots");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.worker.local_workers, 3);
    }

    #[test]
    fn test_string_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("CONVEYOR_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("CONVEYOR_STATE_DIR", "/srv/conveyor");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.coordinator.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.coordinator.state_dir, PathBuf::from("/srv/conveyor"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.coordinator.bind_addr, "127.0.0.1:7878");
        assert_eq!(config.coordinator.max_failed_attempts, 5);
        assert_eq!(config.coordinator.heartbeat_interval_secs, 30);
        assert_eq!(config.admission.common_min_hits, 10);
        assert_eq!(config.admission.supported_min_hits, 5);
        assert!(config.admission.high_priority_channels.is_empty());
        assert_eq!(config.worker.concurrency, 0);
        assert_eq!(config.worker.local_workers, 1);
        assert_eq!(config.encoder.binary, "av1an");
        assert_eq!(config.encoder.logical_cores, None);
    }

    #[test]
    fn test_channel_lists_parse() {
        let toml_str = r#"
[admission]
high_priority_channels = ["@alpha", "@beta"]
normal_channels = ["@gamma"]
"#;
        let config = Config::parse_toml(toml_str).expect("Valid TOML");

        assert_eq!(config.admission.high_priority_channels, vec!["@alpha", "@beta"]);
        assert_eq!(config.admission.normal_channels, vec!["@gamma"]);
        assert_eq!(config.admission.idle_interval_ms, 200); // default
    }
}
