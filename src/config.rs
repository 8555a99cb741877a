//! Configuration system for the swarm trainer
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (SWARM_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dht::BootstrapPeer;
use crate::error::{Error, Result};
use crate::protocol::TensorPayload;
use crate::transport::MAX_MESSAGE_SIZE;

/// Room left in a frame for the envelope around a tensor part
const FRAME_HEADROOM: usize = 64 * 1024;

/// Main trainer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Peer identity and networking
    pub peer: PeerSettings,

    /// Directory service (DHT) tuning
    pub dht: DhtSettings,

    /// Matchmaking and all-reduce settings
    pub averaging: AveragingSettings,

    /// Collaborative step settings
    pub training: TrainingSettings,

    /// Passive monitor settings
    pub monitor: MonitorSettings,

    /// Telemetry sink settings
    pub telemetry: TelemetrySettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Async runtime settings
    pub runtime: RuntimeSettings,
}

/// Peer identity and networking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    /// Fixed peer identifier (40 hex chars, random if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// File that persists the generated identifier across restarts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_path: Option<String>,

    /// Human-readable peer name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Interface to bind the listener on
    pub listen_host: String,

    /// TCP listen port (0 = auto-assign)
    pub listen_port: u16,

    /// Address advertised to other peers (tunnel / NAT setups)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce_addr: Option<String>,

    /// Bootstrap peers: "<peer_id_hex>@host:port" or "host:port"
    pub initial_peers: Vec<String>,

    /// Declared compute/bandwidth capacity used for part load balancing
    pub capacity: f64,

    /// Contribute tensors but never own parts
    pub client_mode: bool,

    /// Timeout for a single request/response exchange in milliseconds
    pub request_timeout_ms: u64,
}

/// Directory service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    /// Bucket capacity and replication factor (k)
    pub bucket_size: usize,

    /// Lookup parallelism (alpha)
    pub alpha: usize,

    /// Consecutive failures before a contact is evicted
    pub max_failures: u32,

    /// Interval between maintenance passes in milliseconds
    pub refresh_interval_ms: u64,

    /// Default time-to-live for stored entries in seconds
    pub default_ttl_secs: u64,
}

/// How contributions are weighted in the group average
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightingMode {
    /// Weight by declared capacity
    Capacity,
    /// Every peer counts the same
    Equal,
    /// Weight by samples accumulated for the step
    Samples,
}

/// Matchmaking and all-reduce settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AveragingSettings {
    /// Experiment namespace prefixed to every directory key
    pub run_id: String,

    /// Preferred number of peers per averaging group
    pub target_group_size: usize,

    /// Smallest group that may proceed (1 = average alone)
    pub min_group_size: usize,

    /// Matchmaking deadline in milliseconds
    pub matchmaking_time_ms: u64,

    /// Per-phase exchange timeout in milliseconds
    pub allreduce_timeout_ms: u64,

    /// Weighting policy
    pub weighting: WeightingMode,

    /// Maximum number of elements per tensor part
    pub max_part_size: usize,
}

/// Collaborative step settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Samples the whole collaboration accumulates per logical step
    pub target_batch_size: u64,

    /// Lifetime of published progress records in seconds
    pub statistics_expiration_secs: u64,

    /// Interval between progress publications in milliseconds
    pub publish_interval_ms: u64,

    /// Forget peers not heard from within this window (milliseconds)
    pub stale_peer_timeout_ms: u64,

    /// Failed rounds a gradient may survive before being discarded
    pub max_retained_attempts: u32,

    /// Demo trainer: number of model parameters
    pub model_size: usize,

    /// Demo trainer: samples per local batch
    pub batch_size: usize,

    /// Demo trainer: SGD learning rate
    pub learning_rate: f32,

    /// Demo trainer: artificial compute time per batch in milliseconds
    pub compute_delay_ms: u64,

    /// Demo trainer: RNG seed for the synthetic dataset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Passive monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Period between progress reads in milliseconds
    pub refresh_period_ms: u64,
}

/// Telemetry sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Emit telemetry records
    pub enabled: bool,

    /// Append records as JSON lines to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Records buffered before new ones are dropped
    pub queue_size: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

/// Async runtime settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Tokio worker threads (0 = auto)
    pub worker_threads: usize,
}

// Default implementations

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            id: None,
            identity_path: None,
            name: None,
            listen_host: "0.0.0.0".to_string(),
            listen_port: 0, // Auto-assign
            announce_addr: None,
            initial_peers: vec![],
            capacity: 1.0,
            client_mode: false,
            request_timeout_ms: 5000,
        }
    }
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            alpha: 3,
            max_failures: 3,
            refresh_interval_ms: 60_000,
            default_ttl_secs: 300,
        }
    }
}

impl Default for AveragingSettings {
    fn default() -> Self {
        Self {
            run_id: "swarm".to_string(),
            target_group_size: 16,
            min_group_size: 1,
            matchmaking_time_ms: 15_000,
            allreduce_timeout_ms: 30_000,
            weighting: WeightingMode::Capacity,
            max_part_size: 65_536,
        }
    }
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            target_batch_size: 4096,
            statistics_expiration_secs: 600,
            publish_interval_ms: 5000,
            stale_peer_timeout_ms: 120_000,
            max_retained_attempts: 3,
            model_size: 64,
            batch_size: 32,
            learning_rate: 0.05,
            compute_delay_ms: 200,
            seed: None,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            refresh_period_ms: 30_000,
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            file: None,
            queue_size: 64,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl PeerSettings {
    /// Request timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse the configured bootstrap peers
    pub fn bootstrap_peers(&self) -> Result<Vec<BootstrapPeer>> {
        self.initial_peers
            .iter()
            .map(|s| {
                s.parse::<BootstrapPeer>()
                    .map_err(|e| Error::config_field_invalid("peer.initial_peers", e))
            })
            .collect()
    }
}

impl AveragingSettings {
    /// Matchmaking deadline as a Duration
    pub fn matchmaking_time(&self) -> Duration {
        Duration::from_millis(self.matchmaking_time_ms)
    }

    /// All-reduce phase timeout as a Duration
    pub fn allreduce_timeout(&self) -> Duration {
        Duration::from_millis(self.allreduce_timeout_ms)
    }
}

impl SwarmConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("swarm-trainer.toml"),
            PathBuf::from("config.toml"),
            dirs::config_dir()
                .map(|p| p.join("swarm").join("trainer.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".swarm").join("trainer.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/swarm/trainer.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Peer settings
        if let Ok(val) = std::env::var("SWARM_PEER_ID") {
            self.peer.id = Some(val);
        }
        if let Ok(val) = std::env::var("SWARM_PEER_NAME") {
            self.peer.name = Some(val);
        }
        if let Ok(val) = std::env::var("SWARM_LISTEN_PORT") {
            if let Ok(n) = val.parse() {
                self.peer.listen_port = n;
            }
        }
        if let Ok(val) = std::env::var("SWARM_ANNOUNCE_ADDR") {
            self.peer.announce_addr = Some(val);
        }
        if let Ok(val) = std::env::var("SWARM_INITIAL_PEERS") {
            self.peer.initial_peers = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("SWARM_CAPACITY") {
            if let Ok(n) = val.parse() {
                self.peer.capacity = n;
            }
        }
        if let Ok(val) = std::env::var("SWARM_CLIENT_MODE") {
            self.peer.client_mode = val.to_lowercase() == "true" || val == "1";
        }

        // Averaging settings
        if let Ok(val) = std::env::var("SWARM_RUN_ID") {
            self.averaging.run_id = val;
        }
        if let Ok(val) = std::env::var("SWARM_TARGET_GROUP_SIZE") {
            if let Ok(n) = val.parse() {
                self.averaging.target_group_size = n;
            }
        }
        if let Ok(val) = std::env::var("SWARM_MIN_GROUP_SIZE") {
            if let Ok(n) = val.parse() {
                self.averaging.min_group_size = n;
            }
        }
        if let Ok(val) = std::env::var("SWARM_MATCHMAKING_TIME_MS") {
            if let Ok(n) = val.parse() {
                self.averaging.matchmaking_time_ms = n;
            }
        }
        if let Ok(val) = std::env::var("SWARM_ALLREDUCE_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.averaging.allreduce_timeout_ms = n;
            }
        }

        // Training settings
        if let Ok(val) = std::env::var("SWARM_TARGET_BATCH_SIZE") {
            if let Ok(n) = val.parse() {
                self.training.target_batch_size = n;
            }
        }

        // Monitor settings
        if let Ok(val) = std::env::var("SWARM_MONITOR_REFRESH_MS") {
            if let Ok(n) = val.parse() {
                self.monitor.refresh_period_ms = n;
            }
        }

        // Telemetry settings
        if let Ok(val) = std::env::var("SWARM_TELEMETRY_FILE") {
            self.telemetry.file = Some(val);
        }

        // Logging settings
        if let Ok(val) = std::env::var("SWARM_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("SWARM_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("SWARM_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }

        // Runtime settings
        if let Ok(val) = std::env::var("SWARM_WORKER_THREADS") {
            if let Ok(n) = val.parse() {
                self.runtime.worker_threads = n;
            }
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref path) = self.peer.identity_path {
            self.peer.identity_path = Some(expand_path(path));
        }
        if let Some(ref file) = self.telemetry.file {
            self.telemetry.file = Some(expand_path(file));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref id) = self.peer.id {
            if id.len() != 40 || hex::decode(id).is_err() {
                return Err(Error::config_field_invalid(
                    "peer.id",
                    format!("peer id must be 40 hex characters, got '{}'", id),
                ));
            }
        }
        if !self.peer.capacity.is_finite() || self.peer.capacity < 0.0 {
            return Err(Error::config_field_invalid(
                "peer.capacity",
                "capacity must be a finite, non-negative number",
            ));
        }
        if self.peer.request_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "peer.request_timeout_ms",
                "request timeout must be greater than zero",
            ));
        }
        self.peer.bootstrap_peers()?;

        if self.dht.bucket_size == 0 || self.dht.alpha == 0 {
            return Err(Error::config_field_invalid(
                "dht.bucket_size",
                "bucket_size and alpha must be greater than zero",
            ));
        }

        if self.averaging.run_id.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "averaging.run_id",
                "run_id cannot be empty",
            ));
        }
        if self.averaging.min_group_size == 0 || self.averaging.target_group_size == 0 {
            return Err(Error::config_field_invalid(
                "averaging.min_group_size",
                "group sizes must be at least 1",
            ));
        }
        if self.averaging.min_group_size > self.averaging.target_group_size {
            return Err(Error::config_field_invalid(
                "averaging.min_group_size",
                format!(
                    "min_group_size ({}) exceeds target_group_size ({})",
                    self.averaging.min_group_size, self.averaging.target_group_size
                ),
            ));
        }
        if self.averaging.matchmaking_time_ms == 0 || self.averaging.allreduce_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "averaging.matchmaking_time_ms",
                "matchmaking and all-reduce timeouts must be greater than zero",
            ));
        }
        if self.averaging.max_part_size == 0 {
            return Err(Error::config_field_invalid(
                "averaging.max_part_size",
                "max_part_size must be greater than zero",
            ));
        }
        let frame_budget = (MAX_MESSAGE_SIZE as usize).saturating_sub(FRAME_HEADROOM);
        if TensorPayload::encoded_len(self.averaging.max_part_size) > frame_budget {
            return Err(Error::config_field_invalid(
                "averaging.max_part_size",
                format!(
                    "max_part_size ({}) does not fit in a {} byte message once encoded",
                    self.averaging.max_part_size, MAX_MESSAGE_SIZE
                ),
            ));
        }

        if self.training.target_batch_size == 0 {
            return Err(Error::config_field_invalid(
                "training.target_batch_size",
                "target_batch_size must be greater than zero",
            ));
        }
        if self.training.model_size == 0 || self.training.batch_size == 0 {
            return Err(Error::config_field_invalid(
                "training.model_size",
                "model_size and batch_size must be greater than zero",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Tokio worker thread count
    pub fn worker_threads(&self) -> usize {
        if self.runtime.worker_threads > 0 {
            self.runtime.worker_threads
        } else {
            num_cpus::get().min(8)
        }
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".swarm")
                .join("trainer.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Swarm Trainer Configuration

[peer]
# Fixed 40-hex-character peer identifier (random if not set)
# id = "0123456789abcdef0123456789abcdef01234567"

# Persist the generated identifier here so restarts keep the same identity
# identity_path = "~/.swarm/identity"

# Interface and port for the peer listener (port 0 = auto-assign)
listen_host = "0.0.0.0"
listen_port = 0

# Address advertised to other peers when behind NAT or a tunnel
# announce_addr = "203.0.113.7:31337"

# Bootstrap peers ("<peer_id>@host:port" or "host:port"); empty = seed peer
initial_peers = []

# Declared compute/bandwidth capacity used to balance tensor parts
capacity = 1.0

# Contribute gradients without owning tensor parts
client_mode = false

# Timeout for a single request in milliseconds
request_timeout_ms = 5000

[dht]
# Bucket size and replication factor
bucket_size = 20

# Parallel requests per lookup round
alpha = 3

# Consecutive failures before a contact is evicted
max_failures = 3

# Maintenance interval in milliseconds
refresh_interval_ms = 60000

# Default entry lifetime in seconds
default_ttl_secs = 300

[averaging]
# Experiment namespace; all peers of one run must agree on it
run_id = "swarm"

# Preferred and minimum number of peers per group
target_group_size = 16
min_group_size = 1

# Matchmaking deadline in milliseconds
matchmaking_time_ms = 15000

# Exchange timeout per all-reduce phase in milliseconds
allreduce_timeout_ms = 30000

# Weighting: capacity, equal, samples
weighting = "capacity"

# Maximum elements per tensor part
max_part_size = 65536

[training]
# Samples the collaboration accumulates per logical step
target_batch_size = 4096

# Lifetime of published progress records in seconds
statistics_expiration_secs = 600

# Progress publication interval in milliseconds
publish_interval_ms = 5000

# Forget peers not heard from within this window (milliseconds)
stale_peer_timeout_ms = 120000

# Failed rounds a gradient may survive before it is discarded
max_retained_attempts = 3

# Demo trainer settings
model_size = 64
batch_size = 32
learning_rate = 0.05
compute_delay_ms = 200

[monitor]
# Period between progress reads in milliseconds
refresh_period_ms = 30000

[telemetry]
enabled = true

# Append telemetry records as JSON lines
# file = "~/.swarm/telemetry.jsonl"

queue_size = 64

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.swarm/logs/trainer.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false

[runtime]
# Tokio worker threads (0 = auto-detect)
worker_threads = 0
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SwarmConfig::default();
        assert_eq!(config.averaging.run_id, "swarm");
        assert_eq!(config.averaging.min_group_size, 1);
        assert_eq!(config.averaging.weighting, WeightingMode::Capacity);
        assert_eq!(config.monitor.refresh_period_ms, 30_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_override() {
        env::set_var("SWARM_RUN_ID", "albert-run");
        env::set_var("SWARM_INITIAL_PEERS", "10.0.0.1:4000, 10.0.0.2:4000");
        env::set_var("SWARM_CLIENT_MODE", "1");

        let mut config = SwarmConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.averaging.run_id, "albert-run");
        assert_eq!(config.peer.initial_peers, vec!["10.0.0.1:4000", "10.0.0.2:4000"]);
        assert!(config.peer.client_mode);

        env::remove_var("SWARM_RUN_ID");
        env::remove_var("SWARM_INITIAL_PEERS");
        env::remove_var("SWARM_CLIENT_MODE");
    }

    #[test]
    fn test_validation_valid_config() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_group_sizes() {
        let mut config = SwarmConfig::default();
        config.averaging.min_group_size = 8;
        config.averaging.target_group_size = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_group_size"));
    }

    #[test]
    fn test_validation_bad_initial_peer() {
        let mut config = SwarmConfig::default();
        config.peer.initial_peers = vec!["not-an-address".to_string()];
        assert!(config.validate().is_err());

        config.peer.initial_peers = vec!["127.0.0.1:4000".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_bad_peer_id() {
        let mut config = SwarmConfig::default();
        config.peer.id = Some("xyz".to_string());
        assert!(config.validate().is_err());

        config.peer.id = Some("ab".repeat(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_capacity() {
        let mut config = SwarmConfig::default();
        config.peer.capacity = -1.0;
        assert!(config.validate().is_err());

        config.peer.capacity = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_part_size_fits_frame() {
        let mut config = SwarmConfig::default();
        config.averaging.max_part_size = 4_000_000;
        assert!(config.validate().is_ok());

        config.averaging.max_part_size = 20_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_part_size"));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = SwarmConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_expansion() {
        let mut config = SwarmConfig::default();
        config.peer.identity_path = Some("~/test/identity".to_string());
        config.expand_paths();

        assert!(!config.peer.identity_path.unwrap().contains('~'));
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = SwarmConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SwarmConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.averaging.run_id, parsed.averaging.run_id);
        assert_eq!(config.dht.bucket_size, parsed.dht.bucket_size);
    }

    #[test]
    fn test_generated_default_parses() {
        let parsed: SwarmConfig = toml::from_str(&generate_default_config()).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.averaging.target_group_size, 16);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[peer]
listen_port = 31337
initial_peers = ["0123456789abcdef0123456789abcdef01234567@10.1.1.1:31337"]
capacity = 2.5

[averaging]
run_id = "albert"
weighting = "equal"

[logging]
level = "debug"
"#;

        let config: SwarmConfig = toml::from_str(config_str).unwrap();

        assert_eq!(config.peer.listen_port, 31337);
        assert_eq!(config.peer.capacity, 2.5);
        assert_eq!(config.averaging.run_id, "albert");
        assert_eq!(config.averaging.weighting, WeightingMode::Equal);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.peer.bootstrap_peers().unwrap().len(), 1);
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trainer.toml");
        let path_str = path.to_str().unwrap();

        init_config(Some(path_str), false).unwrap();
        assert!(path.exists());
        assert!(init_config(Some(path_str), false).is_err());
        assert!(init_config(Some(path_str), true).is_ok());
    }
}
