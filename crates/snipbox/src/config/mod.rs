use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::language::{
    CompileConfig, DEFAULT_SANDBOX_PATH, FileExtension, Language, RunConfig,
};
use crate::types::{MountConfig, ResourceLimits};

pub mod language;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../snipbox.example.toml");

/// Prefix for environment variable overrides, e.g. `SNIPBOX__POOL__MAX_WORKERS=16`
pub const ENV_PREFIX: &str = "SNIPBOX";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub isolate_path: Option<PathBuf>,

    /// Use cgroup memory limiting instead of RLIMIT_AS.
    ///
    /// When enabled, isolate uses `--cg` and `--cg-mem` which limit actual memory
    /// usage (RSS) rather than virtual address space. Runtimes such as Node map
    /// large amounts of virtual memory and need this. Falls back to RLIMIT_AS
    /// at startup when the cgroup hierarchy cannot be prepared.
    #[serde(default = "default_cgroup")]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// Global directory mounts applied to every sandbox
    #[serde(default)]
    pub sandbox_mounts: Vec<MountConfig>,

    /// Default resource limits applied to every execution.
    /// Per-language `run.limits` override individual fields.
    #[serde(default)]
    pub default_limits: ResourceLimits,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Interval between SSE keep-alive comments, in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Submission boundary limits and delivery deadlines
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Largest accepted `source`, in bytes
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Largest accepted `stdin`, in bytes
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: usize,

    /// Combined stdout + stderr kept per execution, in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Deadline covering queueing plus execution, in seconds
    #[serde(default = "default_end_to_end_secs")]
    pub end_to_end_timeout_secs: u64,

    /// How long a finished result is kept for a caller to collect, in seconds
    #[serde(default = "default_delivery_secs")]
    pub delivery_timeout_secs: u64,

    /// An unfinished request nobody polled or streamed for this long is cancelled
    #[serde(default = "default_abandon_secs")]
    pub abandon_after_secs: u64,
}

impl GatewayConfig {
    pub fn end_to_end_timeout(&self) -> Duration {
        Duration::from_secs(self.end_to_end_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn abandon_after(&self) -> Duration {
        Duration::from_secs(self.abandon_after_secs)
    }

    /// Largest submission body worth parsing: source and stdin at their
    /// limits, every byte JSON-escaped as `\uXXXX`, plus room for the
    /// envelope
    pub fn request_body_limit(&self) -> usize {
        self.max_source_bytes
            .saturating_add(self.max_stdin_bytes)
            .saturating_mul(6)
            .saturating_add(4096)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: default_max_source_bytes(),
            max_stdin_bytes: default_max_stdin_bytes(),
            max_output_bytes: default_max_output_bytes(),
            end_to_end_timeout_secs: default_end_to_end_secs(),
            delivery_timeout_secs: default_delivery_secs(),
            abandon_after_secs: default_abandon_secs(),
        }
    }
}

/// Warm pool and queue sizing
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// First isolate box id handed out; ids `first_box_id..first_box_id + max_workers` are used
    #[serde(default)]
    pub first_box_id: u32,

    /// Maximum number of live sandboxes (warm and executing)
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,

    /// Ready sandboxes kept per language
    #[serde(default = "default_target_ready")]
    pub target_ready: usize,

    /// Pending requests beyond this are rejected with ServiceBusy
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Extra time the watchdog grants past the wall clock limit, in milliseconds
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl PoolConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            first_box_id: 0,
            max_workers: default_max_workers(),
            target_ready: default_target_ready(),
            queue_capacity: default_queue_capacity(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// Per-session rate limiting
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Token bucket size
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// One token is refilled every interval, in milliseconds
    #[serde(default = "default_refill_ms")]
    pub refill_interval_ms: u64,

    /// Simultaneously executing requests per session
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_session: usize,

    /// Simultaneously executing requests across every session sharing one
    /// network origin
    #[serde(default = "default_max_concurrent_per_origin")]
    pub max_concurrent_per_origin: usize,

    /// ResourceExceeded outcomes within `abuse_window_secs` that flag a session
    #[serde(default = "default_abuse_threshold")]
    pub abuse_threshold: usize,

    #[serde(default = "default_abuse_window_secs")]
    pub abuse_window_secs: u64,

    /// How long a flagged session is rejected, in seconds
    #[serde(default = "default_ban_secs")]
    pub ban_duration_secs: u64,

    /// Session state idle this long is forgotten, in seconds
    #[serde(default = "default_idle_session_secs")]
    pub idle_session_secs: u64,
}

impl QuotaConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }

    pub fn abuse_window(&self) -> Duration {
        Duration::from_secs(self.abuse_window_secs)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    pub fn idle_session(&self) -> Duration {
        Duration::from_secs(self.idle_session_secs)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            refill_interval_ms: default_refill_ms(),
            max_concurrent_per_session: default_max_concurrent(),
            max_concurrent_per_origin: default_max_concurrent_per_origin(),
            abuse_threshold: default_abuse_threshold(),
            abuse_window_secs: default_abuse_window_secs(),
            ban_duration_secs: default_ban_secs(),
            idle_session_secs: default_idle_session_secs(),
        }
    }
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            isolate_path: None,
            cgroup: default_cgroup(),
            cg_root: default_cg_root(),
            sandbox_mounts: Vec::new(),
            default_limits: ResourceLimits::default(),
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            pool: PoolConfig::default(),
            quota: QuotaConfig::default(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by ID
    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    /// Get the path to the isolate binary
    pub fn isolate_binary(&self) -> PathBuf {
        self.isolate_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }

    /// Effective run limits for a language: config defaults overlaid with the
    /// language's own `run.limits`
    pub fn effective_limits(&self, language: &Language) -> ResourceLimits {
        match language.run.limits {
            Some(ref limits) => self.default_limits.with_overrides(limits),
            None => self.default_limits.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_cgroup() -> bool {
    true
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_max_source_bytes() -> usize {
    64 * 1024
}

fn default_max_stdin_bytes() -> usize {
    64 * 1024
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_end_to_end_secs() -> u64 {
    30
}

fn default_delivery_secs() -> u64 {
    60
}

fn default_abandon_secs() -> u64 {
    20
}

fn default_max_workers() -> u32 {
    8
}

fn default_target_ready() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_kill_grace_ms() -> u64 {
    1000
}

fn default_burst() -> u32 {
    10
}

fn default_refill_ms() -> u64 {
    3000
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_concurrent_per_origin() -> usize {
    8
}

fn default_abuse_threshold() -> usize {
    5
}

fn default_abuse_window_secs() -> u64 {
    300
}

fn default_ban_secs() -> u64 {
    900
}

fn default_idle_session_secs() -> u64 {
    3600
}
