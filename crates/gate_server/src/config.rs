//! Gate configuration, loaded from TOML.
//!
//! Every field has a serde default so a partial file (or an empty one) is
//! valid. A missing file is created with the defaults on first start.

use module_runtime::{ModuleConfig, RuntimeConfig, TaskPoolConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use wire_protocol::{Endianness, FrameConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub module: ModuleSettings,
    #[serde(default)]
    pub task_pool: TaskPoolSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Interval of the periodic stats log line. Zero disables it.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSettings {
    #[serde(default = "default_call_queue_len")]
    pub call_queue_len: usize,
    #[serde(default = "default_timer_queue_len")]
    pub timer_queue_len: usize,
    #[serde(default = "default_callback_queue_len")]
    pub callback_queue_len: usize,
    #[serde(default = "default_exec_warn_ms")]
    pub exec_warn_ms: u64,
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_fail_fast_grace_ms")]
    pub fail_fast_grace_ms: u64,
    #[serde(default = "default_true")]
    pub fail_pending_on_drain: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPoolSettings {
    /// Zero means one worker per CPU.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_task_queue_len")]
    pub queue_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_header_len_size")]
    pub header_len_size: usize,
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default)]
    pub min_msg_len: usize,
    #[serde(default = "default_max_header_len")]
    pub max_header_len: usize,
    #[serde(default = "default_max_body_len")]
    pub max_body_len: usize,
    /// Bodies at least this long are compressed. Zero disables compression.
    #[serde(default)]
    pub min_compress_size: usize,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default = "default_max_packets_per_read")]
    pub max_packets_per_read: usize,
    #[serde(default = "default_max_decompressed_len")]
    pub max_decompressed_len: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_queue_len")]
    pub write_queue_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json_format: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_listen_backlog() -> i32 {
    1024
}

fn default_stats_interval_ms() -> u64 {
    60_000
}

fn default_call_queue_len() -> usize {
    ModuleConfig::default().call_queue_len
}

fn default_timer_queue_len() -> usize {
    ModuleConfig::default().timer_queue_len
}

fn default_callback_queue_len() -> usize {
    ModuleConfig::default().callback_queue_len
}

fn default_exec_warn_ms() -> u64 {
    10
}

fn default_block_timeout_ms() -> u64 {
    10_000
}

fn default_exit_grace_ms() -> u64 {
    3_000
}

fn default_fail_fast_grace_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_task_queue_len() -> usize {
    TaskPoolConfig::DEFAULT_QUEUE_LEN
}

fn default_header_len_size() -> usize {
    1
}

fn default_max_header_len() -> usize {
    255
}

fn default_max_body_len() -> usize {
    64 * 1024
}

fn default_max_packets_per_read() -> usize {
    16
}

fn default_max_decompressed_len() -> usize {
    1024 * 1024
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_write_queue_len() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            listen_backlog: default_listen_backlog(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            call_queue_len: default_call_queue_len(),
            timer_queue_len: default_timer_queue_len(),
            callback_queue_len: default_callback_queue_len(),
            exec_warn_ms: default_exec_warn_ms(),
            block_timeout_ms: default_block_timeout_ms(),
            exit_grace_ms: default_exit_grace_ms(),
            fail_fast: false,
            fail_fast_grace_ms: default_fail_fast_grace_ms(),
            fail_pending_on_drain: true,
        }
    }
}

impl Default for TaskPoolSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_len: default_task_queue_len(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            header_len_size: default_header_len_size(),
            endianness: Endianness::default(),
            min_msg_len: 0,
            max_header_len: default_max_header_len(),
            max_body_len: default_max_body_len(),
            min_compress_size: 0,
            encrypt: false,
            max_packets_per_read: default_max_packets_per_read(),
            max_decompressed_len: default_max_decompressed_len(),
            read_buffer_size: default_read_buffer_size(),
            write_queue_len: default_write_queue_len(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads the configuration, writing a default file first if none exists.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            tokio::fs::write(path, content)
                .await
                .map_err(|source| ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            info!("📝 Created default configuration file: {}", path.display());
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = toml::from_str(&content)?;
        info!("📋 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        let raw = &self.server.bind_address;
        raw.parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid bind address: {}", raw)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address()?;

        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero".to_string()));
        }
        if self.module.call_queue_len == 0 {
            return Err(ConfigError::Invalid(
                "module.call_queue_len must be non-zero".to_string(),
            ));
        }
        if self.module.callback_queue_len == 0 {
            return Err(ConfigError::Invalid(
                "module.callback_queue_len must be non-zero, task completions need it".to_string(),
            ));
        }
        if self.network.write_queue_len == 0 {
            return Err(ConfigError::Invalid(
                "network.write_queue_len must be non-zero".to_string(),
            ));
        }

        let frame = self.to_frame_config();
        frame
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if frame.max_header_len as u64 > frame.max_encodable_header_len() {
            return Err(ConfigError::Invalid(format!(
                "max_header_len {} does not fit a {}-byte length prefix",
                frame.max_header_len, frame.header_len_size
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }
        Ok(())
    }

    pub fn to_module_config(&self) -> ModuleConfig {
        let module = &self.module;
        ModuleConfig {
            call_queue_len: module.call_queue_len,
            timer_queue_len: module.timer_queue_len,
            callback_queue_len: module.callback_queue_len,
            exec_warn_timeout: Duration::from_millis(module.exec_warn_ms),
            block_timeout: Duration::from_millis(module.block_timeout_ms),
            exit_grace: Duration::from_millis(module.exit_grace_ms),
            fail_fast: module.fail_fast,
            fail_fast_grace: Duration::from_millis(module.fail_fast_grace_ms),
            fail_pending_on_drain: module.fail_pending_on_drain,
            ..ModuleConfig::default()
        }
    }

    pub fn to_task_pool_config(&self) -> TaskPoolConfig {
        TaskPoolConfig {
            workers: self.task_pool.workers,
            queue_len: self.task_pool.queue_len,
        }
    }

    pub fn to_runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            module: self.to_module_config(),
            task_pool: self.to_task_pool_config(),
        }
    }

    pub fn to_frame_config(&self) -> FrameConfig {
        let network = &self.network;
        FrameConfig {
            header_len_size: network.header_len_size,
            endianness: network.endianness,
            min_msg_len: network.min_msg_len,
            max_header_len: network.max_header_len,
            max_body_len: network.max_body_len,
            min_compress_size: network.min_compress_size,
            encrypt: network.encrypt,
            max_packets_per_read: network.max_packets_per_read,
            max_decompressed_len: network.max_decompressed_len,
            read_buffer_size: network.read_buffer_size,
        }
    }
}
