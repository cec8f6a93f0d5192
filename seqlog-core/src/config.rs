//! Service configuration
//!
//! The service reads a plain text file with one setting per line:
//!
//! ```text
//! # comment
//! SHARED_MEMORY_DIR        /tmp
//! SHARED_MEMORY_ITEM_COUNT 300
//! LOG_OUTPUT_DIR           /var/log/slog
//! MAX_FILE_SIZE            10 MB
//! MAX_FILE_COUNT           20
//! OUTPUT_SCREEN            false
//! ```
//!
//! Unknown keys are reported and skipped; a value that does not parse is a
//! `ConfigError`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{ChannelConfig, OverflowPolicy, DEFAULT_CAPACITY};
use crate::codec::MAX_RECORD_LEN;
use crate::error::{Result, SeqLogError};
use crate::policy::FlushPolicy;
use crate::record::OutputFlag;
use crate::sink::DEFAULT_SINK_QUEUE_SIZE;
use crate::tree::DEFAULT_MAX_BUFFERED_NODES;

/// Where the service looks when no file is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/slog.conf";

/// Full service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding the channel segment file
    pub shared_memory_dir: PathBuf,
    /// Ring capacity in slots
    pub shared_memory_item_count: u32,
    /// Directory of the rotating log segments
    pub log_output_dir: PathBuf,
    /// Bytes per segment, 0 for unlimited
    pub max_file_size: u64,
    /// Retained segments, 0 for unlimited
    pub max_file_count: usize,
    /// Mirror flushed lines on stdout
    pub output_screen: bool,
    /// Live view port, 0 disables the web server
    pub web_server_port: u16,
    /// Remote collector address; forwarding is off while unset
    pub forward_ip: Option<String>,
    pub forward_port: u16,
    /// How `ROOT` resolves
    pub root_flag: OutputFlag,
    pub channel_overflow: OverflowPolicy,
    /// Bounded wait used by the `BLOCK` overflow policy
    pub channel_block_timeout_ms: u32,
    /// Idle time after which a tag whose producer is gone is reaped
    pub tag_idle_timeout: Duration,
    pub max_buffered_nodes: usize,
    /// Treat `ERROR` messages as `OUTPUT_ALL`
    pub error_promotes: bool,
    pub sink_queue_size: usize,
    /// Collector sleep when the channel is empty
    pub poll_interval: Duration,
    /// Accepted for compatibility; privilege changes are left to the supervisor
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shared_memory_dir: PathBuf::from("/tmp"),
            shared_memory_item_count: DEFAULT_CAPACITY,
            log_output_dir: PathBuf::from("/var/log/slog"),
            max_file_size: 0,
            max_file_count: 0,
            output_screen: true,
            web_server_port: 8080,
            forward_ip: None,
            forward_port: 8081,
            root_flag: OutputFlag::Always,
            channel_overflow: OverflowPolicy::DropNewest,
            channel_block_timeout_ms: 100,
            tag_idle_timeout: Duration::from_secs(300),
            max_buffered_nodes: DEFAULT_MAX_BUFFERED_NODES,
            error_promotes: false,
            sink_queue_size: DEFAULT_SINK_QUEUE_SIZE,
            poll_interval: Duration::from_millis(10),
            user: None,
            group: None,
        }
    }
}

impl ServiceConfig {
    /// Read and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            SeqLogError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&text)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration text on top of the defaults
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let lineno = index + 1;
            let mut fields = line.split_whitespace();
            let Some(key) = fields.next() else {
                continue;
            };
            let value = fields.next();
            let unit = fields.next();

            config
                .apply(key, value, unit)
                .map_err(|reason| SeqLogError::config(format!("line {}: {}", lineno, reason)))?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: Option<&str>, unit: Option<&str>) -> std::result::Result<(), String> {
        let required = || value.ok_or_else(|| format!("{} needs a value", key));

        match key {
            "SHARED_MEMORY_DIR" => self.shared_memory_dir = PathBuf::from(required()?),
            "SHARED_MEMORY_ITEM_COUNT" => self.shared_memory_item_count = number(key, required()?)?,
            "LOG_OUTPUT_DIR" => self.log_output_dir = PathBuf::from(required()?),
            "MAX_FILE_SIZE" => {
                let size: u64 = number(key, required()?)?;
                let scale = match unit.map(str::to_ascii_uppercase).as_deref() {
                    None => 1,
                    Some("KB") => 1024,
                    Some("MB") => 1024 * 1024,
                    Some(other) => return Err(format!("unknown size unit '{}'", other)),
                };
                self.max_file_size = size
                    .checked_mul(scale)
                    .ok_or_else(|| format!("{} is too large", key))?;
            }
            "MAX_FILE_COUNT" => self.max_file_count = number(key, required()?)?,
            "OUTPUT_SCREEN" => self.output_screen = boolean(key, required()?)?,
            "WEB_SERVER_PORT" => self.web_server_port = number(key, required()?)?,
            "SEQUENCE_LOG_SERVER_IP" => self.forward_ip = Some(required()?.to_string()),
            "SEQUENCE_LOG_SERVER_PORT" => self.forward_port = number(key, required()?)?,
            "ROOT_FLAG" => {
                self.root_flag = match required()?.parse::<OutputFlag>()? {
                    flag @ (OutputFlag::Always | OutputFlag::Keep) => flag,
                    other => return Err(format!("ROOT_FLAG must be ALWAYS or KEEP, not {:?}", other)),
                }
            }
            "CHANNEL_OVERFLOW" => {
                self.channel_overflow = match required()?.to_ascii_uppercase().as_str() {
                    "DROP_NEWEST" => OverflowPolicy::DropNewest,
                    "DROP_OLDEST" => OverflowPolicy::DropOldest,
                    "BLOCK" => OverflowPolicy::Block {
                        timeout_ms: self.channel_block_timeout_ms,
                    },
                    other => return Err(format!("unknown overflow policy '{}'", other)),
                }
            }
            "CHANNEL_BLOCK_TIMEOUT_MS" => self.channel_block_timeout_ms = number(key, required()?)?,
            "TAG_IDLE_TIMEOUT" => {
                self.tag_idle_timeout = Duration::from_secs(number(key, required()?)?)
            }
            "MAX_BUFFERED_NODES" => self.max_buffered_nodes = number(key, required()?)?,
            "ERROR_PROMOTES" => self.error_promotes = boolean(key, required()?)?,
            "SINK_QUEUE_SIZE" => self.sink_queue_size = number(key, required()?)?,
            "USER" => self.user = value.map(str::to_string),
            "GROUP" => self.group = value.map(str::to_string),
            unknown => warn!(key = unknown, "Ignoring unknown configuration key"),
        }
        Ok(())
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.shared_memory_item_count < 2 {
            return Err(SeqLogError::config(format!(
                "SHARED_MEMORY_ITEM_COUNT must be at least 2, got {}",
                self.shared_memory_item_count
            )));
        }
        if self.max_file_size != 0 && self.max_file_size < MAX_RECORD_LEN as u64 {
            return Err(SeqLogError::config(format!(
                "MAX_FILE_SIZE must be 0 or at least {} bytes, got {}",
                MAX_RECORD_LEN, self.max_file_size
            )));
        }
        if self.sink_queue_size == 0 {
            return Err(SeqLogError::config("SINK_QUEUE_SIZE must be positive"));
        }
        if self.max_buffered_nodes == 0 {
            return Err(SeqLogError::config("MAX_BUFFERED_NODES must be positive"));
        }
        Ok(())
    }

    /// Remote collector as `host:port`, when forwarding is enabled
    pub fn forward_address(&self) -> Option<String> {
        self.forward_ip
            .as_ref()
            .map(|ip| format!("{}:{}", ip, self.forward_port))
    }

    pub fn channel_config(&self) -> ChannelConfig {
        let overflow = match self.channel_overflow {
            OverflowPolicy::Block { .. } => OverflowPolicy::Block {
                timeout_ms: self.channel_block_timeout_ms,
            },
            other => other,
        };
        ChannelConfig::default()
            .capacity(self.shared_memory_item_count)
            .overflow(overflow)
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy::new(self.root_flag, self.error_promotes)
    }

    pub fn shared_memory_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shared_memory_dir = dir.into();
        self
    }

    pub fn item_count(mut self, count: u32) -> Self {
        self.shared_memory_item_count = count;
        self
    }

    pub fn log_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_output_dir = dir.into();
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn max_file_count(mut self, count: usize) -> Self {
        self.max_file_count = count;
        self
    }

    pub fn output_screen(mut self, enabled: bool) -> Self {
        self.output_screen = enabled;
        self
    }

    pub fn web_server_port(mut self, port: u16) -> Self {
        self.web_server_port = port;
        self
    }

    pub fn forward_to(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.forward_ip = Some(ip.into());
        self.forward_port = port;
        self
    }

    pub fn root_flag(mut self, flag: OutputFlag) -> Self {
        self.root_flag = flag;
        self
    }

    pub fn channel_overflow(mut self, overflow: OverflowPolicy) -> Self {
        if let OverflowPolicy::Block { timeout_ms } = overflow {
            self.channel_block_timeout_ms = timeout_ms;
        }
        self.channel_overflow = overflow;
        self
    }

    pub fn tag_idle_timeout(mut self, timeout: Duration) -> Self {
        self.tag_idle_timeout = timeout;
        self
    }

    pub fn max_buffered_nodes(mut self, nodes: usize) -> Self {
        self.max_buffered_nodes = nodes;
        self
    }

    pub fn error_promotes(mut self, enabled: bool) -> Self {
        self.error_promotes = enabled;
        self
    }

    pub fn sink_queue_size(mut self, size: usize) -> Self {
        self.sink_queue_size = size;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{} expects a number, got '{}'", key, value))
}

fn boolean(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("{} expects true or false, got '{}'", key, value)),
    }
}
