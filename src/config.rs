use crate::dnstap::{IngestOptions, ListenAddr};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Blocklist, one domain per line.
    #[serde(default)]
    pub domains: PathBuf,

    /// SQLite database mirroring the cache. Without it nothing survives a restart.
    #[serde(default)]
    pub cache: Option<PathBuf>,

    /// Route file included by the routing daemon.
    #[serde(default)]
    pub routes: PathBuf,

    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    #[serde(default = "default_ttl")]
    pub ttl: String,

    #[serde(default)]
    pub ipv6: bool,

    #[serde(default)]
    pub dnstap: DnstapConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnstapConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: String,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,
}

// Defaults
fn default_reload_command() -> String {
    "birdc configure".to_string()
}
fn default_ttl() -> String {
    "24h".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:6000".to_string()
}
fn default_read_timeout() -> String {
    "5m".to_string()
}
fn default_max_frame_size() -> usize {
    1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_stats_interval() -> u64 {
    300
}

impl Default for DnstapConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout: default_read_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats_interval_seconds: default_stats_interval(),
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config TOML")?;
        Ok(config)
    }

    /// Checks the settings that have no usable default.
    pub fn validate(&self) -> Result<()> {
        if self.domains.as_os_str().is_empty() {
            bail!("You need to specify path to a domain list");
        }
        if self.routes.as_os_str().is_empty() {
            bail!("You need to specify path to a route file");
        }
        if self.dnstap.max_frame_size == 0 {
            bail!("dnstap.max_frame_size must be greater than zero");
        }
        Ok(())
    }

    /// Entry time-to-live. Falls back to 24h if unparseable or zero.
    pub fn ttl(&self) -> Duration {
        match parse_duration(&self.ttl) {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => {
                warn!(
                    "Unable to parse TTL '{}', using {}h",
                    self.ttl,
                    DEFAULT_TTL.as_secs() / 3600
                );
                DEFAULT_TTL
            }
        }
    }

    pub fn listen_addr(&self) -> Result<ListenAddr> {
        Ok(self.dnstap.listen.parse()?)
    }

    pub fn reload_command(&self) -> Option<Vec<String>> {
        let parts: Vec<String> = self
            .reload_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        (!parts.is_empty()).then_some(parts)
    }

    pub fn ingest_options(&self) -> IngestOptions {
        let read_timeout = match parse_duration(&self.dnstap.read_timeout) {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => {
                warn!(
                    "Unable to parse dnstap read timeout '{}', using {}s",
                    self.dnstap.read_timeout,
                    DEFAULT_READ_TIMEOUT.as_secs()
                );
                DEFAULT_READ_TIMEOUT
            }
        };

        IngestOptions {
            read_timeout,
            max_frame_size: self.dnstap.max_frame_size,
            ipv6: self.ipv6,
        }
    }
}

/// Parses durations like `24h`, `1h30m`, `90s`, `1.5h` or `250ms`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    let mut secs = 0f64;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let value: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        secs += value * scale;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(secs).ok()
}
