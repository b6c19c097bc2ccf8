use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::media::DownloadSettings;
use crate::notify::NoticeSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub download: DownloadConfig,
    pub janitor: JanitorConfig,
    pub discord: DiscordConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Trust `X-Forwarded-For` and friends when identifying clients.
    pub trust_proxy_headers: bool,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            trust_proxy_headers: false,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub capacity: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            capacity: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    /// Downloader program followed by any leading arguments, e.g. `["python3", "-m", "yt_dlp"]`.
    pub command: Vec<String>,
    pub scratch_dir: PathBuf,
    pub timeout_secs: u64,
    pub strategy_delay_ms: u64,
    pub stderr_limit: usize,
    pub youtube_clients: Vec<String>,
    pub mirror_endpoint: Option<String>,
    pub impersonate_target: String,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            command: vec!["yt-dlp".to_string()],
            scratch_dir: std::env::temp_dir().join("clipdrop"),
            timeout_secs: 300,
            strategy_delay_ms: 1500,
            stderr_limit: 2000,
            youtube_clients: vec![
                "android_vr".to_string(),
                "web_safari".to_string(),
                "android".to_string(),
            ],
            mirror_endpoint: None,
            impersonate_target: "chrome".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JanitorConfig {
    pub interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            max_age_secs: 3600,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: Option<String>,
    pub channel_id: Option<String>,
    pub webhook_url: Option<String>,
    pub log_downloads: bool,
    pub log_visits: bool,
    pub log_errors: bool,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: None,
            channel_id: None,
            webhook_url: None,
            log_downloads: true,
            log_visits: true,
            log_errors: true,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Applies environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(bind) = lookup("BIND_ADDR") {
            self.server.bind = bind;
        } else if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
            self.server.bind = format!("0.0.0.0:{port}");
        }
        if let Some(dir) = lookup("SCRATCH_DIR") {
            self.download.scratch_dir = PathBuf::from(dir);
        }
        if let Some(token) = lookup("DISCORD_TOKEN").or_else(|| lookup("DISCORD_BOT_TOKEN")) {
            self.discord.token = Some(token);
        }
        if let Some(channel) = lookup("DISCORD_CHANNEL_ID") {
            self.discord.channel_id = Some(channel);
        }
        if let Some(webhook) = lookup("DISCORD_WEBHOOK_URL") {
            self.discord.webhook_url = Some(webhook);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.capacity == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.capacity must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }
        if self.download.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "download.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.janitor.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "janitor.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.download.command.is_empty() {
            return Err(ConfigError::Invalid(
                "download.command must name a program".to_string(),
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server.bind {:?}: {e}", self.server.bind)))
    }

    pub fn get_logging_format(&self) -> &str {
        &self.logging.format
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn download_settings(&self) -> DownloadSettings {
        let d = &self.download;
        DownloadSettings {
            command: d.command.clone(),
            scratch_dir: d.scratch_dir.clone(),
            timeout: Duration::from_secs(d.timeout_secs),
            strategy_delay: Duration::from_millis(d.strategy_delay_ms),
            stderr_limit: d.stderr_limit,
            youtube_clients: d.youtube_clients.clone(),
            mirror_endpoint: d.mirror_endpoint.clone(),
            impersonate_target: d.impersonate_target.clone(),
            user_agent: d.user_agent.clone(),
        }
    }

    pub fn notice_settings(&self) -> NoticeSettings {
        NoticeSettings {
            log_downloads: self.discord.log_downloads,
            log_visits: self.discord.log_visits,
            log_errors: self.discord.log_errors,
        }
    }
}
