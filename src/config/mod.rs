use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub group_id: i64,
    /// Forum topic the announcements go to
    #[serde(default)]
    pub topic_id: Option<i64>,
    /// The only user allowed to run diagnostics/reset commands
    #[serde(default)]
    pub operator_id: Option<i64>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            group_id: 0,
            topic_id: None,
            operator_id: None,
            api_base: default_telegram_api_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_kick_slug")]
    pub kick_slug: String,
    #[serde(default = "default_vk_slug")]
    pub vk_slug: String,
    #[serde(default = "default_kick_api_base")]
    pub kick_api_base: String,
    #[serde(default = "default_vk_base")]
    pub vk_base: String,
}

fn default_kick_slug() -> String {
    "gladvalakaspwnz".to_string()
}

fn default_vk_slug() -> String {
    "gladvalakas".to_string()
}

fn default_kick_api_base() -> String {
    "https://kick.com".to_string()
}

fn default_vk_base() -> String {
    "https://live.vkvideo.ru".to_string()
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            kick_slug: default_kick_slug(),
            vk_slug: default_vk_slug(),
            kick_api_base: default_kick_api_base(),
            vk_base: default_vk_base(),
        }
    }
}

impl SourcesConfig {
    pub fn kick_public_url(&self) -> String {
        format!("https://kick.com/{}", self.kick_slug)
    }

    pub fn vk_public_url(&self) -> String {
        format!("{}/{}", self.vk_base.trim_end_matches('/'), self.vk_slug)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Consecutive fully-offline ticks required before a session is declared over
    #[serde(default = "default_confirm_threshold")]
    pub confirm_threshold: u32,
    /// Per-tick stats delta is clamped to this many poll intervals
    #[serde(default = "default_max_gap_factor")]
    pub max_gap_factor: u32,
    #[serde(default = "default_session_tolerance")]
    pub session_tolerance_secs: u64,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_confirm_threshold() -> u32 {
    2
}

fn default_max_gap_factor() -> u32 {
    3
}

fn default_session_tolerance() -> u64 {
    120
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            confirm_threshold: default_confirm_threshold(),
            max_gap_factor: default_max_gap_factor(),
            session_tolerance_secs: default_session_tolerance(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.interval_secs * u64::from(self.max_gap_factor.max(1))) as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_start_window")]
    pub start_window_secs: u64,
    #[serde(default = "default_change_window")]
    pub change_window_secs: u64,
    /// Minimum time between two operator alerts of the same kind
    #[serde(default = "default_alert_window")]
    pub alert_window_secs: u64,
}

fn default_start_window() -> u64 {
    900
}

fn default_change_window() -> u64 {
    120
}

fn default_alert_window() -> u64 {
    1800
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            start_window_secs: default_start_window(),
            change_window_secs: default_change_window(),
            alert_window_secs: default_alert_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_long_poll")]
    pub long_poll_secs: u64,
    /// Must exceed `long_poll_secs`, see [`Config::validate`]
    #[serde(default = "default_command_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_conflict_backoff")]
    pub conflict_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_long_poll() -> u64 {
    15
}

fn default_command_http_timeout() -> u64 {
    30
}

fn default_conflict_backoff() -> u64 {
    30
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            long_poll_secs: default_long_poll(),
            http_timeout_secs: default_command_http_timeout(),
            conflict_backoff_secs: default_conflict_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_watchdog_silence")]
    pub silence_secs: u64,
    #[serde(default = "default_watchdog_cooldown")]
    pub cooldown_secs: u64,
}

fn default_watchdog_interval() -> u64 {
    10
}

fn default_watchdog_silence() -> u64 {
    120
}

fn default_watchdog_cooldown() -> u64 {
    600
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watchdog_interval(),
            silence_secs: default_watchdog_silence(),
            cooldown_secs: default_watchdog_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Files larger than this are not trusted on load
    #[serde(default = "default_state_max_bytes")]
    pub max_bytes: u64,
}

fn default_state_max_bytes() -> u64 {
    1024 * 1024
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_bytes: default_state_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_capture_timeout")]
    pub timeout_secs: u64,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_capture_timeout() -> u64 {
    15
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ffmpeg_path: default_ffmpeg_path(),
            timeout_secs: default_capture_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    8000
}

fn default_retry_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            retry_statuses: default_retry_statuses(),
        }
    }
}

impl Config {
    /// Check the settings the runtime cannot work without, and repair the
    /// ones that have a safe fallback.
    pub fn validate(&mut self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("Telegram bot token is empty. Set BOT_TOKEN or telegram.bot_token.");
        }
        if self.telegram.group_id == 0 {
            anyhow::bail!("Telegram group id is not set. Set GROUP_ID or telegram.group_id.");
        }
        if self.polling.interval_secs == 0 {
            anyhow::bail!("polling.interval_secs must be greater than zero");
        }
        if self.polling.confirm_threshold == 0 {
            anyhow::bail!("polling.confirm_threshold must be at least 1");
        }
        if self.command.http_timeout_secs <= self.command.long_poll_secs {
            let raised = self.command.long_poll_secs + 10;
            tracing::warn!(
                "command.http_timeout_secs ({}) does not exceed long_poll_secs ({}), using {}",
                self.command.http_timeout_secs,
                self.command.long_poll_secs,
                raised
            );
            self.command.http_timeout_secs = raised;
        }
        Ok(())
    }

    /// Apply deployment overrides from the environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup (the environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(token) = get("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(id) = get("GROUP_ID").and_then(|v| v.parse().ok()) {
            self.telegram.group_id = id;
        }
        if let Some(id) = get("TOPIC_ID").and_then(|v| v.parse().ok()) {
            self.telegram.topic_id = Some(id);
        }
        if let Some(id) = get("OPERATOR_ID").and_then(|v| v.parse().ok()) {
            self.telegram.operator_id = Some(id);
        }
        if let Some(slug) = get("KICK_SLUG") {
            self.sources.kick_slug = slug;
        }
        if let Some(slug) = get("VK_SLUG") {
            self.sources.vk_slug = slug;
        }
        if let Some(secs) = get("POLL_INTERVAL").and_then(|v| v.parse().ok()) {
            self.polling.interval_secs = secs;
        }
        if let Some(path) = get("STATE_FILE") {
            self.state.path = Some(PathBuf::from(path));
        }
    }

    /// Resolved location of the persisted state file
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state.path {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("state.json")),
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "onair").context("Could not determine project directories")
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Load configuration from a TOML file, then apply environment overrides.
///
/// An explicit path must exist. A missing default file is fine: a typical
/// deployment is configured entirely through the environment.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => {
            if !p.exists() {
                anyhow::bail!("Config file not found at {}", p.display());
            }
            load_from_path(p)?
        }
        None => {
            let default = default_config_path()?;
            if default.exists() {
                load_from_path(&default)?
            } else {
                tracing::debug!(
                    "No config file at {}, using defaults and environment",
                    default.display()
                );
                Config::default()
            }
        }
    };

    config.apply_env();
    Ok(config)
}

pub fn load_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;

    Ok(config)
}
