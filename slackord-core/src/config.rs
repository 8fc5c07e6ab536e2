// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Loads the channel mapping file, validates tokens, poll budgets and mapping uniqueness
use crate::orchestrator::ThreadPolicy;
use crate::paths;
use crate::retry::RetryPolicy;
use crate::router::ChannelMapping;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ─── SlackConfig ────────────────────────────────────────────────

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub signing_secret: String,
    /// Bridge's own Slack user id; resolved with auth.test when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_user_id: Option<String>,
}

// Custom Debug impl to redact bot_token, signing_secret
impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("bot_token", &"[REDACTED]")
            .field("signing_secret", &"[REDACTED]")
            .field("bot_user_id", &self.bot_user_id)
            .finish()
    }
}

// ─── DiscordConfig ──────────────────────────────────────────────

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Bridge's own Discord user id; resolved with /users/@me when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_user_id: Option<String>,
    /// Webhook the newcomer waves are posted through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newbies_webhook_url: Option<String>,
}

// Custom Debug impl to redact bot_token and the webhook URL (it embeds a secret)
impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("bot_token", &"[REDACTED]")
            .field("bot_user_id", &self.bot_user_id)
            .field(
                "newbies_webhook_url",
                &self.newbies_webhook_url.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

// ─── BridgeConfig ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Inline channel pairs, merged with the mapping file
    #[serde(default)]
    pub channels: Vec<ChannelMapping>,
    /// JSON mapping file (`{"channels_mapping": [...]}`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_file: Option<String>,
    /// Slack channel receiving messages from unmapped Discord channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_fallback_channel: Option<String>,
    /// Discord channel receiving messages from unmapped Slack channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_fallback_channel: Option<String>,
    /// Slack channel where Discord newcomers are announced; defaults to the Slack fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting_channel: Option<String>,
}

impl BridgeConfig {
    pub fn greeting_channel(&self) -> Option<&str> {
        self.greeting_channel
            .as_deref()
            .or(self.slack_fallback_channel.as_deref())
    }
}

// ─── RelayConfig ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_retention_secs")]
    pub dedup_retention_secs: u64,
    #[serde(default = "default_parent_poll_attempts")]
    pub parent_poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub parent_poll_interval_ms: u64,
    #[serde(default = "default_file_share_poll_attempts")]
    pub file_share_poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub file_share_poll_interval_ms: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default)]
    pub orphan_reply_policy: ThreadPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dedup_retention_secs: default_retention_secs(),
            parent_poll_attempts: default_parent_poll_attempts(),
            parent_poll_interval_ms: default_poll_interval_ms(),
            file_share_poll_attempts: default_file_share_poll_attempts(),
            file_share_poll_interval_ms: default_poll_interval_ms(),
            max_message_len: default_max_message_len(),
            orphan_reply_policy: ThreadPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }

    pub fn parent_poll(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.parent_poll_attempts,
            Duration::from_millis(self.parent_poll_interval_ms),
        )
    }

    pub fn file_share_poll(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.file_share_poll_attempts,
            Duration::from_millis(self.file_share_poll_interval_ms),
        )
    }
}

fn default_retention_secs() -> u64 {
    300
}

fn default_parent_poll_attempts() -> u32 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_file_share_poll_attempts() -> u32 {
    30
}

fn default_max_message_len() -> usize {
    crate::format::DEFAULT_MAX_MESSAGE_LEN
}

// ─── WebhookConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_port")]
    pub port: u16,
    #[serde(default = "default_webhook_host")]
    pub host: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            port: default_webhook_port(),
            host: default_webhook_host(),
        }
    }
}

fn default_webhook_port() -> u16 {
    3000
}

fn default_webhook_host() -> String {
    "127.0.0.1".to_string()
}

// ─── StorageConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Identity database, logs and staging live here; XDG data dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_deref()
            .map(|p| PathBuf::from(expand_tilde(p)))
            .unwrap_or_else(paths::data_dir)
    }
}

// ─── LoggingConfig ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rolling log file under the data directory
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            file: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ─── Channel mapping file ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MappingFile {
    channels_mapping: Vec<ChannelMapping>,
}

/// Parse a `{"channels_mapping": [...]}` document
pub fn parse_channel_mappings(json: &str) -> Result<Vec<ChannelMapping>> {
    let file: MappingFile =
        serde_json::from_str(json).context("Invalid channel mapping document")?;
    Ok(file.channels_mapping)
}

pub fn load_channel_mappings(path: &Path) -> Result<Vec<ChannelMapping>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_channel_mappings(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    }
    path.to_string()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. SLACKORD_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/slackord/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("SLACKORD_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from the default search path with environment overrides
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from `path`, or the default search path when `None`
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::find_config_file(),
        };

        let mut config = if let Some(config_path) = config_path {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = non_empty_env("SLACK_TOKEN") {
            self.slack.bot_token = val;
        }
        if let Some(val) = non_empty_env("SLACK_SIGNING_SECRET") {
            self.slack.signing_secret = val;
        }
        if let Some(val) = non_empty_env("DISCORD_TOKEN") {
            self.discord.bot_token = val;
        }
        if let Some(val) = non_empty_env("SLACK_CHANNEL_DISCORD") {
            self.bridge.slack_fallback_channel = Some(val);
        }
        if let Some(val) = non_empty_env("DISCORD_NEWBIES_WEBHOOK_URL") {
            self.discord.newbies_webhook_url = Some(val);
        }
        if let Some(val) = non_empty_env("SLACKORD_DATA_DIR") {
            self.storage.data_dir = Some(val);
        }
        if let Some(val) = non_empty_env("WEBHOOK_PORT") {
            self.webhook.port = val.parse().with_context(|| {
                format!("WEBHOOK_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Some(val) = non_empty_env("WEBHOOK_HOST") {
            self.webhook.host = val;
        }
        Ok(())
    }

    /// Check required fields and internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.slack.bot_token.trim().is_empty() {
            anyhow::bail!("slack.bot_token is required (set in config.toml or SLACK_TOKEN env var)");
        }
        if self.slack.signing_secret.trim().is_empty() {
            anyhow::bail!(
                "slack.signing_secret is required (set in config.toml or SLACK_SIGNING_SECRET env var)"
            );
        }
        if self.discord.bot_token.trim().is_empty() {
            anyhow::bail!(
                "discord.bot_token is required (set in config.toml or DISCORD_TOKEN env var)"
            );
        }
        if self.relay.parent_poll_attempts == 0 {
            anyhow::bail!("relay.parent_poll_attempts must be at least 1");
        }
        if self.relay.file_share_poll_attempts == 0 {
            anyhow::bail!("relay.file_share_poll_attempts must be at least 1");
        }
        if self.relay.max_message_len < 200 {
            anyhow::bail!(
                "relay.max_message_len must be at least 200, got {}",
                self.relay.max_message_len
            );
        }
        check_unique_sources(&self.bridge.channels)?;
        Ok(())
    }

    /// All channel pairs: inline entries followed by the mapping file's.
    ///
    /// A configured `mapping_file` must exist; the implicit `./channels.json`
    /// is read only when present.
    pub fn channel_mappings(&self) -> Result<Vec<ChannelMapping>> {
        let mut mappings = self.bridge.channels.clone();

        let file = match &self.bridge.mapping_file {
            Some(path) => Some(PathBuf::from(expand_tilde(path))),
            None => Some(PathBuf::from("channels.json")).filter(|p| p.exists()),
        };
        if let Some(path) = file {
            let from_file = load_channel_mappings(&path)?;
            tracing::info!(
                path = %path.display(),
                count = from_file.len(),
                "Loaded channel mapping file"
            );
            mappings.extend(from_file);
        }

        check_unique_sources(&mappings)?;
        Ok(mappings)
    }
}

/// A channel may appear at most once per side
pub fn check_unique_sources(mappings: &[ChannelMapping]) -> Result<()> {
    let mut slack = HashSet::new();
    let mut discord = HashSet::new();
    for m in mappings {
        if !slack.insert(m.slack_channel_id.as_str()) {
            anyhow::bail!("Slack channel {} is mapped more than once", m.slack_channel_id);
        }
        if !discord.insert(m.discord_channel_id.as_str()) {
            anyhow::bail!(
                "Discord channel {} is mapped more than once",
                m.discord_channel_id
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.slack.bot_token = "xoxb-1".to_string();
        config.slack.signing_secret = "sig".to_string();
        config.discord.bot_token = "disc".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.relay.dedup_retention(), Duration::from_secs(300));
        assert_eq!(config.relay.parent_poll(), RetryPolicy::new(60, Duration::from_secs(1)));
        assert_eq!(config.relay.max_message_len, 2000);
        assert_eq!(config.relay.orphan_reply_policy, ThreadPolicy::PostTopLevel);
        assert_eq!(config.webhook.port, 3000);
        assert!(config.logging.file);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [slack]
            bot_token = "xoxb-abc"
            signing_secret = "shh"

            [discord]
            bot_token = "discord-token"

            [bridge]
            slack_fallback_channel = "C_OVERFLOW"

            [[bridge.channels]]
            slack_channel_id = "C1"
            discord_channel_id = "111"

            [relay]
            parent_poll_attempts = 5
            orphan_reply_policy = "drop"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bridge.channels.len(), 1);
        assert_eq!(config.relay.parent_poll_attempts, 5);
        assert_eq!(config.relay.orphan_reply_policy, ThreadPolicy::Drop);
        assert_eq!(config.bridge.greeting_channel(), Some("C_OVERFLOW"));
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_tokens_rejected() {
        let mut config = valid();
        config.discord.bot_token.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("discord.bot_token"), "got: {}", err);
    }

    #[test]
    fn test_zero_poll_attempts_rejected() {
        let mut config = valid();
        config.relay.parent_poll_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_source_channel_rejected() {
        let mut config = valid();
        config.bridge.channels = vec![
            ChannelMapping {
                slack_channel_id: "C1".to_string(),
                discord_channel_id: "111".to_string(),
            },
            ChannelMapping {
                slack_channel_id: "C1".to_string(),
                discord_channel_id: "222".to_string(),
            },
        ];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("C1"));
    }

    #[test]
    fn test_parse_mapping_document() {
        let json = r#"{"channels_mapping":[
            {"slack_channel_id":"C1","discord_channel_id":"111"},
            {"slack_channel_id":"C2","discord_channel_id":"222"}
        ]}"#;
        let mappings = parse_channel_mappings(json).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[1].discord_channel_id, "222");
        assert!(parse_channel_mappings("{}").is_err());
    }

    #[test]
    fn test_mapping_file_merged_with_inline() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(
            &path,
            r#"{"channels_mapping":[{"slack_channel_id":"C2","discord_channel_id":"222"}]}"#,
        )
        .unwrap();

        let mut config = valid();
        config.bridge.channels = vec![ChannelMapping {
            slack_channel_id: "C1".to_string(),
            discord_channel_id: "111".to_string(),
        }];
        config.bridge.mapping_file = Some(path.to_string_lossy().to_string());

        let all = config.channel_mappings().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].slack_channel_id, "C1");
        assert_eq!(all[1].slack_channel_id, "C2");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = valid();
        config.discord.newbies_webhook_url =
            Some("https://discord.com/api/webhooks/1/secret-part".to_string());
        let debug_str = format!("{:?}", config);
        assert!(!debug_str.contains("xoxb-1"));
        assert!(!debug_str.contains("secret-part"));
        assert!(debug_str.contains("[REDACTED]"));
    }
}
