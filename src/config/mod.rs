//! Runtime configuration: the `~/.acp` directory and `config.yml`.
//!
//! Config selects the consent channel and carries its credentials.
//! Credentials may also arrive via environment variables, which win over
//! the file. Unknown keys are a parse error — a typo in a security
//! config must not be silently ignored.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env override for the host-approval cache TTL.
pub const TTL_ENV: &str = "ACP_HTTP_HOST_APPROVAL_TTL_SEC";

/// Layout of the per-user config directory.
#[derive(Debug, Clone)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    /// `~/.acp` of the runtime user, or an explicit override.
    pub fn resolve(override_dir: Option<&Path>, user_home: &Path) -> Self {
        let root = match override_dir {
            Some(dir) => dir.to_path_buf(),
            None => user_home.join(".acp"),
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yml")
    }

    pub fn policy_file(&self) -> PathBuf {
        self.root.join("policy.yml")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }
}

/// Which consent channel answers the asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Terminal,
    Telegram,
    Webhook,
}

impl ChannelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Terminal => "terminal",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelKind,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Prepend the built-in safe-host allowlist at startup.
    #[serde(default = "default_true")]
    pub builtin_allowlist: bool,

    /// Resolvers the kernel filter permits on port 53.
    #[serde(default = "default_dns")]
    pub dns_servers: Vec<IpAddr>,

    /// Global bound on a consent wait when no rule sets its own.
    #[serde(default = "default_ask_timeout")]
    pub ask_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_dns() -> Vec<IpAddr> {
    vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()]
}

fn default_ask_timeout() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: ChannelKind::default(),
            telegram: TelegramConfig::default(),
            webhook: WebhookConfig::default(),
            builtin_allowlist: true,
            dns_servers: default_dns(),
            ask_timeout_secs: default_ask_timeout(),
        }
    }
}

impl Config {
    /// Load `config.yml`, falling back to defaults when absent, then apply
    /// environment overrides for credentials.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid YAML in config file")
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("ACP_TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Ok(chat) = std::env::var("ACP_TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = Some(chat);
        }
        if let Ok(url) = std::env::var("ACP_WEBHOOK_URL") {
            self.webhook.url = Some(url);
        }
        if let Ok(secret) = std::env::var("ACP_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
    }

    fn validate(&self) -> Result<()> {
        match self.channel {
            ChannelKind::Telegram => {
                if self.telegram.bot_token.is_none() || self.telegram.chat_id.is_none() {
                    bail!(
                        "telegram channel needs bot_token and chat_id \
                         (config.yml or ACP_TELEGRAM_BOT_TOKEN / ACP_TELEGRAM_CHAT_ID)"
                    );
                }
            }
            ChannelKind::Webhook => {
                if self.webhook.url.is_none() {
                    bail!("webhook channel needs a url (config.yml or ACP_WEBHOOK_URL)");
                }
            }
            ChannelKind::Terminal => {}
        }
        Ok(())
    }
}

/// The host-approval TTL: env override, else the default 180 s.
pub fn approval_ttl() -> Duration {
    std::env::var(TTL_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(crate::gate::DEFAULT_APPROVAL_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.channel, ChannelKind::Terminal);
        assert!(config.builtin_allowlist);
        assert_eq!(config.dns_servers.len(), 2);
        assert_eq!(config.ask_timeout_secs, 300);
    }

    #[test]
    fn test_parse_telegram_config() {
        let config = Config::parse(
            r#"
channel: telegram
telegram:
  bot_token: "123:abc"
  chat_id: "42"
"#,
        )
        .unwrap();
        assert_eq!(config.channel, ChannelKind::Telegram);
        assert_eq!(config.telegram.bot_token.as_deref(), Some("123:abc"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::parse("channnel: terminal\n").is_err());
        assert!(Config::parse("channel: terminal\nextra: 1\n").is_err());
    }

    #[test]
    fn test_telegram_without_credentials_invalid() {
        let config = Config::parse("channel: telegram\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_webhook_needs_url() {
        let config = Config::parse("channel: webhook\n").unwrap();
        assert!(config.validate().is_err());

        let config = Config::parse(
            "channel: webhook\nwebhook:\n  url: \"https://hooks.example/consent\"\n",
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_dir_layout() {
        let dir = ConfigDir::resolve(None, Path::new("/home/agent"));
        assert_eq!(dir.config_file(), PathBuf::from("/home/agent/.acp/config.yml"));
        assert_eq!(dir.policy_file(), PathBuf::from("/home/agent/.acp/policy.yml"));
        assert_eq!(dir.audit_file(), PathBuf::from("/home/agent/.acp/audit.jsonl"));

        let dir = ConfigDir::resolve(Some(Path::new("/etc/acp")), Path::new("/home/agent"));
        assert_eq!(dir.root(), Path::new("/etc/acp"));
    }
}
