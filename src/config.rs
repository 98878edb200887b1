//! Configuration file model.

use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_TEMPLATE: &str = "{subject} from: {from}";
pub const PROWL_ENDPOINT: &str = "https://api.prowlapp.com/publicapi/add";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no accounts configured")]
    NoAccounts,

    #[error("account {account}: {reason}")]
    Account { account: String, reason: String },

    #[error("unknown fallback charset {0:?}")]
    UnknownCharset(String),

    #[error("{0} must be at least one second")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    /// Directory for daily-rotated log files; logs go to stderr when unset.
    pub log_dir: Option<PathBuf>,
    /// Seconds between supervisor ticks.
    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval: u64,
    /// Seconds shutdown waits for watchers to leave their wait cleanly.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default = "default_fallback_charset")]
    pub fallback_charset: String,
    pub push: PushConfig,
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "service", rename_all = "lowercase", deny_unknown_fields)]
pub enum PushConfig {
    Prowl {
        api_key: String,
        #[serde(default = "default_prowl_endpoint")]
        endpoint: String,
        proxy: Option<ProxyConfig>,
    },
    Ntfy {
        url: String,
        topic: String,
        click_url: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    name: Option<String>,
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minutes a long poll may sit without an event before it is refreshed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: i64,
    /// Seconds between probes when long poll is unavailable.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_length")]
    pub subject_length: usize,
    #[serde(default = "default_length")]
    pub body_length: usize,
    #[serde(default)]
    pub priority: i8,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default)]
    pub force_poll: bool,
}

impl AccountConfig {
    /// Label used in logs and as the notification source.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}@{}", self.username, self.server),
        }
    }

    /// `None` when forced refresh is disabled.
    pub fn idle_timeout(&self) -> Option<std::time::Duration> {
        u64::try_from(self.idle_timeout)
            .ok()
            .filter(|&minutes| minutes > 0)
            .map(|minutes| std::time::Duration::from_secs(minutes * 60))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |reason: &str| {
            Err(ConfigError::Account {
                account: self.label(),
                reason: reason.to_string(),
            })
        };
        if self.server.trim().is_empty() {
            return fail("server must not be empty");
        }
        if self.username.is_empty() {
            return fail("username must not be empty");
        }
        if !(-2..=2).contains(&self.priority) {
            return fail("priority must be between -2 and 2");
        }
        if self.poll_interval == 0 {
            return fail("poll_interval must be at least one second");
        }
        if self.body_length == 0 || self.subject_length == 0 {
            return fail("subject_length and body_length must be positive");
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }
        if self.supervisor_interval == 0 {
            return Err(ConfigError::ZeroInterval("supervisor_interval"));
        }
        for account in &self.accounts {
            account.validate()?;
        }
        if charset::Charset::for_label(self.fallback_charset.as_bytes()).is_none() {
            return Err(ConfigError::UnknownCharset(self.fallback_charset.clone()));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_supervisor_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_fallback_charset() -> String {
    "iso-8859-1".to_string()
}

fn default_prowl_endpoint() -> String {
    PROWL_ENDPOINT.to_string()
}

fn default_port() -> u16 {
    993
}

fn default_true() -> bool {
    true
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_idle_timeout() -> i64 {
    20
}

fn default_poll_interval() -> u64 {
    60
}

fn default_length() -> usize {
    100
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

#[cfg(test)]
pub(crate) fn test_account(name: &str) -> AccountConfig {
    AccountConfig {
        name: Some(name.to_string()),
        server: "imap.example.org".to_string(),
        port: 993,
        secure: true,
        accept_invalid_certs: false,
        username: "user".to_string(),
        password: "secret".to_string(),
        mailbox: default_mailbox(),
        enabled: true,
        idle_timeout: default_idle_timeout(),
        poll_interval: default_poll_interval(),
        subject_length: default_length(),
        body_length: default_length(),
        priority: 0,
        template: default_template(),
        force_poll: false,
    }
}
