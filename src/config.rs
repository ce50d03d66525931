use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::auth::{Role, TokenTable};
use crate::timefmt::parse_offset;

const PREFIX: &str = "BAYBOOK_";

#[derive(Debug)]
pub enum ConfigError {
    Invalid {
        key: String,
        value: String,
        reason: &'static str,
    },
    Labels(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value, reason } => {
                write!(f, "invalid {key}={value:?}: {reason}")
            }
            ConfigError::Labels(msg) => write!(f, "labels file: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
    /// `{placeholder}` template. `None` selects the built-in format.
    pub template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub lock_timeout: Duration,
    /// Offset used for human-readable dates in messages and exports.
    pub display_offset: FixedOffset,
    /// Present only when both token and chat id are set.
    pub telegram: Option<TelegramConfig>,
    pub labels_file: Option<PathBuf>,
    pub tokens: TokenTable,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; keys are passed with the `BAYBOOK_` prefix.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        let display_offset = match get("DISPLAY_OFFSET") {
            Some(raw) => parse_offset(&raw).ok_or_else(|| ConfigError::Invalid {
                key: format!("{PREFIX}DISPLAY_OFFSET"),
                value: raw,
                reason: "expected +HH:MM, -HH:MM or UTC",
            })?,
            None => Utc.fix(),
        };

        let telegram = match (get("TELEGRAM_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(token), Some(chat_id)) => Some(TelegramConfig {
                token,
                chat_id,
                template: get("TELEGRAM_TEMPLATE"),
            }),
            _ => None,
        };

        let mut tokens = TokenTable::new();
        tokens.insert(get("ADMIN_TOKEN").unwrap_or_else(|| "baybook".into()), Role::Admin);
        for (name, role) in [
            ("DISPATCHER_TOKEN", Role::Dispatcher),
            ("MECHANIC_TOKEN", Role::Mechanic),
            ("VIEWER_TOKEN", Role::Viewer),
        ] {
            if let Some(token) = get(name) {
                tokens.insert(token, role);
            }
        }

        Ok(Self {
            port: parse_or(&get, "PORT", 7433)?,
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            max_connections: parse_or(&get, "MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&get, "METRICS_PORT")?,
            lock_timeout: Duration::from_millis(parse_or(&get, "LOCK_TIMEOUT_MS", 5000)?),
            display_offset,
            telegram,
            labels_file: get("LABELS_FILE").map(PathBuf::from),
            tokens,
        })
    }
}

fn parse_opt<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match get(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            key: format!("{PREFIX}{name}"),
            value: raw,
            reason: "not a valid number",
        }),
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(get, name)?.unwrap_or(default))
}
