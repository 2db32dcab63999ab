//! Service configuration, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::sequence::admission::AdmissionPolicy;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sends allowed per sender identity per tick.
    pub max_per_hour: usize,
    /// Spacing between consecutive sends of one identity.
    pub delay_between_sends: Duration,
    /// Cron expression (with seconds) driving ticks.
    pub tick_schedule: String,
    /// Public base URL tracking pixels point at.
    pub public_base_url: Url,
}

impl SchedulerConfig {
    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            max_per_hour: self.max_per_hour,
            delay_between_sends: self.delay_between_sends,
        }
    }
}

/// SMTP credentials for one sender identity.
#[derive(Debug)]
pub struct SenderAccount {
    /// The `my_email` value prospects reference; also the From address.
    pub identity: String,
    pub display_name: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
}

/// JSON shape of one entry in `SEQUENCE_SENDERS`.
#[derive(Deserialize)]
struct RawSenderAccount {
    identity: String,
    #[serde(default)]
    display_name: Option<String>,
    smtp_host: String,
    #[serde(default)]
    smtp_port: Option<u16>,
    username: Option<String>,
    password: String,
}

impl From<RawSenderAccount> for SenderAccount {
    fn from(raw: RawSenderAccount) -> Self {
        Self {
            username: raw.username.unwrap_or_else(|| raw.identity.clone()),
            identity: raw.identity,
            display_name: raw.display_name,
            smtp_host: raw.smtp_host,
            smtp_port: raw.smtp_port.unwrap_or(DEFAULT_SMTP_PORT),
            password: SecretString::from(raw.password),
        }
    }
}

/// Full service configuration.
#[derive(Debug)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub scheduler: SchedulerConfig,
    pub senders: Vec<SenderAccount>,
}

const DEFAULT_SMTP_PORT: u16 = 465;
const DEFAULT_DB_PATH: &str = "./data/sequences.db";
const DEFAULT_HTTP_PORT: u16 = 3001;
const DEFAULT_TICK_SCHEDULE: &str = "0 0 * * * *";

impl ServiceConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let public_base_url = get("PUBLIC_BASE_URL").ok_or_else(|| ConfigError::MissingRequired {
            key: "PUBLIC_BASE_URL".into(),
            hint: "Set it to the externally reachable URL of this service, e.g. https://mail.example.com".into(),
        })?;
        let public_base_url = Url::parse(&public_base_url).map_err(|e| ConfigError::InvalidValue {
            key: "PUBLIC_BASE_URL".into(),
            message: e.to_string(),
        })?;

        let max_per_hour: usize = parse_or(&get, "MAX_PER_HOUR", 10)?;
        if max_per_hour == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_PER_HOUR".into(),
                message: "must be at least 1".into(),
            });
        }

        let delay_secs: u64 = parse_or(&get, "DELAY_BETWEEN_SENDS_SECS", 90)?;

        let tick_schedule = get("SEQUENCE_TICK_CRON").unwrap_or_else(|| DEFAULT_TICK_SCHEDULE.into());
        cron::Schedule::from_str(&tick_schedule).map_err(|e| ConfigError::InvalidValue {
            key: "SEQUENCE_TICK_CRON".into(),
            message: e.to_string(),
        })?;

        let db_path = get("SEQUENCE_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.into());
        let http_port: u16 = parse_or(&get, "SEQUENCE_HTTP_PORT", DEFAULT_HTTP_PORT)?;

        let senders = load_senders(&get)?;

        Ok(Self {
            db_path: PathBuf::from(db_path),
            http_port,
            scheduler: SchedulerConfig {
                max_per_hour,
                delay_between_sends: Duration::from_secs(delay_secs),
                tick_schedule,
                public_base_url,
            },
            senders,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// `SEQUENCE_SENDERS` (JSON array) takes precedence; otherwise a single
/// account is assembled from the `SMTP_*` variables.
fn load_senders<G>(get: &G) -> Result<Vec<SenderAccount>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let senders: Vec<SenderAccount> = if let Some(json) = get("SEQUENCE_SENDERS") {
        let raw: Vec<RawSenderAccount> = serde_json::from_str(&json)
            .map_err(|e| ConfigError::ParseError(format!("SEQUENCE_SENDERS: {e}")))?;
        raw.into_iter().map(SenderAccount::from).collect()
    } else if let Some(identity) = get("SMTP_FROM") {
        let smtp_host = get("SMTP_HOST").ok_or_else(|| ConfigError::MissingEnvVar("SMTP_HOST".into()))?;
        let password =
            get("SMTP_PASSWORD").ok_or_else(|| ConfigError::MissingEnvVar("SMTP_PASSWORD".into()))?;
        vec![SenderAccount {
            username: get("SMTP_USERNAME").unwrap_or_else(|| identity.clone()),
            display_name: get("SMTP_DISPLAY_NAME"),
            smtp_port: parse_or(get, "SMTP_PORT", DEFAULT_SMTP_PORT)?,
            smtp_host,
            password: SecretString::from(password),
            identity,
        }]
    } else {
        Vec::new()
    };

    if senders.is_empty() {
        return Err(ConfigError::MissingRequired {
            key: "SEQUENCE_SENDERS".into(),
            hint: "Provide a JSON array of sender accounts, or SMTP_FROM/SMTP_HOST/SMTP_PASSWORD".into(),
        });
    }

    let mut seen = std::collections::HashSet::new();
    for sender in &senders {
        if !seen.insert(sender.identity.to_lowercase()) {
            return Err(ConfigError::InvalidValue {
                key: "SEQUENCE_SENDERS".into(),
                message: format!("duplicate sender identity {}", sender.identity),
            });
        }
    }

    Ok(senders)
}
