//! Runtime configuration from the environment, optionally seeded by a `.env` file.

use rand::Rng;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::bus::MqttSettings;
use crate::client::{CloudConfig, DEFAULT_AUTH_URL, DEFAULT_BASE_URL, DEFAULT_CLIENT_ID};
use crate::models::cloud::InstallationId;
use crate::reconcile::ReconcilePolicy;
use crate::services::scheduler::Intervals;
use crate::session::Credentials;

pub const DEFAULT_MQTT_HOST: &str = "localhost";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "heatzone";
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_NODE_ID: &str = "heatzone-bridge";
pub const DEFAULT_POLL_SECS: u64 = 60;
pub const DEFAULT_LIVE_SECS: u64 = 300;
pub const DEFAULT_REFERENTIAL_SECS: u64 = 86_400;
pub const DEFAULT_TOKEN_REFRESH_SECS: u64 = 240;

#[derive(Debug, Clone)]
pub struct Config {
    pub cloud: CloudConfig,
    pub credentials: Credentials,
    /// Installations to bridge; `None` bridges every installation of the account.
    pub installations: Option<Vec<InstallationId>>,
    pub mqtt: MqttSettings,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub node_id: String,
    pub intervals: Intervals,
    pub policy: ReconcilePolicy,
    pub max_login_failures: u32,
    /// How long shutdown waits for in-flight command results.
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| var(key).ok_or_else(|| format!("Missing required setting {}", key));

        let credentials = Credentials {
            username: required("CLOUD_USERNAME")?,
            password: required("CLOUD_PASSWORD")?,
        };

        let cloud = CloudConfig {
            base_url: var("CLOUD_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            auth_url: var("CLOUD_AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.to_string()),
            client_id: var("CLOUD_CLIENT_ID").unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            timeout: seconds(&var, "REQUEST_TIMEOUT_SECS", 30)?,
        };

        let installations = var("CLOUD_INSTALLATIONS").map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| InstallationId(s.to_string()))
                .collect::<Vec<_>>()
        });

        let mqtt = MqttSettings {
            host: var("MQTT_HOST").unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
            port: number(&var, "MQTT_PORT", DEFAULT_MQTT_PORT)?,
            username: var("MQTT_USERNAME"),
            password: var("MQTT_PASSWORD"),
            client_id: var("MQTT_CLIENT_ID").unwrap_or_else(|| {
                format!("{}-{:06x}", DEFAULT_NODE_ID, rand::rng().random_range(0..0x100_0000u32))
            }),
            keep_alive: seconds(&var, "MQTT_KEEP_ALIVE_SECS", 30)?,
        };

        let intervals = Intervals {
            poll: seconds(&var, "POLL_INTERVAL_SECS", DEFAULT_POLL_SECS)?,
            live: seconds(&var, "LIVE_INTERVAL_SECS", DEFAULT_LIVE_SECS)?,
            referential: seconds(&var, "REFERENTIAL_INTERVAL_SECS", DEFAULT_REFERENTIAL_SECS)?,
            token_refresh: seconds(&var, "TOKEN_REFRESH_SECS", DEFAULT_TOKEN_REFRESH_SECS)?,
        };

        let grace = seconds(&var, "GRACE_PERIOD_SECS", intervals.poll.as_secs())?;
        let policy = ReconcilePolicy {
            grace: chrono::TimeDelta::from_std(grace).map_err(|_| "GRACE_PERIOD_SECS is too large".to_string())?,
            confirm_updates: positive(&var, "CONFIRM_UPDATES", 2)?,
            missed_polls_before_removal: positive(&var, "MISSED_POLLS_BEFORE_REMOVAL", 3)?,
        };

        Ok(Config {
            cloud,
            credentials,
            installations,
            mqtt,
            topic_prefix: var("MQTT_TOPIC_PREFIX").unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            discovery_prefix: var("DISCOVERY_PREFIX").unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string()),
            node_id: var("DISCOVERY_NODE_ID").unwrap_or_else(|| DEFAULT_NODE_ID.to_string()),
            intervals,
            policy,
            max_login_failures: positive(&var, "MAX_LOGIN_FAILURES", 3)?,
            shutdown_timeout: seconds(&var, "SHUTDOWN_TIMEOUT_SECS", 10)?,
        })
    }
}

fn number<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, String> {
    match var(key) {
        Some(raw) => raw.parse::<T>().map_err(|_| format!("{} must be a number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

fn positive(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> Result<u32, String> {
    match number(var, key, default)? {
        0 => Err(format!("{} must be at least 1", key)),
        n => Ok(n),
    }
}

fn seconds(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration, String> {
    match number(var, key, default)? {
        0 => Err(format!("{} must be at least 1", key)),
        n => Ok(Duration::from_secs(n)),
    }
}

// =====================
// .env files
// =====================

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Load `--env-file <path>` if given, else `./.env` if present. Variables
/// already set in the process environment are left alone.
pub fn load_env_from_args(args: impl IntoIterator<Item = String>) -> Result<Option<LoadedEnvFile>, String> {
    let mut args = args.into_iter();
    let mut explicit: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            args.next()
        } else if let Some(path) = arg.strip_prefix("--env-file=") {
            Some(path.to_string())
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        let path = path.filter(|p| !p.is_empty()).ok_or("`--env-file` requires a path argument")?;
        if explicit.replace(PathBuf::from(path)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    let (path, explicit) = match explicit {
        Some(path) if path.is_file() => (path, true),
        Some(path) => return Err(format!("env file not found: {}", path.display())),
        None => {
            let path = PathBuf::from(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };

    for (key, value) in read_env_file(&path)? {
        if std::env::var_os(&key).is_none() {
            // Runs before any other thread is started.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn read_env_file(path: &Path) -> Result<Vec<(String, String)>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut out = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if let Some(pair) = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

/// `KEY=value`, `export KEY=value`, single or double quotes, `#` comments.
fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or("missing '=' in assignment")?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => {
            let body = &raw[1..];
            let end = body.find(quote).ok_or("unterminated quoted value")?;
            let rest = body[end + 1..].trim();
            if !rest.is_empty() && !rest.starts_with('#') {
                return Err("unexpected characters after closing quote".to_string());
            }
            let body = &body[..end];
            if quote == '"' {
                body.replace("\\n", "\n").replace("\\t", "\t")
            } else {
                body.to_string()
            }
        }
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}
