use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::session::DEFAULT_SWEEP_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Scylla,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "scylla" => Ok(StoreBackend::Scylla),
            other => Err(AppError::ValidationFailed(format!("unknown store backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub store: StoreBackend,
    pub scylla_nodes: Vec<String>,
    pub scylla_credentials: Option<(String, String)>,
    pub keyspace: String,
    pub replication_factor: u32,
    pub schema_path: PathBuf,
    /// `None` migrates to the newest version on disk.
    pub schema_version: Option<i32>,
    pub sweep_interval: Duration,
    pub require_email_validation: bool,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:1227".to_string(),
            store: StoreBackend::Scylla,
            scylla_nodes: vec!["127.0.0.1:9042".to_string()],
            scylla_credentials: None,
            keyspace: "warden".to_string(),
            replication_factor: 1,
            schema_path: PathBuf::from("schema"),
            schema_version: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            require_email_validation: true,
            bootstrap_admin: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::ValidationFailed(format!("{} has an invalid value '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::ValidationFailed(format!("{} has an invalid value '{}'", key, value))),
    }
}

impl Config {
    /// Loads `.env` if present, then reads the `WARDEN_*` variables.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("WARDEN_BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Some(v) = get("WARDEN_STORE") {
            config.store = v.parse()?;
        }
        if let Some(v) = get("WARDEN_SCYLLA_NODES") {
            config.scylla_nodes = v.split(',').map(|n| n.trim().to_string()).filter(|n| !n.is_empty()).collect();
        }
        config.scylla_credentials = match (get("WARDEN_SCYLLA_USER"), get("WARDEN_SCYLLA_PASSWORD")) {
            (Some(user), Some(password)) => Some((user, password)),
            (None, None) => None,
            _ => {
                return Err(AppError::ValidationFailed(
                    "WARDEN_SCYLLA_USER and WARDEN_SCYLLA_PASSWORD must be set together".into(),
                ))
            }
        };
        if let Some(v) = get("WARDEN_KEYSPACE") {
            config.keyspace = v;
        }
        if let Some(v) = get("WARDEN_REPLICATION_FACTOR") {
            config.replication_factor = parse("WARDEN_REPLICATION_FACTOR", &v)?;
        }
        if let Some(v) = get("WARDEN_SCHEMA_PATH") {
            config.schema_path = PathBuf::from(v);
        }
        if let Some(v) = get("WARDEN_SCHEMA_VERSION") {
            config.schema_version = Some(parse("WARDEN_SCHEMA_VERSION", &v)?);
        }
        if let Some(v) = get("WARDEN_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse("WARDEN_SWEEP_INTERVAL_SECS", &v)?;
            if secs == 0 {
                return Err(AppError::ValidationFailed("WARDEN_SWEEP_INTERVAL_SECS must be positive".into()));
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = get("WARDEN_REQUIRE_EMAIL_VALIDATION") {
            config.require_email_validation = parse_bool("WARDEN_REQUIRE_EMAIL_VALIDATION", &v)?;
        }
        config.bootstrap_admin = match (get("WARDEN_ADMIN_EMAIL"), get("WARDEN_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(BootstrapAdmin {
                email,
                password,
                name: get("WARDEN_ADMIN_NAME").unwrap_or_else(|| "Administrator".to_string()),
            }),
            (None, None) => None,
            _ => {
                return Err(AppError::ValidationFailed(
                    "WARDEN_ADMIN_EMAIL and WARDEN_ADMIN_PASSWORD must be set together".into(),
                ))
            }
        };
        Ok(config)
    }
}
