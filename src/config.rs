use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::scan::registry::SessionLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} is required when PRODUCT_SOURCE uses the remote source")]
    Missing(&'static str),
}

/// Where product records come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Fixture,
    Remote,
    Layered,
}

impl FromStr for SourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixture" => Ok(Self::Fixture),
            "remote" | "edamam" => Ok(Self::Remote),
            "layered" => Ok(Self::Layered),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdamamConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_key: String,
    pub timeout_secs: u64,
}

impl EdamamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub product_source: SourceKind,
    pub fixtures_path: Option<PathBuf>,
    /// Present when app id and key are both set.
    pub edamam: Option<EdamamConfig>,
    pub camera_snapshot_path: Option<PathBuf>,
    pub session_capacity: usize,
    pub session_idle_ttl_secs: u64,
}

pub const DEFAULT_EDAMAM_URL: &str = "https://api.edamam.com/api/food-database/v2/parser";

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| get(name).filter(|v| !v.trim().is_empty());

        let port = parse_or(&get, "APP_PORT", 8080u16)?;
        let max_upload_bytes = parse_or(&get, "MAX_UPLOAD_BYTES", 10 * 1024 * 1024usize)?;
        let timeout_secs = parse_or(&get, "UPSTREAM_TIMEOUT_SECS", 10u64)?;
        let session_capacity = parse_or(&get, "SESSION_CAPACITY", 256usize)?;
        let session_idle_ttl_secs = parse_or(&get, "SESSION_IDLE_TTL_SECS", 900u64)?;

        let product_source = match non_empty("PRODUCT_SOURCE") {
            Some(v) => v.parse::<SourceKind>().map_err(|_| ConfigError::Invalid {
                name: "PRODUCT_SOURCE",
                value: v,
            })?,
            None => SourceKind::Fixture,
        };

        let edamam = match (non_empty("EDAMAM_APP_ID"), non_empty("EDAMAM_APP_KEY")) {
            (Some(app_id), Some(app_key)) => Some(EdamamConfig {
                base_url: non_empty("EDAMAM_BASE_URL").unwrap_or_else(|| DEFAULT_EDAMAM_URL.into()),
                app_id,
                app_key,
                timeout_secs,
            }),
            _ => None,
        };

        if product_source != SourceKind::Fixture && edamam.is_none() {
            let missing = if non_empty("EDAMAM_APP_ID").is_none() {
                "EDAMAM_APP_ID"
            } else {
                "EDAMAM_APP_KEY"
            };
            return Err(ConfigError::Missing(missing));
        }

        Ok(Self {
            host: non_empty("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            max_upload_bytes,
            product_source,
            fixtures_path: non_empty("PRODUCT_FIXTURES_PATH").map(PathBuf::from),
            edamam,
            camera_snapshot_path: non_empty("CAMERA_SNAPSHOT_PATH").map(PathBuf::from),
            session_capacity,
            session_idle_ttl_secs,
        })
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            capacity: self.session_capacity,
            idle_ttl: Duration::from_secs(self.session_idle_ttl_secs),
        }
    }
}

fn parse_or<F, T>(get: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(name).filter(|v| !v.trim().is_empty()) {
        Some(v) => v.trim().parse::<T>().map_err(|_| ConfigError::Invalid { name, value: v }),
        None => Ok(default),
    }
}
