//! Configuration loading helpers.
//!
//! Controllers describe their settings as plain serde structs. These helpers
//! read them from TOML files and apply `FLEET_*` environment overrides.

use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "FLEET_";

/// Parse a TOML document into `T`.
///
/// # Errors
///
/// Returns [`Error::TomlParseFailed`] if the document is malformed or does not
/// match `T`.
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))
}

/// Load a TOML file into `T`.
///
/// # Errors
///
/// Returns error if:
/// - File cannot be read
/// - TOML is malformed
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config_read_failed(path, e.to_string()))?;

    tracing::debug!(path = %path.display(), "Loaded config file");

    parse_toml(&content)
}

/// Read `FLEET_<name>` from the environment and parse it.
///
/// Returns `Ok(None)` when the variable is unset.
///
/// # Errors
///
/// Returns [`Error::InvalidEnvVar`] when the variable is set but does not parse.
pub fn env_override<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    match std::env::var(&key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::invalid_env_var(key, e.to_string())),
        Err(_) => Ok(None),
    }
}

/// Serialize a [`std::time::Duration`] as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serialize an optional [`std::time::Duration`] as whole seconds.
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
