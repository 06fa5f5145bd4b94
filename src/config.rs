//! Settings loaded from the environment.
//!
//! Variables use `__` as the nested delimiter, e.g. `DB__DSN` or
//! `AGE__IDENT_PROPERTY`. Every struct also deserializes with defaults so a
//! host application can embed it in its own config file.

use std::env;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::invariants::is_valid_property_key;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    pub dsn: Option<String>,
    pub pool_min_connections: u32,
    pub pool_max_connections: u32,
    pub connection_timeout_secs: u64,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            dsn: None,
            pool_min_connections: 1,
            pool_max_connections: 10,
            connection_timeout_secs: 10,
        }
    }
}

impl DbSettings {
    pub fn require_dsn(&self) -> Result<&str> {
        self.dsn.as_deref().ok_or_else(|| {
            LibError::invalid_with_code(
                "missing_setting",
                "DB__DSN is required to connect to the graph store",
                anyhow!("DB__DSN is not set"),
            )
        })
    }
}

/// Names of the properties that carry logical identities inside the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgeSettings {
    pub ident_property: String,
    pub start_ident_property: String,
    pub end_ident_property: String,
}

impl Default for AgeSettings {
    fn default() -> Self {
        Self {
            ident_property: "__ident".to_string(),
            start_ident_property: "__start_ident".to_string(),
            end_ident_property: "__end_ident".to_string(),
        }
    }
}

impl AgeSettings {
    pub fn is_reserved(&self, key: &str) -> bool {
        key == self.ident_property
            || key == self.start_ident_property
            || key == self.end_ident_property
    }

    pub fn validate(&self) -> Result<()> {
        let names = [
            &self.ident_property,
            &self.start_ident_property,
            &self.end_ident_property,
        ];
        if names.iter().any(|name| !is_valid_property_key(name)) {
            return Err(LibError::invalid_with_code(
                "invalid_setting",
                "Identity property names must be valid property keys",
                anyhow!("invalid identity property names {:?}", names),
            ));
        }
        if names[0] == names[1] || names[0] == names[2] || names[1] == names[2] {
            return Err(LibError::invalid_with_code(
                "invalid_setting",
                "Identity property names must be distinct",
                anyhow!("duplicate identity property names {:?}", names),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Entities per chunk; the batch aborts between chunks on store failure.
    pub batch_size: usize,
    /// Concurrent single-entity transactions inside a chunk.
    pub max_concurrency: usize,
    /// Vertex endpoint cache entries; 0 disables the cache.
    pub identity_cache_capacity: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_concurrency: 8,
            identity_cache_capacity: 4096,
        }
    }
}

impl ReconcileSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_concurrency == 0 {
            return Err(LibError::invalid_with_code(
                "invalid_setting",
                "Batch size and concurrency must be at least 1",
                anyhow!(
                    "batch_size={} max_concurrency={}",
                    self.batch_size,
                    self.max_concurrency
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub db: DbSettings,
    pub age: AgeSettings,
    pub reconcile: ReconcileSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db: DbSettings::default(),
            age: AgeSettings::default(),
            reconcile: ReconcileSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds settings from any variable source, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let text = |name: &str, default: String| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(default)
        };

        let settings = Settings {
            log_level: text("APP__LOG_LEVEL", defaults.log_level),
            db: DbSettings {
                dsn: lookup("DB__DSN").filter(|value| !value.trim().is_empty()),
                pool_min_connections: parse_var(
                    &lookup,
                    "DB__POOL_MIN_CONNECTIONS",
                    defaults.db.pool_min_connections,
                )?,
                pool_max_connections: parse_var(
                    &lookup,
                    "DB__POOL_MAX_CONNECTIONS",
                    defaults.db.pool_max_connections,
                )?,
                connection_timeout_secs: parse_var(
                    &lookup,
                    "DB__CONNECTION_TIMEOUT",
                    defaults.db.connection_timeout_secs,
                )?,
            },
            age: AgeSettings {
                ident_property: text("AGE__IDENT_PROPERTY", defaults.age.ident_property),
                start_ident_property: text(
                    "AGE__START_IDENT_PROPERTY",
                    defaults.age.start_ident_property,
                ),
                end_ident_property: text(
                    "AGE__END_IDENT_PROPERTY",
                    defaults.age.end_ident_property,
                ),
            },
            reconcile: ReconcileSettings {
                batch_size: parse_var(
                    &lookup,
                    "RECONCILE__BATCH_SIZE",
                    defaults.reconcile.batch_size,
                )?,
                max_concurrency: parse_var(
                    &lookup,
                    "RECONCILE__MAX_CONCURRENCY",
                    defaults.reconcile.max_concurrency,
                )?,
                identity_cache_capacity: parse_var(
                    &lookup,
                    "RECONCILE__IDENTITY_CACHE_CAPACITY",
                    defaults.reconcile.identity_cache_capacity,
                )?,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.age.validate()?;
        self.reconcile.validate()?;
        if self.db.pool_min_connections > self.db.pool_max_connections {
            return Err(LibError::invalid_with_code(
                "invalid_setting",
                "Minimum pool size exceeds maximum pool size",
                anyhow!(
                    "pool_min_connections={} pool_max_connections={}",
                    self.db.pool_min_connections,
                    self.db.pool_max_connections
                ),
            ));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| {
            LibError::invalid_with_code(
                "invalid_setting",
                "Setting value could not be parsed",
                anyhow!("invalid {} '{}': {}", name, raw, err),
            )
        }),
    }
}
