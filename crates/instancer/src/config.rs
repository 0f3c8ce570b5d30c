// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for config key {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("Invalid port range: min-port {min} is greater than max-port {max}")]
    InvalidPortRange { min: u16, max: u16 },
    #[error("hash-len must be between 4 and 32, got {0}")]
    InvalidHashLen(usize),
}

/// Key/value configuration source owned by the embedding platform.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Runtime-editable store, e.g. backed by the platform's admin config table.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: impl ToString) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn unset(&self, key: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// Reads `min-port` from `MIN_PORT` and so on.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfigStore;

impl EnvConfigStore {
    pub fn env_name(key: &str) -> String {
        key.replace('-', "_").to_uppercase()
    }
}

impl ConfigStore for EnvConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::env_name(key)).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstancerConfig {
    pub min_port: u16,
    pub max_port: u16,
    /// Seconds; used when a challenge does not carry its own lifetime. 0 disables expiry.
    pub default_lifetime: u64,
    pub reclaim_interval: Duration,
    pub max_memory_mb: u32,
    pub max_cpus: f64,
    pub hash_len: usize,
    /// Base domain for hash-domain routing.
    pub domain: String,
    pub instance_host: String,
    pub proxy_container: String,
}

impl Default for InstancerConfig {
    fn default() -> Self {
        Self {
            min_port: 10000,
            max_port: 20000,
            default_lifetime: 30 * 60,
            reclaim_interval: Duration::from_secs(5 * 60),
            max_memory_mb: 512,
            max_cpus: 1.0,
            hash_len: 12,
            domain: String::new(),
            instance_host: "localhost".to_string(),
            proxy_container: "plfanzen-proxy-1".to_string(),
        }
    }
}

fn read<T: FromStr>(store: &dyn ConfigStore, key: &str, default: T) -> Result<T, ConfigError> {
    match store.get(key) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
    }
}

impl InstancerConfig {
    pub fn load(store: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let min_port = read(store, "min-port", defaults.min_port)?;
        let max_port = read(store, "max-port", defaults.max_port)?;
        if min_port > max_port {
            return Err(ConfigError::InvalidPortRange {
                min: min_port,
                max: max_port,
            });
        }
        let hash_len = read(store, "hash-len", defaults.hash_len)?;
        if !(4..=32).contains(&hash_len) {
            return Err(ConfigError::InvalidHashLen(hash_len));
        }
        let max_cpus: f64 = read(store, "instance-max-cpu", defaults.max_cpus)?;
        if !max_cpus.is_finite() || max_cpus <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "instance-max-cpu".to_string(),
                value: max_cpus.to_string(),
            });
        }
        let project_name = store
            .get("project-name")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "plfanzen".to_string());
        let proxy_container = store
            .get("proxy-container")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("{}-proxy-1", project_name));

        Ok(Self {
            min_port,
            max_port,
            default_lifetime: read(store, "instance-lifetime", defaults.default_lifetime)?,
            reclaim_interval: Duration::from_secs(read(
                store,
                "reclaim-instance-interval",
                defaults.reclaim_interval.as_secs(),
            )?),
            max_memory_mb: read(store, "instance-max-memory", defaults.max_memory_mb)?,
            max_cpus,
            hash_len,
            domain: store.get("domain").unwrap_or_default().trim().to_string(),
            instance_host: store
                .get("instance-host")
                .filter(|host| !host.trim().is_empty())
                .unwrap_or(defaults.instance_host),
            proxy_container,
        })
    }

    /// Host reported for direct-mode instances.
    pub fn advertised_host(&self) -> &str {
        if self.domain.is_empty() {
            &self.instance_host
        } else {
            &self.domain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_store_is_empty() {
        let config = InstancerConfig::load(&MemoryConfigStore::new()).unwrap();
        assert_eq!(config, InstancerConfig::default());
        assert_eq!(config.advertised_host(), "localhost");
    }

    #[test]
    fn test_overrides_and_proxy_name() {
        let store = MemoryConfigStore::new()
            .with("min-port", 10000)
            .with("max-port", 10000)
            .with("domain", "ctf.example.com")
            .with("project-name", "event");
        let config = InstancerConfig::load(&store).unwrap();
        assert_eq!((config.min_port, config.max_port), (10000, 10000));
        assert_eq!(config.proxy_container, "event-proxy-1");
        assert_eq!(config.advertised_host(), "ctf.example.com");

        store.set("proxy-container", "traefik");
        let config = InstancerConfig::load(&store).unwrap();
        assert_eq!(config.proxy_container, "traefik");
    }

    #[test]
    fn test_rejects_inverted_range() {
        let store = MemoryConfigStore::new()
            .with("min-port", 20000)
            .with("max-port", 10000);
        assert_eq!(
            InstancerConfig::load(&store),
            Err(ConfigError::InvalidPortRange {
                min: 20000,
                max: 10000
            })
        );
    }

    #[test]
    fn test_rejects_garbage() {
        let store = MemoryConfigStore::new().with("instance-lifetime", "soon");
        assert!(matches!(
            InstancerConfig::load(&store),
            Err(ConfigError::InvalidValue { key, .. }) if key == "instance-lifetime"
        ));
        let store = MemoryConfigStore::new().with("hash-len", 2);
        assert_eq!(
            InstancerConfig::load(&store),
            Err(ConfigError::InvalidHashLen(2))
        );
    }

    #[test]
    fn test_env_name() {
        assert_eq!(
            EnvConfigStore::env_name("reclaim-instance-interval"),
            "RECLAIM_INSTANCE_INTERVAL"
        );
    }
}
