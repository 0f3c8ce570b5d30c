// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Port the challenge service listens on inside its container when the
/// challenge does not say otherwise.
pub const DEFAULT_SERVICE_PORT: u16 = 1337;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Container,
    Composition,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Deployment {
    Container { image: String },
    Composition { compose: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceLimits {
    /// MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<u32>,
    /// Cores, fractional values allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<f64>,
}

/// Deployment configuration of an instanced challenge, as resolved by the
/// platform for a single request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChallengeSpec {
    pub id: i32,
    pub deployment: Deployment,
    /// Seconds until the instance is reaped. `None` falls back to the
    /// configured `instance-lifetime`, `Some(0)` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<u64>,
    #[serde(default)]
    pub hash_domain: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Advertised host for direct-mode instances hosted behind another name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Service port inside the workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,
}

impl ChallengeSpec {
    pub fn container(id: i32, image: impl Into<String>) -> Self {
        Self::new(id, Deployment::Container {
            image: image.into(),
        })
    }

    pub fn composition(id: i32, compose: impl Into<String>) -> Self {
        Self::new(id, Deployment::Composition {
            compose: compose.into(),
        })
    }

    fn new(id: i32, deployment: Deployment) -> Self {
        Self {
            id,
            deployment,
            lifetime: None,
            hash_domain: false,
            limits: ResourceLimits::default(),
            host: None,
            port: None,
            envs: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ChallengeKind {
        match self.deployment {
            Deployment::Container { .. } => ChallengeKind::Container,
            Deployment::Composition { .. } => ChallengeKind::Composition,
        }
    }

    pub fn service_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SERVICE_PORT)
    }

    /// Parses the JSON object challenge authors store their environment in.
    pub fn envs_from_json(json: &str) -> Result<BTreeMap<String, String>, serde_json::Error> {
        if json.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_from_yaml() {
        let spec: ChallengeSpec = serde_yaml::from_str(
            r#"
id: 4
deployment:
  type: composition
  compose: "services: {}"
hash_domain: true
lifetime: 60
limits:
  max_memory: 256
"#,
        )
        .unwrap();
        assert_eq!(spec.kind(), ChallengeKind::Composition);
        assert!(spec.hash_domain);
        assert_eq!(spec.lifetime, Some(60));
        assert_eq!(spec.limits.max_memory, Some(256));
        assert_eq!(spec.limits.max_cpu, None);
        assert_eq!(spec.service_port(), DEFAULT_SERVICE_PORT);
    }

    #[test]
    fn test_envs_from_json() {
        let envs = ChallengeSpec::envs_from_json(r#"{"FLAG": "flag{x}", "MODE": "hard"}"#).unwrap();
        assert_eq!(envs.get("FLAG").map(String::as_str), Some("flag{x}"));
        assert!(ChallengeSpec::envs_from_json("").unwrap().is_empty());
        assert!(ChallengeSpec::envs_from_json("[1, 2]").is_err());
    }
}
