// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::challenge::{ChallengeSpec, Deployment};
use crate::engine::{ContainerEngine, EngineError, NetworkSpec};
use crate::instances::InstanceKey;
use crate::routing::RouteBinding;

mod compose;
mod container;

/// Label carrying the owning project on every container the driver creates.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Failed to pull image {image}: {source}")]
    ImagePullFailed {
        image: String,
        #[source]
        source: EngineError,
    },
    #[error("Failed to parse composition: {0}")]
    SpecParseError(String),
    #[error("Invalid composition: {0}")]
    SpecValidationError(String),
    #[error("Failed to run workload: {0}")]
    EngineRunError(#[source] EngineError),
    #[error("Resource name {0} is already taken")]
    NameCollision(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Names of everything provisioned for one instance. Only names are kept;
/// they are resolved against the engine again whenever they are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceHandle {
    Container {
        name: String,
        network: Option<String>,
    },
    Composition {
        project: String,
        containers: Vec<String>,
        network: String,
    },
}

impl ResourceHandle {
    pub fn primary_container(&self) -> Option<&str> {
        match self {
            ResourceHandle::Container { name, .. } => Some(name),
            ResourceHandle::Composition { containers, .. } => {
                containers.first().map(String::as_str)
            }
        }
    }

    pub fn network(&self) -> Option<&str> {
        match self {
            ResourceHandle::Container { network, .. } => network.as_deref(),
            ResourceHandle::Composition { network, .. } => Some(network),
        }
    }
}

/// Everything the driver needs to bring up one instance.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    pub key: InstanceKey,
    pub challenge: &'a ChallengeSpec,
    /// Host advertised to the team.
    pub host: &'a str,
    /// Host port, direct mode only.
    pub port: Option<u16>,
    /// Route, hash-domain mode only.
    pub route: Option<&'a RouteBinding>,
    pub memory_mb: u32,
    pub cpus: f64,
}

impl ProvisionRequest<'_> {
    fn injected_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("INSTANCE_HOST".to_string(), self.host.to_string()),
            ("CONTAINER_NAME".to_string(), self.key.container_name()),
            ("MAX_MEMORY".to_string(), self.memory_mb.to_string()),
            ("MAX_CPUS".to_string(), self.cpus.to_string()),
        ]);
        if let Some(port) = self.port {
            env.insert("INSTANCE_PORT".to_string(), port.to_string());
        }
        env
    }

    /// Challenge environment with the injected values on top.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.challenge.envs.clone();
        env.extend(self.injected_env());
        env
    }

    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_mb) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1e9) as i64
    }
}

/// Provisions and tears down instance workloads on a container engine.
#[derive(Clone)]
pub struct RuntimeDriver {
    engine: Arc<dyn ContainerEngine>,
}

impl RuntimeDriver {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    pub async fn provision(
        &self,
        request: &ProvisionRequest<'_>,
    ) -> Result<ResourceHandle, DriverError> {
        match &request.challenge.deployment {
            Deployment::Container { image } => {
                container::provision(self, request, image).await
            }
            Deployment::Composition { compose } => {
                compose::provision(self, request, compose).await
            }
        }
    }

    /// Removes everything behind the handle. Missing resources are skipped;
    /// other failures are logged and the first one is returned after all
    /// removals were attempted.
    pub async fn teardown(&self, handle: &ResourceHandle) -> Result<(), DriverError> {
        let mut first_error = None;
        let mut containers: Vec<String> = match handle {
            ResourceHandle::Container { name, .. } => vec![name.clone()],
            ResourceHandle::Composition { containers, .. } => containers.clone(),
        };
        if let ResourceHandle::Composition { project, .. } = handle {
            match self.project_containers(project).await {
                Ok(found) => {
                    for name in found {
                        if !containers.contains(&name) {
                            containers.push(name);
                        }
                    }
                }
                Err(e) => tracing::warn!("Failed to list containers of {}: {}", project, e),
            }
        }

        for name in &containers {
            if let Err(e) = self.remove_container(name).await {
                tracing::warn!("Failed to remove container {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(network) = handle.network() {
            if let Err(e) = self.remove_network(network).await {
                tracing::warn!("Failed to remove network {}: {}", network, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Names of all containers labeled as part of `project`.
    async fn project_containers(&self, project: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .engine
            .list_containers(PROJECT_LABEL, project)
            .await?
            .into_iter()
            .map(|container| container.name)
            .collect())
    }

    /// Whether the container called `name` carries the label of `project`.
    async fn project_owns(&self, project: &str, name: &str) -> bool {
        match self.project_containers(project).await {
            Ok(found) => found.iter().any(|container| container == name),
            Err(e) => {
                tracing::warn!("Failed to list containers of {}: {}", project, e);
                false
            }
        }
    }

    /// Best-effort removal of every container of `project`.
    async fn remove_project(&self, project: &str) {
        let found = match self.project_containers(project).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Failed to list containers of {}: {}", project, e);
                return;
            }
        };
        for name in found {
            if let Err(e) = self.remove_container(&name).await {
                tracing::warn!("Failed to remove container {}: {}", name, e);
            }
        }
    }

    /// Creates the network unless one of that name exists already. Returns
    /// whether this call created it.
    pub async fn ensure_network(&self, name: &str, internal: bool) -> Result<bool, DriverError> {
        let spec = NetworkSpec {
            name: name.to_string(),
            internal,
            labels: BTreeMap::new(),
        };
        match self.engine.create_network(&spec).await {
            Ok(_) => {
                tracing::debug!("Created network {}", name);
                Ok(true)
            }
            Err(EngineError::Conflict(_)) => {
                tracing::info!("Network {} already exists, reusing it", name);
                Ok(false)
            }
            Err(e) => Err(DriverError::EngineRunError(e)),
        }
    }

    /// Removes a network. A network that is already gone counts as removed.
    pub async fn remove_network(&self, name: &str) -> Result<(), DriverError> {
        match self.engine.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), DriverError> {
        match self.engine.remove_container(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!("Container {} was already gone", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        let present = self
            .engine
            .image_exists(image)
            .await
            .map_err(DriverError::EngineRunError)?;
        if present {
            return Ok(());
        }
        self.engine
            .pull_image(image)
            .await
            .map_err(|source| DriverError::ImagePullFailed {
                image: image.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;

    #[test]
    fn test_injected_env_wins() {
        let mut challenge = ChallengeSpec::container(1, "nginx");
        challenge
            .envs
            .insert("INSTANCE_PORT".to_string(), "1".to_string());
        challenge
            .envs
            .insert("FLAG".to_string(), "flag{x}".to_string());
        let request = ProvisionRequest {
            key: InstanceKey::new(1, 2),
            challenge: &challenge,
            host: "localhost",
            port: Some(10005),
            route: None,
            memory_mb: 256,
            cpus: 0.5,
        };
        let env = request.env();
        assert_eq!(env["INSTANCE_PORT"], "10005");
        assert_eq!(env["FLAG"], "flag{x}");
        assert_eq!(env["CONTAINER_NAME"], "chall_1_2");
        assert_eq!(env["MAX_CPUS"], "0.5");
        assert_eq!(request.memory_bytes(), 256 * 1024 * 1024);
        assert_eq!(request.nano_cpus(), 500_000_000);
    }

    #[tokio::test]
    async fn test_ensure_network_reuses_existing() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_network("net_1_1", false);
        let driver = RuntimeDriver::new(engine.clone());
        assert!(!driver.ensure_network("net_1_1", true).await.unwrap());
        assert!(driver.ensure_network("net_1_2", true).await.unwrap());
        assert_eq!(engine.network_is_internal("net_1_2"), Some(true));

        driver.remove_network("net_1_2").await.unwrap();
        driver.remove_network("net_1_2").await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_resources() {
        let engine = Arc::new(MemoryEngine::new());
        let driver = RuntimeDriver::new(engine.clone());
        let handle = ResourceHandle::Container {
            name: "chall_1_1".to_string(),
            network: Some("net_1_1".to_string()),
        };
        driver.teardown(&handle).await.unwrap();
    }
}
