// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

pub mod docker;
pub mod memory;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No such resource: {0}")]
    NotFound(String),
    #[error("Name is already in use: {0}")]
    Conflict(String),
    #[error("Container {container} is already connected to network {network}")]
    AlreadyConnected { network: String, container: String },
    #[error("Container {container} is not connected to network {network}")]
    NotConnected { network: String, container: String },
    #[error("Container engine is unavailable: {0}")]
    Unavailable(String),
    #[error("Container engine error: {0}")]
    Api(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

impl PortBinding {
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            protocol: "tcp".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub aliases: Vec<String>,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub ports: Vec<PortBinding>,
    /// The first entry is used at creation time, the rest are connected
    /// afterwards.
    pub networks: Vec<NetworkAttachment>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    /// Internal networks have no route to the outside world.
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub running: bool,
}

/// The container runtime. Implementations resolve every name on each call;
/// callers never keep ids across calls.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Fails with [`EngineError::Conflict`] if the name is taken.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    /// Force-removes a container, running or not.
    async fn remove_container(&self, name: &str) -> Result<(), EngineError>;

    async fn inspect_container(&self, name: &str)
    -> Result<Option<ContainerSummary>, EngineError>;

    /// Containers (running or not) carrying `label=value`.
    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Fails with [`EngineError::Conflict`] if the name is taken.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError>;

    async fn inspect_network(&self, name: &str) -> Result<Option<String>, EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<(), EngineError>;

    async fn disconnect_network(&self, network: &str, container: &str)
    -> Result<(), EngineError>;
}
