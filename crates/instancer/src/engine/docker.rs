// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
};
use futures_util::StreamExt;

use super::{ContainerEngine, ContainerSpec, ContainerSummary, EngineError, NetworkSpec};

/// Docker daemon reached through its HTTP API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

fn map_error(err: BollardError, resource: &str) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(resource.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409, ..
        } => EngineError::Conflict(resource.to_string()),
        BollardError::DockerResponseServerError { message, .. } => EngineError::Api(message),
        BollardError::IOError { err } => EngineError::Unavailable(err.to_string()),
        other => EngineError::Api(other.to_string()),
    }
}

impl DockerEngine {
    /// Connects using `DOCKER_HOST` or the local socket.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for binding in &spec.ports {
            let key = format!("{}/{}", binding.container_port, binding.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let first_network = spec.networks.first();
        let host_config = HostConfig {
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: first_network.map(|attachment| attachment.network.clone()),
            ..Default::default()
        };
        let networking_config = first_network.map(|attachment| NetworkingConfig {
            endpoints_config: HashMap::from([(
                attachment.network.clone(),
                EndpointSettings {
                    aliases: (!attachment.aliases.is_empty()).then(|| attachment.aliases.clone()),
                    ..Default::default()
                },
            )]),
        });

        Config {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            domainname: spec.domainname.clone(),
            env: Some(spec.env.clone()),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.command.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(e, image)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        tracing::info!("Pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| map_error(e, image))?;
            if let Some(status) = progress.status {
                tracing::debug!("Pull {}: {}", image, status);
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                Self::container_config(spec),
            )
            .await
            .map_err(|e| map_error(e, &spec.name))?;
        tracing::debug!("Created container {} ({})", spec.name, response.id);

        for attachment in spec.networks.iter().skip(1) {
            self.connect_network(&attachment.network, &response.id, &attachment.aliases)
                .await?;
        }
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error(e, name))
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error(e, name))
    }

    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(container) => Ok(Some(ContainerSummary {
                id: container.id.unwrap_or_default(),
                name: container
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| name.to_string()),
                running: container
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false),
            })),
            Err(e) => match map_error(e, name) {
                EngineError::NotFound(_) => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", label, value)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_error(e, value))?;
        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let name = container
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerSummary {
                    id: container.id?,
                    name,
                    running: container.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        self.docker
            .create_network(CreateNetworkOptions {
                name: spec.name.clone(),
                check_duplicate: true,
                driver: "bridge".to_string(),
                internal: spec.internal,
                labels: spec
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                ..Default::default()
            })
            .await
            .map_err(|e| map_error(e, &spec.name))?;
        Ok(spec.name.clone())
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<String>, EngineError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => Ok(Some(network.id.unwrap_or_else(|| name.to_string()))),
            Err(e) => match map_error(e, name) {
                EngineError::NotFound(_) => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| map_error(e, name))
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<(), EngineError> {
        let result = self
            .docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings {
                        aliases: (!aliases.is_empty()).then(|| aliases.to_vec()),
                        ..Default::default()
                    },
                },
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { message, .. })
                if message.contains("already exists in network") =>
            {
                Err(EngineError::AlreadyConnected {
                    network: network.to_string(),
                    container: container.to_string(),
                })
            }
            Err(e) => Err(map_error(e, network)),
        }
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), EngineError> {
        let result = self
            .docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container.to_string(),
                    force: true,
                },
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { message, .. })
                if message.contains("is not connected") =>
            {
                Err(EngineError::NotConnected {
                    network: network.to_string(),
                    container: container.to_string(),
                })
            }
            Err(e) => Err(map_error(e, network)),
        }
    }
}
