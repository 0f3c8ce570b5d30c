// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;

use crate::engine::{ContainerSpec, EngineError, NetworkAttachment, PortBinding};
use crate::utils::env_list;

use super::{DriverError, PROJECT_LABEL, ProvisionRequest, ResourceHandle, RuntimeDriver};

fn container_spec(request: &ProvisionRequest<'_>, image: &str) -> ContainerSpec {
    let name = request.key.container_name();
    let service_port = request.challenge.service_port();
    let mut labels = BTreeMap::from([(PROJECT_LABEL.to_string(), name.clone())]);
    let mut ports = Vec::new();
    let mut networks = Vec::new();
    if let Some(port) = request.port {
        ports.push(PortBinding::tcp(service_port, port));
    }
    if let Some(route) = request.route {
        labels.extend(route.labels());
        networks.push(NetworkAttachment {
            network: route.network.clone(),
            aliases: route.aliases(),
        });
    }
    ContainerSpec {
        hostname: Some(name.clone()),
        name,
        image: image.to_string(),
        env: env_list(&request.env()),
        labels,
        ports,
        networks,
        memory_bytes: Some(request.memory_bytes()),
        nano_cpus: Some(request.nano_cpus()),
        ..Default::default()
    }
}

/// Removes what a failed provisioning attempt created.
async fn rollback(driver: &RuntimeDriver, container: Option<&str>, network: Option<&str>) {
    if let Some(name) = container {
        if let Err(e) = driver.remove_container(name).await {
            tracing::warn!("Failed to clean up container {}: {}", name, e);
        }
    }
    if let Some(network) = network {
        if let Err(e) = driver.remove_network(network).await {
            tracing::warn!("Failed to clean up network {}: {}", network, e);
        }
    }
}

/// Brings up a single container named after the instance key.
///
/// A container that already carries the name is force-removed and creation
/// is retried once.
pub(super) async fn provision(
    driver: &RuntimeDriver,
    request: &ProvisionRequest<'_>,
    image: &str,
) -> Result<ResourceHandle, DriverError> {
    driver.ensure_image(image).await?;

    let mut network = None;
    let mut created_network = false;
    if let Some(route) = request.route {
        created_network = driver.ensure_network(&route.network, true).await?;
        network = Some(route.network.clone());
    }

    let spec = container_spec(request, image);
    let created = match driver.engine.create_container(&spec).await {
        Err(EngineError::Conflict(_)) => {
            tracing::warn!("Container {} already exists, replacing it", spec.name);
            if let Err(e) = driver.remove_container(&spec.name).await {
                tracing::warn!("Failed to remove stale container {}: {}", spec.name, e);
            }
            driver
                .engine
                .create_container(&spec)
                .await
                .map_err(|e| match e {
                    EngineError::Conflict(name) => DriverError::NameCollision(name),
                    e => DriverError::EngineRunError(e),
                })
        }
        other => other.map_err(DriverError::EngineRunError),
    };
    let owned_network = network.as_deref().filter(|_| created_network);
    if let Err(e) = created {
        rollback(driver, None, owned_network).await;
        return Err(e);
    }
    if let Err(e) = driver.engine.start_container(&spec.name).await {
        rollback(driver, Some(&spec.name), owned_network).await;
        return Err(DriverError::EngineRunError(e));
    }

    tracing::info!("Started container {} from {}", spec.name, image);
    Ok(ResourceHandle::Container {
        name: spec.name,
        network,
    })
}
