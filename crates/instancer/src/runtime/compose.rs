// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;

use compose_spec::service::Command;
use compose_spec::service::ports::Protocol;

use crate::engine::{ContainerSpec, EngineError, NetworkAttachment, PortBinding};
use crate::utils::{env_list, split_with_quotes};

use super::{
    DriverError, PROJECT_LABEL, ProvisionRequest, ResourceHandle, RuntimeDriver, SERVICE_LABEL,
};

mod interpolation;
mod template;
mod validation;

fn command_args(cmd: &Command) -> Vec<String> {
    match cmd {
        Command::String(cmd) => split_with_quotes(cmd),
        Command::List(items) => items.clone(),
    }
}

fn service_spec(
    request: &ProvisionRequest<'_>,
    project: &str,
    network: &str,
    service: &str,
    svc: &compose_spec::Service,
) -> Result<ContainerSpec, DriverError> {
    let name = svc
        .container_name
        .as_ref()
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("{}-{}-1", project, service));
    let image = svc
        .image
        .as_ref()
        .map(|image| image.to_string())
        .ok_or_else(|| DriverError::SpecValidationError(format!("service {} has no image", service)))?;

    let mut env = request.challenge.envs.clone();
    let own_env = svc
        .environment
        .clone()
        .into_map()
        .map_err(|e| DriverError::SpecValidationError(e.to_string()))?;
    for (key, value) in own_env {
        // Variables without a value would be taken from the daemon's environment.
        if let Some(value) = value {
            env.insert(key.to_string(), value.to_string());
        }
    }
    env.extend(request.injected_env());

    let ports = if request.route.is_some() {
        Vec::new()
    } else {
        compose_spec::service::ports::into_long_iter(svc.ports.clone())
            .filter_map(|port| {
                let published = port.published?;
                Some(PortBinding {
                    container_port: port.target as u16,
                    host_port: published.start(),
                    protocol: match port.protocol {
                        Some(Protocol::Udp) => "udp".to_string(),
                        Some(Protocol::Other(other)) => other,
                        Some(Protocol::Tcp) | None => "tcp".to_string(),
                    },
                })
            })
            .collect()
    };

    Ok(ContainerSpec {
        hostname: Some(service.to_string()),
        name,
        image,
        env: env_list(&env),
        labels: BTreeMap::from([
            (PROJECT_LABEL.to_string(), project.to_string()),
            (SERVICE_LABEL.to_string(), service.to_string()),
            ("com.docker.compose.oneoff".to_string(), "False".to_string()),
        ]),
        entrypoint: svc.entrypoint.as_ref().map(command_args),
        command: svc.command.as_ref().map(command_args),
        ports,
        networks: vec![NetworkAttachment {
            network: network.to_string(),
            aliases: vec![service.to_string()],
        }],
        memory_bytes: Some(request.memory_bytes()),
        nano_cpus: Some(request.nano_cpus()),
        ..Default::default()
    })
}

/// Creates the services in order, recording each one that was created.
async fn create_services(
    driver: &RuntimeDriver,
    specs: &[ContainerSpec],
    created: &mut Vec<String>,
) -> Result<(), EngineError> {
    for spec in specs {
        driver.engine.create_container(spec).await?;
        created.push(spec.name.clone());
    }
    Ok(())
}

/// Removes what a failed provisioning attempt created, and nothing else.
async fn rollback(driver: &RuntimeDriver, containers: &[String], network: Option<&str>) {
    for name in containers {
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

/// Brings up every service of a composition document.
///
/// The document is rendered, parsed and validated before anything is
/// created. Leftovers of the same project are replaced; a container name
/// taken by anything else fails the whole composition.
pub(super) async fn provision(
    driver: &RuntimeDriver,
    request: &ProvisionRequest<'_>,
    document: &str,
) -> Result<ResourceHandle, DriverError> {
    let rendered = template::render(document, request)?;
    let rendered = interpolation::interpolate(&rendered, &request.env())?;
    let compose: compose_spec::Compose = serde_yaml::from_str(&rendered)
        .map_err(|e| DriverError::SpecParseError(e.to_string()))?;
    validation::validate(&compose)?;

    let primary_name = request.key.container_name();
    let project = primary_name.clone();
    let (network, internal) = match request.route {
        Some(route) => (route.network.clone(), true),
        None => (format!("{}_default", project), false),
    };

    let mut specs = Vec::with_capacity(compose.services.len());
    for (service, svc) in &compose.services {
        specs.push(service_spec(
            request,
            &project,
            &network,
            &service.to_string(),
            svc,
        )?);
    }
    let primary = specs
        .iter()
        .position(|spec| spec.name == primary_name)
        .unwrap_or(0);
    specs.swap(0, primary);
    if let (Some(route), Some(spec)) = (request.route, specs.first_mut()) {
        spec.labels.extend(route.labels());
        if let Some(attachment) = spec.networks.first_mut() {
            attachment.aliases.extend(route.aliases());
        }
    }

    for spec in &specs {
        driver.ensure_image(&spec.image).await?;
    }

    let created_network = driver.ensure_network(&network, internal).await?;
    let owned_network = Some(network.as_str()).filter(|_| created_network);

    let mut created = Vec::with_capacity(specs.len());
    let mut outcome = create_services(driver, &specs, &mut created).await;
    let leftover = match &outcome {
        Err(EngineError::Conflict(name)) => driver.project_owns(&project, name).await,
        _ => false,
    };
    if leftover {
        tracing::warn!("Replacing containers left over from an earlier run of {}", project);
        driver.remove_project(&project).await;
        created.clear();
        outcome = create_services(driver, &specs, &mut created).await;
    }
    if let Err(e) = outcome {
        rollback(driver, &created, owned_network).await;
        return Err(match e {
            EngineError::Conflict(name) => {
                tracing::warn!("Container {} is taken, not touching it", name);
                DriverError::NameCollision(name)
            }
            e => DriverError::EngineRunError(e),
        });
    }
    for spec in &specs {
        if let Err(e) = driver.engine.start_container(&spec.name).await {
            rollback(driver, &created, owned_network).await;
            return Err(DriverError::EngineRunError(e));
        }
    }

    tracing::info!(
        "Started composition {} with {} service(s)",
        project,
        created.len()
    );
    Ok(ResourceHandle::Composition {
        project,
        containers: created,
        network,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::challenge::ChallengeSpec;
    use crate::engine::memory::MemoryEngine;
    use crate::instances::InstanceKey;

    const COMPOSE: &str = r#"
services:
  db:
    image: redis
  app:
    image: ghcr.io/ctf/web
    container_name: "{{ container_name }}"
    command: "python3 -m http.server '{{ instance_port }}'"
    environment:
      MODE: hard
    ports:
      - "{{ instance_port }}:1337"
"#;

    fn request(challenge: &ChallengeSpec) -> ProvisionRequest<'_> {
        ProvisionRequest {
            key: InstanceKey::new(challenge.id, 3),
            challenge,
            host: "localhost",
            port: Some(10010),
            route: None,
            memory_mb: 256,
            cpus: 1.0,
        }
    }

    #[tokio::test]
    async fn test_brings_up_all_services() {
        let engine = Arc::new(MemoryEngine::new());
        let driver = RuntimeDriver::new(engine.clone());
        let challenge = ChallengeSpec::composition(5, COMPOSE);

        let handle = driver.provision(&request(&challenge)).await.unwrap();
        assert_eq!(handle.primary_container(), Some("chall_5_3"));
        assert_eq!(handle.network(), Some("chall_5_3_default"));

        let app = engine.container("chall_5_3").unwrap();
        assert!(app.running);
        assert_eq!(app.host_ports, vec![10010]);
        assert!(app.env.contains(&"MODE=hard".to_string()));
        assert!(app.env.contains(&"INSTANCE_PORT=10010".to_string()));
        assert_eq!(
            app.labels.get(SERVICE_LABEL).map(String::as_str),
            Some("app")
        );
        assert!(engine.container("chall_5_3-db-1").unwrap().running);
        assert_eq!(
            engine.network_members("chall_5_3_default"),
            vec!["chall_5_3", "chall_5_3-db-1"]
        );

        driver.teardown(&handle).await.unwrap();
        assert!(engine.container_names().is_empty());
        assert!(!engine.network_exists("chall_5_3_default"));
    }

    #[tokio::test]
    async fn test_collision_fails_without_touching_foreign_container() {
        let engine = Arc::new(MemoryEngine::new());
        let foreign = engine.run_container("chall_5_3", "nginx", None);
        let driver = RuntimeDriver::new(engine.clone());
        let challenge = ChallengeSpec::composition(5, COMPOSE);

        let result = driver.provision(&request(&challenge)).await;
        assert!(matches!(result, Err(DriverError::NameCollision(name)) if name == "chall_5_3"));
        assert_eq!(engine.container("chall_5_3").unwrap().id, foreign);
        assert_eq!(engine.container_names(), vec!["chall_5_3"]);
        assert!(!engine.network_exists("chall_5_3_default"));
    }

    #[tokio::test]
    async fn test_replaces_leftovers_of_same_project() {
        let engine = Arc::new(MemoryEngine::new());
        engine.add_network("chall_5_3_default", false);
        let old_app = engine.run_container("chall_5_3", "ghcr.io/ctf/web", Some(10010));
        let old_db = engine.run_container("chall_5_3-db-1", "redis", None);
        for name in ["chall_5_3", "chall_5_3-db-1"] {
            engine.set_label(name, PROJECT_LABEL, "chall_5_3");
            engine.attach(name, "chall_5_3_default");
        }
        let driver = RuntimeDriver::new(engine.clone());
        let challenge = ChallengeSpec::composition(5, COMPOSE);

        let handle = driver.provision(&request(&challenge)).await.unwrap();
        let app = engine.container("chall_5_3").unwrap();
        assert_ne!(app.id, old_app);
        assert!(app.running);
        assert_eq!(app.host_ports, vec![10010]);
        assert_ne!(engine.container("chall_5_3-db-1").unwrap().id, old_db);
        assert_eq!(engine.removals("chall_5_3"), 1);

        driver.teardown(&handle).await.unwrap();
        assert!(engine.container_names().is_empty());
        assert!(!engine.network_exists("chall_5_3_default"));
    }

    #[tokio::test]
    async fn test_compose_variables_are_interpolated() {
        let engine = Arc::new(MemoryEngine::new());
        let driver = RuntimeDriver::new(engine.clone());
        let mut challenge = ChallengeSpec::composition(
            5,
            r#"
services:
  chall:
    image: echo-server:latest
    container_name: ${CONTAINER_NAME}
    ports:
      - "${INSTANCE_PORT}:1337"
    environment:
      - MESSAGE=${GREETING:-hello}
      - FLAG=$FLAG
"#,
        );
        challenge
            .envs
            .insert("FLAG".to_string(), "flag{compose}".to_string());

        driver.provision(&request(&challenge)).await.unwrap();
        let chall = engine.container("chall_5_3").unwrap();
        assert_eq!(chall.host_ports, vec![10010]);
        assert!(chall.env.contains(&"MESSAGE=hello".to_string()));
        assert!(chall.env.contains(&"FLAG=flag{compose}".to_string()));
    }

    #[tokio::test]
    async fn test_malformed_document() {
        let engine = Arc::new(MemoryEngine::new());
        let driver = RuntimeDriver::new(engine.clone());

        let challenge = ChallengeSpec::composition(5, "services: [not, a, map");
        let result = driver.provision(&request(&challenge)).await;
        assert!(matches!(result, Err(DriverError::SpecParseError(_))));

        let challenge = ChallengeSpec::composition(5, "services: {}");
        let result = driver.provision(&request(&challenge)).await;
        assert!(matches!(result, Err(DriverError::SpecValidationError(_))));
        assert!(engine.network_names().is_empty());
    }
}
