// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerEngine, ContainerSpec, ContainerSummary, EngineError, NetworkSpec};

/// Snapshot of a container held by [`MemoryEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
    /// Network name to aliases
    pub networks: BTreeMap<String, Vec<String>>,
    pub host_ports: Vec<u16>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

#[derive(Debug, Clone)]
struct MemoryNetwork {
    id: String,
    internal: bool,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    containers: HashMap<String, MemoryContainer>,
    networks: HashMap<String, MemoryNetwork>,
    images: HashSet<String>,
    broken_images: HashSet<String>,
    failing_starts: HashSet<String>,
    removals: HashMap<String, usize>,
    pulls: Vec<String>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:012x}", prefix, self.next_id)
    }

    /// Containers are addressed by name or id, like the Docker API does.
    fn container_name(&self, name_or_id: &str) -> Option<String> {
        if self.containers.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        self.containers
            .values()
            .find(|container| container.id == name_or_id)
            .map(|container| container.name.clone())
    }

    fn members(&self, network: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .containers
            .values()
            .filter(|container| container.networks.contains_key(network))
            .map(|container| container.name.clone())
            .collect();
        members.sort();
        members
    }
}

/// In-process container engine for dry runs and tests.
///
/// Behaves like a Docker daemon as far as names, conflicts, network
/// membership and host port clashes go. Faults can be injected per image or
/// container name, and every call can be slowed down with
/// [`MemoryEngine::with_latency`].
#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
    latency: Duration,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn round_trip(&self) {
        if self.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.latency).await;
        }
    }

    pub fn add_image(&self, image: &str) {
        self.state().images.insert(image.to_string());
    }

    /// Pulls of `image` fail from now on.
    pub fn fail_pulls_for(&self, image: &str) {
        self.state().broken_images.insert(image.to_string());
    }

    /// Starting the container called `name` fails from now on.
    pub fn fail_starts_for(&self, name: &str) {
        self.state().failing_starts.insert(name.to_string());
    }

    /// Puts a running container in place without going through the
    /// create/start path, e.g. a leftover from an earlier run or the proxy.
    pub fn run_container(&self, name: &str, image: &str, host_port: Option<u16>) -> String {
        let mut state = self.state();
        let id = state.next_id("c");
        state.images.insert(image.to_string());
        state.containers.insert(
            name.to_string(),
            MemoryContainer {
                id: id.clone(),
                name: name.to_string(),
                image: image.to_string(),
                env: Vec::new(),
                labels: BTreeMap::new(),
                running: true,
                networks: BTreeMap::new(),
                host_ports: host_port.into_iter().collect(),
                memory_bytes: None,
                nano_cpus: None,
            },
        );
        id
    }

    pub fn set_label(&self, name: &str, key: &str, value: &str) {
        if let Some(container) = self.state().containers.get_mut(name) {
            container.labels.insert(key.to_string(), value.to_string());
        }
    }

    /// Attaches a container without going through the engine API.
    pub fn attach(&self, name: &str, network: &str) {
        if let Some(container) = self.state().containers.get_mut(name) {
            container.networks.insert(network.to_string(), Vec::new());
        }
    }

    pub fn add_network(&self, name: &str, internal: bool) -> String {
        let mut state = self.state();
        let id = state.next_id("n");
        state.networks.insert(
            name.to_string(),
            MemoryNetwork {
                id: id.clone(),
                internal,
            },
        );
        id
    }

    /// Stops a container as if its process had exited.
    pub fn kill_container(&self, name: &str) {
        if let Some(container) = self.state().containers.get_mut(name) {
            container.running = false;
        }
    }

    /// Removes a container behind the orchestrator's back.
    pub fn force_remove(&self, name: &str) -> bool {
        self.state().containers.remove(name).is_some()
    }

    /// Replaces a container with a fresh one of the same name. The new
    /// container gets a new id and is not attached to any network.
    pub fn recreate_container(&self, name: &str) -> Option<String> {
        let mut state = self.state();
        let id = state.next_id("c");
        let container = state.containers.get_mut(name)?;
        container.id = id.clone();
        container.networks.clear();
        container.running = true;
        Some(id)
    }

    pub fn container(&self, name: &str) -> Option<MemoryContainer> {
        self.state().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().containers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn network_exists(&self, name: &str) -> bool {
        self.state().networks.contains_key(name)
    }

    pub fn network_is_internal(&self, name: &str) -> Option<bool> {
        self.state().networks.get(name).map(|network| network.internal)
    }

    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().networks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn network_members(&self, network: &str) -> Vec<String> {
        self.state().members(network)
    }

    /// How often a container of this name was removed through the engine.
    pub fn removals(&self, name: &str) -> usize {
        self.state().removals.get(name).copied().unwrap_or(0)
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.round_trip().await;
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        state.pulls.push(image.to_string());
        if state.broken_images.contains(image) {
            return Err(EngineError::Api(format!(
                "pull access denied for {}, repository does not exist",
                image
            )));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::Conflict(spec.name.clone()));
        }
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound(spec.image.clone()));
        }
        if let Some(missing) = spec
            .networks
            .iter()
            .find(|attachment| !state.networks.contains_key(&attachment.network))
        {
            return Err(EngineError::NotFound(missing.network.clone()));
        }
        let id = state.next_id("c");
        state.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                env: spec.env.clone(),
                labels: spec.labels.clone(),
                running: false,
                networks: spec
                    .networks
                    .iter()
                    .map(|attachment| (attachment.network.clone(), attachment.aliases.clone()))
                    .collect(),
                host_ports: spec.ports.iter().map(|binding| binding.host_port).collect(),
                memory_bytes: spec.memory_bytes,
                nano_cpus: spec.nano_cpus,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        let name = state
            .container_name(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        if state.failing_starts.contains(&name) {
            return Err(EngineError::Api(format!(
                "container {} exited during startup",
                name
            )));
        }
        let ports = state.containers[&name].host_ports.clone();
        let clash = state.containers.values().any(|other| {
            other.name != name
                && other.running
                && other.host_ports.iter().any(|port| ports.contains(port))
        });
        if clash {
            return Err(EngineError::Api(
                "Bind for 0.0.0.0 failed: port is already allocated".to_string(),
            ));
        }
        if let Some(container) = state.containers.get_mut(&name) {
            container.running = true;
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        let name = state
            .container_name(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        state.containers.remove(&name);
        *state.removals.entry(name).or_default() += 1;
        Ok(())
    }

    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, EngineError> {
        self.round_trip().await;
        let state = self.state();
        Ok(state
            .container_name(name)
            .and_then(|name| state.containers.get(&name))
            .map(|container| ContainerSummary {
                id: container.id.clone(),
                name: container.name.clone(),
                running: container.running,
            }))
    }

    async fn list_containers(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        self.round_trip().await;
        let mut found: Vec<ContainerSummary> = self
            .state()
            .containers
            .values()
            .filter(|container| container.labels.get(label).map(String::as_str) == Some(value))
            .map(|container| ContainerSummary {
                id: container.id.clone(),
                name: container.name.clone(),
                running: container.running,
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        if state.networks.contains_key(&spec.name) {
            return Err(EngineError::Conflict(spec.name.clone()));
        }
        let id = state.next_id("n");
        state.networks.insert(
            spec.name.clone(),
            MemoryNetwork {
                id: id.clone(),
                internal: spec.internal,
            },
        );
        Ok(id)
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<String>, EngineError> {
        self.round_trip().await;
        Ok(self
            .state()
            .networks
            .get(name)
            .map(|network| network.id.clone()))
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        if !state.networks.contains_key(name) {
            return Err(EngineError::NotFound(name.to_string()));
        }
        let members = state.members(name);
        if !members.is_empty() {
            return Err(EngineError::Api(format!(
                "error while removing network: network {} has active endpoints ({})",
                name,
                members.join(", ")
            )));
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<(), EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        if !state.networks.contains_key(network) {
            return Err(EngineError::NotFound(network.to_string()));
        }
        let name = state
            .container_name(container)
            .ok_or_else(|| EngineError::NotFound(container.to_string()))?;
        let Some(target) = state.containers.get_mut(&name) else {
            return Err(EngineError::NotFound(container.to_string()));
        };
        if target.networks.contains_key(network) {
            return Err(EngineError::AlreadyConnected {
                network: network.to_string(),
                container: name,
            });
        }
        target.networks.insert(network.to_string(), aliases.to_vec());
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), EngineError> {
        self.round_trip().await;
        let mut state = self.state();
        if !state.networks.contains_key(network) {
            return Err(EngineError::NotFound(network.to_string()));
        }
        let name = state
            .container_name(container)
            .ok_or_else(|| EngineError::NotFound(container.to_string()))?;
        let Some(target) = state.containers.get_mut(&name) else {
            return Err(EngineError::NotFound(container.to_string()));
        };
        if target.networks.remove(network).is_none() {
            return Err(EngineError::NotConnected {
                network: network.to_string(),
                container: name,
            });
        }
        Ok(())
    }
}
