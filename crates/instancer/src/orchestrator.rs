// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::challenge::ChallengeSpec;
use crate::config::{ConfigError, ConfigStore, InstancerConfig};
use crate::engine::ContainerEngine;
use crate::instances::lifetime::{Expiry, LifetimeScheduler};
use crate::instances::ports::PortAllocator;
use crate::instances::registry::InstanceRegistry;
use crate::instances::{Egress, Instance, InstanceKey, InstanceState, expiry_after};
use crate::routing::{RouteBinding, RoutingPublisher};
use crate::runtime::{ProvisionRequest, RuntimeDriver};

/// Outcome reported to callers. Engine details are logged, never returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceError {
    #[error("Already an active instance")]
    Conflict,
    #[error("No free port available")]
    PoolExhausted,
    #[error("Failed to create instance")]
    CreationFailed,
    #[error("No active instance")]
    NotFound,
}

/// How a team reaches its instance.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// 0 if the instance never expires.
    pub expires_in_seconds: u64,
}

impl InstanceInfo {
    fn new(instance: &Instance, expires_in_seconds: u64) -> Self {
        Self {
            host: instance.host.clone(),
            port: instance.port(),
            expires_in_seconds,
        }
    }
}

struct Inner {
    config: Arc<dyn ConfigStore>,
    registry: InstanceRegistry,
    ports: PortAllocator,
    driver: RuntimeDriver,
    routing: RoutingPublisher,
    lifetimes: LifetimeScheduler,
    expiries: Mutex<Option<mpsc::UnboundedReceiver<Expiry>>>,
    reaper: Mutex<Option<AbortHandle>>,
}

/// Creates, tracks and reaps challenge instances, one per (challenge, team).
///
/// Must be used from within a tokio runtime. Expiries are only acted on
/// while the reaper runs; see [`Orchestrator::spawn_reaper`].
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: Arc<dyn ConfigStore>,
    ) -> Result<Self, ConfigError> {
        let initial = InstancerConfig::load(config.as_ref())?;
        let (lifetimes, expiries) = LifetimeScheduler::new();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry: InstanceRegistry::new(),
                ports: PortAllocator::new(initial.min_port, initial.max_port),
                driver: RuntimeDriver::new(Arc::clone(&engine)),
                routing: RoutingPublisher::new(engine),
                lifetimes,
                expiries: Mutex::new(Some(expiries)),
                reaper: Mutex::new(None),
            }),
        })
    }

    /// Starts the background reaper: it tears down instances whose timer
    /// fired and sweeps the registry every `reclaim-instance-interval` as a
    /// backstop. The first `create_instance` starts it if nobody did before.
    /// Calling it again has no effect.
    pub fn spawn_reaper(&self) -> Result<(), ConfigError> {
        let mut slot = self
            .inner
            .expiries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            return Ok(());
        }
        let interval = InstancerConfig::load(self.inner.config.as_ref())?
            .reclaim_interval
            .max(Duration::from_secs(1));
        let Some(mut expiries) = slot.take() else {
            return Ok(());
        };
        drop(slot);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    expiry = expiries.recv() => {
                        let (Some(expiry), Some(inner)) = (expiry, inner.upgrade()) else {
                            break;
                        };
                        tracing::info!("Instance for {} expired", expiry.key);
                        tokio::spawn(async move {
                            let _ = inner.teardown(expiry.key, Some(expiry.instance_id)).await;
                        });
                    }
                    _ = sweep.tick() => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        for instance in inner.registry.expired(Utc::now()) {
                            tracing::info!("Reclaiming expired instance for {}", instance.key);
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move {
                                let _ = inner.teardown(instance.key, Some(instance.id)).await;
                            });
                        }
                    }
                }
            }
            tracing::debug!("Reaper stopped");
        });
        *self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());
        Ok(())
    }

    /// Provisions an instance of `challenge` for `team_id`.
    ///
    /// Provisioning runs in its own task. If the returned future is dropped
    /// early the attempt still completes and the instance is then torn down
    /// again.
    pub async fn create_instance(
        &self,
        challenge: &ChallengeSpec,
        team_id: i32,
    ) -> Result<InstanceInfo, InstanceError> {
        if let Err(e) = self.spawn_reaper() {
            tracing::warn!("Cannot start the reaper: {}", e);
        }
        let key = InstanceKey::new(challenge.id, team_id);
        if !self.inner.registry.try_reserve(key) {
            tracing::debug!("Refusing second instance for {}", key);
            return Err(InstanceError::Conflict);
        }

        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let challenge = challenge.clone();
        tokio::spawn(async move {
            let result = inner.provision(key, &challenge).await;
            if let Err(Ok(instance)) = tx.send(result) {
                tracing::warn!("Nobody is waiting for the instance for {}, removing it", key);
                let _ = inner.teardown(key, Some(instance.id)).await;
            }
        });

        let instance = rx.await.map_err(|_| InstanceError::CreationFailed)??;
        Ok(InstanceInfo::new(&instance, instance.lifetime))
    }

    pub async fn delete_instance(&self, challenge_id: i32, team_id: i32) -> Result<(), InstanceError> {
        self.inner
            .teardown(InstanceKey::new(challenge_id, team_id), None)
            .await
    }

    /// Restarts the lifetime of an active instance. Returns the new number
    /// of seconds until expiry.
    pub async fn extend_instance(&self, challenge_id: i32, team_id: i32) -> Result<u64, InstanceError> {
        let key = InstanceKey::new(challenge_id, team_id);
        let _guard = self.inner.registry.lock_key(key).await;
        let instance = self.inner.registry.get(key).ok_or(InstanceError::NotFound)?;
        if instance.lifetime == 0 {
            return Ok(0);
        }
        self.inner
            .registry
            .extend(key, expiry_after(Utc::now(), instance.lifetime))
            .ok_or(InstanceError::NotFound)?;
        self.inner
            .lifetimes
            .arm(key, instance.id, Duration::from_secs(instance.lifetime));
        tracing::info!("Extended instance for {} by {}s", key, instance.lifetime);
        Ok(instance.lifetime)
    }

    pub fn get_instance(&self, challenge_id: i32, team_id: i32) -> Option<Instance> {
        self.inner
            .registry
            .get(InstanceKey::new(challenge_id, team_id))
    }

    /// What a team currently sees for its instance.
    pub fn instance_info(&self, challenge_id: i32, team_id: i32) -> Option<InstanceInfo> {
        let instance = self.get_instance(challenge_id, team_id)?;
        Some(InstanceInfo::new(
            &instance,
            instance.expires_in(Utc::now()),
        ))
    }

    pub fn list_instances(&self) -> Vec<Instance> {
        self.inner.registry.active()
    }

    /// Stops the reaper and tears down every active instance.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reaper.abort();
        }
        self.inner.lifetimes.cancel_all();
        let instances = self.inner.registry.active();
        tracing::info!("Shutting down, removing {} instance(s)", instances.len());
        futures_util::future::join_all(
            instances
                .iter()
                .map(|instance| self.inner.teardown(instance.key, Some(instance.id))),
        )
        .await;
    }
}

impl Inner {
    async fn provision(
        &self,
        key: InstanceKey,
        challenge: &ChallengeSpec,
    ) -> Result<Instance, InstanceError> {
        let _guard = self.registry.lock_key(key).await;
        let result = self.try_provision(key, challenge).await;
        if result.is_err() {
            self.registry.release(key);
        }
        result
    }

    async fn try_provision(
        &self,
        key: InstanceKey,
        challenge: &ChallengeSpec,
    ) -> Result<Instance, InstanceError> {
        let config = InstancerConfig::load(self.config.as_ref()).map_err(|e| {
            tracing::error!("Refusing to create instance for {}: {}", key, e);
            InstanceError::CreationFailed
        })?;
        self.ports.set_range(config.min_port, config.max_port);
        let mut lifetime = challenge.lifetime.unwrap_or(config.default_lifetime);
        if lifetime > 0 && expiry_after(Utc::now(), lifetime).is_none() {
            tracing::warn!(
                "Lifetime of {}s for {} is out of range, instance will not expire",
                lifetime,
                key
            );
            lifetime = 0;
        }

        let (route, egress) = if challenge.hash_domain {
            let route = self
                .routing
                .prepare(key, &config, challenge.service_port())
                .await
                .map_err(|e| {
                    tracing::error!("Cannot route instance for {}: {}", key, e);
                    InstanceError::CreationFailed
                })?;
            let egress = Egress::Subdomain(route.token.clone());
            (Some(route), egress)
        } else {
            let port = self.ports.allocate().map_err(|e| {
                tracing::warn!("Cannot create instance for {}: {}", key, e);
                InstanceError::PoolExhausted
            })?;
            (None, Egress::Port(port))
        };
        let port = match egress {
            Egress::Port(port) => Some(port),
            Egress::Subdomain(_) => None,
        };
        let host = match &route {
            Some(route) => route.host.clone(),
            None => challenge
                .host
                .clone()
                .unwrap_or_else(|| config.advertised_host().to_string()),
        };

        let request = ProvisionRequest {
            key,
            challenge,
            host: &host,
            port,
            route: route.as_ref(),
            memory_mb: challenge.limits.max_memory.unwrap_or(config.max_memory_mb),
            cpus: challenge.limits.max_cpu.unwrap_or(config.max_cpus),
        };
        let resources = match self.driver.provision(&request).await {
            Ok(resources) => resources,
            Err(e) => {
                tracing::error!("Failed to create instance for {}: {}", key, e);
                self.abandon(port, route.as_ref());
                return Err(InstanceError::CreationFailed);
            }
        };
        if let Some(route) = &route {
            if let Err(e) = self.routing.register(route).await {
                tracing::error!("Failed to publish route for {}: {}", key, e);
                if let Err(e) = self.driver.teardown(&resources).await {
                    tracing::warn!("Failed to remove resources of {}: {}", key, e);
                }
                self.abandon(port, Some(route));
                return Err(InstanceError::CreationFailed);
            }
        }

        let now = Utc::now();
        let instance = Instance {
            id: Uuid::now_v7(),
            key,
            kind: challenge.kind(),
            resources,
            egress,
            route,
            host,
            lifetime,
            created_at: now,
            expires_at: expiry_after(now, lifetime),
            state: InstanceState::Provisioning,
        };
        if !self.registry.commit(instance.clone()) {
            tracing::error!("Slot for {} vanished during provisioning", key);
            let _ = self.driver.teardown(&instance.resources).await;
            self.abandon(port, instance.route.as_ref());
            return Err(InstanceError::CreationFailed);
        }
        if lifetime > 0 {
            self.lifetimes
                .arm(key, instance.id, Duration::from_secs(lifetime));
        }
        tracing::info!(
            "Created instance for {} at {}{}",
            key,
            instance.host,
            instance.port().map(|p| format!(":{}", p)).unwrap_or_default()
        );
        Ok(instance)
    }

    fn abandon(&self, port: Option<u16>, route: Option<&RouteBinding>) {
        if let Some(port) = port {
            self.ports.release(port);
        }
        if let Some(route) = route {
            self.routing.discard(route);
        }
    }

    /// Shared by delete, expiry, the sweep and shutdown. With `expected` set
    /// only that instance is torn down.
    async fn teardown(
        &self,
        key: InstanceKey,
        expected: Option<Uuid>,
    ) -> Result<(), InstanceError> {
        match self.registry.state(key) {
            None | Some(InstanceState::Provisioning) => return Err(InstanceError::NotFound),
            Some(InstanceState::Active | InstanceState::TearingDown) => {}
        }
        let _guard = self.registry.lock_key(key).await;
        let Some(instance) = self.registry.begin_teardown(key, expected) else {
            // Lost against another teardown of the same instance.
            return Ok(());
        };

        self.lifetimes.cancel(key, instance.id);
        if let Some(route) = &instance.route {
            if let Err(e) = self.routing.unregister(route).await {
                tracing::warn!("Failed to remove route {}: {}", route.host, e);
            }
        }
        if let Err(e) = self.driver.teardown(&instance.resources).await {
            tracing::warn!("Failed to remove resources of {}: {}", key, e);
        }
        if let Some(port) = instance.port() {
            self.ports.release(port);
        }
        self.registry.release(key);
        tracing::info!("Removed instance for {}", key);
        Ok(())
    }
}
