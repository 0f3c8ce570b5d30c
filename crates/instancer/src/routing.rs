// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use thiserror::Error;

use crate::config::InstancerConfig;
use crate::engine::{ContainerEngine, ContainerSummary, EngineError};
use crate::instances::InstanceKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Reverse proxy {0} is not available")]
    ProxyUnavailable(String),
    #[error("No base domain configured for hash-domain routing")]
    MissingBaseDomain,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A hash-domain route from `{token}.{domain}` to one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBinding {
    pub token: String,
    /// Fully qualified host name teams connect to.
    pub host: String,
    /// Private network shared by the instance and the proxy.
    pub network: String,
    /// Router and service name in the proxy configuration.
    pub router: String,
    pub service_port: u16,
    /// Proxy container name. Never an id: the proxy may be recreated.
    pub proxy: String,
}

impl RouteBinding {
    /// Labels the proxy's docker provider picks the route up from.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let router = &self.router;
        BTreeMap::from([
            ("traefik.enable".to_string(), "true".to_string()),
            ("traefik.docker.network".to_string(), self.network.clone()),
            (
                format!("traefik.http.routers.{}.rule", router),
                format!("Host(`{}`)", self.host),
            ),
            (
                format!("traefik.http.routers.{}.entrypoints", router),
                "web".to_string(),
            ),
            (
                format!("traefik.http.routers.{}.priority", router),
                "10".to_string(),
            ),
            (
                format!("traefik.http.services.{}.loadbalancer.server.port", router),
                self.service_port.to_string(),
            ),
        ])
    }

    /// DNS aliases of the routed container on the instance network.
    pub fn aliases(&self) -> Vec<String> {
        vec![self.token.clone()]
    }
}

fn random_token(len: usize) -> String {
    (0..len)
        .map(|_| format!("{:x}", rand::rng().random_range(0..16)))
        .collect()
}

/// Publishes hash-domain routes through the shared reverse proxy.
///
/// The proxy is looked up by name on every call. Tokens of live routes are
/// tracked so two instances never share a subdomain.
pub struct RoutingPublisher {
    engine: Arc<dyn ContainerEngine>,
    tokens: DashMap<String, InstanceKey>,
}

impl RoutingPublisher {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            tokens: DashMap::new(),
        }
    }

    async fn resolve_proxy(&self, name: &str) -> Result<Option<ContainerSummary>, RoutingError> {
        Ok(self
            .engine
            .inspect_container(name)
            .await?
            .filter(|proxy| proxy.running))
    }

    /// Checks that the proxy is there and reserves a fresh token. Nothing is
    /// created on the engine yet.
    pub async fn prepare(
        &self,
        key: InstanceKey,
        config: &InstancerConfig,
        service_port: u16,
    ) -> Result<RouteBinding, RoutingError> {
        if config.domain.is_empty() {
            return Err(RoutingError::MissingBaseDomain);
        }
        if self.resolve_proxy(&config.proxy_container).await?.is_none() {
            return Err(RoutingError::ProxyUnavailable(
                config.proxy_container.clone(),
            ));
        }
        let token = loop {
            let token = random_token(config.hash_len);
            match self.tokens.entry(token.clone()) {
                Entry::Occupied(_) => {
                    tracing::debug!("Token {} already in use, rolling again", token);
                    continue;
                }
                Entry::Vacant(entry) => {
                    entry.insert(key);
                    break token;
                }
            }
        };
        Ok(RouteBinding {
            host: format!("{}.{}", token, config.domain),
            token,
            network: key.network_name(),
            router: key.container_name(),
            service_port,
            proxy: config.proxy_container.clone(),
        })
    }

    /// Attaches the proxy to the instance network.
    pub async fn register(&self, route: &RouteBinding) -> Result<(), RoutingError> {
        let Some(proxy) = self.resolve_proxy(&route.proxy).await? else {
            return Err(RoutingError::ProxyUnavailable(route.proxy.clone()));
        };
        match self
            .engine
            .connect_network(&route.network, &proxy.id, &[])
            .await
        {
            Ok(()) | Err(EngineError::AlreadyConnected { .. }) => {
                tracing::info!("Routing {} via {}", route.host, route.proxy);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Detaches whatever container currently carries the proxy's name from
    /// the instance network. A missing proxy or network is not an error.
    pub async fn unregister(&self, route: &RouteBinding) -> Result<(), RoutingError> {
        self.discard(route);
        let Some(proxy) = self.engine.inspect_container(&route.proxy).await? else {
            tracing::warn!(
                "Proxy {} is gone, nothing to detach from {}",
                route.proxy,
                route.network
            );
            return Ok(());
        };
        match self
            .engine
            .disconnect_network(&route.network, &proxy.id)
            .await
        {
            Ok(()) => {
                tracing::info!("Removed route {}", route.host);
                Ok(())
            }
            Err(EngineError::NotConnected { .. }) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Frees the token without touching the engine.
    pub fn discard(&self, route: &RouteBinding) {
        self.tokens.remove(&route.token);
    }

    pub fn lookup(&self, token: &str) -> Option<InstanceKey> {
        self.tokens.get(token).map(|key| *key)
    }

    pub fn routes(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::engine::NetworkSpec;
    use crate::engine::memory::MemoryEngine;

    fn config() -> InstancerConfig {
        InstancerConfig::load(
            &MemoryConfigStore::new()
                .with("domain", "ctf.test")
                .with("proxy-container", "proxy"),
        )
        .unwrap()
    }

    #[test]
    fn test_random_token() {
        let token = random_token(12);
        assert_eq!(token.len(), 12);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_labels() {
        let route = RouteBinding {
            token: "abc123".to_string(),
            host: "abc123.ctf.test".to_string(),
            network: "net_1_2".to_string(),
            router: "chall_1_2".to_string(),
            service_port: 1337,
            proxy: "proxy".to_string(),
        };
        let labels = route.labels();
        assert_eq!(
            labels
                .get("traefik.http.routers.chall_1_2.rule")
                .map(String::as_str),
            Some("Host(`abc123.ctf.test`)")
        );
        assert_eq!(
            labels
                .get("traefik.http.services.chall_1_2.loadbalancer.server.port")
                .map(String::as_str),
            Some("1337")
        );
        assert_eq!(route.aliases(), vec!["abc123"]);
    }

    #[tokio::test]
    async fn test_prepare_requires_domain_and_proxy() {
        let engine = Arc::new(MemoryEngine::new());
        let routing = RoutingPublisher::new(engine.clone());
        let key = InstanceKey::new(1, 1);

        let no_domain = InstancerConfig::default();
        assert_eq!(
            routing.prepare(key, &no_domain, 80).await,
            Err(RoutingError::MissingBaseDomain)
        );
        assert_eq!(
            routing.prepare(key, &config(), 80).await,
            Err(RoutingError::ProxyUnavailable("proxy".to_string()))
        );
        engine.run_container("proxy", "traefik", None);
        engine.kill_container("proxy");
        assert!(routing.prepare(key, &config(), 80).await.is_err());
        assert_eq!(routing.routes(), 0);
    }

    #[tokio::test]
    async fn test_register_follows_recreated_proxy() {
        let engine = Arc::new(MemoryEngine::new());
        engine.run_container("proxy", "traefik", None);
        let routing = RoutingPublisher::new(engine.clone());
        let key = InstanceKey::new(3, 7);

        let route = routing.prepare(key, &config(), 1337).await.unwrap();
        assert!(route.host.ends_with(".ctf.test"));
        assert_eq!(routing.lookup(&route.token), Some(key));

        engine
            .create_network(&NetworkSpec {
                name: route.network.clone(),
                internal: true,
                ..Default::default()
            })
            .await
            .unwrap();
        routing.register(&route).await.unwrap();
        // Registering twice is fine.
        routing.register(&route).await.unwrap();
        assert_eq!(engine.network_members(&route.network), vec!["proxy"]);

        engine.recreate_container("proxy");
        routing.unregister(&route).await.unwrap();
        assert!(routing.lookup(&route.token).is_none());

        engine.force_remove("proxy");
        routing.unregister(&route).await.unwrap();
    }
}
