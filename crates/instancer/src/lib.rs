// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ephemeral challenge instances: one short-lived container or composition per
//! (challenge, team), exposed on a host port or a generated subdomain, reaped
//! once its lifetime runs out.

pub mod challenge;
pub mod config;
pub mod engine;
pub mod instances;
pub mod orchestrator;
pub mod routing;
pub mod runtime;
mod utils;

pub use challenge::{ChallengeKind, ChallengeSpec, Deployment, ResourceLimits};
pub use config::{ConfigError, ConfigStore, EnvConfigStore, InstancerConfig, MemoryConfigStore};
pub use engine::{ContainerEngine, EngineError, docker::DockerEngine, memory::MemoryEngine};
pub use instances::{Egress, Instance, InstanceKey, InstanceState};
pub use orchestrator::{InstanceError, InstanceInfo, Orchestrator};
