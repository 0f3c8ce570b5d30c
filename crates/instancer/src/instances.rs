// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::challenge::ChallengeKind;
use crate::routing::RouteBinding;
use crate::runtime::ResourceHandle;

pub mod lifetime;
pub mod ports;
pub mod registry;

/// One instance slot per (challenge, team).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub challenge_id: i32,
    pub team_id: i32,
}

impl InstanceKey {
    pub fn new(challenge_id: i32, team_id: i32) -> Self {
        Self {
            challenge_id,
            team_id,
        }
    }

    /// Name of the primary container. Operator tooling relies on this scheme.
    pub fn container_name(&self) -> String {
        format!("chall_{}_{}", self.challenge_id, self.team_id)
    }

    /// Private network used for hash-domain routing.
    pub fn network_name(&self) -> String {
        format!("net_{}_{}", self.challenge_id, self.team_id)
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "challenge {} / team {}", self.challenge_id, self.team_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Provisioning,
    Active,
    TearingDown,
}

/// How teams reach the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Egress {
    Port(u16),
    Subdomain(String),
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: Uuid,
    pub key: InstanceKey,
    pub kind: ChallengeKind,
    pub resources: ResourceHandle,
    pub egress: Egress,
    pub route: Option<RouteBinding>,
    /// Host reported to the team.
    pub host: String,
    /// Seconds, 0 means the instance never expires.
    pub lifetime: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub state: InstanceState,
}

impl Instance {
    pub fn port(&self) -> Option<u16> {
        match self.egress {
            Egress::Port(port) => Some(port),
            Egress::Subdomain(_) => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn expires_in(&self, now: DateTime<Utc>) -> u64 {
        self.expires_at
            .map(|expires_at| (expires_at - now).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

pub(crate) fn expiry_after(now: DateTime<Utc>, lifetime: u64) -> Option<DateTime<Utc>> {
    if lifetime == 0 {
        return None;
    }
    i64::try_from(lifetime)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_names() {
        let key = InstanceKey::new(3, 17);
        assert_eq!(key.container_name(), "chall_3_17");
        assert_eq!(key.network_name(), "net_3_17");
    }

    #[test]
    fn test_expiry_after() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 0), None);
        assert_eq!(
            expiry_after(now, 90),
            Some(now + chrono::TimeDelta::seconds(90))
        );
        assert_eq!(expiry_after(now, u64::MAX), None);
    }
}
