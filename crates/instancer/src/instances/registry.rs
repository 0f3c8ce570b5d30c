// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Instance, InstanceKey, InstanceState};

#[derive(Debug)]
enum Slot {
    Provisioning,
    Active(Instance),
    TearingDown(Instance),
}

impl Slot {
    fn state(&self) -> InstanceState {
        match self {
            Slot::Provisioning => InstanceState::Provisioning,
            Slot::Active(_) => InstanceState::Active,
            Slot::TearingDown(_) => InstanceState::TearingDown,
        }
    }
}

/// Authoritative map of instance slots.
///
/// `try_reserve` is the only way into a slot and never waits. Provisioning
/// and teardown additionally serialize on a per-key lock from `lock_key`;
/// the locks live in an arena and are dropped once nobody holds them.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    slots: DashMap<InstanceKey, Slot>,
    locks: Arc<DashMap<InstanceKey, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one key. Removes its lock from the arena on drop when
/// no other task is waiting for it.
pub struct KeyGuard {
    key: InstanceKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<InstanceKey, Arc<Mutex<()>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims an empty slot. Returns false if the key is provisioning, active
    /// or still tearing down.
    pub fn try_reserve(&self, key: InstanceKey) -> bool {
        match self.slots.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Slot::Provisioning);
                true
            }
        }
    }

    /// Finalizes a reserved slot. Returns false (and stores nothing) if the
    /// slot was not reserved.
    pub fn commit(&self, mut instance: Instance) -> bool {
        match self.slots.get_mut(&instance.key) {
            Some(mut slot) if matches!(*slot, Slot::Provisioning) => {
                instance.state = InstanceState::Active;
                *slot = Slot::Active(instance);
                true
            }
            _ => false,
        }
    }

    /// Empties the slot whatever its state.
    pub fn release(&self, key: InstanceKey) -> Option<Instance> {
        match self.slots.remove(&key)? {
            (_, Slot::Active(instance)) | (_, Slot::TearingDown(instance)) => Some(instance),
            (_, Slot::Provisioning) => None,
        }
    }

    /// Committed, active instance for the key.
    pub fn get(&self, key: InstanceKey) -> Option<Instance> {
        match self.slots.get(&key)?.value() {
            Slot::Active(instance) => Some(instance.clone()),
            _ => None,
        }
    }

    pub fn state(&self, key: InstanceKey) -> Option<InstanceState> {
        self.slots.get(&key).map(|slot| slot.state())
    }

    /// Moves an active slot to tearing-down. With `expected` set, only the
    /// instance with that id is affected, so a stale expiry cannot hit a
    /// newer instance under the same key.
    pub fn begin_teardown(&self, key: InstanceKey, expected: Option<Uuid>) -> Option<Instance> {
        let mut slot = self.slots.get_mut(&key)?;
        let Slot::Active(instance) = &*slot else {
            return None;
        };
        if expected.is_some_and(|id| id != instance.id) {
            return None;
        }
        let mut instance = instance.clone();
        instance.state = InstanceState::TearingDown;
        *slot = Slot::TearingDown(instance.clone());
        Some(instance)
    }

    pub fn extend(&self, key: InstanceKey, expires_at: Option<DateTime<Utc>>) -> Option<Instance> {
        let mut slot = self.slots.get_mut(&key)?;
        match &mut *slot {
            Slot::Active(instance) => {
                instance.expires_at = expires_at;
                Some(instance.clone())
            }
            _ => None,
        }
    }

    pub fn active(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Active(instance) => Some(instance.clone()),
                _ => None,
            })
            .collect();
        instances.sort_by_key(|instance| instance.key);
        instances
    }

    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Instance> {
        self.active()
            .into_iter()
            .filter(|instance| instance.is_expired(now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub async fn lock_key(&self, key: InstanceKey) -> KeyGuard {
        let lock = self.locks.entry(key).or_default().clone();
        KeyGuard {
            key,
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of per-key locks currently alive in the arena.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeKind;
    use crate::instances::Egress;
    use crate::runtime::ResourceHandle;

    fn instance(key: InstanceKey) -> Instance {
        Instance {
            id: Uuid::now_v7(),
            key,
            kind: ChallengeKind::Container,
            resources: ResourceHandle::Container {
                name: key.container_name(),
                network: None,
            },
            egress: Egress::Port(10000),
            route: None,
            host: "localhost".to_string(),
            lifetime: 60,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::TimeDelta::seconds(60)),
            state: InstanceState::Provisioning,
        }
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let registry = InstanceRegistry::new();
        let key = InstanceKey::new(1, 1);
        assert!(registry.try_reserve(key));
        assert!(!registry.try_reserve(key));
        assert!(registry.try_reserve(InstanceKey::new(1, 2)));
        assert_eq!(registry.state(key), Some(InstanceState::Provisioning));
        assert!(registry.get(key).is_none());
    }

    #[test]
    fn test_commit_requires_reservation() {
        let registry = InstanceRegistry::new();
        let key = InstanceKey::new(1, 1);
        assert!(!registry.commit(instance(key)));
        assert!(registry.is_empty());

        assert!(registry.try_reserve(key));
        assert!(registry.commit(instance(key)));
        let active = registry.get(key).unwrap();
        assert_eq!(active.state, InstanceState::Active);
        assert!(!registry.commit(instance(key)));
    }

    #[test]
    fn test_teardown_matches_instance_id() {
        let registry = InstanceRegistry::new();
        let key = InstanceKey::new(2, 5);
        registry.try_reserve(key);
        let committed = instance(key);
        let id = committed.id;
        registry.commit(committed);

        assert!(registry.begin_teardown(key, Some(Uuid::now_v7())).is_none());
        let tearing = registry.begin_teardown(key, Some(id)).unwrap();
        assert_eq!(tearing.state, InstanceState::TearingDown);
        assert!(registry.begin_teardown(key, None).is_none());
        // Still occupied until released.
        assert!(!registry.try_reserve(key));
        assert!(registry.release(key).is_some());
        assert!(registry.try_reserve(key));
    }

    #[test]
    fn test_expired_lists_only_active_past_deadline() {
        let registry = InstanceRegistry::new();
        let (fresh, stale) = (InstanceKey::new(1, 1), InstanceKey::new(1, 2));
        for key in [fresh, stale] {
            registry.try_reserve(key);
            registry.commit(instance(key));
        }
        registry.extend(stale, Some(Utc::now() - chrono::TimeDelta::seconds(1)));
        let expired = registry.expired(Utc::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, stale);
        assert_eq!(registry.active().len(), 2);
    }

    #[tokio::test]
    async fn test_key_locks_are_collected() {
        let registry = InstanceRegistry::new();
        let key = InstanceKey::new(9, 9);
        {
            let _guard = registry.lock_key(key).await;
            assert_eq!(registry.lock_count(), 1);
        }
        assert_eq!(registry.lock_count(), 0);
    }
}
