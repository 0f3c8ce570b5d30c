// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::InstanceKey;

/// Emitted when an instance's lifetime has run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub key: InstanceKey,
    pub instance_id: Uuid,
}

#[derive(Debug)]
struct Timer {
    instance_id: Uuid,
    handle: AbortHandle,
}

/// One timer per instance. Fired timers only report the expiry; tearing the
/// instance down is up to whoever drains the receiver.
#[derive(Debug)]
pub struct LifetimeScheduler {
    timers: DashMap<InstanceKey, Timer>,
    expiries: mpsc::UnboundedSender<Expiry>,
}

impl LifetimeScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                timers: DashMap::new(),
                expiries: tx,
            },
            rx,
        )
    }

    /// Arms (or re-arms) the timer for an instance. Must be called from
    /// within a tokio runtime.
    pub fn arm(&self, key: InstanceKey, instance_id: Uuid, lifetime: Duration) {
        let expiries = self.expiries.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            tracing::debug!("Lifetime of instance for {} elapsed", key);
            // The receiver is gone once the orchestrator shut down.
            let _ = expiries.send(Expiry { key, instance_id });
        });
        let timer = Timer {
            instance_id,
            handle: task.abort_handle(),
        };
        if let Some(previous) = self.timers.insert(key, timer) {
            previous.handle.abort();
        }
    }

    /// Cancels the timer if it still belongs to `instance_id`. Cancelling a
    /// timer that already fired is harmless.
    pub fn cancel(&self, key: InstanceKey, instance_id: Uuid) -> bool {
        match self
            .timers
            .remove_if(&key, |_, timer| timer.instance_id == instance_id)
        {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.timers.retain(|_, timer| {
            timer.handle.abort();
            false
        });
    }

    pub fn armed(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_after_lifetime() {
        let (scheduler, mut expiries) = LifetimeScheduler::new();
        let key = InstanceKey::new(1, 2);
        let id = Uuid::now_v7();
        scheduler.arm(key, id, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(expiries.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            expiries.try_recv().ok(),
            Some(Expiry {
                key,
                instance_id: id
            })
        );
        assert!(expiries.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (scheduler, mut expiries) = LifetimeScheduler::new();
        let key = InstanceKey::new(1, 2);
        let id = Uuid::now_v7();
        scheduler.arm(key, id, Duration::from_secs(5));
        assert!(!scheduler.cancel(key, Uuid::now_v7()));
        assert!(scheduler.cancel(key, id));
        assert!(!scheduler.cancel(key, id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(expiries.try_recv().is_err());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let (scheduler, mut expiries) = LifetimeScheduler::new();
        let key = InstanceKey::new(4, 4);
        let id = Uuid::now_v7();
        scheduler.arm(key, id, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        scheduler.arm(key, id, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(expiries.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(expiries.try_recv().is_ok());
        assert_eq!(scheduler.armed(), 1);

        scheduler.cancel_all();
        assert_eq!(scheduler.armed(), 0);
    }
}
