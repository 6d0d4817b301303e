//! In-flight registry: at most one worker per budget id.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::package::PackageSnapshot;

/// Unit of work for one budget.
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    /// Reconcile against this current snapshot.
    Update(PackageSnapshot),
    /// The package was deleted upstream.
    Withdraw,
}

impl Work {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Withdraw => "withdraw",
        }
    }
}

/// Observable state of one budget id.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Running { pending: Option<&'static str> },
}

/// Outcome of submitting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Claim {
    /// No worker was running; one was spawned.
    Started,
    /// A worker is running; the work waits in its pending slot.
    Queued,
}

struct Slot {
    cancel: CancellationToken,
    pending: Option<Work>,
    handle: Option<JoinHandle<()>>,
}

/// What shutdown takes over from a slot.
pub(crate) struct Drained {
    pub budget_id: Uuid,
    pub handle: Option<JoinHandle<()>>,
    pub pending: Option<Work>,
}

#[derive(Default)]
struct Table {
    slots: HashMap<Uuid, Slot>,
    /// Set by `drain`; no worker starts afterwards.
    closed: bool,
}

#[derive(Default)]
pub struct InFlightRegistry {
    table: Mutex<Table>,
    idle: Notify,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a worker for `budget_id` unless one is running.
    ///
    /// Claiming and spawning happen under one lock, so two callers can never
    /// both start a worker for the same id. A queued deletion is never
    /// replaced by a later update. Once drained, every claim is refused.
    pub fn claim<F>(
        &self,
        budget_id: Uuid,
        work: Work,
        parent: &CancellationToken,
        spawn: F,
    ) -> Result<Claim, ReconcileError>
    where
        F: FnOnce(CancellationToken, Work) -> JoinHandle<()>,
    {
        let mut table = self.table();
        if table.closed {
            tracing::debug!(budget_id = %budget_id, work = work.name(), "Registry drained, refusing work");
            return Err(ReconcileError::SchedulerClosed);
        }
        if let Some(slot) = table.slots.get_mut(&budget_id) {
            let keep_withdraw =
                matches!(slot.pending, Some(Work::Withdraw)) && matches!(work, Work::Update(_));
            if !keep_withdraw {
                slot.pending = Some(work);
            }
            tracing::debug!(budget_id = %budget_id, "Reconciliation in flight, work coalesced");
            return Ok(Claim::Queued);
        }

        let cancel = parent.child_token();
        let handle = spawn(cancel.clone(), work);
        table.slots.insert(
            budget_id,
            Slot {
                cancel,
                pending: None,
                handle: Some(handle),
            },
        );
        Ok(Claim::Started)
    }

    /// Pending work for `budget_id`, or release the id when there is none.
    pub fn next_or_release(&self, budget_id: Uuid) -> Option<Work> {
        let mut table = self.table();
        let slot = table.slots.get_mut(&budget_id)?;
        if let Some(work) = slot.pending.take() {
            return Some(work);
        }
        table.slots.remove(&budget_id);
        if table.slots.is_empty() {
            self.idle.notify_waiters();
        }
        None
    }

    /// Release `budget_id` unconditionally, returning any pending work.
    pub fn release(&self, budget_id: Uuid) -> Option<Work> {
        let mut table = self.table();
        let pending = table.slots.remove(&budget_id).and_then(|slot| slot.pending);
        if table.slots.is_empty() {
            self.idle.notify_waiters();
        }
        pending
    }

    pub fn state(&self, budget_id: Uuid) -> RunState {
        match self.table().slots.get(&budget_id) {
            Some(slot) => RunState::Running {
                pending: slot.pending.as_ref().map(Work::name),
            },
            None => RunState::Idle,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.table().slots.len()
    }

    /// Resolve once no worker is registered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.table().slots.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new claims, cancel every worker and take over their handles
    /// and pending work.
    pub(crate) fn drain(&self) -> Vec<Drained> {
        let mut table = self.table();
        table.closed = true;
        let drained = table
            .slots
            .drain()
            .map(|(budget_id, slot)| {
                slot.cancel.cancel();
                Drained {
                    budget_id,
                    handle: slot.handle,
                    pending: slot.pending,
                }
            })
            .collect();
        self.idle.notify_waiters();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::snapshot;
    use rust_decimal::Decimal;

    fn idle_task() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn test_second_claim_is_queued() {
        let registry = InFlightRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::new_v4();
        let mut spawned = 0;

        let first = registry.claim(id, Work::Withdraw, &parent, |_, _| {
            spawned += 1;
            idle_task()
        });
        let second = registry.claim(id, Work::Update(snapshot("PKG-1", 1)), &parent, |_, _| {
            spawned += 1;
            idle_task()
        });

        assert_eq!(first.unwrap(), Claim::Started);
        assert_eq!(second.unwrap(), Claim::Queued);
        assert_eq!(spawned, 1);
        assert_eq!(registry.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_newer_update_replaces_pending_update() {
        let registry = InFlightRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::new_v4();
        registry.claim(id, Work::Update(snapshot("PKG-1", 1)), &parent, |_, _| idle_task()).unwrap();
        registry.claim(id, Work::Update(snapshot("PKG-1", 2)), &parent, |_, _| idle_task()).unwrap();
        registry.claim(id, Work::Update(snapshot("PKG-1", 3)), &parent, |_, _| idle_task()).unwrap();

        assert_eq!(registry.state(id), RunState::Running { pending: Some("update") });
        match registry.next_or_release(id) {
            Some(Work::Update(p)) => assert_eq!(p.price, Decimal::from(3)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.next_or_release(id), None);
        assert_eq!(registry.state(id), RunState::Idle);
    }

    #[tokio::test]
    async fn test_pending_withdraw_is_sticky() {
        let registry = InFlightRegistry::new();
        let parent = CancellationToken::new();
        let id = Uuid::new_v4();
        registry.claim(id, Work::Update(snapshot("PKG-1", 1)), &parent, |_, _| idle_task()).unwrap();
        registry.claim(id, Work::Withdraw, &parent, |_, _| idle_task()).unwrap();
        registry.claim(id, Work::Update(snapshot("PKG-1", 2)), &parent, |_, _| idle_task()).unwrap();

        assert_eq!(registry.next_or_release(id), Some(Work::Withdraw));
    }

    #[tokio::test]
    async fn test_wait_idle_and_drain() {
        let registry = std::sync::Arc::new(InFlightRegistry::new());
        let parent = CancellationToken::new();
        let id = Uuid::new_v4();
        let mut token = None;
        registry
            .claim(id, Work::Withdraw, &parent, |cancel, _| {
                token = Some(cancel);
                idle_task()
            })
            .unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_idle().await })
        };
        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(token.unwrap().is_cancelled());
        waiter.await.unwrap();
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_claim_after_drain_is_refused() {
        let registry = InFlightRegistry::new();
        let parent = CancellationToken::new();
        registry.drain();

        let mut spawned = false;
        let refused = registry.claim(Uuid::new_v4(), Work::Withdraw, &parent, |_, _| {
            spawned = true;
            idle_task()
        });
        assert!(matches!(refused, Err(ReconcileError::SchedulerClosed)));
        assert!(!spawned);
        assert_eq!(registry.in_flight(), 0);
    }
}
