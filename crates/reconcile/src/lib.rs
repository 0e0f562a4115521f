//! svcmerge reconcile: the merge lifecycle state machine.
//!
//! One entry point, [`Reconciler::reconcile`], invoked by the controller
//! runtime whenever a managed resource may have changed. It reads the
//! persisted [`MergeState`], decides which transition applies (activate,
//! update, rollback) and drives it to completion. State is written back once
//! a transition's new membership is in effect; every step before that point
//! is idempotent and everything after is re-driven by later passes, so a
//! re-run after any abort converges.

#![forbid(unsafe_code)]

mod labels;
mod lifecycle;
mod resolver;
pub mod wait;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use svcmerge_core::store::{ObjectStore, StoreError};
use svcmerge_core::{InstanceId, MergeState};
use tracing::{debug, info, warn};

pub use wait::WaitPolicy;

/// What the invoking scheduler should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    RetryAfter(Duration),
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("service {0} not found")]
    MissingService(String),
    #[error("service {0} declares no ports")]
    PortlessService(String),
    #[error("merge state invariant violated: {0}")]
    StateInvariant(String),
    #[error("pod membership did not settle within {0:?}")]
    PropagationTimeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Error kind recorded on the resource status.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingService(_) => "NotFoundFatal",
            Self::PortlessService(_) => "InvalidService",
            Self::StateInvariant(_) => "CorruptState",
            Self::PropagationTimeout(_) => "PropagationTimeout",
            Self::Store(StoreError::NotFound { .. }) => "NotFoundFatal",
            Self::Store(StoreError::AlreadyExists { .. }) => "ConflictOnWrite",
            Self::Store(StoreError::Conflict { .. }) => "ConflictOnWrite",
            Self::Store(StoreError::Unavailable(_)) => "StoreUnavailable",
        }
    }

    /// Classify per the fatal/recoverable policy: conflicts, outages and
    /// propagation timeouts are retried by the scheduler; a named service
    /// that does not exist (or corrupt persisted state) needs operator input.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::MissingService(_)
            | Self::PortlessService(_)
            | Self::StateInvariant(_)
            | Self::Store(StoreError::NotFound { .. }) => Outcome::Fatal(self.to_string()),
            Self::PropagationTimeout(_) => Outcome::RetryAfter(Duration::from_secs(10)),
            Self::Store(StoreError::AlreadyExists { .. })
            | Self::Store(StoreError::Conflict { .. })
            | Self::Store(StoreError::Unavailable(_)) => Outcome::RetryAfter(Duration::from_secs(5)),
        }
    }
}

/// Per-instance exclusive lease: at most one transition runs for a given
/// resource at a time, while distinct instances proceed concurrently.
struct LeaseMap {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LeaseMap {
    fn new() -> Self {
        Self { inner: std::sync::Mutex::new(HashMap::new()) }
    }

    async fn hold(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }
}

pub struct Reconciler<S: ObjectStore> {
    store: Arc<S>,
    leases: LeaseMap,
    wait: WaitPolicy,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: Arc<S>, wait: WaitPolicy) -> Self {
        Self { store, leases: LeaseMap::new(), wait }
    }

    /// Run one reconciliation for `id`. Never panics and never retries
    /// internally; failures are classified into the returned [`Outcome`].
    pub async fn reconcile(&self, id: &InstanceId) -> Outcome {
        let _lease = self.leases.hold(&id.to_string()).await;
        let started = std::time::Instant::now();
        counter!("reconcile_total", 1u64);
        match self.run(id).await {
            Ok(()) => {
                histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
                Outcome::Done
            }
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                warn!(instance = %id, error = %e, kind = e.kind(), "transition aborted");
                // Best effort; the classification below stands either way.
                if let Err(se) = self.store.record_failure(id, e.kind(), &e.to_string()).await {
                    debug!(instance = %id, error = %se, "failed to record status error");
                }
                e.outcome()
            }
        }
    }

    async fn run(&self, id: &InstanceId) -> Result<(), ReconcileError> {
        let store = self.store.as_ref();
        let Some(instance) = store.get_instance(id).await? else {
            debug!(instance = %id, "resource gone; nothing durable remains");
            return Ok(());
        };

        if instance.deleting {
            if instance.state.active {
                info!(instance = %id, services = instance.state.services.len(), "rolling back merge before delete");
                lifecycle::rollback(store, id, &instance.state).await?;
                store.put_state(id, &MergeState::default()).await?;
                counter!("merge_rollbacks_total", 1u64);
            }
            store.clear_finalizer(id).await?;
            return Ok(());
        }

        // The finalizer keeps the resource (and the state persisted on it)
        // visible until rollback has completed.
        store.ensure_finalizer(id).await?;

        let intent: BTreeSet<String> = instance.intent.iter().cloned().collect();
        if !instance.state.active {
            if intent.is_empty() {
                return Ok(());
            }
            info!(instance = %id, services = intent.len(), "activating merge");
            lifecycle::activate(store, id, &intent, self.wait).await?;
            counter!("merge_activations_total", 1u64);
        } else if intent.is_empty() {
            info!(instance = %id, "intent emptied; rolling back merge");
            lifecycle::rollback(store, id, &instance.state).await?;
            store.put_state(id, &MergeState::default()).await?;
            counter!("merge_rollbacks_total", 1u64);
        } else if intent != instance.state.services {
            info!(instance = %id, "updating merge membership");
            lifecycle::update(store, id, &intent, &instance.state, self.wait).await?;
            counter!("merge_updates_total", 1u64);
        } else {
            debug!(instance = %id, "merge already converged");
            lifecycle::sweep_leftover_originals(store, id, &instance.state).await?;
        }
        Ok(())
    }
}
