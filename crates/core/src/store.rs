//! Object-store capability consumed by the reconciler.
//!
//! The reconciler never talks to a cluster directly; it goes through this
//! trait so transitions can be exercised against an in-memory double.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{
    DeploymentRecord, InstanceId, MergeInstance, MergeState, PodRecord, ReplicaSetRecord,
    ServiceRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {kind} {namespace}/{name}")]
    NotFound { kind: &'static str, namespace: String, name: String },
    #[error("already exists: {kind} {namespace}/{name}")]
    AlreadyExists { kind: &'static str, namespace: String, name: String },
    #[error("write conflict: {kind} {namespace}/{name}")]
    Conflict { kind: &'static str, namespace: String, name: String },
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed access to the cluster objects the merge touches.
///
/// Gets return `Ok(None)` for absence so callers decide whether a missing
/// object is fatal or an eventual-consistency skip; deletes and creates
/// surface `NotFound`/`AlreadyExists` as errors for callers that tolerate
/// them explicitly.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // Managed resource and its durable state.
    async fn get_instance(&self, id: &InstanceId) -> StoreResult<Option<MergeInstance>>;
    /// Persist the merge state on the managed resource. Clears any recorded
    /// failure; called once a transition's membership has taken effect.
    async fn put_state(&self, id: &InstanceId, state: &MergeState) -> StoreResult<()>;
    /// Record the last failure kind and message on the resource status so an
    /// operator can tell "still converging" from "stuck".
    async fn record_failure(&self, id: &InstanceId, kind: &str, message: &str) -> StoreResult<()>;
    async fn ensure_finalizer(&self, id: &InstanceId) -> StoreResult<()>;
    async fn clear_finalizer(&self, id: &InstanceId) -> StoreResult<()>;

    // Services.
    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Option<ServiceRecord>>;
    async fn create_service(&self, service: &ServiceRecord) -> StoreResult<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()>;

    // Workloads.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<PodRecord>>;
    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Option<PodRecord>>;
    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ReplicaSetRecord>>;
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<DeploymentRecord>>;
    async fn update_deployment(&self, deployment: &DeploymentRecord) -> StoreResult<()>;
}
