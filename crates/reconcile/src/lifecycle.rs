//! The three lifecycle transitions: activate, update, rollback.
//!
//! Every step is idempotent or guarded by an existing-state check so a
//! transition aborted partway through can be re-run from the top: creates
//! skip when the object already exists, deletes tolerate absence, and label
//! writes are no-ops when the template already has the desired shape.

use std::collections::BTreeSet;

use svcmerge_core::store::{ObjectStore, StoreError};
use svcmerge_core::{
    diff, merge_selector, origin_selector, release_selector, InstanceId, MergeState,
    ServicePortSpec, ServiceRecord, MERGED_SERVICE_NAME, MERGED_SERVICE_PORT, MERGED_TARGET_PORT,
    SERVICE_PORT_NAME,
};
use tracing::{debug, info};

use crate::labels::LabelMutator;
use crate::wait::{self, WaitPolicy};
use crate::{resolver, ReconcileError};

/// First activation: capture ports, label every backing deployment, wait for
/// the membership to settle, then create the merged service, persist the new
/// state and delete the originals. The merged service exists and is populated
/// before any original is removed, so merged traffic always has a working
/// endpoint; persisting before the delete sweep means an interrupted sweep is
/// re-driven by the converged path instead of replayed from scratch.
pub(crate) async fn activate<S: ObjectStore>(
    store: &S,
    id: &InstanceId,
    intent: &BTreeSet<String>,
    policy: WaitPolicy,
) -> Result<(), ReconcileError> {
    let ns = id.namespace.as_str();
    let mut state = MergeState::default();

    for svc in intent {
        let record = store
            .get_service(ns, svc)
            .await?
            .ok_or_else(|| ReconcileError::MissingService(svc.clone()))?;
        let port = record
            .ports
            .first()
            .map(|p| p.port)
            .ok_or_else(|| ReconcileError::PortlessService(svc.clone()))?;
        state.services.insert(svc.clone());
        state.port_by_service.insert(svc.clone(), port);
    }

    let names: Vec<String> = intent.iter().cloned().collect();
    let pairs = resolver::resolve_pods(store, ns, &names).await?;
    debug!(instance = %id, pods = pairs.len(), "pods before merge");

    let mut labels = LabelMutator::new(store, ns);
    for (pod_name, svc) in &pairs {
        // The pod may have gone away since listing; the settled re-listing
        // below picks up whatever replaced it.
        let Some(pod) = store.get_pod(ns, pod_name).await? else {
            debug!(pod = %pod_name, "pod vanished between list and get; skipping");
            continue;
        };
        if let Some(dep) = resolver::resolve_deployment(store, ns, &pod).await? {
            labels.ensure_merged(&dep, svc).await?;
        }
    }

    let names_ref: &[String] = &names;
    let settled = wait::await_settled(policy, move || async move {
        let pairs = resolver::resolve_pods(store, ns, names_ref).await?;
        Ok(pairs.into_iter().map(|(pod, _)| pod).collect())
    })
    .await?;
    info!(instance = %id, pods = settled.len(), "membership settled after merge");
    state.merged_pod_ids = settled;

    let merged = ServiceRecord {
        name: MERGED_SERVICE_NAME.to_string(),
        namespace: id.namespace.clone(),
        selector: merge_selector(),
        ports: vec![ServicePortSpec {
            name: SERVICE_PORT_NAME.to_string(),
            port: MERGED_SERVICE_PORT,
            target_port: MERGED_TARGET_PORT,
        }],
    };
    create_if_absent(store, &merged).await?;
    state.merged_service_name = MERGED_SERVICE_NAME.to_string();
    state.active = true;

    // Membership is in effect from here; the remaining deletes are cleanup.
    store.put_state(id, &state).await?;

    for svc in intent {
        delete_if_present(store, ns, svc).await?;
    }
    Ok(())
}

/// Incremental update: release what left the intent, absorb what joined it,
/// one propagation wait for the whole batch, then persist the new state and
/// drop the now-redundant originals of the absorbed services. Services in
/// both the old and new sets are untouched.
pub(crate) async fn update<S: ObjectStore>(
    store: &S,
    id: &InstanceId,
    intent: &BTreeSet<String>,
    state: &MergeState,
    policy: WaitPolicy,
) -> Result<(), ReconcileError> {
    let ns = id.namespace.as_str();
    let delta = diff(&state.services, intent);
    info!(instance = %id, release = delta.to_release.len(), absorb = delta.to_absorb.len(), "computed membership delta");

    let mut next = state.clone();
    // Dedup is per phase: a deployment released here may back an absorbed
    // service too and must be re-merged below under its new origin.
    let mut labels = LabelMutator::new(store, ns);

    for svc in &delta.to_release {
        let port = next.port_by_service.get(svc).copied().ok_or_else(|| {
            ReconcileError::StateInvariant(format!("no recorded port for merged service {svc}"))
        })?;
        // Recreate the original identity first, selecting still-merged pods,
        // so the service is reachable before its deployments roll.
        let restored = ServiceRecord {
            name: svc.clone(),
            namespace: id.namespace.clone(),
            selector: release_selector(svc),
            ports: vec![ServicePortSpec {
                name: SERVICE_PORT_NAME.to_string(),
                port,
                target_port: MERGED_TARGET_PORT,
            }],
        };
        create_if_absent(store, &restored).await?;

        for pod in store.list_pods(ns, &release_selector(svc)).await? {
            if let Some(dep) = resolver::resolve_deployment(store, ns, &pod).await? {
                labels.ensure_released(&dep).await?;
            }
        }
        next.services.remove(svc);
        next.port_by_service.remove(svc);
    }

    let mut labels = LabelMutator::new(store, ns);
    for svc in &delta.to_absorb {
        let record = store
            .get_service(ns, svc)
            .await?
            .ok_or_else(|| ReconcileError::MissingService(svc.clone()))?;
        let port = record
            .ports
            .first()
            .map(|p| p.port)
            .ok_or_else(|| ReconcileError::PortlessService(svc.clone()))?;
        next.services.insert(svc.clone());
        next.port_by_service.insert(svc.clone(), port);

        for pod in store.list_pods(ns, &record.selector).await? {
            if let Some(dep) = resolver::resolve_deployment(store, ns, &pod).await? {
                labels.ensure_merged(&dep, svc).await?;
            }
        }
    }

    let merge_sel = merge_selector();
    let merge_sel_ref = &merge_sel;
    let settled = wait::await_settled(policy, move || async move {
        let pods = store.list_pods(ns, merge_sel_ref).await?;
        Ok(pods.into_iter().map(|p| p.name).collect())
    })
    .await?;
    info!(instance = %id, pods = settled.len(), "membership settled after update");
    next.merged_pod_ids = settled;

    // Membership is in effect from here; the remaining deletes are cleanup.
    store.put_state(id, &next).await?;

    // The merged service now fronts the absorbed pods; their originals are
    // redundant.
    for svc in &delta.to_absorb {
        delete_if_present(store, ns, svc).await?;
    }

    Ok(())
}

/// Full rollback: strip the merge markers from every participating
/// deployment, delete the merged service, and recreate each original
/// service with its remembered port. Vanished pods are skipped.
pub(crate) async fn rollback<S: ObjectStore>(
    store: &S,
    id: &InstanceId,
    state: &MergeState,
) -> Result<(), ReconcileError> {
    let ns = id.namespace.as_str();
    let mut labels = LabelMutator::new(store, ns);

    for pod_name in &state.merged_pod_ids {
        let Some(pod) = store.get_pod(ns, pod_name).await? else {
            debug!(pod = %pod_name, "merged pod no longer exists; skipping");
            continue;
        };
        if let Some(dep) = resolver::resolve_deployment(store, ns, &pod).await? {
            labels.ensure_released(&dep).await?;
        }
    }

    let merged_name = if state.merged_service_name.is_empty() {
        MERGED_SERVICE_NAME
    } else {
        state.merged_service_name.as_str()
    };
    delete_if_present(store, ns, merged_name).await?;

    for svc in &state.services {
        let port = state.port_by_service.get(svc).copied().ok_or_else(|| {
            ReconcileError::StateInvariant(format!("no recorded port for merged service {svc}"))
        })?;
        let restored = ServiceRecord {
            name: svc.clone(),
            namespace: id.namespace.clone(),
            selector: origin_selector(svc),
            ports: vec![ServicePortSpec {
                name: SERVICE_PORT_NAME.to_string(),
                port,
                target_port: MERGED_TARGET_PORT,
            }],
        };
        create_if_absent(store, &restored).await?;
    }

    info!(instance = %id, services = state.services.len(), "rollback complete");
    Ok(())
}

/// A converged instance may still carry leftovers of an interrupted final
/// sweep: the original Service of a current member whose state was persisted
/// but whose delete never ran. Finish the sweep here.
pub(crate) async fn sweep_leftover_originals<S: ObjectStore>(
    store: &S,
    id: &InstanceId,
    state: &MergeState,
) -> Result<(), ReconcileError> {
    let ns = id.namespace.as_str();
    for svc in &state.services {
        if store.get_service(ns, svc).await?.is_some() {
            info!(instance = %id, service = %svc, "removing leftover original of merged member");
            delete_if_present(store, ns, svc).await?;
        }
    }
    Ok(())
}

/// Skip-if-exists create: a previous partial pass may already have restored
/// this service.
async fn create_if_absent<S: ObjectStore>(
    store: &S,
    service: &ServiceRecord,
) -> Result<(), ReconcileError> {
    match store.create_service(service).await {
        Ok(()) => Ok(()),
        Err(StoreError::AlreadyExists { .. }) => {
            debug!(service = %service.name, "service already present; keeping it");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Tolerant delete: absence means an earlier pass already removed it.
async fn delete_if_present<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
) -> Result<(), ReconcileError> {
    match store.delete_service(namespace, name).await {
        Ok(()) => Ok(()),
        Err(StoreError::NotFound { .. }) => {
            debug!(service = %name, "service already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
