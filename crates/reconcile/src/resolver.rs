//! Membership resolution: service -> pods, pod -> owning deployment.

use svcmerge_core::store::ObjectStore;
use svcmerge_core::PodRecord;

use crate::ReconcileError;

/// Pair every pod backing the named services with its originating service.
/// A named service that does not exist is an error; the caller decides
/// whether that is fatal for the transition.
pub(crate) async fn resolve_pods<S: ObjectStore + ?Sized>(
    store: &S,
    namespace: &str,
    services: &[String],
) -> Result<Vec<(String, String)>, ReconcileError> {
    let mut out = Vec::new();
    for svc in services {
        let record = store
            .get_service(namespace, svc)
            .await?
            .ok_or_else(|| ReconcileError::MissingService(svc.clone()))?;
        let pods = store.list_pods(namespace, &record.selector).await?;
        for pod in pods {
            out.push((pod.name, svc.clone()));
        }
    }
    Ok(out)
}

/// Walk pod -> ReplicaSet -> Deployment owner references. A broken chain
/// (pod or replica set deleted underneath us, or a pod not owned by a
/// deployment at all) resolves to `None` and the caller skips it;
/// membership is eventually consistent by nature.
pub(crate) async fn resolve_deployment<S: ObjectStore + ?Sized>(
    store: &S,
    namespace: &str,
    pod: &PodRecord,
) -> Result<Option<String>, ReconcileError> {
    let Some(owner) = pod.owner.as_ref().filter(|o| o.kind == "ReplicaSet") else {
        return Ok(None);
    };
    let Some(rs) = store.get_replica_set(namespace, &owner.name).await? else {
        return Ok(None);
    };
    Ok(rs.owner.filter(|o| o.kind == "Deployment").map(|o| o.name))
}
