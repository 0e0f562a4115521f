//! svcmerge kube integration: the cluster-backed object store.
//!
//! Maps the typed records the reconciler works with onto live Service,
//! Deployment, ReplicaSet and Pod objects, and onto the `ServiceMerge`
//! custom resource (accessed dynamically, so no generated CRD types are
//! required). Merge state and failure reporting live on the custom
//! resource's status subresource.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Pod, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tracing::debug;

use svcmerge_core::store::{ObjectStore, StoreError, StoreResult};
use svcmerge_core::{
    DeploymentRecord, InstanceId, MergeInstance, MergeState, OwnerRef, PodRecord,
    ReplicaSetRecord, ServicePortSpec, ServiceRecord,
};

pub const CRD_GROUP: &str = "svcmerge.dev";
pub const CRD_VERSION: &str = "v1alpha1";
pub const CRD_KIND: &str = "ServiceMerge";
/// Keeps a deleted `ServiceMerge` visible until rollback has completed.
pub const FINALIZER: &str = "svcmerge.dev/rollback";

pub fn servicemerge_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(CRD_GROUP, CRD_VERSION, CRD_KIND))
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn services(&self, ns: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn pods(&self, ns: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn replica_sets(&self, ns: &str) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn deployments(&self, ns: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn instances(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &servicemerge_resource())
    }
}

fn map_err(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => StoreError::Unavailable(anyhow::Error::new(other)),
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Controlling owner if one is marked, otherwise the first listed.
fn owner_of(meta: &ObjectMeta) -> Option<OwnerRef> {
    let owners = meta.owner_references.as_ref()?;
    owners
        .iter()
        .find(|o| o.controller == Some(true))
        .or_else(|| owners.first())
        .map(|o| OwnerRef { kind: o.kind.clone(), name: o.name.clone() })
}

fn service_record(svc: Service) -> Option<ServiceRecord> {
    let name = svc.metadata.name.clone()?;
    let namespace = svc.metadata.namespace.clone().unwrap_or_default();
    let spec = svc.spec.unwrap_or_default();
    let ports = spec
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| ServicePortSpec {
            name: p.name.unwrap_or_default(),
            port: p.port,
            target_port: match p.target_port {
                Some(IntOrString::Int(i)) => i,
                // Named target ports are opaque here; only the front port is
                // ever restored.
                _ => p.port,
            },
        })
        .collect();
    Some(ServiceRecord { name, namespace, selector: spec.selector.unwrap_or_default(), ports })
}

fn service_from_record(rec: &ServiceRecord) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(rec.name.clone()),
            namespace: Some(rec.namespace.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(rec.selector.clone()),
            ports: Some(
                rec.ports
                    .iter()
                    .map(|p| ServicePort {
                        name: Some(p.name.clone()),
                        port: p.port,
                        protocol: Some("TCP".to_string()),
                        target_port: Some(IntOrString::Int(p.target_port)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_record(pod: Pod) -> Option<PodRecord> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let owner = owner_of(&pod.metadata);
    Some(PodRecord { name, namespace, labels: pod.metadata.labels.unwrap_or_default(), owner })
}

fn replica_set_record(rs: ReplicaSet) -> Option<ReplicaSetRecord> {
    let name = rs.metadata.name.clone()?;
    let namespace = rs.metadata.namespace.clone().unwrap_or_default();
    let owner = owner_of(&rs.metadata);
    Some(ReplicaSetRecord { name, namespace, owner })
}

fn deployment_record(dep: &Deployment) -> Option<DeploymentRecord> {
    let name = dep.metadata.name.clone()?;
    let namespace = dep.metadata.namespace.clone().unwrap_or_default();
    let template_labels = dep
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    Some(DeploymentRecord { name, namespace, template_labels })
}

pub fn instance_from_dynamic(id: &InstanceId, obj: &DynamicObject) -> MergeInstance {
    let intent = obj
        .data
        .get("spec")
        .and_then(|s| s.get("services"))
        .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
        .unwrap_or_default();
    let state = obj
        .data
        .get("status")
        .and_then(|s| s.get("mergeState"))
        .and_then(|v| serde_json::from_value::<MergeState>(v.clone()).ok())
        .unwrap_or_default();
    MergeInstance {
        id: id.clone(),
        intent,
        state,
        deleting: obj.metadata.deletion_timestamp.is_some(),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_instance(&self, id: &InstanceId) -> StoreResult<Option<MergeInstance>> {
        let obj = self
            .instances(&id.namespace)
            .get_opt(&id.name)
            .await
            .map_err(|e| map_err(CRD_KIND, &id.namespace, &id.name, e))?;
        Ok(obj.map(|o| instance_from_dynamic(id, &o)))
    }

    async fn put_state(&self, id: &InstanceId, state: &MergeState) -> StoreResult<()> {
        let patch = serde_json::json!({"status": {"mergeState": state, "lastError": null}});
        self.instances(&id.namespace)
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(CRD_KIND, &id.namespace, &id.name, e))?;
        Ok(())
    }

    async fn record_failure(&self, id: &InstanceId, kind: &str, message: &str) -> StoreResult<()> {
        let patch = serde_json::json!({"status": {"lastError": {
            "kind": kind,
            "message": message,
            "at": chrono::Utc::now().to_rfc3339(),
        }}});
        self.instances(&id.namespace)
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(CRD_KIND, &id.namespace, &id.name, e))?;
        Ok(())
    }

    async fn ensure_finalizer(&self, id: &InstanceId) -> StoreResult<()> {
        let api = self.instances(&id.namespace);
        let Some(obj) = api
            .get_opt(&id.name)
            .await
            .map_err(|e| map_err(CRD_KIND, &id.namespace, &id.name, e))?
        else {
            return Ok(());
        };
        let mut finalizers = obj.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        api.patch(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(CRD_KIND, &id.namespace, &id.name, e))?;
        debug!(instance = %id, "finalizer added");
        Ok(())
    }

    async fn clear_finalizer(&self, id: &InstanceId) -> StoreResult<()> {
        let api = self.instances(&id.namespace);
        let Some(obj) = api
            .get_opt(&id.name)
            .await
            .map_err(|e| map_err(CRD_KIND, &id.namespace, &id.name, e))?
        else {
            return Ok(());
        };
        let Some(finalizers) = obj.metadata.finalizers else { return Ok(()) };
        if !finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let kept: Vec<String> = finalizers.into_iter().filter(|f| f != FINALIZER).collect();
        let patch = serde_json::json!({"metadata": {"finalizers": kept}});
        api.patch(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_err(CRD_KIND, &id.namespace, &id.name, e))?;
        debug!(instance = %id, "finalizer removed");
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Option<ServiceRecord>> {
        let svc = self
            .services(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_err("Service", namespace, name, e))?;
        Ok(svc.and_then(service_record))
    }

    async fn create_service(&self, service: &ServiceRecord) -> StoreResult<()> {
        let obj = service_from_record(service);
        self.services(&service.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_err("Service", &service.namespace, &service.name, e))?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_err("Service", namespace, name, e))?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<PodRecord>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = self
            .pods(namespace)
            .list(&lp)
            .await
            .map_err(|e| map_err("Pod", namespace, "", e))?;
        Ok(list.items.into_iter().filter_map(pod_record).collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Option<PodRecord>> {
        let pod = self
            .pods(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_err("Pod", namespace, name, e))?;
        Ok(pod.and_then(pod_record))
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ReplicaSetRecord>> {
        let rs = self
            .replica_sets(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_err("ReplicaSet", namespace, name, e))?;
        Ok(rs.and_then(replica_set_record))
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<DeploymentRecord>> {
        let dep = self
            .deployments(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_err("Deployment", namespace, name, e))?;
        Ok(dep.as_ref().and_then(deployment_record))
    }

    async fn update_deployment(&self, deployment: &DeploymentRecord) -> StoreResult<()> {
        // Read-modify-write with a full replace: a concurrent writer shows
        // up as a 409 Conflict and aborts the transition for a fresh retry.
        let api = self.deployments(&deployment.namespace);
        let mut live = api
            .get(&deployment.name)
            .await
            .map_err(|e| map_err("Deployment", &deployment.namespace, &deployment.name, e))?;
        let Some(spec) = live.spec.as_mut() else {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "deployment {}/{} has no spec",
                deployment.namespace,
                deployment.name
            )));
        };
        let meta = spec.template.metadata.get_or_insert_with(Default::default);
        meta.labels = Some(deployment.template_labels.clone());
        api.replace(&deployment.name, &PostParams::default(), &live)
            .await
            .map_err(|e| map_err("Deployment", &deployment.namespace, &deployment.name, e))?;
        Ok(())
    }
}
