//! In-memory object store double for lifecycle tests.
//!
//! Models the one piece of cluster behavior the reconciler depends on:
//! updating a deployment's pod template relabels the pods it owns (through
//! the replica-set chain). Write failures can be injected to exercise
//! partial-completion recovery.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use svcmerge_core::store::{ObjectStore, StoreError, StoreResult};
use svcmerge_core::{
    DeploymentRecord, InstanceId, MergeInstance, MergeState, OwnerRef, PodRecord,
    ReplicaSetRecord, ServicePortSpec, ServiceRecord,
};

pub const NS: &str = "default";

#[derive(Default)]
pub struct MemCluster {
    pub services: BTreeMap<String, ServiceRecord>,
    pub deployments: BTreeMap<String, DeploymentRecord>,
    pub replica_sets: BTreeMap<String, ReplicaSetRecord>,
    pub pods: BTreeMap<String, PodRecord>,
    pub present: bool,
    pub intent: Vec<String>,
    pub state: MergeState,
    pub deleting: bool,
    pub finalizer: bool,
    pub last_error: Option<(String, String)>,
    pub writes: usize,
    pub deployment_updates: usize,
    pub fail_after_writes: Option<usize>,
    pub vanished_deployments: std::collections::BTreeSet<String>,
}

pub struct MemStore {
    cluster: Mutex<MemCluster>,
}

impl MemStore {
    pub fn new() -> Self {
        Self { cluster: Mutex::new(MemCluster { present: true, ..Default::default() }) }
    }

    /// Seed one logical service backed by a single deployment/replica-set
    /// chain with the given pods.
    pub fn add_app_pods(&self, svc: &str, port: i32, pods: &[&str]) {
        let mut c = self.cluster.lock().unwrap();
        let selector = BTreeMap::from([("app".to_string(), svc.to_string())]);
        c.services.insert(
            svc.to_string(),
            ServiceRecord {
                name: svc.to_string(),
                namespace: NS.to_string(),
                selector: selector.clone(),
                ports: vec![ServicePortSpec { name: "http".to_string(), port, target_port: 8080 }],
            },
        );
        let dep = format!("{svc}-dep");
        let rs = format!("{svc}-rs");
        c.deployments.insert(
            dep.clone(),
            DeploymentRecord {
                name: dep.clone(),
                namespace: NS.to_string(),
                template_labels: selector.clone(),
            },
        );
        c.replica_sets.insert(
            rs.clone(),
            ReplicaSetRecord {
                name: rs.clone(),
                namespace: NS.to_string(),
                owner: Some(OwnerRef { kind: "Deployment".to_string(), name: dep }),
            },
        );
        for pod in pods {
            c.pods.insert(
                pod.to_string(),
                PodRecord {
                    name: pod.to_string(),
                    namespace: NS.to_string(),
                    labels: selector.clone(),
                    owner: Some(OwnerRef { kind: "ReplicaSet".to_string(), name: rs.clone() }),
                },
            );
        }
    }

    pub fn add_app(&self, svc: &str, port: i32) {
        self.add_app_pods(svc, port, &[&format!("{svc}-pod")]);
    }

    /// Seed a service with no workload of its own; whatever matches the
    /// selector backs it.
    pub fn add_service_with_selector(
        &self,
        svc: &str,
        port: i32,
        selector: BTreeMap<String, String>,
    ) {
        let mut c = self.cluster.lock().unwrap();
        c.services.insert(
            svc.to_string(),
            ServiceRecord {
                name: svc.to_string(),
                namespace: NS.to_string(),
                selector,
                ports: vec![ServicePortSpec { name: "http".to_string(), port, target_port: 8080 }],
            },
        );
    }

    /// Seed a deployment/replica-set chain with the given pod template
    /// labels, unattached to any particular service.
    pub fn add_workload(&self, dep: &str, labels: BTreeMap<String, String>, pods: &[&str]) {
        let mut c = self.cluster.lock().unwrap();
        let rs = format!("{dep}-rs");
        c.deployments.insert(
            dep.to_string(),
            DeploymentRecord {
                name: dep.to_string(),
                namespace: NS.to_string(),
                template_labels: labels.clone(),
            },
        );
        c.replica_sets.insert(
            rs.clone(),
            ReplicaSetRecord {
                name: rs.clone(),
                namespace: NS.to_string(),
                owner: Some(OwnerRef { kind: "Deployment".to_string(), name: dep.to_string() }),
            },
        );
        for pod in pods {
            c.pods.insert(
                pod.to_string(),
                PodRecord {
                    name: pod.to_string(),
                    namespace: NS.to_string(),
                    labels: labels.clone(),
                    owner: Some(OwnerRef { kind: "ReplicaSet".to_string(), name: rs.clone() }),
                },
            );
        }
    }

    /// Make label writes to `dep` behave as if it was deleted between the
    /// caller's read and the write.
    pub fn vanish_deployment_on_write(&self, dep: &str) {
        self.cluster.lock().unwrap().vanished_deployments.insert(dep.to_string());
    }

    pub fn add_portless_service(&self, svc: &str) {
        let mut c = self.cluster.lock().unwrap();
        c.services.insert(
            svc.to_string(),
            ServiceRecord {
                name: svc.to_string(),
                namespace: NS.to_string(),
                selector: BTreeMap::from([("app".to_string(), svc.to_string())]),
                ports: Vec::new(),
            },
        );
    }

    pub fn set_intent(&self, services: &[&str]) {
        self.cluster.lock().unwrap().intent = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn mark_deleting(&self) {
        self.cluster.lock().unwrap().deleting = true;
    }

    pub fn remove_instance(&self) {
        self.cluster.lock().unwrap().present = false;
    }

    pub fn remove_pod(&self, name: &str) {
        self.cluster.lock().unwrap().pods.remove(name);
    }

    /// Fail every write after `extra` more succeed.
    pub fn fail_after(&self, extra: usize) {
        let mut c = self.cluster.lock().unwrap();
        c.fail_after_writes = Some(c.writes + extra);
    }

    pub fn clear_failures(&self) {
        self.cluster.lock().unwrap().fail_after_writes = None;
    }

    pub fn writes(&self) -> usize {
        self.cluster.lock().unwrap().writes
    }

    pub fn with<R>(&self, f: impl FnOnce(&MemCluster) -> R) -> R {
        f(&self.cluster.lock().unwrap())
    }
}

fn matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn gate(c: &mut MemCluster) -> StoreResult<()> {
    c.writes += 1;
    if let Some(n) = c.fail_after_writes {
        if c.writes > n {
            return Err(StoreError::Unavailable(anyhow::anyhow!("injected outage")));
        }
    }
    Ok(())
}

/// The cluster's own rollout behavior, collapsed to "instant": pods owned by
/// the deployment take on the new template labels immediately.
fn relabel_owned_pods(c: &mut MemCluster, dep: &str) {
    let Some(labels) = c.deployments.get(dep).map(|d| d.template_labels.clone()) else {
        return;
    };
    let owned_rs: Vec<String> = c
        .replica_sets
        .values()
        .filter(|rs| {
            rs.owner.as_ref().map(|o| o.kind == "Deployment" && o.name == dep).unwrap_or(false)
        })
        .map(|rs| rs.name.clone())
        .collect();
    for pod in c.pods.values_mut() {
        let owned = pod
            .owner
            .as_ref()
            .map(|o| o.kind == "ReplicaSet" && owned_rs.contains(&o.name))
            .unwrap_or(false);
        if owned {
            pod.labels = labels.clone();
        }
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get_instance(&self, id: &InstanceId) -> StoreResult<Option<MergeInstance>> {
        let c = self.cluster.lock().unwrap();
        if !c.present {
            return Ok(None);
        }
        Ok(Some(MergeInstance {
            id: id.clone(),
            intent: c.intent.clone(),
            state: c.state.clone(),
            deleting: c.deleting,
        }))
    }

    async fn put_state(&self, _id: &InstanceId, state: &MergeState) -> StoreResult<()> {
        let mut c = self.cluster.lock().unwrap();
        gate(&mut c)?;
        c.state = state.clone();
        c.last_error = None;
        Ok(())
    }

    async fn record_failure(&self, _id: &InstanceId, kind: &str, message: &str) -> StoreResult<()> {
        let mut c = self.cluster.lock().unwrap();
        gate(&mut c)?;
        c.last_error = Some((kind.to_string(), message.to_string()));
        Ok(())
    }

    async fn ensure_finalizer(&self, _id: &InstanceId) -> StoreResult<()> {
        let mut c = self.cluster.lock().unwrap();
        if !c.present || c.finalizer {
            return Ok(());
        }
        gate(&mut c)?;
        c.finalizer = true;
        Ok(())
    }

    async fn clear_finalizer(&self, _id: &InstanceId) -> StoreResult<()> {
        let mut c = self.cluster.lock().unwrap();
        if !c.finalizer {
            return Ok(());
        }
        gate(&mut c)?;
        c.finalizer = false;
        if c.deleting {
            // Nothing holds the object anymore; the cluster collects it.
            c.present = false;
        }
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Option<ServiceRecord>> {
        let c = self.cluster.lock().unwrap();
        Ok(c.services.get(name).filter(|s| s.namespace == namespace).cloned())
    }

    async fn create_service(&self, service: &ServiceRecord) -> StoreResult<()> {
        let mut c = self.cluster.lock().unwrap();
        if c.services.contains_key(&service.name) {
            return Err(StoreError::AlreadyExists {
                kind: "Service",
                namespace: service.namespace.clone(),
                name: service.name.clone(),
            });
        }
        gate(&mut c)?;
        c.services.insert(service.name.clone(), service.clone());
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut c = self.cluster.lock().unwrap();
        if !c.services.contains_key(name) {
            return Err(StoreError::NotFound {
                kind: "Service",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        gate(&mut c)?;
        c.services.remove(name);
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<PodRecord>> {
        let c = self.cluster.lock().unwrap();
        Ok(c.pods
            .values()
            .filter(|p| p.namespace == namespace && matches(selector, &p.labels))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> StoreResult<Option<PodRecord>> {
        let c = self.cluster.lock().unwrap();
        Ok(c.pods.get(name).filter(|p| p.namespace == namespace).cloned())
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ReplicaSetRecord>> {
        let c = self.cluster.lock().unwrap();
        Ok(c.replica_sets.get(name).filter(|r| r.namespace == namespace).cloned())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<DeploymentRecord>> {
        let c = self.cluster.lock().unwrap();
        Ok(c.deployments.get(name).filter(|d| d.namespace == namespace).cloned())
    }

    async fn update_deployment(&self, deployment: &DeploymentRecord) -> StoreResult<()> {
        let mut c = self.cluster.lock().unwrap();
        if !c.deployments.contains_key(&deployment.name)
            || c.vanished_deployments.contains(&deployment.name)
        {
            return Err(StoreError::NotFound {
                kind: "Deployment",
                namespace: deployment.namespace.clone(),
                name: deployment.name.clone(),
            });
        }
        gate(&mut c)?;
        c.deployments.insert(deployment.name.clone(), deployment.clone());
        c.deployment_updates += 1;
        relabel_owned_pods(&mut c, &deployment.name);
        Ok(())
    }
}
