//! svcmerge core: merge state, the diff engine, and the object-store capability.

#![forbid(unsafe_code)]

pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label marking a pod template as absorbed into the merged service.
pub const MERGE_LABEL: &str = "merge";
pub const MERGE_LABEL_VALUE: &str = "true";
/// Label recording which logical service a merged deployment originally backed.
pub const ORIGIN_LABEL: &str = "name";
/// Identity of the synthetic service fronting all absorbed pods.
pub const MERGED_SERVICE_NAME: &str = "merged-service";
pub const MERGED_SERVICE_PORT: i32 = 89;
pub const MERGED_TARGET_PORT: i32 = 8080;
pub const SERVICE_PORT_NAME: &str = "merged-service-port";

/// Selector matching every absorbed pod.
pub fn merge_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(MERGE_LABEL.to_string(), MERGE_LABEL_VALUE.to_string())])
}

/// Selector used when restoring a service mid-merge: still-merged pods stay
/// reachable under the original identity until their deployment rolls.
pub fn release_selector(service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ORIGIN_LABEL.to_string(), service.to_string()),
        (MERGE_LABEL.to_string(), MERGE_LABEL_VALUE.to_string()),
    ])
}

/// Selector used when restoring a service on full rollback.
pub fn origin_selector(service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(ORIGIN_LABEL.to_string(), service.to_string())])
}

/// Identity of one managed `ServiceMerge` resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InstanceId {
    pub namespace: String,
    pub name: String,
}

impl InstanceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Durable record of the actual merge status for one managed instance.
///
/// Persisted once a transition's new membership has taken effect, before the
/// final cleanup sweep; a transition that aborts earlier leaves the previous
/// consistent state in place, and an interrupted sweep is re-driven by the
/// next invocation. `active == false` implies every other field is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeState {
    pub active: bool,
    pub services: BTreeSet<String>,
    pub port_by_service: BTreeMap<String, i32>,
    pub merged_pod_ids: BTreeSet<String>,
    pub merged_service_name: String,
}

impl MergeState {
    pub fn is_clear(&self) -> bool {
        !self.active
            && self.services.is_empty()
            && self.port_by_service.is_empty()
            && self.merged_pod_ids.is_empty()
            && self.merged_service_name.is_empty()
    }
}

/// One managed resource as read from the store: declared intent plus the
/// persisted state, and whether the resource is being deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInstance {
    pub id: InstanceId,
    pub intent: Vec<String>,
    pub state: MergeState,
    pub deleting: bool,
}

/// A logical service as seen in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<ServicePortSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePortSpec {
    pub name: String,
    pub port: i32,
    pub target_port: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub name: String,
    pub namespace: String,
    pub template_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSetRecord {
    pub name: String,
    pub namespace: String,
    pub owner: Option<OwnerRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Services to drop from and add to the merge, as computed by [`diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub to_release: Vec<String>,
    pub to_absorb: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.to_release.is_empty() && self.to_absorb.is_empty()
    }
}

/// Pure set difference between the previously merged services and the newly
/// declared ones. Services present in both sets appear in neither output.
pub fn diff(old: &BTreeSet<String>, new: &BTreeSet<String>) -> Delta {
    Delta {
        to_release: old.difference(new).cloned().collect(),
        to_absorb: new.difference(old).cloned().collect(),
    }
}
