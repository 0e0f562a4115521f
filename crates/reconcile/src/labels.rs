//! Idempotent merge-marker mutation on deployment pod templates.

use std::collections::HashSet;

use metrics::counter;
use svcmerge_core::store::{ObjectStore, StoreError};
use svcmerge_core::{DeploymentRecord, MERGE_LABEL, MERGE_LABEL_VALUE, ORIGIN_LABEL};
use tracing::debug;

use crate::ReconcileError;

/// Applies or removes the merge markers, touching each deployment at most
/// once per reconciliation pass. Several pods usually map to one deployment;
/// the touched set makes that a single read (and at most one write).
pub(crate) struct LabelMutator<'a, S: ?Sized> {
    store: &'a S,
    namespace: &'a str,
    touched: HashSet<String>,
}

impl<'a, S: ObjectStore + ?Sized> LabelMutator<'a, S> {
    pub(crate) fn new(store: &'a S, namespace: &'a str) -> Self {
        Self { store, namespace, touched: HashSet::new() }
    }

    /// Set `merge=true` and `name=<origin>` on the pod template. No cluster
    /// write if the labels are already in place.
    pub(crate) async fn ensure_merged(
        &mut self,
        deployment: &str,
        origin: &str,
    ) -> Result<(), ReconcileError> {
        if !self.touched.insert(deployment.to_string()) {
            return Ok(());
        }
        let Some(mut dep) = self.store.get_deployment(self.namespace, deployment).await? else {
            debug!(deployment, "deployment vanished before labeling; skipping");
            return Ok(());
        };
        let merged = dep.template_labels.get(MERGE_LABEL).map(String::as_str) == Some(MERGE_LABEL_VALUE)
            && dep.template_labels.get(ORIGIN_LABEL).map(String::as_str) == Some(origin);
        if merged {
            debug!(deployment, origin, "already merged; no write");
            return Ok(());
        }
        dep.template_labels.insert(MERGE_LABEL.to_string(), MERGE_LABEL_VALUE.to_string());
        dep.template_labels.insert(ORIGIN_LABEL.to_string(), origin.to_string());
        if self.write(&dep).await? {
            counter!("deployment_label_writes_total", 1u64, "op" => "merge");
        }
        Ok(())
    }

    /// Remove the merge markers from the pod template. No cluster write if
    /// neither marker is present.
    pub(crate) async fn ensure_released(&mut self, deployment: &str) -> Result<(), ReconcileError> {
        if !self.touched.insert(deployment.to_string()) {
            return Ok(());
        }
        let Some(mut dep) = self.store.get_deployment(self.namespace, deployment).await? else {
            debug!(deployment, "deployment vanished before release; skipping");
            return Ok(());
        };
        let had_merge = dep.template_labels.remove(MERGE_LABEL).is_some();
        let had_origin = dep.template_labels.remove(ORIGIN_LABEL).is_some();
        if !had_merge && !had_origin {
            debug!(deployment, "already released; no write");
            return Ok(());
        }
        if self.write(&dep).await? {
            counter!("deployment_label_writes_total", 1u64, "op" => "release");
        }
        Ok(())
    }

    /// A deployment deleted between our read and the write surfaces as
    /// `NotFound`; the membership is eventually consistent, so that is a
    /// skip, not an abort.
    async fn write(&self, dep: &DeploymentRecord) -> Result<bool, ReconcileError> {
        match self.store.update_deployment(dep).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound { .. }) => {
                debug!(deployment = %dep.name, "deployment vanished during label write; skipping");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
