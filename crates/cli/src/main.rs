//! svcmerged: the ServiceMerge controller daemon.
//!
//! Watches `ServiceMerge` resources and drives each one through the merge
//! lifecycle. Scheduling decisions (requeue, fatal) come out of the
//! reconciler as an `Outcome`; this binary only translates them into
//! controller actions.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use tracing::{error, info, warn};

use svcmerge_core::InstanceId;
use svcmerge_kubehub::{servicemerge_resource, KubeStore};
use svcmerge_reconcile::{Outcome, Reconciler, WaitPolicy};

#[derive(Parser, Debug)]
#[command(name = "svcmerged", version, about = "service merge controller")]
struct Cli {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("SVCMERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SVCMERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SVCMERGE_METRICS_ADDR; expected host:port");
        }
    }
}

struct Ctx {
    reconciler: Reconciler<KubeStore>,
}

/// Surfaced when a resource is declared unreconcilable; the error policy
/// parks it on a slow requeue so a spec edit gets picked up eventually.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct FatalReconcile(String);

async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Ctx>) -> Result<Action, FatalReconcile> {
    let Some(name) = obj.metadata.name.clone() else {
        return Ok(Action::await_change());
    };
    let namespace = obj.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let id = InstanceId::new(namespace, name);

    match ctx.reconciler.reconcile(&id).await {
        Outcome::Done => Ok(Action::await_change()),
        Outcome::RetryAfter(after) => Ok(Action::requeue(after)),
        Outcome::Fatal(reason) => Err(FatalReconcile(reason)),
    }
}

fn error_policy(obj: Arc<DynamicObject>, err: &FatalReconcile, _ctx: Arc<Ctx>) -> Action {
    warn!(
        object = obj.metadata.name.as_deref().unwrap_or("<unnamed>"),
        error = %err,
        "reconcile declared fatal; parking"
    );
    Action::requeue(Duration::from_secs(300))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let store = KubeStore::try_default().await?;
    let client = store.client();
    let reconciler = Reconciler::new(Arc::new(store), WaitPolicy::from_env());
    let ctx = Arc::new(Ctx { reconciler });

    let ar = servicemerge_resource();
    let api: Api<DynamicObject> = match &cli.namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    info!(
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        "svcmerged starting"
    );

    Controller::new_with(api, watcher::Config::default(), ar)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => info!(object = %obj.name, "reconciled"),
                Err(e) => error!(error = %e, "reconcile stream error"),
            }
        })
        .await;

    info!("svcmerged stopped");
    Ok(())
}
