//! Propagation wait: bounded poll-until-stable over pod membership.
//!
//! After label mutations the cluster rolls the affected deployments; the pod
//! set behind a selector churns until new pods are scheduled and old ones
//! terminate. We re-list at an interval and declare the membership settled
//! once two consecutive reads agree, with an overall deadline.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::ReconcileError;

#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(2000), timeout: Duration::from_secs(120) }
    }
}

impl WaitPolicy {
    pub fn from_env() -> Self {
        let poll_ms: u64 = std::env::var("SVCMERGE_SETTLE_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);
        let timeout_secs: u64 = std::env::var("SVCMERGE_SETTLE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(120);
        Self {
            poll_interval: Duration::from_millis(poll_ms),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Poll `list` until two consecutive reads return the same pod identity set,
/// or fail with `PropagationTimeout` once the deadline passes. Timeout means
/// the whole transition is aborted and retried later; success must never be
/// assumed.
pub(crate) async fn await_settled<F, Fut>(
    policy: WaitPolicy,
    mut list: F,
) -> Result<BTreeSet<String>, ReconcileError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<BTreeSet<String>, ReconcileError>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut prev = list().await?;
    loop {
        if Instant::now() >= deadline {
            return Err(ReconcileError::PropagationTimeout(policy.timeout));
        }
        sleep(policy.poll_interval).await;
        let cur = list().await?;
        if cur == prev {
            return Ok(cur);
        }
        prev = cur;
    }
}
