//! Cleanup of child jobs once they reached a final state.

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{error, info, instrument, warn};
use tracing_error::SpanTrace;

use crate::error::SpannedExt;

use super::Context;
use super::error::ReconcileError;

/// Pod template label requesting removal of the pod of a succeeded job
pub const LABEL_DELETE: &str = "delete";
pub const DELETE_POD: &str = "pod";

const DEFAULT_BACKOFF_LIMIT: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalState {
    Succeeded,
    Failed,
}

fn final_state(job: &Job) -> Option<FinalState> {
    let status = job.status.as_ref()?;
    if status.succeeded == Some(1) {
        return Some(FinalState::Succeeded);
    }
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|s| s.backoff_limit)
        .unwrap_or(DEFAULT_BACKOFF_LIMIT);
    if status.failed.unwrap_or(0) > backoff_limit {
        return Some(FinalState::Failed);
    }
    None
}

#[instrument(
    "job/reconcile",
    skip(job, ctx),
    fields(
        kubernetes_namespace = %job.namespace().unwrap_or_default(),
        job_name = %job.name_any()
    )
)]
pub async fn reconcile(job: Arc<Job>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let timeout = ctx.config.timing.ctx_timeout;
    match tokio::time::timeout(timeout, reconcile_job(&ctx, &job)).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout(timeout, SpanTrace::capture())),
    }
}

pub fn error_policy(job: Arc<Job>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    error!(
        "Failed to reconcile job '{}/{}': {}",
        job.namespace().unwrap_or_default(),
        job.name_any(),
        error
    );
    Action::requeue(ctx.config.timing.error_requeue)
}

pub(crate) async fn reconcile_job(ctx: &Context, job: &Job) -> Result<Action, ReconcileError> {
    if job.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let Some(state) = final_state(job) else {
        return Ok(Action::await_change());
    };

    let namespace = job
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(SpanTrace::capture()))?;
    let name = job.name_any();
    info!("Reconciling finished job '{}/{}'.", namespace, name);

    let parent_name = job
        .owner_references()
        .iter()
        .find(|o| o.controller == Some(true))
        .map(|o| o.name.clone())
        .ok_or_else(|| ReconcileError::MissingOwner(name.clone(), SpanTrace::capture()))?;

    let parent = ctx
        .client
        .get_errand(&namespace, &parent_name)
        .await
        .with_span_trace()?;
    if parent.is_none() {
        info!(
            "Parent errand '{}' of job '{}' not found, cleaning up anyway.",
            parent_name, name
        );
    }

    if state == FinalState::Failed {
        info!("Keeping failed job '{}' for inspection.", name);
        return Ok(Action::await_change());
    }

    info!("Deleting succeeded job '{}'.", name);
    if let Err(e) = ctx.client.delete_job(&namespace, &name).await {
        error!("Cannot delete succeeded job '{}': {}", name, e);
    }

    if parent.is_some() {
        if let Err(e) = ctx
            .client
            .mark_errand_completed(&namespace, &parent_name)
            .await
        {
            warn!(
                "Cannot mark errand '{}' completed: {}",
                parent_name, e
            );
        }
    }

    let delete_pod = job
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
        .and_then(|l| l.get(LABEL_DELETE))
        .is_some_and(|v| v == DELETE_POD);
    if delete_pod {
        delete_latest_pod(ctx, &namespace, &name).await;
    }

    Ok(Action::await_change())
}

async fn delete_latest_pod(ctx: &Context, namespace: &str, job_name: &str) {
    let pods = match ctx
        .client
        .list_pods(namespace, &format!("job-name={job_name}"))
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            error!("Cannot list pods of job '{}': {}", job_name, e);
            return;
        }
    };

    let Some(pod) = pods
        .into_iter()
        .max_by_key(|p| p.metadata.creation_timestamp.clone())
    else {
        error!("Job '{}' does not own any pods.", job_name);
        return;
    };

    let pod_name = pod.name_any();
    info!("Deleting pod '{}' of succeeded job '{}'.", pod_name, job_name);
    if let Err(e) = ctx.client.delete_pod(namespace, &pod_name).await {
        error!("Cannot delete pod '{}': {}", pod_name, e);
    }
}
