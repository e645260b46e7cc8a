//! Trigger state machine of `ErrandJob`s.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};
use tracing_error::SpanTrace;

use crate::error::SpannedExt;
use crate::kubernetes_objects::errand_job::{
    ErrandJob, ErrandJobStatus, Strategy, is_monitored_namespace,
};

use super::Context;
use super::error::ReconcileError;
use super::job_creator::{JobCreation, References};
use super::meltdown::MeltdownWindow;

#[instrument(
    "errand/reconcile",
    skip(errand, ctx),
    fields(
        kubernetes_namespace = %errand.namespace().unwrap_or_default(),
        errand_name = %errand.name_any()
    )
)]
pub async fn reconcile(errand: Arc<ErrandJob>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = errand
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(SpanTrace::capture()))?;
    let name = errand.name_any();
    let timeout = ctx.config.timing.ctx_timeout;

    match tokio::time::timeout(timeout, reconcile_errand(&ctx, &namespace, &name, Utc::now())).await
    {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout(timeout, SpanTrace::capture())),
    }
}

pub fn error_policy(errand: Arc<ErrandJob>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    error!(
        "Failed to reconcile errand '{}': {}",
        errand.namespaced_name(),
        error
    );
    Action::requeue(ctx.config.timing.error_requeue)
}

pub(crate) async fn reconcile_errand(
    ctx: &Context,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    info!("Reconciling errand '{}/{}'.", namespace, name);

    let Some(errand) = ctx.client.get_errand(namespace, name).await.with_span_trace()? else {
        info!("Errand '{}/{}' not found, not retrying.", namespace, name);
        return Ok(Action::await_change());
    };
    if errand.to_be_deleted() {
        debug!("Errand '{}' is being deleted, skipping.", errand.namespaced_name());
        return Ok(Action::await_change());
    }

    let monitored = ctx
        .client
        .get_namespace(namespace)
        .await
        .with_span_trace()?
        .is_some_and(|ns| is_monitored_namespace(&ns, &ctx.config.monitored_id));
    if !monitored {
        debug!("Namespace '{}' is not monitored, skipping.", namespace);
        return Ok(Action::await_change());
    }

    let window = MeltdownWindow::new(errand.last_reconcile(), ctx.config.timing.meltdown_duration);
    if let Some(remaining) = window.remaining(now) {
        info!("Meltdown in progress for '{}'.", errand.namespaced_name());
        return Ok(Action::requeue(remaining));
    }

    let strategy = errand.strategy();
    match strategy {
        Strategy::Manual => {
            debug!("Errand '{}' is manual, nothing to do.", errand.namespaced_name());
            return Ok(Action::await_change());
        }
        Strategy::Done => {
            if let Some(action) = skip_done_errand(ctx, &errand, now).await? {
                return Ok(action);
            }
            info!(
                "References of '{}' changed, running it again.",
                errand.namespaced_name()
            );
        }
        Strategy::Now => {
            // The request stays pending until every reference exists.
            let references = ctx
                .creator
                .observe_references(&errand)
                .await
                .with_span_trace()
                .map_err(|e| ReconcileError::CreateJob(errand.namespaced_name(), e))?;
            if let References::Missing(missing) = references {
                info!(
                    "Waiting to run '{}': {} '{}' not found.",
                    errand.namespaced_name(),
                    missing.kind,
                    missing.name
                );
                return Ok(Action::requeue(ctx.config.timing.reference_retry));
            }
            ctx.client
                .update_errand_strategy(namespace, name, Strategy::Now, Strategy::Manual)
                .await
                .with_span_trace()
                .map_err(|e| ReconcileError::ResetStrategy(errand.namespaced_name(), e))?;
        }
        Strategy::Once => {}
    }

    let creation = ctx
        .creator
        .create(&errand)
        .await
        .with_span_trace()
        .map_err(|e| ReconcileError::CreateJob(errand.namespaced_name(), e))?;

    let references = match creation {
        JobCreation::Created {
            job_name,
            references,
        } => {
            info!(
                "Created job '{}' for errand '{}'.",
                job_name,
                errand.namespaced_name()
            );
            references
        }
        JobCreation::AlreadyRunning => return Ok(Action::await_change()),
        JobCreation::MissingReference(missing) => {
            info!(
                "Retrying to create job for '{}': {} '{}' not found.",
                errand.namespaced_name(),
                missing.kind,
                missing.name
            );
            return Ok(Action::requeue(ctx.config.timing.reference_retry));
        }
    };

    if strategy == Strategy::Once {
        if let Err(e) = ctx
            .client
            .update_errand_strategy(namespace, name, Strategy::Once, Strategy::Done)
            .await
        {
            error!(
                "Failed to traverse errand '{}' to 'done': {}",
                errand.namespaced_name(),
                e
            );
            return Ok(Action::await_change());
        }
    }

    let status = ErrandJobStatus {
        last_reconcile: Some(now),
        completed: false,
        observed_references: references,
    };
    if let Err(e) = ctx
        .client
        .replace_errand_status(namespace, name, &status)
        .await
    {
        error!(
            "Failed to update status of errand '{}': {}",
            errand.namespaced_name(),
            e
        );
    }

    Ok(Action::await_change())
}

/// Returns the action to take instead of running a `done` errand, or `None`
/// if its references changed since the last run.
async fn skip_done_errand(
    ctx: &Context,
    errand: &ErrandJob,
    now: DateTime<Utc>,
) -> Result<Option<Action>, ReconcileError> {
    if !errand.spec.update_on_config_change {
        return Ok(Some(Action::await_change()));
    }

    let references = ctx
        .creator
        .observe_references(errand)
        .await
        .with_span_trace()
        .map_err(|e| ReconcileError::CreateJob(errand.namespaced_name(), e))?;

    let current = match references {
        References::Resolved(current) => current,
        References::Missing(missing) => {
            info!(
                "Cannot compare references of '{}': {} '{}' not found.",
                errand.namespaced_name(),
                missing.kind,
                missing.name
            );
            return Ok(Some(Action::requeue(ctx.config.timing.reference_retry)));
        }
    };

    if errand.last_reconcile().is_none() {
        // Nothing recorded yet, the current state becomes the baseline.
        let status = ErrandJobStatus {
            last_reconcile: Some(now),
            completed: errand.status.as_ref().is_some_and(|s| s.completed),
            observed_references: current,
        };
        let namespace = errand.namespace().unwrap_or_default();
        if let Err(e) = ctx
            .client
            .replace_errand_status(&namespace, &errand.name_any(), &status)
            .await
        {
            warn!(
                "Failed to record references of errand '{}': {}",
                errand.namespaced_name(),
                e
            );
        }
        return Ok(Some(Action::await_change()));
    }

    if errand.observed_references() == Some(&current) {
        return Ok(Some(Action::await_change()));
    }
    Ok(None)
}
