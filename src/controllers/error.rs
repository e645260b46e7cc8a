use std::time::Duration;

use thiserror::Error;
use tracing_error::{ExtractSpanTrace, SpanTrace};

use crate::error::SpannedErr;
use crate::kubernetes_objects::client::ClientError;
use crate::kubernetes_objects::service_account::ServiceAccountError;
use crate::kubernetes_objects::versioned_secret::VersionedSecretError;

#[derive(Error, Debug)]
pub enum CreateJobError {
    #[error("Errand '{0}' has no pod template")]
    MissingPodSpec(String),

    #[error("Errand '{0}' has no uid to own its job")]
    MissingOwner(String),

    #[error("Cannot mount service account: {0}")]
    ServiceAccount(#[from] ServiceAccountError),

    #[error("Cannot resolve versioned secrets: {0}")]
    VersionedSecret(#[from] VersionedSecretError),

    #[error("Kubernetes client error: {0}")]
    Client(#[from] ClientError),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Kubernetes client error: {0}")]
    Client(SpannedErr<ClientError>),

    #[error("Failed to create job for errand '{0}': {1}")]
    CreateJob(String, SpannedErr<CreateJobError>),

    #[error("Failed to reset trigger strategy of errand '{0}': {1}")]
    ResetStrategy(String, SpannedErr<ClientError>),

    #[error("Job '{0}' has no controlling errand")]
    MissingOwner(String, SpanTrace),

    #[error("Object has no namespace")]
    MissingNamespace(SpanTrace),

    #[error("Reconcile did not finish within {} seconds", .0.as_secs())]
    Timeout(Duration, SpanTrace),
}

impl ExtractSpanTrace for ReconcileError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            ReconcileError::Client(e) => e.span_trace(),
            ReconcileError::CreateJob(_, e) => e.span_trace(),
            ReconcileError::ResetStrategy(_, e) => e.span_trace(),
            ReconcileError::MissingOwner(_, span_trace) => Some(span_trace),
            ReconcileError::MissingNamespace(span_trace) => Some(span_trace),
            ReconcileError::Timeout(_, span_trace) => Some(span_trace),
        }
    }
}

impl From<SpannedErr<ClientError>> for ReconcileError {
    fn from(e: SpannedErr<ClientError>) -> Self {
        ReconcileError::Client(e)
    }
}
