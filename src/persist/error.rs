use std::path::PathBuf;

use thiserror::Error;
use tracing_error::{ExtractSpanTrace, SpanTrace};

use crate::error::SpannedErr;
use crate::kubernetes_objects::client::ClientError;
use crate::kubernetes_objects::versioned_secret::VersionedSecretError;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Pod '{namespace}/{name}' not found")]
    PodNotFound {
        namespace: String,
        name: String,
        span_trace: SpanTrace,
    },

    #[error("Pod '{0}' carries no errand label")]
    MissingErrandLabel(String, SpanTrace),

    #[error("Errand '{0}' not found")]
    ErrandNotFound(String, SpanTrace),

    #[error("Errand '{0}' has no uid to own secrets")]
    MissingUid(String, SpanTrace),

    #[error("Kubernetes client error: {0}")]
    Client(#[from] SpannedErr<ClientError>),

    #[error("Cannot watch '{}': {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
        span_trace: SpanTrace,
    },

    #[error("Cannot read output file '{}': {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        span_trace: SpanTrace,
    },

    #[error("Output file '{}' is not a flat JSON object of strings: {source}", path.display())]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
        span_trace: SpanTrace,
    },

    #[error("Key '{key}' of '{}' is not a flat JSON object of strings: {source}", path.display())]
    ParseFanOutValue {
        path: PathBuf,
        key: String,
        #[source]
        source: serde_json::Error,
        span_trace: SpanTrace,
    },

    #[error("Cannot write versioned secret: {0}")]
    VersionedSecret(#[from] SpannedErr<VersionedSecretError>),

    #[error("Container '{container}' did not finish within {secs} seconds")]
    Timeout {
        container: String,
        secs: u64,
        span_trace: SpanTrace,
    },

    #[error("Interrupted by {0}")]
    Cancelled(&'static str),

    #[error("Persist task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ExtractSpanTrace for PersistError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            PersistError::PodNotFound { span_trace, .. } => Some(span_trace),
            PersistError::MissingErrandLabel(_, span_trace) => Some(span_trace),
            PersistError::ErrandNotFound(_, span_trace) => Some(span_trace),
            PersistError::MissingUid(_, span_trace) => Some(span_trace),
            PersistError::Client(e) => e.span_trace(),
            PersistError::Watch { span_trace, .. } => Some(span_trace),
            PersistError::ReadFile { span_trace, .. } => Some(span_trace),
            PersistError::ParseFile { span_trace, .. } => Some(span_trace),
            PersistError::ParseFanOutValue { span_trace, .. } => Some(span_trace),
            PersistError::VersionedSecret(e) => e.span_trace(),
            PersistError::Timeout { span_trace, .. } => Some(span_trace),
            PersistError::Cancelled(_) | PersistError::TaskJoin(_) => None,
        }
    }
}
