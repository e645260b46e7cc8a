use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{error, info, instrument, trace, warn};
use tracing_error::SpanTrace;

use crate::error::SpannedExt;
use crate::kubernetes_objects::client::ClusterClient;

use super::error::PersistError;

const MAX_POLL_ERRORS: u64 = 10;

/// Exit code of `container`, if it terminated
fn terminated_exit_code(pod: &Pod, container: &str) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == container)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

/// Polls the pod until `container` has terminated and returns its exit code
#[instrument("persist/wait_for_exit_code", skip(client), level = "trace")]
pub async fn wait_for_exit_code(
    client: &dyn ClusterClient,
    namespace: &str,
    pod_name: &str,
    container: &str,
    interval: Duration,
) -> Result<i32, PersistError> {
    let mut errors_count = 0u64;
    loop {
        match client.get_pod(namespace, pod_name).await {
            Ok(Some(pod)) => {
                errors_count = 0;
                if let Some(code) = terminated_exit_code(&pod, container) {
                    info!("Container '{}' exited with code {}.", container, code);
                    return Ok(code);
                }
                trace!("Container '{}' still running.", container);
            }
            Ok(None) => {
                return Err(PersistError::PodNotFound {
                    namespace: namespace.to_string(),
                    name: pod_name.to_string(),
                    span_trace: SpanTrace::capture(),
                });
            }
            Err(e) => {
                warn!("Error while checking pod '{}': {}", pod_name, e);
                errors_count += 1;
                if errors_count >= MAX_POLL_ERRORS {
                    error!(
                        "Failed to check pod '{}' {} times in a row. Aborting wait.",
                        pod_name, MAX_POLL_ERRORS
                    );
                    return Err(e).with_span_trace().map_err(PersistError::Client);
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}
