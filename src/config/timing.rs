use duration_str::deserialize_duration;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct TimingConfig {
    /// Upper bound of a single reconcile pass
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_ctx_timeout"
    )]
    pub ctx_timeout: Duration,

    /// Minimum time between two job creations for the same errand
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_meltdown_duration"
    )]
    pub meltdown_duration: Duration,

    /// Requeue delay while a referenced ConfigMap or Secret is missing
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_reference_retry"
    )]
    pub reference_retry: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_error_requeue"
    )]
    pub error_requeue: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_pod_poll_interval"
    )]
    pub pod_poll_interval: Duration,

    /// How long the output sidecar waits for files and container exit
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_output_wait_timeout"
    )]
    pub output_wait_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ctx_timeout: default_ctx_timeout(),
            meltdown_duration: default_meltdown_duration(),
            reference_retry: default_reference_retry(),
            error_requeue: default_error_requeue(),
            pod_poll_interval: default_pod_poll_interval(),
            output_wait_timeout: default_output_wait_timeout(),
        }
    }
}

const fn default_ctx_timeout() -> Duration {
    Duration::from_secs(30)
}
const fn default_meltdown_duration() -> Duration {
    Duration::from_secs(10)
}
const fn default_reference_retry() -> Duration {
    Duration::from_secs(5)
}
const fn default_error_requeue() -> Duration {
    Duration::from_secs(30)
}
const fn default_pod_poll_interval() -> Duration {
    Duration::from_secs(1)
}
const fn default_output_wait_timeout() -> Duration {
    Duration::from_secs(3600)
}
