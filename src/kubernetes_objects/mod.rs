pub mod client;
pub mod errand_job;
pub mod names;
pub mod references;
pub mod service_account;
pub mod versioned_secret;

/// Field manager used for every write issued by this operator
pub(crate) const FIELD_MANAGER: &str = "errand-operator";

/// Namespace label holding the monitor id of the controller instance watching it
pub const LABEL_MONITORED: &str = "errand.dev/monitored";

/// Namespace label naming the service account mounted into the output sidecar
pub const LABEL_SERVICE_ACCOUNT: &str = "errand.dev/service-account";

/// Label on child jobs and their pods, set to the owning errand's name
pub const LABEL_ERRAND_NAME: &str = "errand.dev/errand-name";

/// Label on persisted secrets naming the container that produced them
pub const LABEL_PERSISTENT_SECRET_CONTAINER: &str = "errand.dev/container-name";

/// Label on persisted secrets copied from the container's `REMOTE_ID` env
pub const LABEL_REMOTE_ID: &str = "errand.dev/remote-id";

/// Container env var whose value becomes the remote id label
pub const REMOTE_ID_KEY: &str = "REMOTE_ID";

/// Env var carrying the namespace into the output sidecar
pub const ENV_NAMESPACE: &str = "NAMESPACE";

/// Name of the injected sidecar container
pub const OUTPUT_PERSIST_CONTAINER: &str = "output-persist";

/// Argument the sidecar runs the operator binary with
pub const PERSIST_OUTPUT_COMMAND: &str = "persist-output";

/// Directory primary containers write their output files into
pub const OUTPUT_MOUNT_PATH: &str = "/mnt/errand";
