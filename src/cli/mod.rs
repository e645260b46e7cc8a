use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::OperatorConfig;
use crate::kubernetes_objects::OUTPUT_MOUNT_PATH;

#[derive(Debug, Parser)]
#[clap(name = "errand-operator", version, about = "Runs errand jobs and persists their output")]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub(crate) subcommand: SubCommands,

    /// YAML config file, defaults are used when the default path is missing
    #[clap(short, long, env = "ERRAND_OPERATOR_CONFIG", global = true)]
    pub(crate) config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub(crate) enum SubCommands {
    /// Run the errand and job controllers
    Operator(OperatorArgs),

    /// Persist the output files of the current pod as secrets
    PersistOutput(PersistOutputArgs),

    /// Print the ErrandJob custom resource definition
    Crd,
}

#[derive(Debug, Clone, clap::Args)]
pub(crate) struct OperatorArgs {
    /// Only watch this namespace
    #[clap(long, env = "WATCH_NAMESPACE")]
    pub(crate) watch_namespace: Option<String>,

    /// Image of the output sidecar
    #[clap(long, env = "OPERATOR_IMAGE")]
    pub(crate) image: Option<String>,

    #[clap(long, env = "MAX_WORKERS")]
    pub(crate) max_workers: Option<u16>,

    /// Monitor id namespaces must carry to be served by this instance
    #[clap(long, env = "MONITORED_ID")]
    pub(crate) monitored_id: Option<String>,
}

impl OperatorArgs {
    /// Flags and env vars win over the config file
    pub(crate) fn apply(self, config: &mut OperatorConfig) {
        if let Some(ns) = self.watch_namespace.filter(|ns| !ns.is_empty()) {
            config.watch_namespace = Some(ns);
        }
        if let Some(image) = self.image {
            config.operator_image = image;
        }
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if let Some(id) = self.monitored_id {
            config.monitored_id = id;
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
pub(crate) struct PersistOutputArgs {
    #[clap(long, env = "NAMESPACE")]
    pub(crate) namespace: String,

    /// Name of the pod the sidecar runs in
    #[clap(long, env = "HOSTNAME")]
    pub(crate) pod_name: String,

    #[clap(long, default_value = OUTPUT_MOUNT_PATH)]
    pub(crate) output_dir: PathBuf,
}
