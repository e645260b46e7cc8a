use std::sync::Arc;

use self::cli::{Cli, SubCommands};
use self::kubernetes_objects::client::{ClusterClient, KubeClusterClient};
use self::kubernetes_objects::errand_job::ErrandJob;
use self::kubernetes_objects::versioned_secret::KubeVersionedSecretStore;
use self::persist::{OutputPersistor, PersistTarget};
use self::shutdown::Shutdown;
use clap::Parser;
use kube::CustomResourceExt;
use thiserror::Error;
use tracing::info;
use tracing_error::ExtractSpanTrace;
use tracing_error::SpanTrace;

pub mod cli;
pub mod config;
pub mod controllers;
pub mod error;
pub mod kubernetes_objects;
pub mod persist;
pub mod shutdown;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to load config.\n{0}")]
    ConfigError(#[from] config::ConfigLoadError),

    #[error("Failed to initialize kubernetes client.\n{0}")]
    KubeClientError(#[from] kube::Error),

    #[error("Persisting output stopped due to following error:\n{0}")]
    Persist(#[from] persist::error::PersistError),

    #[error("Failed to render custom resource definition.\n{0}")]
    Crd(#[from] serde_yaml::Error),
}

impl ExtractSpanTrace for AppError {
    fn span_trace(&self) -> Option<&SpanTrace> {
        match self {
            AppError::Persist(e) => e.span_trace(),
            _ => None,
        }
    }
}

pub async fn app() -> Result<(), AppError> {
    let cli = Cli::parse();

    if let SubCommands::Crd = cli.subcommand {
        print!("{}", serde_yaml::to_string(&ErrandJob::crd())?);
        return Ok(());
    }

    let mut config = config::OperatorConfig::load(cli.config.as_deref()).await?;

    info!("Config Loaded.");

    let client = kube::Client::try_default().await?;

    info!("Kubernetes Client Initialized.");

    match cli.subcommand {
        SubCommands::Operator(args) => {
            args.apply(&mut config);
            config.validate()?;
            controllers::run(client, config).await;
        }
        SubCommands::PersistOutput(args) => {
            let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client));
            let store = Arc::new(KubeVersionedSecretStore::new(cluster.clone()));
            let target = PersistTarget {
                namespace: args.namespace,
                pod_name: args.pod_name,
                output_dir: args.output_dir,
                poll_interval: config.timing.pod_poll_interval,
                wait_timeout: config.timing.output_wait_timeout,
            };
            OutputPersistor::new(cluster, store, target, Shutdown::new())
                .persist()
                .await?;
            info!("Output persisted.");
        }
        SubCommands::Crd => {}
    }

    Ok(())
}
