pub mod error;
pub mod errand_reconciler;
pub mod job_creator;
pub mod job_reconciler;
pub mod meltdown;
pub mod reference_predicate;

use std::sync::Arc;

use derive_debug::Dbg;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::Controller;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client};
use tracing::{debug, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::kubernetes_objects::LABEL_ERRAND_NAME;
use crate::kubernetes_objects::client::{ClusterClient, KubeClusterClient};
use crate::kubernetes_objects::errand_job::ErrandJob;
use crate::kubernetes_objects::versioned_secret::{
    KubeVersionedSecretStore, VersionedSecretStore,
};

use self::job_creator::JobCreator;
use self::reference_predicate::reference_triggers;

/// Shared state of the errand and job controllers
#[derive(Dbg)]
pub struct Context {
    #[dbg(skip)]
    pub client: Arc<dyn ClusterClient>,
    pub creator: JobCreator,
    pub config: Arc<OperatorConfig>,
}

impl Context {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn VersionedSecretStore>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            creator: JobCreator::new(client.clone(), store, config.clone()),
            client,
            config,
        }
    }
}

pub(crate) fn api<K>(client: &Client, config: &OperatorConfig) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match &config.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Runs the errand and job controllers until a shutdown signal arrives
#[instrument("operator", skip(client, config))]
pub async fn run(client: Client, config: OperatorConfig) {
    let config = Arc::new(config);
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let store: Arc<dyn VersionedSecretStore> =
        Arc::new(KubeVersionedSecretStore::new(cluster.clone()));
    let ctx = Arc::new(Context::new(cluster.clone(), store, config.clone()));

    let controller_config = ControllerConfig::default().concurrency(config.max_workers);

    info!(
        "Starting controllers (monitored id '{}', namespace {}, {} worker(s)).",
        config.monitored_id,
        config.watch_namespace.as_deref().unwrap_or("<all>"),
        config.max_workers
    );

    let errands = Controller::new(api::<ErrandJob>(&client, &config), WatcherConfig::default())
        .with_config(controller_config.clone())
        .reconcile_on(reference_triggers(
            client.clone(),
            cluster.clone(),
            config.clone(),
        ))
        .shutdown_on_signal()
        .run(
            errand_reconciler::reconcile,
            errand_reconciler::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("ErrandJob"));

    let jobs = Controller::new(
        api::<Job>(&client, &config),
        WatcherConfig::default().labels(LABEL_ERRAND_NAME),
    )
    .with_config(controller_config)
    .shutdown_on_signal()
    .run(job_reconciler::reconcile, job_reconciler::error_policy, ctx)
    .for_each(log_reconcile_result("Job"));

    futures::join!(errands, jobs);
    info!("Controllers stopped.");
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => debug!("{} reconciled: {:?}", controller_name, object),
            Err(e) => warn!("{} reconcile failed: {}", controller_name, e),
        }
        std::future::ready(())
    }
}
