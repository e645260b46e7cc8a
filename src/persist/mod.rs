//! Output sidecar: waits for the primary containers of its pod to finish and
//! persists the files they wrote as secrets.

pub mod error;
pub mod exit_code;
pub mod file_watch;
pub mod secrets;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_debug::Dbg;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, instrument};
use tracing_error::SpanTrace;

use crate::error::SpannedExt;
use crate::kubernetes_objects::client::ClusterClient;
use crate::kubernetes_objects::errand_job::{FilesToSecrets, Output};
use crate::kubernetes_objects::versioned_secret::VersionedSecretStore;
use crate::kubernetes_objects::{LABEL_ERRAND_NAME, OUTPUT_PERSIST_CONTAINER};
use crate::shutdown::Shutdown;

use self::error::PersistError;
use self::exit_code::wait_for_exit_code;
use self::file_watch::wait_for_files;
use self::secrets::{SecretWriter, read_output_file, secret_labels, should_persist, split_output};

/// Where the sidecar runs and how long it waits
#[derive(Debug, Clone)]
pub struct PersistTarget {
    pub namespace: String,
    pub pod_name: String,
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

#[derive(Dbg, Clone)]
pub struct OutputPersistor {
    #[dbg(skip)]
    client: Arc<dyn ClusterClient>,
    #[dbg(skip)]
    store: Arc<dyn VersionedSecretStore>,
    target: Arc<PersistTarget>,
    #[dbg(skip)]
    shutdown: Shutdown,
}

/// Everything one container task needs
struct ContainerJob {
    container: Container,
    files: FilesToSecrets,
    output: Arc<Output>,
    owner: Arc<OwnerReference>,
    errand_name: Arc<str>,
}

impl OutputPersistor {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn VersionedSecretStore>,
        target: PersistTarget,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            client,
            store,
            target: Arc::new(target),
            shutdown,
        }
    }

    /// Persists the output of every primary container listed in the errand's output map.
    ///
    /// Containers are handled concurrently and the first failure is returned
    /// after all of them finished.
    #[instrument(
        "persist",
        skip(self),
        fields(
            kubernetes_namespace = %self.target.namespace,
            pod_name = %self.target.pod_name
        )
    )]
    pub async fn persist(&self) -> Result<(), PersistError> {
        let target = &self.target;
        let pod = self
            .client
            .get_pod(&target.namespace, &target.pod_name)
            .await
            .with_span_trace()?
            .ok_or_else(|| PersistError::PodNotFound {
                namespace: target.namespace.clone(),
                name: target.pod_name.clone(),
                span_trace: SpanTrace::capture(),
            })?;

        let errand_name = pod.labels().get(LABEL_ERRAND_NAME).cloned().ok_or_else(|| {
            PersistError::MissingErrandLabel(target.pod_name.clone(), SpanTrace::capture())
        })?;
        let errand = self
            .client
            .get_errand(&target.namespace, &errand_name)
            .await
            .with_span_trace()?
            .ok_or_else(|| PersistError::ErrandNotFound(errand_name.clone(), SpanTrace::capture()))?;

        let Some(output) = errand.spec.output.clone() else {
            info!("Errand '{}' declares no output, nothing to persist.", errand_name);
            return Ok(());
        };
        let output = Arc::new(output);
        let owner = errand
            .controller_owner_ref(&())
            .map(Arc::new)
            .ok_or_else(|| PersistError::MissingUid(errand_name.clone(), SpanTrace::capture()))?;
        let errand_name: Arc<str> = errand_name.into();

        let mut tasks = JoinSet::new();
        for container in pod.spec.map(|s| s.containers).unwrap_or_default() {
            if container.name == OUTPUT_PERSIST_CONTAINER {
                continue;
            }
            let Some(files) = output.output_map.get(&container.name).cloned() else {
                continue;
            };
            let span = info_span!("persist/container", container_name = %container.name);
            let job = ContainerJob {
                container,
                files,
                output: output.clone(),
                owner: owner.clone(),
                errand_name: errand_name.clone(),
            };
            let persistor = self.clone();
            tasks.spawn(async move { persistor.persist_container(job).await }.instrument(span));
        }

        let spawned = tasks.len();
        info!("Persisting output of {} container(s).", spawned);

        let mut first_error = None;
        while let Some(result) = tasks.join_next().await {
            let result = result.map_err(PersistError::from).and_then(|r| r);
            if let Err(e) = result {
                error!("Persisting container output failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn persist_container(&self, job: ContainerJob) -> Result<(), PersistError> {
        let target = &self.target;
        let container_name = job.container.name.clone();
        let dir = target.output_dir.join(&container_name);
        let paths: Vec<PathBuf> = job.files.keys().map(|f| dir.join(f)).collect();
        let deadline = Instant::now() + target.wait_timeout;

        self.bounded(&container_name, deadline, wait_for_files(&dir, &paths, target.poll_interval))
            .await?;
        let exit_code = self
            .bounded(
                &container_name,
                deadline,
                wait_for_exit_code(
                    self.client.as_ref(),
                    &target.namespace,
                    &target.pod_name,
                    &container_name,
                    target.poll_interval,
                ),
            )
            .await?;

        if !should_persist(exit_code, job.output.write_on_failure) {
            info!(
                "Not persisting output of '{}', it exited with code {}.",
                container_name, exit_code
            );
            return Ok(());
        }

        let writer = SecretWriter {
            client: self.client.as_ref(),
            store: self.store.as_ref(),
            namespace: &target.namespace,
            owner: &job.owner,
            errand_name: &job.errand_name,
        };
        for (file, options) in &job.files {
            let path = dir.join(file);
            let data = read_output_file(&path).await?;
            let labels = secret_labels(&job.output, options, &job.container);
            for (name, data) in split_output(&path, data, options)? {
                writer.write(&name, data, labels.clone(), options).await?;
            }
        }
        Ok(())
    }

    /// Runs `fut` until `deadline` or shutdown, whichever comes first
    async fn bounded<T>(
        &self,
        container: &str,
        deadline: Instant,
        fut: impl Future<Output = Result<T, PersistError>>,
    ) -> Result<T, PersistError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            result = tokio::time::timeout_at(deadline, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(PersistError::Timeout {
                    container: container.to_string(),
                    secs: self.target.wait_timeout.as_secs(),
                    span_trace: SpanTrace::capture(),
                }),
            },
            signal = shutdown.wait() => Err(PersistError::Cancelled(signal)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes_objects::client::MockClusterClient;
    use crate::kubernetes_objects::errand_job::{
        ErrandJob, PersistenceMethod, SecretOptions, Strategy,
    };
    use crate::kubernetes_objects::versioned_secret::{
        MockVersionedSecretStore, VersionedSecretError,
    };
    use crate::kubernetes_objects::LABEL_PERSISTENT_SECRET_CONTAINER;
    use crate::controllers::job_creator::tests::errand;
    use k8s_openapi::api::core::v1::{Pod, Secret};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::sync::watch;

    fn pod(containers: &[&str], exit_code: i32) -> Pod {
        let specs: Vec<_> = containers
            .iter()
            .map(|name| json!({ "name": name, "image": "busybox" }))
            .collect();
        let statuses: Vec<_> = containers
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "image": "busybox",
                    "imageID": "",
                    "ready": false,
                    "restartCount": 0,
                    "state": { "terminated": { "exitCode": exit_code } }
                })
            })
            .collect();
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "generate-job-abc",
                "namespace": "ns",
                "labels": { "errand.dev/errand-name": "generate" }
            },
            "spec": { "containers": specs },
            "status": { "containerStatuses": statuses }
        }))
        .unwrap()
    }

    fn errand_with_output(output: Option<Output>) -> ErrandJob {
        let mut errand = errand(Strategy::Once);
        errand.spec.output = output;
        errand
    }

    fn output(container: &str, file: &str, options: SecretOptions, write_on_failure: bool) -> Output {
        Output {
            output_map: BTreeMap::from([(
                container.to_string(),
                BTreeMap::from([(file.to_string(), options)]),
            )]),
            write_on_failure,
            ..Default::default()
        }
    }

    fn one_to_one(name: &str) -> SecretOptions {
        SecretOptions {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn client_for(pod: Pod, errand: ErrandJob) -> (MockClusterClient, Arc<Mutex<Vec<Secret>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let mut client = MockClusterClient::new();
        client
            .expect_get_pod()
            .withf(|ns, name| ns == "ns" && name == "generate-job-abc")
            .returning(move |_, _| Ok(Some(pod.clone())));
        client
            .expect_get_errand()
            .withf(|ns, name| ns == "ns" && name == "generate")
            .returning(move |_, _| Ok(Some(errand.clone())));
        client.expect_apply_secret().returning(move |_, secret| {
            sink.lock().unwrap().push(secret.clone());
            Ok(())
        });
        (client, applied)
    }

    fn persistor(
        client: MockClusterClient,
        store: MockVersionedSecretStore,
        output_dir: &Path,
        wait_timeout: Duration,
    ) -> OutputPersistor {
        let (_tx, rx) = watch::channel(None);
        OutputPersistor::new(
            Arc::new(client),
            Arc::new(store),
            PersistTarget {
                namespace: "ns".to_string(),
                pod_name: "generate-job-abc".to_string(),
                output_dir: output_dir.to_path_buf(),
                poll_interval: Duration::from_millis(10),
                wait_timeout,
            },
            Shutdown::from_receiver(rx),
        )
    }

    fn write_output(dir: &Path, container: &str, file: &str, content: &str) {
        let container_dir = dir.join(container);
        std::fs::create_dir_all(&container_dir).unwrap();
        std::fs::write(container_dir.join(file), content).unwrap();
    }

    fn secret_data(secret: &Secret, key: &str) -> String {
        String::from_utf8(secret.data.as_ref().unwrap()[key].0.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_persists_output_as_secret() {
        let dir = tempfile::tempdir().unwrap();
        write_output(dir.path(), "busybox", "output.json", r#"{"hello":"world"}"#);
        let (client, applied) = client_for(
            pod(&["busybox", OUTPUT_PERSIST_CONTAINER], 0),
            errand_with_output(Some(output("busybox", "output.json", one_to_one("foo"), false))),
        );

        persistor(client, MockVersionedSecretStore::new(), dir.path(), Duration::from_secs(5))
            .persist()
            .await
            .unwrap();

        let applied = applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].metadata.name.as_deref(), Some("foo"));
        assert_eq!(secret_data(&applied[0], "hello"), "world");
        assert_eq!(
            applied[0].labels()[LABEL_PERSISTENT_SECRET_CONTAINER],
            "busybox"
        );
    }

    #[tokio::test]
    async fn test_fan_out_creates_secret_per_key() {
        let dir = tempfile::tempdir().unwrap();
        write_output(
            dir.path(),
            "busybox",
            "links.json",
            r#"{"a":"{\"user\":\"admin\"}","b":"{\"port\":\"8080\"}"}"#,
        );
        let options = SecretOptions {
            name: "link".to_string(),
            persistence_method: PersistenceMethod::FanOut,
            ..Default::default()
        };
        let (client, applied) = client_for(
            pod(&["busybox"], 0),
            errand_with_output(Some(output("busybox", "links.json", options, false))),
        );

        persistor(client, MockVersionedSecretStore::new(), dir.path(), Duration::from_secs(5))
            .persist()
            .await
            .unwrap();

        let applied = applied.lock().unwrap();
        let names: Vec<_> = applied
            .iter()
            .map(|s| s.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["link-a", "link-b"]);
        assert_eq!(secret_data(&applied[0], "user"), "admin");
        assert_eq!(secret_data(&applied[1], "port"), "8080");
    }

    #[tokio::test]
    async fn test_failed_container_output_needs_write_on_failure() {
        for (exit_code, write_on_failure, expected) in
            [(1, false, 0), (1, true, 1), (2, true, 0)]
        {
            let dir = tempfile::tempdir().unwrap();
            write_output(dir.path(), "busybox", "output.json", r#"{"hello":"world"}"#);
            let (client, applied) = client_for(
                pod(&["busybox"], exit_code),
                errand_with_output(Some(output(
                    "busybox",
                    "output.json",
                    one_to_one("foo"),
                    write_on_failure,
                ))),
            );

            persistor(client, MockVersionedSecretStore::new(), dir.path(), Duration::from_secs(5))
                .persist()
                .await
                .unwrap();

            assert_eq!(
                applied.lock().unwrap().len(),
                expected,
                "exit code {exit_code}, writeOnFailure {write_on_failure}"
            );
        }
    }

    #[tokio::test]
    async fn test_errand_without_output_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (client, applied) = client_for(pod(&["busybox"], 0), errand_with_output(None));

        persistor(client, MockVersionedSecretStore::new(), dir.path(), Duration::from_secs(5))
            .persist()
            .await
            .unwrap();
        assert!(applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_listed_containers_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let (client, applied) = client_for(
            pod(&["other", OUTPUT_PERSIST_CONTAINER], 0),
            errand_with_output(Some(output("busybox", "output.json", one_to_one("foo"), false))),
        );

        persistor(client, MockVersionedSecretStore::new(), dir.path(), Duration::from_secs(5))
            .persist()
            .await
            .unwrap();
        assert!(applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identical_versioned_secret_is_success() {
        let dir = tempfile::tempdir().unwrap();
        write_output(dir.path(), "busybox", "output.json", r#"{"hello":"world"}"#);
        let options = SecretOptions {
            name: "foo".to_string(),
            versioned: true,
            ..Default::default()
        };
        let (client, applied) = client_for(
            pod(&["busybox"], 0),
            errand_with_output(Some(output("busybox", "output.json", options, false))),
        );

        let mut store = MockVersionedSecretStore::new();
        store
            .expect_create()
            .withf(|ns, owner, version| {
                ns == "ns"
                    && owner.kind == "ErrandJob"
                    && owner.name == "generate"
                    && version.name == "foo"
                    && version.data["hello"] == "world"
            })
            .times(1)
            .returning(|_, _, _| {
                Err(VersionedSecretError::Identical {
                    name: "foo".to_string(),
                })
            });

        persistor(client, store, dir.path(), Duration::from_secs(5))
            .persist()
            .await
            .unwrap();
        assert!(applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("busybox")).unwrap();
        let (client, applied) = client_for(
            pod(&["busybox"], 0),
            errand_with_output(Some(output("busybox", "output.json", one_to_one("foo"), false))),
        );

        let result = persistor(
            client,
            MockVersionedSecretStore::new(),
            dir.path(),
            Duration::from_millis(100),
        )
        .persist()
        .await;

        assert!(matches!(result, Err(PersistError::Timeout { .. })));
        assert!(applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("busybox")).unwrap();
        let (client, _) = client_for(
            pod(&["busybox"], 0),
            errand_with_output(Some(output("busybox", "output.json", one_to_one("foo"), false))),
        );
        let (tx, rx) = watch::channel(None);
        let persistor = OutputPersistor::new(
            Arc::new(client),
            Arc::new(MockVersionedSecretStore::new()),
            PersistTarget {
                namespace: "ns".to_string(),
                pod_name: "generate-job-abc".to_string(),
                output_dir: dir.path().to_path_buf(),
                poll_interval: Duration::from_millis(10),
                wait_timeout: Duration::from_secs(60),
            },
            Shutdown::from_receiver(rx),
        );
        tx.send(Some("SIGTERM")).unwrap();

        let result = persistor.persist().await;
        assert!(matches!(result, Err(PersistError::Cancelled("SIGTERM"))));
    }

    #[tokio::test]
    async fn test_pod_without_errand_label_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut unlabeled = pod(&["busybox"], 0);
        unlabeled.metadata.labels = None;
        let mut client = MockClusterClient::new();
        client
            .expect_get_pod()
            .returning(move |_, _| Ok(Some(unlabeled.clone())));
        client.expect_get_errand().never();

        let result = persistor(client, MockVersionedSecretStore::new(), dir.path(), Duration::from_secs(5))
            .persist()
            .await;
        assert!(matches!(result, Err(PersistError::MissingErrandLabel(..))));
    }
}
