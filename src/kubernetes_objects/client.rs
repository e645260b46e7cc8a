//! Cluster access used by the controllers and the output persistor.
//!
//! Everything talks to the API server through [`ClusterClient`] so that
//! reconcilers can be exercised against a mock in unit tests.

use async_trait::async_trait;
use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, PatchOperation, ReplaceOperation, TestOperation};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, ServiceAccount};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Api, Client};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

#[cfg(test)]
use mockall::automock;

use super::FIELD_MANAGER;
use super::errand_job::{ErrandJob, ErrandJobStatus, Strategy};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Failed to serialize patch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClientError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists { .. })
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_errand(&self, namespace: &str, name: &str)
    -> Result<Option<ErrandJob>, ClientError>;

    async fn list_errands(&self, namespace: &str) -> Result<Vec<ErrandJob>, ClientError>;

    /// Moves the trigger strategy from `from` to `to`.
    ///
    /// Fails when the stored strategy is no longer `from`.
    async fn update_errand_strategy(
        &self,
        namespace: &str,
        name: &str,
        from: Strategy,
        to: Strategy,
    ) -> Result<(), ClientError>;

    /// Replaces the whole status of an errand
    async fn replace_errand_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ErrandJobStatus,
    ) -> Result<(), ClientError>;

    async fn mark_errand_completed(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClientError>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClientError>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClientError>;

    async fn get_secret(&self, namespace: &str, name: &str)
    -> Result<Option<Secret>, ClientError>;

    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, ClientError>;

    /// Fails with [`ClientError::AlreadyExists`] if the name is taken
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClientError>;

    /// Creates the secret or overwrites the fields this operator manages
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClientError>;

    /// Fails with [`ClientError::AlreadyExists`] if the name is taken
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ClientError>;

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClientError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClientError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// [`ClusterClient`] backed by a real API server connection
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn already_exists(err: kube::Error, kind: &'static str, name: &str) -> ClientError {
    match err {
        kube::Error::Api(ref response) if response.reason == "AlreadyExists" => {
            ClientError::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        e => ClientError::Kube(e),
    }
}

fn pointer(tokens: &[&str]) -> PointerBuf {
    PointerBuf::from_tokens(tokens.iter().copied())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    #[instrument("cluster/get_errand", skip(self), level = "trace")]
    async fn get_errand(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ErrandJob>, ClientError> {
        let api: Api<ErrandJob> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument("cluster/list_errands", skip(self), level = "trace")]
    async fn list_errands(&self, namespace: &str) -> Result<Vec<ErrandJob>, ClientError> {
        let api: Api<ErrandJob> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    #[instrument("cluster/update_errand_strategy", skip(self), level = "trace")]
    async fn update_errand_strategy(
        &self,
        namespace: &str,
        name: &str,
        from: Strategy,
        to: Strategy,
    ) -> Result<(), ClientError> {
        let api: Api<ErrandJob> = Api::namespaced(self.client.clone(), namespace);
        let path = pointer(&["spec", "trigger", "strategy"]);
        let patch = json_patch::Patch(vec![
            PatchOperation::Test(TestOperation {
                path: path.clone(),
                value: json!(from),
            }),
            PatchOperation::Replace(ReplaceOperation {
                path,
                value: json!(to),
            }),
        ]);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Json::<()>(patch),
        )
        .await?;
        Ok(())
    }

    #[instrument("cluster/replace_errand_status", skip(self, status), level = "trace")]
    async fn replace_errand_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ErrandJobStatus,
    ) -> Result<(), ClientError> {
        let api: Api<ErrandJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = json_patch::Patch(vec![PatchOperation::Add(AddOperation {
            path: pointer(&["status"]),
            value: serde_json::to_value(status)?,
        })]);
        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Json::<()>(patch),
        )
        .await?;
        Ok(())
    }

    #[instrument("cluster/mark_errand_completed", skip(self), level = "trace")]
    async fn mark_errand_completed(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<ErrandJob> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": { "completed": true } });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    #[instrument("cluster/get_namespace", skip(self), level = "trace")]
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, ClientError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    #[instrument("cluster/get_service_account", skip(self), level = "trace")]
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, ClientError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument("cluster/get_config_map", skip(self), level = "trace")]
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClientError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument("cluster/get_secret", skip(self), level = "trace")]
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClientError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument("cluster/list_secrets", skip(self), level = "trace")]
    async fn list_secrets(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Secret>, ClientError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    #[instrument("cluster/create_secret", skip(self, secret), level = "trace")]
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClientError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        api.create(&Self::post_params(), secret)
            .await
            .map_err(|e| already_exists(e, "Secret", name))?;
        Ok(())
    }

    #[instrument("cluster/apply_secret", skip(self, secret), level = "trace")]
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClientError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let mut applied = secret.clone();
        applied.metadata.namespace = Some(namespace.to_string());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&applied)).await?;
        Ok(())
    }

    #[instrument("cluster/create_job", skip(self, job), level = "trace")]
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ClientError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let name = job.metadata.name.as_deref().unwrap_or_default();
        api.create(&Self::post_params(), job)
            .await
            .map_err(|e| already_exists(e, "Job", name))?;
        Ok(())
    }

    #[instrument("cluster/delete_job", skip(self), level = "trace")]
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    #[instrument("cluster/get_pod", skip(self), level = "trace")]
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument("cluster/list_pods", skip(self), level = "trace")]
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }

    #[instrument("cluster/delete_pod", skip(self), level = "trace")]
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
