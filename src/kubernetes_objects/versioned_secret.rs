//! Content-addressed, monotonically versioned secrets.
//!
//! A versioned secret named `foo` is stored as `foo-v1`, `foo-v2`, ... and
//! carries labels identifying its kind, logical name and version. Writing
//! content identical to the latest version is rejected with
//! [`VersionedSecretError::Identical`], which callers treat as success.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::client::{ClientError, ClusterClient};

pub const LABEL_SECRET_KIND: &str = "errand.dev/secret-kind";
pub const LABEL_SECRET_VERSION: &str = "errand.dev/secret-version";
pub const LABEL_SECRET_NAME: &str = "errand.dev/secret-name";
pub const ANNOTATION_SOURCE_DESCRIPTION: &str = "errand.dev/source-description";

pub const VERSIONED_SECRET_KIND: &str = "versionedSecret";

#[derive(Error, Debug)]
pub enum VersionedSecretError {
    #[error("Latest version of secret '{name}' already holds identical content")]
    Identical { name: String },

    #[error("Secret '{name}' has an invalid version label '{value}'")]
    InvalidVersion { name: String, value: String },

    #[error("Kubernetes client error: {0}")]
    Client(#[from] ClientError),
}

impl VersionedSecretError {
    pub fn is_identical(&self) -> bool {
        matches!(self, VersionedSecretError::Identical { .. })
    }
}

/// A secret version about to be written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewVersion {
    pub name: String,
    pub data: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub source_description: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionedSecretStore: Send + Sync {
    /// Writes `version` as the next version of its secret
    async fn create(
        &self,
        namespace: &str,
        owner: &OwnerReference,
        version: NewVersion,
    ) -> Result<(), VersionedSecretError>;

    /// Latest version of the secret called `name`, if any exists
    async fn latest(&self, namespace: &str, name: &str)
    -> Result<Option<Secret>, VersionedSecretError>;

    /// Points every secret volume referencing a versioned secret at its latest version
    async fn set_secret_references(
        &self,
        namespace: &str,
        pod_spec: &mut PodSpec,
    ) -> Result<(), VersionedSecretError>;
}

/// [`VersionedSecretStore`] keeping versions as labeled secrets in the cluster
#[derive(Clone)]
pub struct KubeVersionedSecretStore {
    client: Arc<dyn ClusterClient>,
}

impl KubeVersionedSecretStore {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    async fn latest_with_version(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<(u64, Secret)>, VersionedSecretError> {
        let selector = format!(
            "{LABEL_SECRET_KIND}={VERSIONED_SECRET_KIND},{LABEL_SECRET_NAME}={name}"
        );
        let mut latest: Option<(u64, Secret)> = None;
        for secret in self.client.list_secrets(namespace, &selector).await? {
            let version = secret_version(&secret)?;
            if latest.as_ref().is_none_or(|(v, _)| version > *v) {
                latest = Some((version, secret));
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl VersionedSecretStore for KubeVersionedSecretStore {
    #[instrument(
        "versioned_secret/create",
        skip(self, owner, version),
        fields(kubernetes_namespace = %namespace, secret_name = %version.name)
    )]
    async fn create(
        &self,
        namespace: &str,
        owner: &OwnerReference,
        version: NewVersion,
    ) -> Result<(), VersionedSecretError> {
        let data: BTreeMap<String, ByteString> = version
            .data
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
            .collect();

        let latest = self.latest_with_version(namespace, &version.name).await?;
        let next = match &latest {
            Some((current, secret)) => {
                if secret.data.as_ref().is_some_and(|d| *d == data) {
                    return Err(VersionedSecretError::Identical { name: version.name });
                }
                current + 1
            }
            None => 1,
        };

        let mut labels = version.labels;
        labels.insert(LABEL_SECRET_KIND.to_string(), VERSIONED_SECRET_KIND.to_string());
        labels.insert(LABEL_SECRET_VERSION.to_string(), next.to_string());
        labels.insert(LABEL_SECRET_NAME.to_string(), version.name.clone());

        let mut annotations = version.annotations;
        annotations.insert(
            ANNOTATION_SOURCE_DESCRIPTION.to_string(),
            version.source_description,
        );

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(versioned_name(&version.name, next)),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        self.client.create_secret(namespace, &secret).await?;
        info!(
            "Created version {} of secret '{}'.",
            next, version.name
        );
        Ok(())
    }

    async fn latest(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, VersionedSecretError> {
        Ok(self
            .latest_with_version(namespace, name)
            .await?
            .map(|(_, secret)| secret))
    }

    #[instrument(
        "versioned_secret/set_secret_references",
        skip(self, pod_spec),
        fields(kubernetes_namespace = %namespace),
        level = "trace"
    )]
    async fn set_secret_references(
        &self,
        namespace: &str,
        pod_spec: &mut PodSpec,
    ) -> Result<(), VersionedSecretError> {
        for volume in pod_spec.volumes.iter_mut().flatten() {
            let Some(source) = volume.secret.as_mut() else {
                continue;
            };
            let Some((name, _)) = source.secret_name.as_deref().and_then(parse_versioned_name)
            else {
                continue;
            };
            if let Some(latest) = self.latest(namespace, name).await? {
                let latest_name = latest.name_any();
                debug!("Pointing volume '{}' at secret '{}'.", volume.name, latest_name);
                source.secret_name = Some(latest_name);
            }
        }
        Ok(())
    }
}

/// `<name>-v<version>`
pub fn versioned_name(name: &str, version: u64) -> String {
    format!("{name}-v{version}")
}

/// Splits `<name>-v<version>` into its parts
pub fn parse_versioned_name(secret_name: &str) -> Option<(&str, u64)> {
    let (name, version) = secret_name.rsplit_once("-v")?;
    if name.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok().map(|v| (name, v))
}

pub fn is_versioned_secret<K: Resource>(object: &K) -> bool {
    object
        .labels()
        .get(LABEL_SECRET_KIND)
        .is_some_and(|kind| kind == VERSIONED_SECRET_KIND)
}

/// Whether `names` contains any version of the versioned secret `secret_name`
pub fn contains_outdated_secret_name<'a>(
    names: impl IntoIterator<Item = &'a String>,
    secret_name: &str,
) -> bool {
    let Some((prefix, _)) = parse_versioned_name(secret_name) else {
        return false;
    };
    names
        .into_iter()
        .filter_map(|n| parse_versioned_name(n))
        .any(|(name, _)| name == prefix)
}

fn secret_version(secret: &Secret) -> Result<u64, VersionedSecretError> {
    let value = secret
        .labels()
        .get(LABEL_SECRET_VERSION)
        .cloned()
        .unwrap_or_default();
    value
        .parse()
        .map_err(|_| VersionedSecretError::InvalidVersion {
            name: secret.name_any(),
            value,
        })
}
