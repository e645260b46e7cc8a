use k8s_openapi::api::core::v1::{SecretVolumeSource, Volume, VolumeMount};
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, instrument};

use super::LABEL_SERVICE_ACCOUNT;
use super::client::{ClientError, ClusterClient};

/// Where the credentials of the output sidecar are mounted
pub const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const SERVICE_ACCOUNT_FILE_MODE: i32 = 0o644;

#[derive(Error, Debug)]
pub enum ServiceAccountError {
    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Service account '{name}' not found in namespace '{namespace}'")]
    NotFound { namespace: String, name: String },

    #[error("Service account '{name}' in namespace '{namespace}' has no secret")]
    NoSecret { namespace: String, name: String },

    #[error("Kubernetes client error: {0}")]
    Client(#[from] ClientError),
}

/// Credential volume of the output sidecar and the mount pointing at it
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAccountMount {
    pub service_account: String,
    pub volume: Volume,
    pub mount: VolumeMount,
}

/// Builds the credential volume for the service account designated by the
/// namespace, falling back to `default_service_account`.
#[instrument(
    "service_account/resolve_mount",
    skip(client),
    fields(kubernetes_namespace = %namespace),
    level = "trace"
)]
pub async fn resolve_mount(
    client: &dyn ClusterClient,
    namespace: &str,
    default_service_account: &str,
) -> Result<ServiceAccountMount, ServiceAccountError> {
    let ns = client
        .get_namespace(namespace)
        .await?
        .ok_or_else(|| ServiceAccountError::NamespaceNotFound(namespace.to_string()))?;

    let name = ns
        .labels()
        .get(LABEL_SERVICE_ACCOUNT)
        .cloned()
        .unwrap_or_else(|| default_service_account.to_string());
    debug!("Using service account '{}' for output persistence.", name);

    let account = client
        .get_service_account(namespace, &name)
        .await?
        .ok_or_else(|| ServiceAccountError::NotFound {
            namespace: namespace.to_string(),
            name: name.clone(),
        })?;

    let secret_name = account
        .secrets
        .iter()
        .flatten()
        .find_map(|s| s.name.clone())
        .ok_or_else(|| ServiceAccountError::NoSecret {
            namespace: namespace.to_string(),
            name: name.clone(),
        })?;

    let volume = Volume {
        name: secret_name.clone(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.clone()),
            default_mode: Some(SERVICE_ACCOUNT_FILE_MODE),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mount = VolumeMount {
        name: secret_name,
        mount_path: SERVICE_ACCOUNT_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    };

    Ok(ServiceAccountMount {
        service_account: name,
        volume,
        mount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes_objects::client::MockClusterClient;
    use k8s_openapi::api::core::v1::{Namespace, ObjectReference, ServiceAccount};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn namespace(labels: BTreeMap<String, String>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some("ns".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn account(secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            secrets: Some(
                secrets
                    .iter()
                    .map(|s| ObjectReference {
                        name: Some(s.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_uses_service_account_from_namespace_label() {
        let mut client = MockClusterClient::new();
        client.expect_get_namespace().returning(|_| {
            Ok(Some(namespace(BTreeMap::from([(
                LABEL_SERVICE_ACCOUNT.to_string(),
                "custom".to_string(),
            )]))))
        });
        client
            .expect_get_service_account()
            .withf(|ns, name| ns == "ns" && name == "custom")
            .returning(|_, _| Ok(Some(account(&["custom-token", "other"]))));

        let mount = resolve_mount(&client, "ns", "fallback").await.unwrap();

        assert_eq!(mount.service_account, "custom");
        assert_eq!(mount.volume.name, "custom-token");
        let secret = mount.volume.secret.unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("custom-token"));
        assert_eq!(secret.default_mode, Some(0o644));
        assert_eq!(mount.mount.mount_path, SERVICE_ACCOUNT_MOUNT_PATH);
        assert_eq!(mount.mount.read_only, Some(true));
    }

    #[tokio::test]
    async fn test_falls_back_to_default_service_account() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_namespace()
            .returning(|_| Ok(Some(namespace(BTreeMap::new()))));
        client
            .expect_get_service_account()
            .withf(|_, name| name == "fallback")
            .returning(|_, _| Ok(Some(account(&["fallback-token"]))));

        let mount = resolve_mount(&client, "ns", "fallback").await.unwrap();
        assert_eq!(mount.service_account, "fallback");
    }

    #[tokio::test]
    async fn test_service_account_without_secret_is_an_error() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_namespace()
            .returning(|_| Ok(Some(namespace(BTreeMap::new()))));
        client
            .expect_get_service_account()
            .returning(|_, _| Ok(Some(account(&[]))));

        let err = resolve_mount(&client, "ns", "fallback").await.unwrap_err();
        assert!(matches!(err, ServiceAccountError::NoSecret { .. }));
    }

    #[tokio::test]
    async fn test_missing_service_account_is_an_error() {
        let mut client = MockClusterClient::new();
        client
            .expect_get_namespace()
            .returning(|_| Ok(Some(namespace(BTreeMap::new()))));
        client.expect_get_service_account().returning(|_, _| Ok(None));

        let err = resolve_mount(&client, "ns", "fallback").await.unwrap_err();
        assert!(matches!(err, ServiceAccountError::NotFound { .. }));
    }
}
