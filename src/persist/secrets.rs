//! Turning output files into secrets.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Container, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{info, instrument};
use tracing_error::SpanTrace;

use crate::error::SpannedExt;
use crate::kubernetes_objects::client::ClusterClient;
use crate::kubernetes_objects::errand_job::{Output, PersistenceMethod, SecretOptions};
use crate::kubernetes_objects::names::{sanitize_label_value, sanitize_subdomain};
use crate::kubernetes_objects::versioned_secret::{NewVersion, VersionedSecretStore};
use crate::kubernetes_objects::{LABEL_PERSISTENT_SECRET_CONTAINER, LABEL_REMOTE_ID, REMOTE_ID_KEY};

use super::error::PersistError;

pub type FlatJson = BTreeMap<String, String>;

/// Exit codes whose output is written: 0 always, 1 only on request
pub fn should_persist(exit_code: i32, write_on_failure: bool) -> bool {
    exit_code == 0 || (exit_code == 1 && write_on_failure)
}

pub async fn read_output_file(path: &Path) -> Result<FlatJson, PersistError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| PersistError::ReadFile {
            path: path.to_path_buf(),
            source,
            span_trace: SpanTrace::capture(),
        })?;
    serde_json::from_slice(&raw).map_err(|source| PersistError::ParseFile {
        path: path.to_path_buf(),
        source,
        span_trace: SpanTrace::capture(),
    })
}

/// Secrets to write for one output file, keyed by unsanitized name
pub fn split_output(
    path: &Path,
    data: FlatJson,
    options: &SecretOptions,
) -> Result<Vec<(String, FlatJson)>, PersistError> {
    match options.persistence_method {
        PersistenceMethod::OneToOne => Ok(vec![(options.name.clone(), data)]),
        PersistenceMethod::FanOut => data
            .into_iter()
            .map(|(key, value)| {
                let nested: FlatJson = serde_json::from_str(&value).map_err(|source| {
                    PersistError::ParseFanOutValue {
                        path: path.to_path_buf(),
                        key: key.clone(),
                        source,
                        span_trace: SpanTrace::capture(),
                    }
                })?;
                Ok((options.fan_out_name(&key), nested))
            })
            .collect(),
    }
}

/// Labels of every secret persisted from `container`
pub fn secret_labels(
    output: &Output,
    options: &SecretOptions,
    container: &Container,
) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = output
        .secret_labels
        .iter()
        .chain(&options.additional_labels)
        .map(|(key, value)| (key.clone(), sanitize_label_value(value)))
        .collect();
    labels.insert(
        LABEL_PERSISTENT_SECRET_CONTAINER.to_string(),
        sanitize_label_value(&container.name),
    );
    let remote_id = container
        .env
        .iter()
        .flatten()
        .find(|e| e.name == REMOTE_ID_KEY)
        .and_then(|e| e.value.clone());
    if let Some(id) = remote_id {
        labels.insert(LABEL_REMOTE_ID.to_string(), sanitize_label_value(&id));
    }
    labels
}

/// Destination of persisted secrets
pub struct SecretWriter<'a> {
    pub client: &'a dyn ClusterClient,
    pub store: &'a dyn VersionedSecretStore,
    pub namespace: &'a str,
    pub owner: &'a OwnerReference,
    pub errand_name: &'a str,
}

impl SecretWriter<'_> {
    #[instrument(
        "persist/write_secret",
        skip(self, data, labels, options),
        fields(kubernetes_namespace = %self.namespace),
        level = "trace"
    )]
    pub async fn write(
        &self,
        name: &str,
        data: FlatJson,
        labels: BTreeMap<String, String>,
        options: &SecretOptions,
    ) -> Result<(), PersistError> {
        let name = sanitize_subdomain(name);
        if options.versioned {
            let version = NewVersion {
                name: name.clone(),
                data,
                labels,
                annotations: options.additional_annotations.clone(),
                source_description: format!("created by errand job '{}'", self.errand_name),
            };
            return match self
                .store
                .create(self.namespace, self.owner, version)
                .await
            {
                Err(e) if e.is_identical() => {
                    info!("Skipping versioned secret '{}', content unchanged.", name);
                    Ok(())
                }
                result => result.with_span_trace().map_err(PersistError::from),
            };
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels),
                annotations: (!options.additional_annotations.is_empty())
                    .then(|| options.additional_annotations.clone()),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v.into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.client
            .apply_secret(self.namespace, &secret)
            .await
            .with_span_trace()?;
        info!("Persisted secret '{}'.", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::EnvVar;
    use std::path::PathBuf;

    fn options(name: &str, method: PersistenceMethod) -> SecretOptions {
        SecretOptions {
            name: name.to_string(),
            persistence_method: method,
            ..Default::default()
        }
    }

    #[test]
    fn test_should_persist() {
        assert!(should_persist(0, false));
        assert!(!should_persist(1, false));
        assert!(should_persist(1, true));
        assert!(!should_persist(2, true));
        assert!(!should_persist(137, true));
    }

    #[test]
    fn test_split_one_to_one() {
        let data = FlatJson::from([("hello".to_string(), "world".to_string())]);
        let secrets = split_output(
            &PathBuf::from("output.json"),
            data.clone(),
            &options("foo", PersistenceMethod::OneToOne),
        )
        .unwrap();
        assert_eq!(secrets, vec![("foo".to_string(), data)]);
    }

    #[test]
    fn test_split_fan_out() {
        let data = FlatJson::from([
            ("a".to_string(), r#"{"user":"admin"}"#.to_string()),
            ("b".to_string(), r#"{"port":"8080"}"#.to_string()),
        ]);
        let secrets = split_output(
            &PathBuf::from("links.json"),
            data,
            &options("link", PersistenceMethod::FanOut),
        )
        .unwrap();
        assert_eq!(
            secrets,
            vec![
                (
                    "link-a".to_string(),
                    FlatJson::from([("user".to_string(), "admin".to_string())])
                ),
                (
                    "link-b".to_string(),
                    FlatJson::from([("port".to_string(), "8080".to_string())])
                ),
            ]
        );
    }

    #[test]
    fn test_split_fan_out_rejects_nested_objects() {
        let data = FlatJson::from([("a".to_string(), "not json".to_string())]);
        let result = split_output(
            &PathBuf::from("links.json"),
            data,
            &options("link", PersistenceMethod::FanOut),
        );
        assert!(matches!(
            result,
            Err(PersistError::ParseFanOutValue { key, .. }) if key == "a"
        ));
    }

    #[tokio::test]
    async fn test_read_output_file_requires_flat_strings() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("flat.json");
        let nested = dir.path().join("nested.json");
        std::fs::write(&flat, r#"{"hello":"world"}"#).unwrap();
        std::fs::write(&nested, r#"{"hello":{"deep":"value"}}"#).unwrap();

        assert_eq!(read_output_file(&flat).await.unwrap()["hello"], "world");
        assert!(matches!(
            read_output_file(&nested).await,
            Err(PersistError::ParseFile { .. })
        ));
        assert!(matches!(
            read_output_file(&dir.path().join("missing.json")).await,
            Err(PersistError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_secret_labels_merge() {
        let output = Output {
            secret_labels: BTreeMap::from([
                ("app".to_string(), "demo".to_string()),
                ("tier".to_string(), "output".to_string()),
            ]),
            ..Default::default()
        };
        let mut opts = options("foo", PersistenceMethod::OneToOne);
        opts.additional_labels = BTreeMap::from([("tier".to_string(), "file".to_string())]);
        let container = Container {
            name: "busybox".to_string(),
            env: Some(vec![EnvVar {
                name: REMOTE_ID_KEY.to_string(),
                value: Some("remote-1".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let labels = secret_labels(&output, &opts, &container);
        assert_eq!(labels["app"], "demo");
        assert_eq!(labels["tier"], "file");
        assert_eq!(labels[LABEL_PERSISTENT_SECRET_CONTAINER], "busybox");
        assert_eq!(labels[LABEL_REMOTE_ID], "remote-1");

        let plain = Container {
            name: "busybox".to_string(),
            ..Default::default()
        };
        assert!(!secret_labels(&output, &opts, &plain).contains_key(LABEL_REMOTE_ID));
    }

    #[test]
    fn test_secret_label_values_are_sanitized() {
        let output = Output {
            secret_labels: BTreeMap::from([("app".to_string(), "My App!".to_string())]),
            ..Default::default()
        };
        let mut opts = options("foo", PersistenceMethod::OneToOne);
        opts.additional_labels =
            BTreeMap::from([("owner".to_string(), format!("team/{}", "x".repeat(80)))]);
        let container = Container {
            name: "busybox".to_string(),
            env: Some(vec![EnvVar {
                name: REMOTE_ID_KEY.to_string(),
                value: Some("remote id:1".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let labels = secret_labels(&output, &opts, &container);
        assert_eq!(labels["app"], "My-App");
        assert_eq!(labels["owner"].len(), 63);
        assert!(labels["owner"].starts_with("team-x"));
        assert_eq!(labels[LABEL_REMOTE_ID], "remote-id-1");
    }
}
