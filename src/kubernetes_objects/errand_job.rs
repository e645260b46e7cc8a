//! `ErrandJob` custom resource.
//!
//! An errand job wraps a batch `JobTemplateSpec` together with a trigger
//! strategy and an optional output policy describing which files written by
//! the job's containers are turned into secrets.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobTemplateSpec;
use k8s_openapi::api::core::v1::{Namespace, PodSpec};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{LABEL_MONITORED, LABEL_SERVICE_ACCOUNT};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "errand.dev",
    version = "v1alpha1",
    kind = "ErrandJob",
    plural = "errandjobs",
    shortname = "ej",
    namespaced,
    status = "ErrandJobStatus",
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.trigger.strategy"}"#,
    printcolumn = r#"{"name":"Completed","type":"boolean","jsonPath":".status.completed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ErrandJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Output>,

    pub trigger: Trigger,

    /// Template of the batch job materialized on every activation
    pub template: JobTemplateSpec,

    /// Re-run a finished auto errand when a referenced ConfigMap or Secret changes
    #[serde(default)]
    pub update_on_config_change: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrandJobStatus {
    /// Start of the current meltdown window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed: bool,

    /// `<Kind>/<name>` to resourceVersion of every object the last created job referenced
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub observed_references: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Trigger {
    #[serde(default)]
    pub strategy: Strategy,
}

/// Trigger strategy of an errand.
///
/// `manual` is idle, `now` fires once and falls back to `manual`,
/// `once` fires on creation and moves to the terminal `done`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Manual,
    Now,
    Once,
    Done,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Manual => "manual",
            Strategy::Now => "now",
            Strategy::Once => "once",
            Strategy::Done => "done",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PersistenceMethod {
    /// One secret per output file, named after the options
    #[default]
    #[serde(rename = "one-to-one")]
    OneToOne,

    /// One secret per top-level key of the output file
    #[serde(rename = "fan-out")]
    FanOut,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Json,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretOptions {
    #[serde(default)]
    pub name: String,

    #[serde(
        default,
        rename = "secretLabels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub additional_labels: BTreeMap<String, String>,

    #[serde(
        default,
        rename = "secretAnnotations",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub additional_annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub versioned: bool,

    #[serde(default, rename = "persistencemethod")]
    pub persistence_method: PersistenceMethod,
}

impl SecretOptions {
    /// Name of the secret created for `key` when fanning out
    pub fn fan_out_name(&self, key: &str) -> String {
        format!("{}-{}", self.name, key)
    }
}

/// Output file name to secret options
pub type FilesToSecrets = BTreeMap<String, SecretOptions>;

/// Container name to its output files
pub type OutputMap = BTreeMap<String, FilesToSecrets>;

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    pub output_map: OutputMap,

    #[serde(default)]
    pub output_type: OutputType,

    /// Labels copied onto every persisted secret
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_labels: BTreeMap<String, String>,

    /// Persist output of containers exiting with code 1 too
    #[serde(default)]
    pub write_on_failure: bool,
}

impl ErrandJob {
    pub fn strategy(&self) -> Strategy {
        self.spec.trigger.strategy
    }

    pub fn to_be_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn namespaced_name(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    pub fn last_reconcile(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.last_reconcile)
    }

    pub fn observed_references(&self) -> Option<&BTreeMap<String, String>> {
        self.status.as_ref().map(|s| &s.observed_references)
    }

    pub fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec
            .template
            .spec
            .as_ref()
            .and_then(|job| job.template.spec.as_ref())
    }
}

/// A namespace is watched by the controller instance whose monitor id matches
/// and which names a service account for the output sidecar.
pub fn is_monitored_namespace(namespace: &Namespace, monitored_id: &str) -> bool {
    let labels = namespace.labels();
    if !labels.contains_key(LABEL_SERVICE_ACCOUNT) {
        return false;
    }
    labels
        .get(LABEL_MONITORED)
        .is_some_and(|value| value == monitored_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_errand_job_deserialize() {
        let yaml_data = r#"
          apiVersion: errand.dev/v1alpha1
          kind: ErrandJob
          metadata:
            name: generate
            namespace: default
          spec:
            trigger:
              strategy: once
            updateOnConfigChange: true
            output:
              writeOnFailure: true
              secretLabels:
                app: demo
              outputMap:
                busybox:
                  output.json:
                    name: foo
                  links.json:
                    name: link
                    versioned: true
                    persistencemethod: fan-out
            template:
              spec:
                template:
                  spec:
                    restartPolicy: Never
                    containers:
                      - name: busybox
                        image: busybox
        "#;

        let errand: ErrandJob = serde_yaml::from_str(yaml_data).unwrap();

        assert_eq!(errand.strategy(), Strategy::Once);
        assert!(errand.spec.update_on_config_change);
        assert_eq!(errand.namespaced_name(), "default/generate");

        let output = errand.spec.output.unwrap();
        assert!(output.write_on_failure);
        assert_eq!(output.output_type, OutputType::Json);
        let files = &output.output_map["busybox"];
        assert_eq!(
            files["output.json"].persistence_method,
            PersistenceMethod::OneToOne
        );
        assert!(!files["output.json"].versioned);
        assert_eq!(
            files["links.json"].persistence_method,
            PersistenceMethod::FanOut
        );
        assert_eq!(files["links.json"].fan_out_name("a"), "link-a");
    }

    #[test]
    fn test_strategy_serializes_lowercase() {
        let trigger = Trigger {
            strategy: Strategy::Done,
        };
        assert_eq!(
            serde_json::to_value(&trigger).unwrap(),
            serde_json::json!({ "strategy": "done" })
        );
        assert_eq!(Strategy::Now.to_string(), "now");
    }

    #[test]
    fn test_is_monitored_namespace() {
        let namespace = |labels: &[(&str, &str)]| Namespace {
            metadata: ObjectMeta {
                name: Some("ns".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };

        let full = namespace(&[(LABEL_SERVICE_ACCOUNT, "sa"), (LABEL_MONITORED, "abc")]);
        assert!(is_monitored_namespace(&full, "abc"));
        assert!(!is_monitored_namespace(&full, "other"));

        let no_service_account = namespace(&[(LABEL_MONITORED, "abc")]);
        assert!(!is_monitored_namespace(&no_service_account, "abc"));

        assert!(!is_monitored_namespace(&Namespace::default(), "abc"));
    }
}
