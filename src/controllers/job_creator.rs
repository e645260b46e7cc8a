//! Materializes the child batch job of an errand.

use std::collections::BTreeMap;
use std::sync::Arc;

use derive_debug::Dbg;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use crate::config::OperatorConfig;
use crate::kubernetes_objects::client::{ClientError, ClusterClient};
use crate::kubernetes_objects::errand_job::ErrandJob;
use crate::kubernetes_objects::names::{job_name, output_volume_name};
use crate::kubernetes_objects::references::{
    ReferencedObjects, config_map_digest, secret_digest,
};
use crate::kubernetes_objects::service_account::resolve_mount;
use crate::kubernetes_objects::versioned_secret::VersionedSecretStore;
use crate::kubernetes_objects::{
    ENV_NAMESPACE, LABEL_ERRAND_NAME, OUTPUT_MOUNT_PATH, OUTPUT_PERSIST_CONTAINER,
    PERSIST_OUTPUT_COMMAND,
};

use super::error::CreateJobError;

/// `<Kind>/<name>` to a digest of the object's data
pub type ReferenceVersions = BTreeMap<String, String>;

/// A ConfigMap or Secret the pod template needs but which does not exist yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReference {
    pub kind: &'static str,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCreation {
    Created {
        job_name: String,
        references: ReferenceVersions,
    },
    /// The job of a previous activation still exists
    AlreadyRunning,
    MissingReference(MissingReference),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum References {
    Resolved(ReferenceVersions),
    Missing(MissingReference),
}

#[derive(Dbg, Clone)]
pub struct JobCreator {
    #[dbg(skip)]
    client: Arc<dyn ClusterClient>,
    #[dbg(skip)]
    store: Arc<dyn VersionedSecretStore>,
    config: Arc<OperatorConfig>,
}

impl JobCreator {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn VersionedSecretStore>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    #[instrument(
        "job_creator/create",
        skip(self, errand),
        fields(kubernetes_namespace = %namespace_of(errand), errand_name = %errand.name_any())
    )]
    pub async fn create(&self, errand: &ErrandJob) -> Result<JobCreation, CreateJobError> {
        let namespace = namespace_of(errand);
        let errand_name = errand.name_any();

        let mut template = errand.spec.template.clone();
        let pod_template = template
            .spec
            .as_mut()
            .map(|job| &mut job.template)
            .ok_or_else(|| CreateJobError::MissingPodSpec(errand_name.clone()))?;
        let pod_spec = pod_template
            .spec
            .as_mut()
            .ok_or_else(|| CreateJobError::MissingPodSpec(errand_name.clone()))?;

        self.store.set_secret_references(&namespace, pod_spec).await?;
        let references = match self.resolve_references(&namespace, pod_spec).await? {
            References::Resolved(r) => r,
            References::Missing(missing) => {
                debug!(
                    "Skip creating job for '{}': {} '{}' not found.",
                    errand_name, missing.kind, missing.name
                );
                return Ok(JobCreation::MissingReference(missing));
            }
        };

        let account =
            resolve_mount(self.client.as_ref(), &namespace, &self.config.service_account).await?;
        pod_spec
            .volumes
            .get_or_insert_with(Vec::new)
            .push(account.volume);
        let sidecar = self.inject_output_volumes(pod_spec, &namespace, account.mount);
        pod_spec.containers.push(sidecar);

        pod_template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_ERRAND_NAME.to_string(), errand_name.clone());

        let mut owner = errand
            .controller_owner_ref(&())
            .ok_or_else(|| CreateJobError::MissingOwner(errand_name.clone()))?;
        owner.block_owner_deletion = Some(true);

        let mut labels = template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.insert(LABEL_ERRAND_NAME.to_string(), errand_name.clone());
        let annotations = template.metadata.as_ref().and_then(|m| m.annotations.clone());

        let name = job_name(&errand_name);
        let job = Job {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels),
                annotations,
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: template.spec,
            ..Default::default()
        };

        match self.client.create_job(&namespace, &job).await {
            Ok(()) => {
                info!("Created job '{}' for errand '{}'.", name, errand_name);
                Ok(JobCreation::Created {
                    job_name: name,
                    references,
                })
            }
            Err(ClientError::AlreadyExists { .. }) => {
                info!("Skip '{}': job '{}' already running.", errand_name, name);
                Ok(JobCreation::AlreadyRunning)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current versions of everything the errand's pod template references
    #[instrument(
        "job_creator/observe_references",
        skip(self, errand),
        fields(kubernetes_namespace = %namespace_of(errand), errand_name = %errand.name_any()),
        level = "trace"
    )]
    pub async fn observe_references(
        &self,
        errand: &ErrandJob,
    ) -> Result<References, CreateJobError> {
        let namespace = namespace_of(errand);
        let mut pod_spec = errand
            .pod_spec()
            .cloned()
            .ok_or_else(|| CreateJobError::MissingPodSpec(errand.name_any()))?;
        self.store
            .set_secret_references(&namespace, &mut pod_spec)
            .await?;
        self.resolve_references(&namespace, &pod_spec).await
    }

    async fn resolve_references(
        &self,
        namespace: &str,
        pod_spec: &PodSpec,
    ) -> Result<References, CreateJobError> {
        let mut versions = ReferenceVersions::new();

        for name in pod_spec.referenced_config_maps() {
            match self.client.get_config_map(namespace, &name).await? {
                Some(cm) => {
                    versions.insert(format!("ConfigMap/{name}"), config_map_digest(&cm));
                }
                None => {
                    return Ok(References::Missing(MissingReference {
                        kind: "ConfigMap",
                        name,
                    }));
                }
            }
        }

        for name in pod_spec.referenced_secrets() {
            match self.client.get_secret(namespace, &name).await? {
                Some(secret) => {
                    versions.insert(format!("Secret/{name}"), secret_digest(&secret));
                }
                None => {
                    return Ok(References::Missing(MissingReference {
                        kind: "Secret",
                        name,
                    }));
                }
            }
        }

        Ok(References::Resolved(versions))
    }

    /// Adds one output volume per primary container and returns the sidecar
    /// mounting all of them.
    fn inject_output_volumes(
        &self,
        pod_spec: &mut PodSpec,
        namespace: &str,
        credentials: VolumeMount,
    ) -> Container {
        let mut sidecar_mounts = vec![credentials];
        let volumes = pod_spec.volumes.get_or_insert_with(Vec::new);

        for container in pod_spec.containers.iter_mut() {
            let volume_name = output_volume_name(&container.name);
            volumes.push(Volume {
                name: volume_name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(VolumeMount {
                    name: volume_name.clone(),
                    mount_path: format!("{OUTPUT_MOUNT_PATH}/"),
                    ..Default::default()
                });
            sidecar_mounts.push(VolumeMount {
                name: volume_name,
                mount_path: format!("{OUTPUT_MOUNT_PATH}/{}", container.name),
                ..Default::default()
            });
        }

        Container {
            name: OUTPUT_PERSIST_CONTAINER.to_string(),
            image: Some(self.config.operator_image.clone()),
            image_pull_policy: Some(self.config.image_pull_policy.clone()),
            args: Some(vec![PERSIST_OUTPUT_COMMAND.to_string()]),
            env: Some(vec![EnvVar {
                name: ENV_NAMESPACE.to_string(),
                value: Some(namespace.to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(sidecar_mounts),
            ..Default::default()
        }
    }
}

fn namespace_of(errand: &ErrandJob) -> String {
    errand.namespace().unwrap_or_default()
}
