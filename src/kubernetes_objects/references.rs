//! ConfigMap and Secret names a pod template depends on.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, Secret};
use sha2::{Digest, Sha256};

use super::errand_job::ErrandJob;

/// Resources that reference ConfigMaps and Secrets through a pod template.
pub trait ReferencedObjects {
    fn referenced_config_maps(&self) -> BTreeSet<String>;
    fn referenced_secrets(&self) -> BTreeSet<String>;
}

impl ReferencedObjects for PodSpec {
    fn referenced_config_maps(&self) -> BTreeSet<String> {
        let mut result: BTreeSet<String> = self
            .volumes
            .iter()
            .flatten()
            .filter_map(|v| v.config_map.as_ref())
            .map(|cm| cm.name.clone())
            .collect();

        for container in all_containers(self) {
            for env_from in container.env_from.iter().flatten() {
                if let Some(cm) = &env_from.config_map_ref {
                    result.insert(cm.name.clone());
                }
            }
            for env in container.env.iter().flatten() {
                if let Some(key_ref) = env
                    .value_from
                    .as_ref()
                    .and_then(|v| v.config_map_key_ref.as_ref())
                {
                    result.insert(key_ref.name.clone());
                }
            }
        }
        result
    }

    fn referenced_secrets(&self) -> BTreeSet<String> {
        let mut result: BTreeSet<String> = self
            .volumes
            .iter()
            .flatten()
            .filter_map(|v| v.secret.as_ref())
            .filter_map(|s| s.secret_name.clone())
            .collect();

        for container in all_containers(self) {
            for env_from in container.env_from.iter().flatten() {
                if let Some(secret) = &env_from.secret_ref {
                    result.insert(secret.name.clone());
                }
            }
            for env in container.env.iter().flatten() {
                if let Some(key_ref) = env
                    .value_from
                    .as_ref()
                    .and_then(|v| v.secret_key_ref.as_ref())
                {
                    result.insert(key_ref.name.clone());
                }
            }
        }
        result
    }
}

impl ReferencedObjects for ErrandJob {
    fn referenced_config_maps(&self) -> BTreeSet<String> {
        self.pod_spec()
            .map(ReferencedObjects::referenced_config_maps)
            .unwrap_or_default()
    }

    fn referenced_secrets(&self) -> BTreeSet<String> {
        self.pod_spec()
            .map(ReferencedObjects::referenced_secrets)
            .unwrap_or_default()
    }
}

/// Hash of the payload of a ConfigMap, ignoring its metadata
pub fn config_map_digest(config_map: &ConfigMap) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in config_map.data.iter().flatten() {
        digest_entry(&mut hasher, "data", key, value.as_bytes());
    }
    for (key, value) in config_map.binary_data.iter().flatten() {
        digest_entry(&mut hasher, "binaryData", key, &value.0);
    }
    format!("{:x}", hasher.finalize())
}

/// Hash of the payload of a Secret, ignoring its metadata
pub fn secret_digest(secret: &Secret) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in secret.data.iter().flatten() {
        digest_entry(&mut hasher, "data", key, &value.0);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        digest_entry(&mut hasher, "stringData", key, value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn digest_entry(hasher: &mut Sha256, section: &str, key: &str, value: &[u8]) {
    hasher.update(section.as_bytes());
    hasher.update([0]);
    hasher.update(key.as_bytes());
    hasher.update([0]);
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value);
}

fn all_containers(spec: &PodSpec) -> impl Iterator<Item = &Container> {
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
}
