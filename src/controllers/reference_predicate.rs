//! Turns updates of ConfigMaps and Secrets into reconcile requests for the
//! `done` errands referencing them.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::{Stream, StreamExt, future, stream};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::config::OperatorConfig;
use crate::kubernetes_objects::client::{ClientError, ClusterClient};
use crate::kubernetes_objects::errand_job::{ErrandJob, Strategy, is_monitored_namespace};
use crate::kubernetes_objects::references::ReferencedObjects;
use crate::kubernetes_objects::versioned_secret::{
    contains_outdated_secret_name, is_versioned_secret,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    ConfigMap,
    Secret,
}

/// A ConfigMap or Secret as seen in an update event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedReference {
    pub kind: ReferenceKind,
    pub namespace: String,
    pub name: String,
    pub resource_version: Option<String>,
}

impl ChangedReference {
    fn from_object<K: Resource>(kind: ReferenceKind, object: &K) -> Self {
        Self {
            kind,
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
            resource_version: object.resource_version(),
        }
    }
}

/// Passes through only modifications of objects that were already known,
/// dropping the initial listing, additions and deletions. Additions of
/// versioned secrets pass too, since each new version is a new object.
#[derive(Debug, Default)]
pub struct UpdateFilter {
    known: HashSet<String>,
    listing: HashSet<String>,
}

impl UpdateFilter {
    pub fn update<K: Resource>(&mut self, event: watcher::Event<K>) -> Option<K> {
        match event {
            watcher::Event::Init => {
                self.listing.clear();
                None
            }
            watcher::Event::InitApply(object) => {
                self.listing.insert(key(&object));
                None
            }
            watcher::Event::InitDone => {
                self.known = std::mem::take(&mut self.listing);
                None
            }
            watcher::Event::Apply(object) => {
                let added = self.known.insert(key(&object));
                if added && !is_versioned_secret(&object) {
                    None
                } else {
                    Some(object)
                }
            }
            watcher::Event::Delete(object) => {
                self.known.remove(&key(&object));
                None
            }
        }
    }
}

fn key<K: Resource>(object: &K) -> String {
    format!(
        "{}/{}",
        object.namespace().unwrap_or_default(),
        object.name_any()
    )
}

/// Errands that must be reconciled because `changed` was modified
#[instrument(
    "reference_predicate/errands_to_reconcile",
    skip(client, changed),
    fields(kubernetes_namespace = %changed.namespace, reference_name = %changed.name),
    level = "trace"
)]
pub async fn errands_to_reconcile(
    client: &dyn ClusterClient,
    monitored_id: &str,
    changed: &ChangedReference,
) -> Result<Vec<ObjectRef<ErrandJob>>, ClientError> {
    let namespace = changed.namespace.as_str();

    let (current_version, versioned) = match changed.kind {
        ReferenceKind::ConfigMap => match client.get_config_map(namespace, &changed.name).await? {
            Some(cm) => (cm.resource_version(), false),
            None => return Ok(vec![]),
        },
        ReferenceKind::Secret => match client.get_secret(namespace, &changed.name).await? {
            Some(secret) => (secret.resource_version(), is_versioned_secret(&secret)),
            None => return Ok(vec![]),
        },
    };
    if current_version != changed.resource_version {
        debug!("'{}' changed again since the event, skipping.", changed.name);
        return Ok(vec![]);
    }

    let monitored = client
        .get_namespace(namespace)
        .await?
        .is_some_and(|ns| is_monitored_namespace(&ns, monitored_id));
    if !monitored {
        return Ok(vec![]);
    }

    let requests = client
        .list_errands(namespace)
        .await?
        .into_iter()
        .filter(|errand| {
            errand.spec.update_on_config_change && errand.strategy() == Strategy::Done
        })
        .filter(|errand| {
            let names = match changed.kind {
                ReferenceKind::ConfigMap => errand.referenced_config_maps(),
                ReferenceKind::Secret => errand.referenced_secrets(),
            };
            names.contains(&changed.name)
                || (versioned && contains_outdated_secret_name(&names, &changed.name))
        })
        .map(|errand| ObjectRef::new(&errand.name_any()).within(namespace))
        .collect::<Vec<_>>();

    if !requests.is_empty() {
        debug!(
            "'{}' changed, reconciling {} errand(s).",
            changed.name,
            requests.len()
        );
    }
    Ok(requests)
}

fn reference_updates<K>(api: Api<K>, kind: ReferenceKind) -> impl Stream<Item = ChangedReference>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut filter = UpdateFilter::default();
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(move |event| {
            let changed = match event {
                Ok(event) => filter
                    .update(event)
                    .map(|object| ChangedReference::from_object(kind, &object)),
                Err(e) => {
                    warn!("Watch on {:?} failed: {}", kind, e);
                    None
                }
            };
            future::ready(changed)
        })
}

/// Reconcile requests caused by ConfigMap and Secret updates
pub fn reference_triggers(
    client: Client,
    cluster: Arc<dyn ClusterClient>,
    config: Arc<OperatorConfig>,
) -> impl Stream<Item = ObjectRef<ErrandJob>> + Send + 'static {
    let config_maps = reference_updates(
        super::api::<ConfigMap>(&client, &config),
        ReferenceKind::ConfigMap,
    );
    let secrets = reference_updates(super::api::<Secret>(&client, &config), ReferenceKind::Secret);

    stream::select(config_maps, secrets)
        .then(move |changed| {
            let cluster = cluster.clone();
            let config = config.clone();
            async move {
                match errands_to_reconcile(cluster.as_ref(), &config.monitored_id, &changed).await
                {
                    Ok(requests) => requests,
                    Err(e) => {
                        warn!(
                            "Cannot map change of '{}/{}' to errands: {}",
                            changed.namespace, changed.name, e
                        );
                        vec![]
                    }
                }
            }
        })
        .flat_map(stream::iter)
}
