//! Kubernetes API server backed implementations of the cluster traits.

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    ClientFactory, ClusterClient, EventKind, EventRecorder, ObjectReader, ScopeResolver, SetStore,
    StaticScopeResolver,
};
use crate::api::{GitOpsSet, GitOpsSetStatus, LabelSelector};
use crate::error::{ClusterError, StoreError};
use crate::inventory::ResourceRef;

/// Maps a kube client error onto the cluster error taxonomy.
fn cluster_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => {
            ClusterError::from_status(response.code, &response.reason, response.message)
        }
        other => ClusterError::Api {
            code: 0,
            message: other.to_string(),
        },
    }
}

fn store_error(set: &GitOpsSet, err: kube::Error) -> StoreError {
    let namespace = set.namespace_or_default();
    let name = set.metadata.name.clone().unwrap_or_default();
    match err {
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict {
            namespace,
            name,
            message: response.message,
        },
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound { namespace, name },
        other => StoreError::Api {
            message: other.to_string(),
        },
    }
}

fn gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
    GroupVersionKind::gvk(group, version, kind)
}

/// Resolves the API resource for a kind through discovery.
async fn discover(
    client: &Client,
    api_version: &str,
    kind: &str,
) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
    kube::discovery::pinned_kind(client, &gvk(api_version, kind))
        .await
        .map_err(cluster_error)
}

fn dynamic_api(client: Client, resource: &ApiResource, caps: &ApiCapabilities, namespace: &str) -> Api<DynamicObject> {
    if caps.scope == Scope::Namespaced && !namespace.is_empty() {
        Api::namespaced_with(client, namespace, resource)
    } else {
        Api::all_with(client, resource)
    }
}

/// Cluster access through a Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    config: kube::Config,
    field_manager: String,
    fallback_scope: StaticScopeResolver,
}

impl KubeCluster {
    /// Connects using the ambient kubeconfig or in-cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no configuration can be inferred.
    pub async fn connect(field_manager: &str, fallback_scope: StaticScopeResolver) -> Result<Self, ClusterError> {
        let config = kube::Config::infer().await.map_err(|e| ClusterError::Client {
            identity: String::from("controller"),
            message: e.to_string(),
        })?;
        let client = Client::try_from(config.clone()).map_err(|e| ClusterError::Client {
            identity: String::from("controller"),
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            config,
            field_manager: field_manager.to_string(),
            fallback_scope,
        })
    }

    /// The underlying client, acting as the controller.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn sets(&self, namespace: &str) -> Api<GitOpsSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectReader for KubeCluster {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, ClusterError> {
        let (resource, caps) = discover(&self.client, api_version, kind).await?;
        let object = dynamic_api(self.client.clone(), &resource, &caps, namespace)
            .get_opt(name)
            .await
            .map_err(cluster_error)?;
        object
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| ClusterError::InvalidObject {
                message: e.to_string(),
            })
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Value>, ClusterError> {
        let (resource, caps) = discover(&self.client, api_version, kind).await?;
        let params = ListParams::default().labels(&selector.to_query());
        let objects = dynamic_api(self.client.clone(), &resource, &caps, namespace)
            .list(&params)
            .await
            .map_err(cluster_error)?;
        objects
            .items
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ClusterError::InvalidObject {
                message: e.to_string(),
            })
    }
}

/// Writes generic resources as one identity.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    field_manager: String,
}

impl KubeClient {
    async fn api_for(&self, object: &DynamicObject) -> Result<(Api<DynamicObject>, String), ClusterError> {
        let types = object.types.as_ref().ok_or_else(|| ClusterError::InvalidObject {
            message: String::from("object has no apiVersion or kind"),
        })?;
        let name = object.metadata.name.clone().ok_or_else(|| ClusterError::InvalidObject {
            message: format!("{} has no metadata.name", types.kind),
        })?;
        let (resource, caps) = discover(&self.client, &types.api_version, &types.kind).await?;
        let namespace = object.metadata.namespace.as_deref().unwrap_or_default();
        Ok((dynamic_api(self.client.clone(), &resource, &caps, namespace), name))
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn create(&self, object: &DynamicObject) -> Result<(), ClusterError> {
        let (api, name) = self.api_for(object).await?;
        debug!(name = %name, "Creating resource");
        api.create(&PostParams::default(), object)
            .await
            .map_err(cluster_error)?;
        Ok(())
    }

    async fn update(&self, object: &DynamicObject) -> Result<(), ClusterError> {
        let (api, name) = self.api_for(object).await?;
        debug!(name = %name, "Applying resource");
        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(&name, &params, &Patch::Apply(object))
            .await
            .map_err(cluster_error)?;
        Ok(())
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<(), ClusterError> {
        let (resource, caps) = discover(&self.client, &reference.v, reference.kind()).await?;
        debug!(resource = %reference, "Deleting resource");
        dynamic_api(self.client.clone(), &resource, &caps, reference.namespace())
            .delete(reference.name(), &DeleteParams::background())
            .await
            .map_err(cluster_error)?;
        Ok(())
    }
}

#[async_trait]
impl ClientFactory for KubeCluster {
    async fn client_for(&self, identity: Option<&str>) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let client = match identity {
            None => self.client.clone(),
            Some(identity) => {
                let mut config = self.config.clone();
                config.auth_info.impersonate = Some(identity.to_string());
                Client::try_from(config).map_err(|e| ClusterError::Client {
                    identity: identity.to_string(),
                    message: e.to_string(),
                })?
            }
        };
        Ok(Arc::new(KubeClient {
            client,
            field_manager: self.field_manager.clone(),
        }))
    }
}

#[async_trait]
impl ScopeResolver for KubeCluster {
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ClusterError> {
        match discover(&self.client, api_version, kind).await {
            Ok((_, caps)) => Ok(caps.scope == Scope::Namespaced),
            Err(err) => {
                debug!(api_version, kind, error = %err, "Discovery failed, using static scope table");
                Ok(self.fallback_scope.namespaced(kind))
            }
        }
    }
}

#[async_trait]
impl SetStore for KubeCluster {
    async fn get_set(&self, namespace: &str, name: &str) -> Result<Option<GitOpsSet>, StoreError> {
        self.sets(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::Api {
                message: e.to_string(),
            })
    }

    async fn update_status(
        &self,
        set: &GitOpsSet,
        status: &GitOpsSetStatus,
    ) -> Result<GitOpsSet, StoreError> {
        let name = set.metadata.name.clone().unwrap_or_default();
        let patch = json!({
            "metadata": { "resourceVersion": set.metadata.resource_version },
            "status": status,
        });
        self.sets(&set.namespace_or_default())
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(set, e))
    }

    async fn set_finalizers(
        &self,
        set: &GitOpsSet,
        finalizers: Vec<String>,
    ) -> Result<GitOpsSet, StoreError> {
        let name = set.metadata.name.clone().unwrap_or_default();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.sets(&set.namespace_or_default())
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(set, e))
    }
}

/// Publishes Kubernetes events on GitOpsSets.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    /// Creates a recorder reporting as `controller`.
    #[must_use]
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, set: &GitOpsSet, kind: EventKind, reason: &str, message: &str) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: String::from("Reconcile"),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &set.object_ref(&())).await {
            warn!(set = %set.namespaced_name(), reason, error = %e, "Failed to publish event");
        }
    }
}
