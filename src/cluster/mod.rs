//! Cluster access boundary.
//!
//! Everything the controller reads from or writes to the cluster goes through
//! the traits in this module. [`KubeCluster`] talks to a real API server;
//! [`MemoryCluster`] keeps objects in memory for tests and offline rendering.

mod artifact;
mod kubernetes;
mod memory;

pub use artifact::{Artifact, HttpArtifactFetcher};
pub use kubernetes::{KubeCluster, KubeEventRecorder};
pub use memory::{MemoryCluster, WriteOp};

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::api::{GitOpsSet, GitOpsSetStatus, LabelSelector};
use crate::error::{ClusterError, GeneratorError, StoreError};
use crate::inventory::ResourceRef;

/// Read access to arbitrary objects, as JSON.
#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Fetches one object. `Ok(None)` when it does not exist.
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, ClusterError>;

    /// Lists objects matching a label selector. An empty namespace lists
    /// across all namespaces.
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Value>, ClusterError>;
}

/// Write access to generic resources under one identity.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Creates an object. Fails with `AlreadyExists` if it is present.
    async fn create(&self, object: &DynamicObject) -> Result<(), ClusterError>;

    /// Updates an object in place using server-side apply.
    async fn update(&self, object: &DynamicObject) -> Result<(), ClusterError>;

    /// Deletes the referenced object.
    async fn delete(&self, reference: &ResourceRef) -> Result<(), ClusterError>;
}

/// Builds cluster clients for impersonated identities.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// A client acting as `identity`, or as the controller itself when `None`.
    async fn client_for(&self, identity: Option<&str>) -> Result<Arc<dyn ClusterClient>, ClusterError>;
}

/// Persistence for GitOpsSets.
#[async_trait]
pub trait SetStore: Send + Sync {
    /// Loads a set. `Ok(None)` when it does not exist.
    async fn get_set(&self, namespace: &str, name: &str) -> Result<Option<GitOpsSet>, StoreError>;

    /// Replaces the status, guarded by the `resourceVersion` of `set`.
    async fn update_status(
        &self,
        set: &GitOpsSet,
        status: &GitOpsSetStatus,
    ) -> Result<GitOpsSet, StoreError>;

    /// Replaces the finalizer list.
    async fn set_finalizers(
        &self,
        set: &GitOpsSet,
        finalizers: Vec<String>,
    ) -> Result<GitOpsSet, StoreError>;
}

/// Decides whether a kind is namespaced.
#[async_trait]
pub trait ScopeResolver: Send + Sync {
    /// Whether objects of `(api_version, kind)` live in a namespace.
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ClusterError>;
}

/// Type of an event emitted on a GitOpsSet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

/// Emits events on a GitOpsSet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publishes an event. Failures are logged, never returned.
    async fn publish(&self, set: &GitOpsSet, kind: EventKind, reason: &str, message: &str);
}

/// Downloads source artifacts.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetches and unpacks the artifact at `url`.
    async fn fetch(&self, url: &str) -> Result<Artifact, GeneratorError>;
}

/// Kinds that are cluster-scoped in every Kubernetes distribution.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PriorityClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "APIService",
    "IngressClass",
    "RuntimeClass",
    "CSIDriver",
    "CSINode",
    "VolumeAttachment",
];

/// Scope resolver backed by a fixed table of cluster-scoped kinds.
#[derive(Debug, Clone)]
pub struct StaticScopeResolver {
    cluster_scoped: BTreeSet<String>,
}

impl StaticScopeResolver {
    /// The built-in table plus `extra` kinds.
    #[must_use]
    pub fn new(extra: impl IntoIterator<Item = String>) -> Self {
        let mut cluster_scoped: BTreeSet<String> =
            CLUSTER_SCOPED_KINDS.iter().map(|k| (*k).to_string()).collect();
        cluster_scoped.extend(extra);
        Self { cluster_scoped }
    }

    /// Whether `kind` is namespaced according to the table.
    #[must_use]
    pub fn namespaced(&self, kind: &str) -> bool {
        !self.cluster_scoped.contains(kind)
    }
}

impl Default for StaticScopeResolver {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

#[async_trait]
impl ScopeResolver for StaticScopeResolver {
    async fn is_namespaced(&self, _api_version: &str, kind: &str) -> Result<bool, ClusterError> {
        Ok(self.namespaced(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_scope_resolver() {
        let resolver = StaticScopeResolver::new([String::from("GitopsCluster")]);
        assert!(!resolver.is_namespaced("v1", "Namespace").await.expect("resolves"));
        assert!(resolver.is_namespaced("v1", "ConfigMap").await.expect("resolves"));
        assert!(!resolver.namespaced("GitopsCluster"));
    }
}
