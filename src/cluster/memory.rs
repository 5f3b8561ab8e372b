//! In-memory cluster.
//!
//! Implements every cluster trait over a shared map of JSON objects. Used by
//! the test suite and by the offline `render` command.

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ClientFactory, ClusterClient, ObjectReader, ScopeResolver, SetStore, StaticScopeResolver};
use crate::api::{GitOpsSet, GitOpsSetStatus, LabelSelector};
use crate::error::{ClusterError, StoreError};
use crate::inventory::{ResourceRef, group_of};

/// `(group, kind, namespace, name)`.
type ObjectKey = (String, String, String, String);

/// A write recorded by [`MemoryCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// An object was created.
    Create {
        /// Inventory id of the object.
        id: String,
        /// Identity the write was made as.
        identity: Option<String>,
    },
    /// An object was applied in place.
    Update {
        /// Inventory id of the object.
        id: String,
        /// Identity the write was made as.
        identity: Option<String>,
    },
    /// An object was deleted.
    Delete {
        /// Inventory id of the object.
        id: String,
        /// Identity the write was made as.
        identity: Option<String>,
    },
}

impl WriteOp {
    /// Inventory id of the written object.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Create { id, .. } | Self::Update { id, .. } | Self::Delete { id, .. } => id,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    sets: BTreeMap<(String, String), GitOpsSet>,
    resource_version: u64,
    next_uid: u64,
    forbidden: BTreeSet<String>,
    writes: Vec<WriteOp>,
}

impl Inner {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Shared in-memory cluster state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<Inner>>,
    scope: StaticScopeResolver,
}

impl MemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `scope` to decide which kinds are namespaced.
    #[must_use]
    pub fn with_scope(mut self, scope: StaticScopeResolver) -> Self {
        self.scope = scope;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a GitOpsSet, assigning uid, generation and resourceVersion.
    pub fn insert_set(&self, mut set: GitOpsSet) -> GitOpsSet {
        let mut inner = self.lock();
        if set.metadata.uid.is_none() {
            inner.next_uid += 1;
            set.metadata.uid = Some(format!("uid-{}", inner.next_uid));
        }
        if set.metadata.generation.is_none() {
            set.metadata.generation = Some(1);
        }
        set.metadata.resource_version = Some(inner.next_resource_version());
        let key = set_key(&set);
        inner.sets.insert(key, set.clone());
        set
    }

    /// Replaces the spec of a stored set and bumps its generation.
    pub fn update_spec(&self, namespace: &str, name: &str, spec: crate::api::GitOpsSetSpec) {
        let mut inner = self.lock();
        let version = inner.next_resource_version();
        if let Some(set) = inner.sets.get_mut(&(namespace.to_string(), name.to_string())) {
            set.spec = spec;
            set.metadata.generation = Some(set.metadata.generation.unwrap_or(0) + 1);
            set.metadata.resource_version = Some(version);
        }
    }

    /// Marks a stored set for deletion, removing it at once if it has no finalizers.
    pub fn request_delete(&self, namespace: &str, name: &str) {
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let has_finalizers = inner
            .sets
            .get(&key)
            .is_some_and(|s| s.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()));
        if has_finalizers {
            let version = inner.next_resource_version();
            if let Some(set) = inner.sets.get_mut(&key) {
                set.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    chrono::Utc::now(),
                ));
                set.metadata.resource_version = Some(version);
            }
        } else {
            inner.sets.remove(&key);
        }
    }

    /// Changes the resourceVersion of a stored set, as a concurrent writer would.
    pub fn bump_set(&self, namespace: &str, name: &str) {
        let mut inner = self.lock();
        let version = inner.next_resource_version();
        if let Some(set) = inner.sets.get_mut(&(namespace.to_string(), name.to_string())) {
            set.metadata.resource_version = Some(version);
        }
    }

    /// Current copy of a stored set.
    #[must_use]
    pub fn set(&self, namespace: &str, name: &str) -> Option<GitOpsSet> {
        self.lock()
            .sets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Stores an arbitrary object given as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the object has no apiVersion, kind or name.
    pub fn insert_object(&self, object: Value) -> Result<(), ClusterError> {
        let key = value_key(&object)?;
        self.lock().objects.insert(key, object);
        Ok(())
    }

    /// Current copy of an object.
    #[must_use]
    pub fn object(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .get(&make_key(api_version, kind, namespace, name))
            .cloned()
    }

    /// All stored objects, in key order.
    #[must_use]
    pub fn objects(&self) -> Vec<Value> {
        self.lock().objects.values().cloned().collect()
    }

    /// Makes every write performed as `identity` fail as forbidden.
    pub fn forbid(&self, identity: &str) {
        self.lock().forbidden.insert(identity.to_string());
    }

    /// Writes performed so far, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<WriteOp> {
        self.lock().writes.clone()
    }

    /// Forgets recorded writes.
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

fn make_key(api_version: &str, kind: &str, namespace: &str, name: &str) -> ObjectKey {
    (
        group_of(api_version).to_string(),
        kind.to_string(),
        namespace.to_string(),
        name.to_string(),
    )
}

fn value_key(object: &Value) -> Result<ObjectKey, ClusterError> {
    let field = |pointer: &str| object.pointer(pointer).and_then(Value::as_str);
    match (field("/apiVersion"), field("/kind"), field("/metadata/name")) {
        (Some(api_version), Some(kind), Some(name)) => Ok(make_key(
            api_version,
            kind,
            field("/metadata/namespace").unwrap_or_default(),
            name,
        )),
        _ => Err(ClusterError::InvalidObject {
            message: String::from("object requires apiVersion, kind and metadata.name"),
        }),
    }
}

fn ref_key(reference: &ResourceRef) -> ObjectKey {
    (
        reference.group().to_string(),
        reference.kind().to_string(),
        reference.namespace().to_string(),
        reference.name().to_string(),
    )
}

fn set_key(set: &GitOpsSet) -> (String, String) {
    (
        set.metadata.namespace.clone().unwrap_or_default(),
        set.metadata.name.clone().unwrap_or_default(),
    )
}

fn plural(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ObjectReader for MemoryCluster {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Value>, ClusterError> {
        Ok(self.object(api_version, kind, namespace, name))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Value>, ClusterError> {
        let group = group_of(api_version);
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((g, k, ns, _), _)| {
                g == group && k == kind && (namespace.is_empty() || ns == namespace)
            })
            .filter(|(_, object)| selector.matches(&labels_of(object)))
            .map(|(_, object)| object.clone())
            .collect())
    }
}

/// A [`ClusterClient`] over a [`MemoryCluster`] acting as one identity.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    cluster: MemoryCluster,
    identity: Option<String>,
}

impl MemoryClient {
    fn check_allowed(&self, verb: &str, kind: &str, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let Some(identity) = &self.identity else {
            return Ok(());
        };
        if !self.cluster.lock().forbidden.contains(identity) {
            return Ok(());
        }
        let resource = plural(kind);
        Err(ClusterError::Forbidden {
            message: format!(
                "{resource} \"{name}\" is forbidden: User \"{identity}\" cannot {verb} resource \"{resource}\" in the namespace \"{namespace}\""
            ),
        })
    }

    fn record(&self, op: impl FnOnce(String, Option<String>) -> WriteOp, id: String) {
        self.cluster.lock().writes.push(op(id, self.identity.clone()));
    }
}

fn object_parts(object: &DynamicObject) -> Result<(ResourceRef, Value), ClusterError> {
    let reference = ResourceRef::from_object(object)?;
    let value = serde_json::to_value(object).map_err(|e| ClusterError::InvalidObject {
        message: e.to_string(),
    })?;
    Ok((reference, value))
}

#[async_trait]
impl ClusterClient for MemoryClient {
    async fn create(&self, object: &DynamicObject) -> Result<(), ClusterError> {
        let (reference, value) = object_parts(object)?;
        self.check_allowed("create", reference.kind(), reference.namespace(), reference.name())?;
        {
            let mut inner = self.cluster.lock();
            let key = ref_key(&reference);
            if inner.objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists {
                    message: format!("{} \"{}\" already exists", plural(reference.kind()), reference.name()),
                });
            }
            inner.objects.insert(key, value);
        }
        self.record(|id, identity| WriteOp::Create { id, identity }, reference.id);
        Ok(())
    }

    async fn update(&self, object: &DynamicObject) -> Result<(), ClusterError> {
        let (reference, value) = object_parts(object)?;
        self.check_allowed("patch", reference.kind(), reference.namespace(), reference.name())?;
        self.cluster.lock().objects.insert(ref_key(&reference), value);
        self.record(|id, identity| WriteOp::Update { id, identity }, reference.id);
        Ok(())
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<(), ClusterError> {
        self.check_allowed("delete", reference.kind(), reference.namespace(), reference.name())?;
        let removed = self.cluster.lock().objects.remove(&ref_key(reference));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                message: format!("{} \"{}\" not found", plural(reference.kind()), reference.name()),
            });
        }
        self.record(|id, identity| WriteOp::Delete { id, identity }, reference.id.clone());
        Ok(())
    }
}

#[async_trait]
impl ClientFactory for MemoryCluster {
    async fn client_for(&self, identity: Option<&str>) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        Ok(Arc::new(MemoryClient {
            cluster: self.clone(),
            identity: identity.map(String::from),
        }))
    }
}

#[async_trait]
impl ScopeResolver for MemoryCluster {
    async fn is_namespaced(&self, _api_version: &str, kind: &str) -> Result<bool, ClusterError> {
        Ok(self.scope.namespaced(kind))
    }
}

#[async_trait]
impl SetStore for MemoryCluster {
    async fn get_set(&self, namespace: &str, name: &str) -> Result<Option<GitOpsSet>, StoreError> {
        Ok(self.set(namespace, name))
    }

    async fn update_status(
        &self,
        set: &GitOpsSet,
        status: &GitOpsSetStatus,
    ) -> Result<GitOpsSet, StoreError> {
        let (namespace, name) = set_key(set);
        let mut inner = self.lock();
        let stored_version = match inner.sets.get(&(namespace.clone(), name.clone())) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(StoreError::NotFound { namespace, name }),
        };
        if stored_version != set.metadata.resource_version {
            return Err(StoreError::Conflict {
                namespace,
                name,
                message: String::from(
                    "the object has been modified; please apply your changes to the latest version and try again",
                ),
            });
        }
        let version = inner.next_resource_version();
        let stored = inner
            .sets
            .get_mut(&(namespace.clone(), name.clone()))
            .ok_or(StoreError::NotFound { namespace, name })?;
        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn set_finalizers(
        &self,
        set: &GitOpsSet,
        finalizers: Vec<String>,
    ) -> Result<GitOpsSet, StoreError> {
        let key = set_key(set);
        let mut inner = self.lock();
        let version = inner.next_resource_version();
        let stored = inner.sets.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            namespace: key.0.clone(),
            name: key.1.clone(),
        })?;
        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if released {
            inner.sets.remove(&key);
        }
        Ok(updated)
    }
}
