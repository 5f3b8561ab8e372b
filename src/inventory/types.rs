//! Inventory types.
//!
//! The inventory records which resources a GitOpsSet applied, keyed by an
//! identity string that survives content changes.

use kube::api::DynamicObject;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Reference to one applied resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    /// `<namespace>_<name>_<group>_<kind>`; namespace is empty for
    /// cluster-scoped resources and group is empty for the core group.
    pub id: String,
    /// API version the resource was applied with.
    pub v: String,
}

/// The set of resources applied by the last reconcile.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceInventory {
    /// Entries. Sorted by id when built with `from_refs`.
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

impl ResourceRef {
    /// Builds a reference from its parts.
    #[must_use]
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            id: format!("{namespace}_{name}_{}_{kind}", group_of(api_version)),
            v: api_version.to_string(),
        }
    }

    /// Builds a reference for an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object has no type information or no name.
    pub fn from_object(object: &DynamicObject) -> Result<Self, ClusterError> {
        let types = object.types.as_ref().ok_or_else(|| ClusterError::InvalidObject {
            message: String::from("object has no apiVersion or kind"),
        })?;
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::InvalidObject {
                message: format!("{} has no metadata.name", types.kind),
            })?;
        let namespace = object.metadata.namespace.as_deref().unwrap_or_default();
        Ok(Self::new(&types.api_version, &types.kind, namespace, name))
    }

    fn part(&self, index: usize) -> &str {
        self.id.splitn(4, '_').nth(index).unwrap_or_default()
    }

    /// Namespace, empty for cluster-scoped resources.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.part(0)
    }

    /// Object name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.part(1)
    }

    /// API group, empty for the core group.
    #[must_use]
    pub fn group(&self) -> &str {
        self.part(2)
    }

    /// Kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.part(3)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let namespace = self.namespace();
        if namespace.is_empty() {
            write!(f, "{}/{}", self.kind(), self.name())
        } else {
            write!(f, "{}/{namespace}/{}", self.kind(), self.name())
        }
    }
}

impl ResourceInventory {
    /// Builds an inventory, sorting by id and dropping duplicates.
    #[must_use]
    pub fn from_refs(refs: impl IntoIterator<Item = ResourceRef>) -> Self {
        let mut entries: Vec<ResourceRef> = refs.into_iter().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.dedup_by(|a, b| a.id == b.id);
        Self { entries }
    }

    /// Whether an entry with the same id is present.
    ///
    /// Inventories read back from a stored status may be in any order.
    #[must_use]
    pub fn contains(&self, reference: &ResourceRef) -> bool {
        self.entries.iter().any(|e| e.id == reference.id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the inventory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The group part of an `apiVersion`; empty for the core group.
#[must_use]
pub fn group_of(api_version: &str) -> &str {
    api_version.split_once('/').map_or("", |(group, _)| group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_id_format() {
        let r = ResourceRef::new("apps/v1", "Deployment", "default", "web");
        assert_eq!(r.id, "default_web_apps_Deployment");
        assert_eq!(r.v, "apps/v1");
        assert_eq!(r.group(), "apps");
        assert_eq!(r.kind(), "Deployment");

        let core = ResourceRef::new("v1", "Namespace", "", "team-a");
        assert_eq!(core.id, "_team-a__Namespace");
        assert_eq!(core.namespace(), "");
        assert_eq!(core.name(), "team-a");
        assert_eq!(core.to_string(), "Namespace/team-a");
    }

    #[test]
    fn test_from_object() {
        let object: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"}
        }))
        .expect("valid object");
        let r = ResourceRef::from_object(&object).expect("has identity");
        assert_eq!(r.id, "ns_cm__ConfigMap");
    }

    #[test]
    fn test_inventory_sorted_and_deduplicated() {
        let inventory = ResourceInventory::from_refs([
            ResourceRef::new("v1", "ConfigMap", "ns", "b"),
            ResourceRef::new("v1", "ConfigMap", "ns", "a"),
            ResourceRef::new("v1", "ConfigMap", "ns", "b"),
        ]);
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.entries[0].name(), "a");
        assert!(inventory.contains(&ResourceRef::new("v1", "ConfigMap", "ns", "b")));
        assert!(!inventory.contains(&ResourceRef::new("v1", "ConfigMap", "ns", "c")));
    }

    #[test]
    fn test_contains_on_unsorted_entries() {
        let inventory = ResourceInventory {
            entries: vec![
                ResourceRef::new("v1", "ConfigMap", "ns", "c"),
                ResourceRef::new("v1", "ConfigMap", "ns", "a"),
                ResourceRef::new("v1", "ConfigMap", "ns", "b"),
            ],
        };
        for name in ["a", "b", "c"] {
            assert!(inventory.contains(&ResourceRef::new("v1", "ConfigMap", "ns", name)));
        }
    }
}
