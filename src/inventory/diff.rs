//! Diff engine for comparing desired resources with the stored inventory.
//!
//! Identity is the only thing compared: a desired resource is either new
//! (create) or already tracked (update in place), and a tracked resource
//! that is no longer desired is deleted.

use std::collections::BTreeSet;
use tracing::debug;

use super::types::{ResourceInventory, ResourceRef};

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource is not tracked and must be created.
    Create,
    /// Resource is tracked and is applied in place.
    Update,
    /// Resource is tracked but no longer desired.
    Delete,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// The resource.
    pub reference: ResourceRef,
    /// Type of difference.
    pub diff_type: DiffType,
}

/// Complete diff result, in execution order: deletes first, then creates
/// and updates sorted by id.
#[derive(Debug, Clone, Default)]
pub struct InventoryDiff {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
}

impl InventoryDiff {
    /// Computes the diff between the previous inventory and the desired refs.
    #[must_use]
    pub fn compute(previous: Option<&ResourceInventory>, desired: &[ResourceRef]) -> Self {
        let empty = ResourceInventory::default();
        let previous = previous.unwrap_or(&empty);
        let desired_ids: BTreeSet<&str> = desired.iter().map(|r| r.id.as_str()).collect();
        let previous_ids: BTreeSet<&str> = previous.entries.iter().map(|r| r.id.as_str()).collect();

        let mut diffs: Vec<ResourceDiff> = previous
            .entries
            .iter()
            .filter(|entry| !desired_ids.contains(entry.id.as_str()))
            .map(|entry| {
                debug!(resource = %entry, "Resource no longer desired");
                ResourceDiff {
                    reference: entry.clone(),
                    diff_type: DiffType::Delete,
                }
            })
            .collect();

        let mut wanted: Vec<&ResourceRef> = desired.iter().collect();
        wanted.sort_by(|a, b| a.id.cmp(&b.id));
        wanted.dedup_by(|a, b| a.id == b.id);
        for reference in wanted {
            let diff_type = if previous_ids.contains(reference.id.as_str()) {
                DiffType::Update
            } else {
                DiffType::Create
            };
            diffs.push(ResourceDiff {
                reference: reference.clone(),
                diff_type,
            });
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        let (creates, updates, deletes) = (count(DiffType::Create), count(DiffType::Update), count(DiffType::Delete));

        Self {
            diffs,
            creates,
            updates,
            deletes,
        }
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reference, self.diff_type)
    }
}
