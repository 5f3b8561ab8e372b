//! Executor for applying an inventory diff.
//!
//! Actions run in diff order and stop at the first failure. The inventory
//! returned always describes what is on the cluster afterwards: previous
//! entries that were not deleted plus everything created.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::diff::{DiffType, InventoryDiff};
use super::types::{ResourceInventory, ResourceRef};
use crate::cluster::ClusterClient;
use crate::error::ClusterError;
use crate::template::RenderedResource;

/// Executor for inventory diffs.
pub struct ApplyExecutor<'a> {
    /// Client acting as the set's identity.
    client: &'a dyn ClusterClient,
    /// Controller reference to the owning set.
    owner: Option<OwnerReference>,
}

/// Result of executing a diff.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// Inventory reflecting what was applied.
    pub inventory: ResourceInventory,
    /// Number of resources created.
    pub created: usize,
    /// Number of resources updated.
    pub updated: usize,
    /// Number of resources deleted, including ones already gone.
    pub deleted: usize,
    /// The failure that stopped execution, if any.
    pub error: Option<ClusterError>,
}

impl ApplyOutcome {
    /// Returns true if every action succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl<'a> ApplyExecutor<'a> {
    /// Creates a new executor.
    #[must_use]
    pub const fn new(client: &'a dyn ClusterClient) -> Self {
        Self { client, owner: None }
    }

    /// Sets the owner reference attached to namespaced resources.
    #[must_use]
    pub fn with_owner(mut self, owner: Option<OwnerReference>) -> Self {
        self.owner = owner;
        self
    }

    /// Executes `diff`, taking objects from `resources`.
    pub async fn execute(
        &self,
        diff: &InventoryDiff,
        previous: Option<&ResourceInventory>,
        resources: &[RenderedResource],
    ) -> ApplyOutcome {
        info!(
            "Applying {} creates, {} updates, {} deletes",
            diff.creates, diff.updates, diff.deletes
        );

        let by_id: BTreeMap<&str, &RenderedResource> = resources
            .iter()
            .map(|r| (r.reference.id.as_str(), r))
            .collect();

        let mut kept: BTreeMap<String, ResourceRef> = previous
            .map(|p| p.entries.iter().map(|e| (e.id.clone(), e.clone())).collect())
            .unwrap_or_default();
        let mut outcome = ApplyOutcome {
            inventory: ResourceInventory::default(),
            created: 0,
            updated: 0,
            deleted: 0,
            error: None,
        };

        for action in &diff.diffs {
            let result = match action.diff_type {
                DiffType::Delete => self.delete(&action.reference).await,
                DiffType::Create | DiffType::Update => {
                    match by_id.get(action.reference.id.as_str()) {
                        Some(resource) => self.apply(resource, action.diff_type).await,
                        None => Err(ClusterError::InvalidObject {
                            message: format!("no rendered object for {}", action.reference),
                        }),
                    }
                }
            };

            match result {
                Ok(()) => match action.diff_type {
                    DiffType::Delete => {
                        kept.remove(&action.reference.id);
                        outcome.deleted += 1;
                    }
                    DiffType::Create => {
                        kept.insert(action.reference.id.clone(), action.reference.clone());
                        outcome.created += 1;
                    }
                    DiffType::Update => {
                        kept.insert(action.reference.id.clone(), action.reference.clone());
                        outcome.updated += 1;
                    }
                },
                Err(err) => {
                    warn!(resource = %action.reference, action = %action.diff_type, error = %err, "Apply failed");
                    outcome.error = Some(err);
                    break;
                }
            }
        }

        outcome.inventory = ResourceInventory::from_refs(kept.into_values());
        outcome
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<(), ClusterError> {
        match self.client.delete(reference).await {
            Err(err) if err.is_not_found() => {
                debug!(resource = %reference, "Resource already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn apply(&self, resource: &RenderedResource, diff_type: DiffType) -> Result<(), ClusterError> {
        let mut object = resource.object.clone();
        if resource.namespaced
            && let Some(owner) = &self.owner
        {
            object.metadata.owner_references = Some(vec![owner.clone()]);
        }
        debug!(resource = %resource.reference, action = %diff_type, "Applying");
        if diff_type == DiffType::Create {
            self.client.create(&object).await
        } else {
            self.client.update(&object).await
        }
    }
}
