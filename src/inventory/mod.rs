//! Inventory of applied resources.
//!
//! This module tracks what a GitOpsSet applied, computes the difference
//! against a newly rendered set of resources and applies it.

mod diff;
mod executor;
mod types;

pub use diff::{DiffType, InventoryDiff, ResourceDiff};
pub use executor::{ApplyExecutor, ApplyOutcome};
pub use types::{ResourceInventory, ResourceRef, group_of};
