// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # GitOpsSets Controller
//!
//! A Kubernetes controller that expands `GitOpsSet` resources into many
//! Kubernetes objects.
//!
//! ## Overview
//!
//! A `GitOpsSet` pairs **generators** with **templates**:
//!
//! - Generators produce elements (parameter maps) from inline lists, Flux
//!   source artifacts, HTTP APIs, ImagePolicies, ConfigMaps, Secrets and
//!   cluster records, or from the cartesian product of other generators
//! - Templates are rendered once per element (and per repeat item)
//! - The rendered objects are applied, tracked in an inventory and pruned
//!   when they stop being generated
//!
//! ## Architecture
//!
//! 1. **Desired State**: the set's templates rendered against its elements
//! 2. **Previous State**: the inventory recorded in the set's status
//! 3. **Reconciler**: diffs the two, applies creates and updates, deletes
//!    what is gone and records the outcome in the `Ready` condition
//!
//! ## Modules
//!
//! - [`api`]: The `GitOpsSet` custom resource
//! - [`generators`]: Element generators and their registry
//! - [`template`]: Template rendering and resource normalization
//! - [`inventory`]: Inventory tracking, diffing and apply
//! - [`cluster`]: Cluster access traits with Kubernetes and in-memory backends
//! - [`reconciler`]: The reconcile algorithm
//! - [`controller`]: Control loop wiring
//! - [`config`]: Controller configuration parsing and validation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: templates.weave.works/v1alpha1
//! kind: GitOpsSet
//! metadata:
//!   name: environments
//! spec:
//!   generators:
//!     - list:
//!         elements:
//!           - env: prod
//!           - env: staging
//!   templates:
//!     - content:
//!         apiVersion: v1
//!         kind: ConfigMap
//!         metadata:
//!           name: "{{ .Element.env }}-settings"
//!         data:
//!           env: "{{ .Element.env }}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod api;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod generators;
pub mod inventory;
pub mod reconciler;
pub mod template;

// ============================================================================
// Re-exports
// ============================================================================

pub use api::{GeneratorKind, GitOpsSet, GitOpsSetSpec, GitOpsSetStatus};
pub use cli::{Cli, Commands, OutputFormatter};
pub use cluster::{EventRecorder, KubeCluster, MemoryCluster};
pub use config::{ConfigParser, ConfigValidator, ControllerConfig};
pub use error::{GitOpsSetError, Result};
pub use generators::{Element, Generator, GeneratorDeps, GeneratorRegistry};
pub use inventory::{ApplyExecutor, InventoryDiff, ResourceInventory, ResourceRef};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use template::{RenderedResource, Renderer};
