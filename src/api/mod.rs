//! GitOpsSet custom resource types.
//!
//! This module defines the `templates.weave.works/v1alpha1` `GitOpsSet`
//! resource, its generator union and its status (conditions and inventory).

mod condition;
mod generator;
mod gitopsset;

pub use condition::{Condition, ConditionStatus, MAX_CONDITION_MESSAGE_LEN, READY_CONDITION};
pub use generator::{
    ApiClientGenerator, ClusterGenerator, ConfigGenerator, ConfigKind, GeneratorKind,
    GeneratorSpec, GitOpsSetGenerator, GitOpsSetNestedGenerator, HeadersReference,
    ImagePolicyGenerator, LabelSelector, LabelSelectorRequirement, ListGenerator,
    MatrixGenerator, PullRequestGenerator, RepositoryDirectoryItem, RepositoryFileItem,
    RepositoryGenerator, parse_duration,
};
pub use gitopsset::{
    DELIMITERS_ANNOTATION, FINALIZER, GitOpsSet, GitOpsSetSpec, GitOpsSetStatus,
    GitOpsSetTemplate, LABEL_SET_NAME, LABEL_SET_NAMESPACE, RECONCILE_REQUESTED_AT_ANNOTATION,
};
