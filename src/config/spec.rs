//! Controller configuration types.
//!
//! These structs map to the optional `gitopssets.yaml` file. Every field has
//! a default, so the controller runs without a file at all.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::api::GeneratorKind;
use crate::cluster::StaticScopeResolver;
use crate::template::FunctionLibrary;

/// The root configuration of the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Generator kinds the controller accepts. Sets using any other kind
    /// fail validation.
    #[serde(default = "default_enabled_generators")]
    pub enabled_generators: Vec<GeneratorKind>,

    /// Service account impersonated for sets that do not name one.
    #[serde(default)]
    pub default_service_account: Option<String>,

    /// Namespace to watch; all namespaces when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,

    /// Delay before retrying a failed reconcile.
    #[serde(default = "default_requeue_on_error_secs")]
    pub requeue_on_error_secs: u64,

    /// Field manager used for server-side apply.
    #[serde(default = "default_field_manager")]
    pub field_manager: String,

    /// Timeout for artifact downloads and APIClient requests.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Template functions or filters blocked in addition to the defaults.
    #[serde(default)]
    pub blocked_functions: Vec<String>,

    /// Kinds treated as cluster-scoped when API discovery cannot tell.
    #[serde(default)]
    pub cluster_scoped_kinds: Vec<String>,
}

fn default_enabled_generators() -> Vec<GeneratorKind> {
    GeneratorKind::ALL
        .iter()
        .copied()
        .filter(|kind| *kind != GeneratorKind::PullRequests)
        .collect()
}

const fn default_requeue_on_error_secs() -> u64 {
    30
}

fn default_field_manager() -> String {
    String::from("gitopssets-controller")
}

const fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled_generators: default_enabled_generators(),
            default_service_account: None,
            watch_namespace: None,
            requeue_on_error_secs: default_requeue_on_error_secs(),
            field_manager: default_field_manager(),
            http_timeout_secs: default_http_timeout_secs(),
            blocked_functions: Vec::new(),
            cluster_scoped_kinds: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Delay before retrying a failed reconcile.
    #[must_use]
    pub const fn requeue_on_error(&self) -> Duration {
        Duration::from_secs(self.requeue_on_error_secs)
    }

    /// Timeout for outbound HTTP requests.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Whether `kind` is enabled.
    #[must_use]
    pub fn is_enabled(&self, kind: GeneratorKind) -> bool {
        self.enabled_generators.contains(&kind)
    }

    /// Template functions with the configured names blocked on top of the
    /// defaults.
    #[must_use]
    pub fn function_library(&self) -> FunctionLibrary {
        self.blocked_functions
            .iter()
            .fold(FunctionLibrary::default(), |library, name| library.with_blocked(name.clone()))
    }

    /// Scope resolver that also treats the configured kinds as cluster-scoped.
    #[must_use]
    pub fn scope_resolver(&self) -> StaticScopeResolver {
        StaticScopeResolver::new(self.cluster_scoped_kinds.iter().cloned())
    }
}
