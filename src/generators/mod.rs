//! Element generators.
//!
//! A generator turns one entry of `spec.generators` into a list of
//! [`Element`]s. The [`GeneratorRegistry`] maps each [`GeneratorKind`] to an
//! implementation and refuses sets that use a kind it does not have.

mod api_client;
mod cluster;
mod config;
mod image_policy;
mod list;
mod matrix;
mod repository;

pub use api_client::ApiClient;
pub use cluster::ClusterRecords;
pub use config::ConfigData;
pub use image_policy::ImagePolicies;
pub use list::InlineList;
pub use matrix::Matrix;
pub use repository::RepositoryFiles;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::api::{GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::cluster::{ArtifactFetcher, ObjectReader};
use crate::error::GeneratorError;

/// One parameter map fed to the templates.
pub type Element = BTreeMap<String, Value>;

/// Produces elements for one generator kind.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generates the elements for `spec` on behalf of `set`.
    async fn generate(&self, spec: GeneratorSpec<'_>, set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError>;

    /// How often the set should be regenerated. Zero means only on watch events.
    fn interval(&self, spec: GeneratorSpec<'_>) -> Duration;
}

/// Shared collaborators of the built-in generators.
#[derive(Clone)]
pub struct GeneratorDeps {
    /// Reads sources, ConfigMaps, Secrets and other inputs.
    pub reader: Arc<dyn ObjectReader>,
    /// Downloads repository artifacts.
    pub fetcher: Arc<dyn ArtifactFetcher>,
    /// Timeout for HTTP requests made by the APIClient generator.
    pub http_timeout: Duration,
}

/// Generators available to the controller, keyed by kind.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: HashMap<GeneratorKind, Arc<dyn Generator>>,
    matrix_enabled: bool,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds = self.kinds();
        kinds.sort_unstable();
        f.debug_struct("GeneratorRegistry").field("kinds", &kinds).finish()
    }
}

impl GeneratorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the built-in generators among `enabled`.
    ///
    /// `PullRequests` has no built-in implementation and is skipped; register
    /// one with [`GeneratorRegistry::register`] to enable it.
    #[must_use]
    pub fn builtin(enabled: &[GeneratorKind], deps: &GeneratorDeps) -> Self {
        let mut registry = Self::new();
        for kind in enabled {
            let generator: Arc<dyn Generator> = match kind {
                GeneratorKind::List => Arc::new(InlineList),
                GeneratorKind::Config => Arc::new(ConfigData::new(deps.reader.clone())),
                GeneratorKind::Cluster => Arc::new(ClusterRecords::new(deps.reader.clone())),
                GeneratorKind::GitRepository | GeneratorKind::OciRepository => Arc::new(
                    RepositoryFiles::new(deps.reader.clone(), deps.fetcher.clone()),
                ),
                GeneratorKind::ApiClient => {
                    Arc::new(ApiClient::new(deps.reader.clone(), deps.http_timeout))
                }
                GeneratorKind::ImagePolicy => Arc::new(ImagePolicies::new(deps.reader.clone())),
                GeneratorKind::Matrix => {
                    registry.matrix_enabled = true;
                    continue;
                }
                GeneratorKind::PullRequests => {
                    debug!("No built-in PullRequests generator, leaving it disabled");
                    continue;
                }
            };
            registry.generators.insert(*kind, generator);
        }
        registry.rebuild_matrix();
        registry
    }

    /// Registers (or replaces) the generator for a leaf kind.
    #[must_use]
    pub fn register(mut self, kind: GeneratorKind, generator: Arc<dyn Generator>) -> Self {
        if kind == GeneratorKind::Matrix {
            self.matrix_enabled = true;
        } else {
            self.generators.insert(kind, generator);
        }
        self.rebuild_matrix();
        self
    }

    /// Enables the Matrix combinator over the registered leaf generators.
    #[must_use]
    pub fn with_matrix(mut self) -> Self {
        self.matrix_enabled = true;
        self.rebuild_matrix();
        self
    }

    fn rebuild_matrix(&mut self) {
        if !self.matrix_enabled {
            return;
        }
        let leaves: HashMap<GeneratorKind, Arc<dyn Generator>> = self
            .generators
            .iter()
            .filter(|(kind, _)| **kind != GeneratorKind::Matrix)
            .map(|(kind, generator)| (*kind, generator.clone()))
            .collect();
        self.generators
            .insert(GeneratorKind::Matrix, Arc::new(Matrix::new(leaves)));
    }

    /// Returns true if `kind` has a generator.
    #[must_use]
    pub fn is_enabled(&self, kind: GeneratorKind) -> bool {
        self.generators.contains_key(&kind)
    }

    /// The enabled kinds, in no particular order.
    #[must_use]
    pub fn kinds(&self) -> Vec<GeneratorKind> {
        self.generators.keys().copied().collect()
    }

    fn get(&self, kind: GeneratorKind) -> Result<&Arc<dyn Generator>, GeneratorError> {
        self.generators
            .get(&kind)
            .ok_or(GeneratorError::NotEnabled { kind })
    }

    /// Checks that every kind the set uses, including those nested in a
    /// Matrix, is enabled, and that no entry populates more than one kind.
    ///
    /// # Errors
    ///
    /// Returns `NotEnabled` for the first missing kind.
    pub fn validate(&self, set: &GitOpsSet) -> Result<(), GeneratorError> {
        for entry in &set.spec.generators {
            let specs = entry.specs();
            if let [first, _, ..] = specs.as_slice() {
                return Err(GeneratorError::invalid(
                    first.kind(),
                    "only one generator may be set per entry",
                ));
            }
            if let Some(matrix) = &entry.matrix {
                for nested in &matrix.generators {
                    if let [first, _, ..] = nested.specs().as_slice() {
                        return Err(GeneratorError::invalid(
                            first.kind(),
                            "only one generator may be set per nested entry",
                        ));
                    }
                }
            }
            for kind in entry.required_kinds() {
                self.get(kind)?;
            }
        }
        Ok(())
    }

    /// Validates the set, then runs every generator entry in order.
    ///
    /// Returns one list of elements per entry; entries with nothing populated
    /// yield an empty list.
    ///
    /// # Errors
    ///
    /// Returns the first generator failure, including `NotReady`.
    pub async fn generate(&self, set: &GitOpsSet) -> Result<Vec<Vec<Element>>, GeneratorError> {
        self.validate(set)?;

        let mut groups = Vec::with_capacity(set.spec.generators.len());
        for entry in &set.spec.generators {
            let elements = match entry.specs().first() {
                Some(spec) => self.get(spec.kind())?.generate(*spec, set).await?,
                None => Vec::new(),
            };
            debug!(set = %set.namespaced_name(), count = elements.len(), "Generated elements");
            groups.push(elements);
        }
        Ok(groups)
    }

    /// Smallest non-zero interval of the set's generators.
    #[must_use]
    pub fn requeue_interval(&self, set: &GitOpsSet) -> Option<Duration> {
        set.spec
            .generators
            .iter()
            .flat_map(|entry| entry.specs())
            .filter_map(|spec| {
                self.generators
                    .get(&spec.kind())
                    .map(|generator| generator.interval(spec))
            })
            .filter(|interval| !interval.is_zero())
            .min()
    }
}

/// Converts a JSON value into an element.
///
/// # Errors
///
/// Returns `InvalidSpec` if the value is not an object.
pub fn element_from_value(kind: GeneratorKind, value: Value) -> Result<Element, GeneratorError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(GeneratorError::invalid(
            kind,
            format!("element must be an object, got {other}"),
        )),
    }
}

/// Error for a spec routed to the wrong generator.
fn unexpected_spec(expected: GeneratorKind, spec: GeneratorSpec<'_>) -> GeneratorError {
    GeneratorError::invalid(
        expected,
        format!("cannot handle a {} generator", spec.kind()),
    )
}

/// Parses an optional interval field.
fn interval_or(interval: Option<&str>, default: Duration) -> Duration {
    interval
        .and_then(|s| crate::api::parse_duration(s).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GitOpsSetSpec;
    use crate::cluster::{HttpArtifactFetcher, MemoryCluster};

    fn deps() -> GeneratorDeps {
        GeneratorDeps {
            reader: Arc::new(MemoryCluster::new()),
            fetcher: Arc::new(HttpArtifactFetcher::new(Duration::from_secs(1)).expect("client")),
            http_timeout: Duration::from_secs(1),
        }
    }

    fn set_from_yaml(spec: &str) -> GitOpsSet {
        let spec: GitOpsSetSpec = serde_yaml::from_str(spec).expect("valid spec");
        let mut set = GitOpsSet::new("demo", spec);
        set.metadata.namespace = Some(String::from("default"));
        set
    }

    #[test]
    fn test_pull_requests_not_builtin() {
        let registry = GeneratorRegistry::builtin(&GeneratorKind::ALL, &deps());
        assert!(registry.is_enabled(GeneratorKind::Matrix));
        assert!(!registry.is_enabled(GeneratorKind::PullRequests));
    }

    #[tokio::test]
    async fn test_validation_before_generation() {
        let registry = GeneratorRegistry::builtin(&[GeneratorKind::List], &deps());
        let set = set_from_yaml(
            r"
generators:
  - list:
      elements: [{env: dev}]
  - matrix:
      generators:
        - list:
            elements: [{a: 1}]
",
        );
        let err = registry.generate(&set).await.expect_err("matrix disabled");
        assert_eq!(err.to_string(), "generator Matrix not enabled");
    }

    #[tokio::test]
    async fn test_nested_kind_must_be_enabled() {
        let registry = GeneratorRegistry::new()
            .register(GeneratorKind::List, Arc::new(InlineList))
            .with_matrix();
        let set = set_from_yaml(
            r"
generators:
  - matrix:
      generators:
        - list:
            elements: [{a: 1}]
        - config:
            kind: ConfigMap
            name: cm
",
        );
        let err = registry.validate(&set).expect_err("config disabled");
        assert_eq!(err.to_string(), "generator Config not enabled");
    }

    #[tokio::test]
    async fn test_empty_entry_yields_no_elements() {
        let registry = GeneratorRegistry::builtin(&[GeneratorKind::List], &deps());
        let set = set_from_yaml("generators:\n  - {}\n");
        let groups = registry.generate(&set).await.expect("generated");
        assert_eq!(groups, vec![Vec::<Element>::new()]);
    }

    #[test]
    fn test_requeue_interval_picks_smallest_non_zero() {
        let registry = GeneratorRegistry::builtin(&GeneratorKind::ALL, &deps());
        let set = set_from_yaml(
            r"
generators:
  - list:
      elements: []
  - gitRepository:
      repositoryRef: repo
      interval: 10m
  - apiClient:
      endpoint: http://example.com
      interval: 2m
",
        );
        assert_eq!(registry.requeue_interval(&set), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_element_from_value_rejects_scalars() {
        assert!(element_from_value(GeneratorKind::List, serde_json::json!({"a": 1})).is_ok());
        assert!(element_from_value(GeneratorKind::List, serde_json::json!("a")).is_err());
    }
}
