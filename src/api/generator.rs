//! Generator specifications.
//!
//! On the wire a generator entry is a struct with one optional field per
//! kind. [`GeneratorSpec`] is the typed view used for dispatch: one variant
//! per kind, borrowed from the entry.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;

/// Every generator kind known to the controller.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GeneratorKind {
    /// Inline elements.
    List,
    /// Files or directories from a Flux `GitRepository` artifact.
    GitRepository,
    /// Files or directories from a Flux `OCIRepository` artifact.
    #[serde(rename = "OCIRepository")]
    OciRepository,
    /// Cluster-membership records matched by label selector.
    Cluster,
    /// Open pull requests of an SCM repository.
    PullRequests,
    /// JSON from an HTTP endpoint.
    #[serde(rename = "APIClient")]
    ApiClient,
    /// Latest and previous image of a Flux `ImagePolicy`.
    ImagePolicy,
    /// Data of a `ConfigMap` or `Secret`.
    Config,
    /// Cartesian product of nested generators.
    Matrix,
}

impl GeneratorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::List,
        Self::GitRepository,
        Self::OciRepository,
        Self::Cluster,
        Self::PullRequests,
        Self::ApiClient,
        Self::ImagePolicy,
        Self::Config,
        Self::Matrix,
    ];

    /// The name used in manifests and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::List => "List",
            Self::GitRepository => "GitRepository",
            Self::OciRepository => "OCIRepository",
            Self::Cluster => "Cluster",
            Self::PullRequests => "PullRequests",
            Self::ApiClient => "APIClient",
            Self::ImagePolicy => "ImagePolicy",
            Self::Config => "Config",
            Self::Matrix => "Matrix",
        }
    }
}

impl std::fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GeneratorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownGenerator { name: s.to_string() })
    }
}

/// One entry of `spec.generators`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSetGenerator {
    /// Inline elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListGenerator>,
    /// Elements from a `GitRepository` artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<RepositoryGenerator>,
    /// Elements from an `OCIRepository` artifact.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ociRepository")]
    pub oci_repository: Option<RepositoryGenerator>,
    /// Elements from cluster-membership records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterGenerator>,
    /// Elements from open pull requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_requests: Option<PullRequestGenerator>,
    /// Elements from an HTTP endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "apiClient")]
    pub api_client: Option<ApiClientGenerator>,
    /// Element from an `ImagePolicy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_policy: Option<ImagePolicyGenerator>,
    /// Element from a `ConfigMap` or `Secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigGenerator>,
    /// Combination of nested generators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixGenerator>,
}

/// A generator nested inside a Matrix. Cannot itself be a Matrix.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSetNestedGenerator {
    /// Key under which this generator's element is nested in the Matrix output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inline elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListGenerator>,
    /// Elements from a `GitRepository` artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<RepositoryGenerator>,
    /// Elements from an `OCIRepository` artifact.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ociRepository")]
    pub oci_repository: Option<RepositoryGenerator>,
    /// Elements from cluster-membership records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterGenerator>,
    /// Elements from open pull requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_requests: Option<PullRequestGenerator>,
    /// Elements from an HTTP endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "apiClient")]
    pub api_client: Option<ApiClientGenerator>,
    /// Element from an `ImagePolicy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_policy: Option<ImagePolicyGenerator>,
    /// Element from a `ConfigMap` or `Secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigGenerator>,
}

/// Typed, borrowed view of one populated generator field.
#[derive(Clone, Copy, Debug)]
pub enum GeneratorSpec<'a> {
    /// See [`ListGenerator`].
    List(&'a ListGenerator),
    /// See [`RepositoryGenerator`].
    GitRepository(&'a RepositoryGenerator),
    /// See [`RepositoryGenerator`].
    OciRepository(&'a RepositoryGenerator),
    /// See [`ClusterGenerator`].
    Cluster(&'a ClusterGenerator),
    /// See [`PullRequestGenerator`].
    PullRequests(&'a PullRequestGenerator),
    /// See [`ApiClientGenerator`].
    ApiClient(&'a ApiClientGenerator),
    /// See [`ImagePolicyGenerator`].
    ImagePolicy(&'a ImagePolicyGenerator),
    /// See [`ConfigGenerator`].
    Config(&'a ConfigGenerator),
    /// See [`MatrixGenerator`].
    Matrix(&'a MatrixGenerator),
}

impl GeneratorSpec<'_> {
    /// The kind of this spec.
    #[must_use]
    pub const fn kind(&self) -> GeneratorKind {
        match self {
            Self::List(_) => GeneratorKind::List,
            Self::GitRepository(_) => GeneratorKind::GitRepository,
            Self::OciRepository(_) => GeneratorKind::OciRepository,
            Self::Cluster(_) => GeneratorKind::Cluster,
            Self::PullRequests(_) => GeneratorKind::PullRequests,
            Self::ApiClient(_) => GeneratorKind::ApiClient,
            Self::ImagePolicy(_) => GeneratorKind::ImagePolicy,
            Self::Config(_) => GeneratorKind::Config,
            Self::Matrix(_) => GeneratorKind::Matrix,
        }
    }
}

macro_rules! leaf_specs {
    ($self:ident) => {{
        let mut specs = Vec::new();
        if let Some(g) = &$self.list {
            specs.push(GeneratorSpec::List(g));
        }
        if let Some(g) = &$self.git_repository {
            specs.push(GeneratorSpec::GitRepository(g));
        }
        if let Some(g) = &$self.oci_repository {
            specs.push(GeneratorSpec::OciRepository(g));
        }
        if let Some(g) = &$self.cluster {
            specs.push(GeneratorSpec::Cluster(g));
        }
        if let Some(g) = &$self.pull_requests {
            specs.push(GeneratorSpec::PullRequests(g));
        }
        if let Some(g) = &$self.api_client {
            specs.push(GeneratorSpec::ApiClient(g));
        }
        if let Some(g) = &$self.image_policy {
            specs.push(GeneratorSpec::ImagePolicy(g));
        }
        if let Some(g) = &$self.config {
            specs.push(GeneratorSpec::Config(g));
        }
        specs
    }};
}

impl GitOpsSetGenerator {
    /// All populated fields as typed specs. Empty when nothing is populated.
    #[must_use]
    pub fn specs(&self) -> Vec<GeneratorSpec<'_>> {
        let mut specs = leaf_specs!(self);
        if let Some(g) = &self.matrix {
            specs.push(GeneratorSpec::Matrix(g));
        }
        specs
    }

    /// Every kind this entry needs enabled, including those nested in a Matrix.
    #[must_use]
    pub fn required_kinds(&self) -> Vec<GeneratorKind> {
        let mut kinds: Vec<GeneratorKind> = self.specs().iter().map(GeneratorSpec::kind).collect();
        if let Some(matrix) = &self.matrix {
            for nested in &matrix.generators {
                kinds.extend(nested.specs().iter().map(GeneratorSpec::kind));
            }
        }
        kinds.sort_unstable();
        kinds.dedup();
        kinds
    }
}

impl GitOpsSetNestedGenerator {
    /// All populated fields as typed specs. Never yields a Matrix.
    #[must_use]
    pub fn specs(&self) -> Vec<GeneratorSpec<'_>> {
        leaf_specs!(self)
    }
}

/// Inline list of elements.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListGenerator {
    /// Elements; each must be an object.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_list")]
    pub elements: Vec<serde_json::Value>,
}

/// Files or directories from a Flux source artifact.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryGenerator {
    /// Name of the source in the set's namespace.
    pub repository_ref: String,
    /// Files parsed into elements.
    #[serde(default)]
    pub files: Vec<RepositoryFileItem>,
    /// Directory globs enumerated into elements.
    #[serde(default)]
    pub directories: Vec<RepositoryDirectoryItem>,
    /// Poll interval hint, e.g. `5m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// A file inside a repository artifact.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RepositoryFileItem {
    /// Path relative to the artifact root.
    pub path: String,
}

/// A directory glob inside a repository artifact.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RepositoryDirectoryItem {
    /// Glob relative to the artifact root, e.g. `clusters/*`.
    pub path: String,
    /// Remove matching directories instead of adding them.
    #[serde(default)]
    pub exclude: bool,
}

/// Cluster-membership records selected by labels.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGenerator {
    /// Selector over the records' labels; empty selects all.
    #[serde(default)]
    pub selector: LabelSelector,
}

/// Open pull requests of a repository.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestGenerator {
    /// SCM driver, e.g. `github`, `gitlab`.
    pub driver: String,
    /// API server URL for self-hosted SCMs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Repository, e.g. `org/repo`.
    pub repo: String,
    /// Secret holding the access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    /// Only pull requests carrying all of these labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Include pull requests from forks.
    #[serde(default)]
    pub forks: bool,
    /// Poll interval hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// JSON from an HTTP endpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiClientGenerator {
    /// URL to request.
    pub endpoint: String,
    /// `GET` (default) or `POST`.
    #[serde(default = "default_method")]
    pub method: String,
    /// JSONPath projecting the response before it is turned into elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// Reference to a `Secret` or `ConfigMap` whose data becomes request headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers_ref: Option<HeadersReference>,
    /// Body sent with `POST` requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_option")]
    pub body: Option<serde_json::Value>,
    /// Produce exactly one element: an object response is used as-is, any
    /// other response is placed under the `Elements` key.
    #[serde(default)]
    pub single_element: bool,
    /// Secret with a `caFile` key holding a PEM CA bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    /// Poll interval hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// Reference to header data.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct HeadersReference {
    /// `Secret` or `ConfigMap`.
    pub kind: ConfigKind,
    /// Name in the set's namespace.
    pub name: String,
}

/// Latest and previous image of an `ImagePolicy`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImagePolicyGenerator {
    /// Name of the policy in the set's namespace.
    pub policy_ref: String,
}

/// Data of a `ConfigMap` or `Secret`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ConfigGenerator {
    /// `ConfigMap` or `Secret`.
    pub kind: ConfigKind,
    /// Name in the set's namespace.
    pub name: String,
}

/// Kinds of key/value objects.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConfigKind {
    /// A `ConfigMap`; values are used as-is.
    #[default]
    ConfigMap,
    /// A `Secret`; values are base64-decoded.
    Secret,
}

/// Combination of nested generators.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatrixGenerator {
    /// Nested generators.
    #[serde(default)]
    pub generators: Vec<GitOpsSetNestedGenerator>,
    /// Produce one merged element instead of the cartesian product.
    #[serde(default)]
    pub single_element: bool,
}

/// A Kubernetes label selector.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact label matches.
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements.
    #[serde(default)]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A set-based label requirement.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    /// Label key.
    pub key: String,
    /// `In`, `NotIn`, `Exists` or `DoesNotExist`.
    pub operator: String,
    /// Values for `In` and `NotIn`.
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelector {
    /// Whether the given labels satisfy the selector.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_match
            && self.match_expressions.iter().all(|req| {
                let value = labels.get(&req.key);
                match req.operator.as_str() {
                    "In" => value.is_some_and(|v| req.values.contains(v)),
                    "NotIn" => value.is_none_or(|v| !req.values.contains(v)),
                    "Exists" => value.is_some(),
                    "DoesNotExist" => value.is_none(),
                    _ => false,
                }
            })
    }

    /// Renders the selector in the API server's query syntax.
    #[must_use]
    pub fn to_query(&self) -> String {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for req in &self.match_expressions {
            let part = match req.operator.as_str() {
                "In" => format!("{} in ({})", req.key, req.values.join(",")),
                "NotIn" => format!("{} notin ({})", req.key, req.values.join(",")),
                "DoesNotExist" => format!("!{}", req.key),
                _ => req.key.clone(),
            };
            parts.push(part);
        }
        parts.join(",")
    }
}

/// Parses a Go-style duration such as `1h30m`, `45s` or `500ms`.
///
/// # Errors
///
/// Returns a description of the problem if the string is not a duration.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(String::from("empty duration"));
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number in duration {input:?}"))?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let seconds = match unit {
            "ns" => value / 1e9,
            "us" | "µs" => value / 1e6,
            "ms" => value / 1e3,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
        };
        total += Duration::from_secs_f64(seconds);
        rest = tail;
    }
    Ok(total)
}

fn default_method() -> String {
    String::from("GET")
}

fn preserve_unknown_list(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
    use schemars::schema::{ArrayValidation, InstanceType, SchemaObject, SingleOrVec};

    let item = preserve_unknown_option(generator);
    SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(SingleOrVec::Single(Box::new(item))),
            ..ArrayValidation::default()
        })),
        ..SchemaObject::default()
    }
    .into()
}

fn preserve_unknown_option(_: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject::default();
    schema.extensions.insert(
        String::from("x-kubernetes-preserve-unknown-fields"),
        serde_json::Value::Bool(true),
    );
    schema.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_kind_round_trip_names() {
        for kind in GeneratorKind::ALL {
            let parsed: GeneratorKind = kind.as_str().parse().expect("known kind");
            assert_eq!(parsed, kind);
        }
        assert_eq!("apiclient".parse::<GeneratorKind>().ok(), Some(GeneratorKind::ApiClient));
        assert!("Helm".parse::<GeneratorKind>().is_err());
    }

    #[test]
    fn test_required_kinds_include_nested() {
        let yaml = r"
matrix:
  generators:
    - name: envs
      list:
        elements: [{env: dev}]
    - gitRepository:
        repositoryRef: repo
";
        let generator: GitOpsSetGenerator = serde_yaml::from_str(yaml).expect("valid generator");
        assert_eq!(
            generator.required_kinds(),
            vec![GeneratorKind::List, GeneratorKind::GitRepository, GeneratorKind::Matrix]
        );
    }

    #[test]
    fn test_empty_generator_has_no_specs() {
        assert!(GitOpsSetGenerator::default().specs().is_empty());
    }

    #[test]
    fn test_label_selector_matches() {
        let selector = LabelSelector {
            match_labels: BTreeMap::from([(String::from("env"), String::from("dev"))]),
            match_expressions: vec![LabelSelectorRequirement {
                key: String::from("tier"),
                operator: String::from("In"),
                values: vec![String::from("gold"), String::from("silver")],
            }],
        };
        let mut labels = BTreeMap::from([
            (String::from("env"), String::from("dev")),
            (String::from("tier"), String::from("gold")),
        ]);
        assert!(selector.matches(&labels));
        labels.insert(String::from("tier"), String::from("bronze"));
        assert!(!selector.matches(&labels));
        assert_eq!(selector.to_query(), "env=dev,tier in (gold,silver)");
        assert!(LabelSelector::default().matches(&labels));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
