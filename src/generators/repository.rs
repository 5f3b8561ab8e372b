//! GitRepository and OCIRepository generators.
//!
//! Both resolve a Flux source in the set's namespace, download its current
//! artifact and turn files or directories inside it into elements. A source
//! without an artifact is not an error: generation reports `NotReady` and the
//! set waits for the source to update.

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Element, Generator, element_from_value, interval_or, unexpected_spec};
use crate::api::{GeneratorKind, GeneratorSpec, GitOpsSet, RepositoryGenerator};
use crate::cluster::{Artifact, ArtifactFetcher, ObjectReader};
use crate::error::GeneratorError;

const GIT_REPOSITORY_API_VERSION: &str = "source.toolkit.fluxcd.io/v1";
const OCI_REPOSITORY_API_VERSION: &str = "source.toolkit.fluxcd.io/v1beta2";

const DIRECTORY_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Yields elements from files or directories of a source artifact.
#[derive(Clone)]
pub struct RepositoryFiles {
    reader: Arc<dyn ObjectReader>,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl RepositoryFiles {
    /// Creates the generator.
    #[must_use]
    pub fn new(reader: Arc<dyn ObjectReader>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self { reader, fetcher }
    }

    async fn artifact_url(
        &self,
        kind: GeneratorKind,
        api_version: &str,
        namespace: &str,
        name: &str,
    ) -> Result<String, GeneratorError> {
        let source = self
            .reader
            .get(api_version, kind.as_str(), namespace, name)
            .await?
            .ok_or_else(|| GeneratorError::NotFound {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        let url = source
            .pointer("/status/artifact/url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty());
        match url {
            Some(url) => Ok(url.to_string()),
            None => {
                debug!(source = %format!("{kind}/{namespace}/{name}"), "Source has no artifact yet");
                Err(GeneratorError::NotReady {
                    source_ref: format!("{kind}/{namespace}/{name}"),
                })
            }
        }
    }
}

/// Parses one file into elements. A top-level array yields one element per item.
fn file_elements(kind: GeneratorKind, path: &str, contents: &[u8]) -> Result<Vec<Element>, GeneratorError> {
    let parse_error = |message: String| GeneratorError::Parse {
        path: path.to_string(),
        message,
    };
    let value: Value = if path.ends_with(".json") {
        serde_json::from_slice(contents).map_err(|e| parse_error(e.to_string()))?
    } else {
        serde_yaml::from_slice(contents).map_err(|e| parse_error(e.to_string()))?
    };

    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| element_from_value(kind, item))
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![element_from_value(kind, other)?]),
    }
}

/// Enumerates directories matching the include globs, minus excluded ones.
fn directory_elements(
    kind: GeneratorKind,
    spec: &RepositoryGenerator,
    artifact: &Artifact,
) -> Result<Vec<Element>, GeneratorError> {
    let mut selected: BTreeSet<&str> = BTreeSet::new();
    for item in &spec.directories {
        let pattern = Pattern::new(item.path.trim_start_matches("./"))
            .map_err(|e| GeneratorError::invalid(kind, format!("directory pattern {:?}: {e}", item.path)))?;
        let matching = artifact
            .directories()
            .filter(|dir| pattern.matches_with(dir, DIRECTORY_MATCH));
        if item.exclude {
            for dir in matching {
                selected.remove(dir);
            }
        } else {
            selected.extend(matching);
        }
    }

    Ok(selected
        .into_iter()
        .map(|dir| {
            let base = dir.rsplit('/').next().unwrap_or(dir);
            Element::from([
                (String::from("Directory"), Value::String(dir.to_string())),
                (String::from("Base"), Value::String(base.to_string())),
            ])
        })
        .collect())
}

#[async_trait]
impl Generator for RepositoryFiles {
    async fn generate(&self, spec: GeneratorSpec<'_>, set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError> {
        let (kind, api_version, repository) = match spec {
            GeneratorSpec::GitRepository(r) => (GeneratorKind::GitRepository, GIT_REPOSITORY_API_VERSION, r),
            GeneratorSpec::OciRepository(r) => (GeneratorKind::OciRepository, OCI_REPOSITORY_API_VERSION, r),
            other => return Err(unexpected_spec(GeneratorKind::GitRepository, other)),
        };
        if repository.repository_ref.is_empty() {
            return Err(GeneratorError::invalid(kind, "repositoryRef is required"));
        }

        let namespace = set.namespace_or_default();
        let url = self
            .artifact_url(kind, api_version, &namespace, &repository.repository_ref)
            .await?;
        let artifact = self.fetcher.fetch(&url).await?;

        let mut elements = Vec::new();
        for file in &repository.files {
            let contents = artifact.file(&file.path).ok_or_else(|| GeneratorError::Parse {
                path: file.path.clone(),
                message: format!("file not found in artifact of {kind} {namespace}/{}", repository.repository_ref),
            })?;
            elements.extend(file_elements(kind, &file.path, contents)?);
        }
        elements.extend(directory_elements(kind, repository, &artifact)?);
        Ok(elements)
    }

    fn interval(&self, spec: GeneratorSpec<'_>) -> Duration {
        match spec {
            GeneratorSpec::GitRepository(r) | GeneratorSpec::OciRepository(r) => {
                interval_or(r.interval.as_deref(), Duration::ZERO)
            }
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GitOpsSetSpec, RepositoryDirectoryItem, RepositoryFileItem};
    use crate::cluster::MemoryCluster;
    use serde_json::json;

    struct StaticFetcher(Artifact);

    #[async_trait]
    impl ArtifactFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<Artifact, GeneratorError> {
            Ok(self.0.clone())
        }
    }

    fn set() -> GitOpsSet {
        let mut set = GitOpsSet::new("demo", GitOpsSetSpec::default());
        set.metadata.namespace = Some(String::from("default"));
        set
    }

    fn cluster_with_source(artifact_url: Option<&str>) -> MemoryCluster {
        let cluster = MemoryCluster::new();
        let mut source = json!({
            "apiVersion": GIT_REPOSITORY_API_VERSION,
            "kind": "GitRepository",
            "metadata": {"name": "repo", "namespace": "default"},
            "status": {}
        });
        if let Some(url) = artifact_url {
            source["status"]["artifact"] = json!({"url": url, "revision": "main@sha1:abc"});
        }
        cluster.insert_object(source).expect("seeded");
        cluster
    }

    fn artifact() -> Artifact {
        Artifact::from_files([
            ("envs/dev.yaml", "env: dev\nreplicas: 1\n"),
            ("envs/all.json", r#"[{"env": "a"}, {"env": "b"}]"#),
            ("clusters/east/kustomization.yaml", ""),
            ("clusters/west/kustomization.yaml", ""),
            ("clusters/lab/kustomization.yaml", ""),
        ])
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_ready() {
        let generator = RepositoryFiles::new(
            Arc::new(cluster_with_source(None)),
            Arc::new(StaticFetcher(artifact())),
        );
        let spec = RepositoryGenerator {
            repository_ref: String::from("repo"),
            ..RepositoryGenerator::default()
        };
        let err = generator
            .generate(GeneratorSpec::GitRepository(&spec), &set())
            .await
            .expect_err("no artifact");
        assert!(matches!(err, GeneratorError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_files_become_elements() {
        let generator = RepositoryFiles::new(
            Arc::new(cluster_with_source(Some("http://source/artifact.tar.gz"))),
            Arc::new(StaticFetcher(artifact())),
        );
        let spec = RepositoryGenerator {
            repository_ref: String::from("repo"),
            files: vec![
                RepositoryFileItem { path: String::from("envs/dev.yaml") },
                RepositoryFileItem { path: String::from("envs/all.json") },
            ],
            ..RepositoryGenerator::default()
        };
        let elements = generator
            .generate(GeneratorSpec::GitRepository(&spec), &set())
            .await
            .expect("generated");
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0]["replicas"], json!(1));
        assert_eq!(elements[2]["env"], json!("b"));
    }

    #[tokio::test]
    async fn test_directories_with_exclusion() {
        let generator = RepositoryFiles::new(
            Arc::new(cluster_with_source(Some("http://source/artifact.tar.gz"))),
            Arc::new(StaticFetcher(artifact())),
        );
        let spec = RepositoryGenerator {
            repository_ref: String::from("repo"),
            directories: vec![
                RepositoryDirectoryItem { path: String::from("clusters/*"), exclude: false },
                RepositoryDirectoryItem { path: String::from("clusters/lab"), exclude: true },
            ],
            ..RepositoryGenerator::default()
        };
        let elements = generator
            .generate(GeneratorSpec::GitRepository(&spec), &set())
            .await
            .expect("generated");
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0]["Directory"], json!("clusters/east"));
        assert_eq!(elements[0]["Base"], json!("east"));
        assert_eq!(elements[1]["Base"], json!("west"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let generator = RepositoryFiles::new(
            Arc::new(cluster_with_source(Some("http://source/artifact.tar.gz"))),
            Arc::new(StaticFetcher(artifact())),
        );
        let spec = RepositoryGenerator {
            repository_ref: String::from("repo"),
            files: vec![RepositoryFileItem { path: String::from("missing.yaml") }],
            ..RepositoryGenerator::default()
        };
        let err = generator
            .generate(GeneratorSpec::GitRepository(&spec), &set())
            .await
            .expect_err("missing file");
        assert!(err.to_string().contains("missing.yaml"));
    }
}
