//! Offline rendering.
//!
//! Renders a GitOpsSet read from a file against an in-memory cluster seeded
//! with the other documents of the same file, without contacting any API
//! server. Only repository artifacts and APIClient endpoints go over HTTP.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::api::GitOpsSet;
use crate::cluster::{HttpArtifactFetcher, MemoryCluster};
use crate::config::ControllerConfig;
use crate::error::{ConfigError, Result};
use crate::generators::{GeneratorDeps, GeneratorRegistry};
use crate::template::{RenderedResource, Renderer};

/// Namespace given to documents that do not name one.
const DEFAULT_NAMESPACE: &str = "default";

/// The parsed contents of a render input file.
#[derive(Debug)]
pub struct RenderInput {
    /// The set to render.
    pub set: GitOpsSet,
    /// Objects the set's generators may read.
    pub objects: Vec<Value>,
}

impl RenderInput {
    /// Splits a multi-document YAML stream into the first GitOpsSet and the
    /// remaining objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or holds no GitOpsSet.
    pub fn parse(content: &str) -> Result<Self> {
        let parse_error = |message: String| ConfigError::ParseError {
            message,
            location: None,
        };

        let mut set = None;
        let mut objects = Vec::new();
        for document in serde_yaml::Deserializer::from_str(content) {
            let mut value = Value::deserialize(document).map_err(|e| parse_error(format!("YAML parse error: {e}")))?;
            if value.is_null() {
                continue;
            }
            if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                metadata
                    .entry("namespace")
                    .or_insert_with(|| Value::from(DEFAULT_NAMESPACE));
            }
            if set.is_none() && value.get("kind").and_then(Value::as_str) == Some("GitOpsSet") {
                let parsed: GitOpsSet =
                    serde_json::from_value(value).map_err(|e| parse_error(format!("invalid GitOpsSet: {e}")))?;
                set = Some(parsed);
            } else {
                objects.push(value);
            }
        }

        let set = set.ok_or_else(|| parse_error(String::from("no GitOpsSet document found")))?;
        Ok(Self { set, objects })
    }
}

/// Renders `input` with the generators and functions `config` enables.
///
/// # Errors
///
/// Returns an error if a seed object is malformed, a generator fails or a
/// template cannot be rendered.
pub async fn render_offline(input: &RenderInput, config: &ControllerConfig) -> Result<Vec<RenderedResource>> {
    let cluster = MemoryCluster::new().with_scope(config.scope_resolver());
    for object in &input.objects {
        cluster.insert_object(object.clone())?;
    }
    debug!(objects = input.objects.len(), "Seeded in-memory cluster");

    let deps = GeneratorDeps {
        reader: Arc::new(cluster.clone()),
        fetcher: Arc::new(HttpArtifactFetcher::new(config.http_timeout())?),
        http_timeout: config.http_timeout(),
    };
    let registry = GeneratorRegistry::builtin(&config.enabled_generators, &deps);
    let renderer = Renderer::new(Arc::new(cluster)).with_functions(config.function_library());
    renderer.render_set(&input.set, &registry).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: &str = r#"
apiVersion: templates.weave.works/v1alpha1
kind: GitOpsSet
metadata:
  name: from-config
spec:
  generators:
    - config:
        kind: ConfigMap
        name: environments
  templates:
    - content:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: "{{ .Element.team }}-settings"
        data:
          region: "{{ .Element.region }}"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: environments
data:
  team: platform
  region: eu-west-1
"#;

    #[test]
    fn test_parse_input() {
        let input = RenderInput::parse(INPUT).expect("valid input");
        assert_eq!(input.set.namespace_or_default(), "default");
        assert_eq!(input.objects.len(), 1);
        assert_eq!(input.objects[0]["metadata"]["namespace"], "default");
    }

    #[test]
    fn test_parse_without_set() {
        let err = RenderInput::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n").expect_err("no set");
        assert!(err.to_string().contains("no GitOpsSet"));
    }

    #[tokio::test]
    async fn test_render_offline_reads_seeded_objects() {
        let input = RenderInput::parse(INPUT).expect("valid input");
        let resources = render_offline(&input, &ControllerConfig::default())
            .await
            .expect("rendered");

        assert_eq!(resources.len(), 1);
        let object = &resources[0].object;
        assert_eq!(object.metadata.name.as_deref(), Some("platform-settings"));
        assert_eq!(object.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(object.data["data"]["region"], "eu-west-1");
    }
}
