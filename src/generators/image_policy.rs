//! ImagePolicy generator.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{Element, Generator, unexpected_spec};
use crate::api::{GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::cluster::ObjectReader;
use crate::error::GeneratorError;

const IMAGE_POLICY_API_VERSION: &str = "image.toolkit.fluxcd.io/v1beta2";

/// Yields the latest and previous image selected by an `ImagePolicy`.
#[derive(Clone)]
pub struct ImagePolicies {
    reader: Arc<dyn ObjectReader>,
}

impl ImagePolicies {
    /// Creates the generator.
    #[must_use]
    pub fn new(reader: Arc<dyn ObjectReader>) -> Self {
        Self { reader }
    }
}

/// The tag of an image reference, empty when it has none.
fn tag_of(image: &str) -> &str {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    image[name_start..]
        .rsplit_once(':')
        .map_or("", |(_, tag)| tag)
}

#[async_trait]
impl Generator for ImagePolicies {
    async fn generate(&self, spec: GeneratorSpec<'_>, set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError> {
        let GeneratorSpec::ImagePolicy(policy) = spec else {
            return Err(unexpected_spec(GeneratorKind::ImagePolicy, spec));
        };
        let namespace = set.namespace_or_default();
        let object = self
            .reader
            .get(IMAGE_POLICY_API_VERSION, "ImagePolicy", &namespace, &policy.policy_ref)
            .await?
            .ok_or_else(|| GeneratorError::NotFound {
                kind: String::from("ImagePolicy"),
                namespace: namespace.clone(),
                name: policy.policy_ref.clone(),
            })?;

        let status_str = |field: &str| {
            object
                .pointer(&format!("/status/{field}"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let latest = status_str("latestImage");
        if latest.is_empty() {
            return Ok(Vec::new());
        }
        let previous = status_str("observedPreviousImage");

        Ok(vec![Element::from([
            (String::from("latestTag"), Value::String(tag_of(&latest).to_string())),
            (String::from("previousTag"), Value::String(tag_of(&previous).to_string())),
            (String::from("latestImage"), Value::String(latest)),
            (String::from("previousImage"), Value::String(previous)),
        ])])
    }

    fn interval(&self, _spec: GeneratorSpec<'_>) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GitOpsSetSpec, ImagePolicyGenerator};
    use crate::cluster::MemoryCluster;
    use serde_json::json;

    #[test]
    fn test_tag_of() {
        assert_eq!(tag_of("ghcr.io/org/app:1.2.3"), "1.2.3");
        assert_eq!(tag_of("localhost:5000/app"), "");
        assert_eq!(tag_of("localhost:5000/app:v2"), "v2");
        assert_eq!(tag_of(""), "");
    }

    #[tokio::test]
    async fn test_latest_and_previous() {
        let cluster = MemoryCluster::new();
        cluster
            .insert_object(json!({
                "apiVersion": IMAGE_POLICY_API_VERSION,
                "kind": "ImagePolicy",
                "metadata": {"name": "app", "namespace": "default"},
                "status": {
                    "latestImage": "ghcr.io/org/app:1.2.0",
                    "observedPreviousImage": "ghcr.io/org/app:1.1.0"
                }
            }))
            .expect("seeded");
        let mut set = GitOpsSet::new("demo", GitOpsSetSpec::default());
        set.metadata.namespace = Some(String::from("default"));
        let spec = ImagePolicyGenerator {
            policy_ref: String::from("app"),
        };

        let elements = ImagePolicies::new(Arc::new(cluster))
            .generate(GeneratorSpec::ImagePolicy(&spec), &set)
            .await
            .expect("generated");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0]["latestTag"], json!("1.2.0"));
        assert_eq!(elements[0]["previousImage"], json!("ghcr.io/org/app:1.1.0"));
        assert_eq!(elements[0]["previousTag"], json!("1.1.0"));
    }
}
