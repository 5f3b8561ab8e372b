//! Cluster-membership generator.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

use super::{Element, Generator, unexpected_spec};
use crate::api::{GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::cluster::ObjectReader;
use crate::error::GeneratorError;

const CLUSTER_API_VERSION: &str = "gitops.weave.works/v1alpha1";
const CLUSTER_KIND: &str = "GitopsCluster";

/// Yields one element per `GitopsCluster` matching a label selector.
#[derive(Clone)]
pub struct ClusterRecords {
    reader: Arc<dyn ObjectReader>,
}

impl ClusterRecords {
    /// Creates the generator.
    #[must_use]
    pub fn new(reader: Arc<dyn ObjectReader>) -> Self {
        Self { reader }
    }
}

fn metadata_map(record: &Value, field: &str) -> Value {
    record
        .get("metadata")
        .and_then(|m| m.get(field))
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn metadata_str(record: &Value, field: &str) -> Value {
    record
        .get("metadata")
        .and_then(|m| m.get(field))
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()))
}

#[async_trait]
impl Generator for ClusterRecords {
    async fn generate(&self, spec: GeneratorSpec<'_>, _set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError> {
        let GeneratorSpec::Cluster(cluster) = spec else {
            return Err(unexpected_spec(GeneratorKind::Cluster, spec));
        };
        let records = self
            .reader
            .list(CLUSTER_API_VERSION, CLUSTER_KIND, "", &cluster.selector)
            .await?;

        Ok(records
            .iter()
            .map(|record| {
                Element::from([
                    (String::from("ClusterName"), metadata_str(record, "name")),
                    (String::from("ClusterNamespace"), metadata_str(record, "namespace")),
                    (String::from("ClusterLabels"), metadata_map(record, "labels")),
                    (String::from("ClusterAnnotations"), metadata_map(record, "annotations")),
                ])
            })
            .collect())
    }

    fn interval(&self, _spec: GeneratorSpec<'_>) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClusterGenerator, GitOpsSetSpec, LabelSelector};
    use crate::cluster::MemoryCluster;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_selects_matching_clusters() {
        let cluster = MemoryCluster::new();
        for (name, env) in [("east", "prod"), ("west", "prod"), ("lab", "dev")] {
            cluster
                .insert_object(json!({
                    "apiVersion": CLUSTER_API_VERSION,
                    "kind": CLUSTER_KIND,
                    "metadata": {
                        "name": name,
                        "namespace": "clusters",
                        "labels": {"env": env},
                        "annotations": {"owner": "team-a"}
                    }
                }))
                .expect("seeded");
        }
        let spec = ClusterGenerator {
            selector: LabelSelector {
                match_labels: BTreeMap::from([(String::from("env"), String::from("prod"))]),
                match_expressions: Vec::new(),
            },
        };
        let set = GitOpsSet::new("demo", GitOpsSetSpec::default());
        let elements = ClusterRecords::new(Arc::new(cluster))
            .generate(GeneratorSpec::Cluster(&spec), &set)
            .await
            .expect("generated");

        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0]["ClusterName"], json!("east"));
        assert_eq!(elements[0]["ClusterNamespace"], json!("clusters"));
        assert_eq!(elements[0]["ClusterLabels"], json!({"env": "prod"}));
        assert_eq!(elements[1]["ClusterAnnotations"], json!({"owner": "team-a"}));
    }
}
