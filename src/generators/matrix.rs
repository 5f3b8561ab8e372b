//! Matrix combinator.
//!
//! Runs nested generators and combines their outputs. By default the result
//! is the cartesian product: each tuple is folded left to right, with named
//! generators nesting their element under the name and unnamed generators
//! merging keys (later wins). Identical combinations are dropped, keeping the
//! first. With `singleElement` the result is exactly one element.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Element, Generator, unexpected_spec};
use crate::api::{GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::error::GeneratorError;

/// The Matrix generator over a fixed set of leaf generators.
#[derive(Clone)]
pub struct Matrix {
    leaves: HashMap<GeneratorKind, Arc<dyn Generator>>,
}

impl Matrix {
    /// Creates a Matrix able to nest the given leaf generators.
    #[must_use]
    pub fn new(leaves: HashMap<GeneratorKind, Arc<dyn Generator>>) -> Self {
        Self { leaves }
    }

    fn leaf(&self, kind: GeneratorKind) -> Result<&Arc<dyn Generator>, GeneratorError> {
        self.leaves.get(&kind).ok_or(GeneratorError::NotEnabled { kind })
    }
}

fn element_value(element: Element) -> Value {
    Value::Object(element.into_iter().collect::<Map<String, Value>>())
}

/// Folds one generator's element into the accumulator.
fn fold_into(acc: &mut Element, name: Option<&str>, element: &Element) {
    match name {
        Some(name) => {
            acc.insert(name.to_string(), element_value(element.clone()));
        }
        None => acc.extend(element.iter().map(|(k, v)| (k.clone(), v.clone()))),
    }
}

/// Cartesian product of the groups, deduplicated preserving first occurrence.
fn product(groups: &[(Option<String>, Vec<Element>)]) -> Vec<Element> {
    let mut combined = vec![Element::new()];
    for (name, elements) in groups {
        let mut next = Vec::with_capacity(combined.len() * elements.len());
        for acc in &combined {
            for element in elements {
                let mut merged = acc.clone();
                fold_into(&mut merged, name.as_deref(), element);
                next.push(merged);
            }
        }
        combined = next;
    }

    let mut unique: Vec<Element> = Vec::with_capacity(combined.len());
    for element in combined {
        if !unique.contains(&element) {
            unique.push(element);
        }
    }
    unique
}

/// Merges all groups into one element.
fn single(groups: Vec<(Option<String>, Vec<Element>)>) -> Element {
    let mut acc = Element::new();
    for (name, elements) in groups {
        match name {
            Some(name) => {
                let items = elements.into_iter().map(element_value).collect();
                acc.insert(name, Value::Array(items));
            }
            None => {
                for element in &elements {
                    fold_into(&mut acc, None, element);
                }
            }
        }
    }
    acc
}

#[async_trait]
impl Generator for Matrix {
    async fn generate(&self, spec: GeneratorSpec<'_>, set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError> {
        let GeneratorSpec::Matrix(matrix) = spec else {
            return Err(unexpected_spec(GeneratorKind::Matrix, spec));
        };
        if matrix.generators.is_empty() {
            return Ok(Vec::new());
        }

        let mut groups = Vec::with_capacity(matrix.generators.len());
        for nested in &matrix.generators {
            let elements = match nested.specs().first() {
                Some(leaf) => self.leaf(leaf.kind())?.generate(*leaf, set).await?,
                None => Vec::new(),
            };
            groups.push((nested.name.clone().filter(|n| !n.is_empty()), elements));
        }

        let elements = if matrix.single_element {
            vec![single(groups)]
        } else {
            product(&groups)
        };
        debug!(count = elements.len(), single = matrix.single_element, "Combined matrix elements");
        Ok(elements)
    }

    fn interval(&self, spec: GeneratorSpec<'_>) -> Duration {
        let GeneratorSpec::Matrix(matrix) = spec else {
            return Duration::ZERO;
        };
        matrix
            .generators
            .iter()
            .flat_map(|nested| nested.specs())
            .filter_map(|leaf| self.leaves.get(&leaf.kind()).map(|g| g.interval(leaf)))
            .filter(|interval| !interval.is_zero())
            .min()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GitOpsSetSpec, MatrixGenerator};
    use crate::generators::InlineList;
    use serde_json::json;

    fn element(value: Value) -> Element {
        crate::generators::element_from_value(GeneratorKind::List, value).expect("object")
    }

    fn matrix() -> Matrix {
        Matrix::new(HashMap::from([(
            GeneratorKind::List,
            Arc::new(InlineList) as Arc<dyn Generator>,
        )]))
    }

    async fn run(yaml: &str) -> Result<Vec<Element>, GeneratorError> {
        let spec: MatrixGenerator = serde_yaml::from_str(yaml).expect("valid matrix");
        let set = GitOpsSet::new("demo", GitOpsSetSpec::default());
        matrix().generate(GeneratorSpec::Matrix(&spec), &set).await
    }

    #[test]
    fn test_product_count_and_merge() {
        let groups = vec![
            (None, vec![element(json!({"env": "dev"})), element(json!({"env": "prod"}))]),
            (None, vec![element(json!({"team": "a"})), element(json!({"team": "b"})), element(json!({"team": "c"}))]),
        ];
        let combined = product(&groups);
        assert_eq!(combined.len(), 6);
        assert_eq!(combined[0], element(json!({"env": "dev", "team": "a"})));
        assert_eq!(combined[5], element(json!({"env": "prod", "team": "c"})));
    }

    #[test]
    fn test_later_unnamed_generator_wins() {
        let groups = vec![
            (None, vec![element(json!({"env": "dev", "x": 1}))]),
            (None, vec![element(json!({"x": 2}))]),
        ];
        assert_eq!(product(&groups), vec![element(json!({"env": "dev", "x": 2}))]);
    }

    #[test]
    fn test_duplicates_removed() {
        let groups = vec![
            (None, vec![element(json!({"a": 1})), element(json!({"a": 1}))]),
            (None, vec![element(json!({"b": 2}))]),
        ];
        assert_eq!(product(&groups).len(), 1);
    }

    #[tokio::test]
    async fn test_named_generators_nest() {
        let elements = run(
            r"
generators:
  - name: env
    list:
      elements: [{name: dev}, {name: prod}]
  - name: team
    list:
      elements: [{name: a}]
",
        )
        .await
        .expect("generated");
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1]["env"], json!({"name": "prod"}));
        assert_eq!(elements[1]["team"], json!({"name": "a"}));
    }

    #[tokio::test]
    async fn test_empty_nested_generator_empties_product() {
        let elements = run(
            r"
generators:
  - list:
      elements: [{a: 1}]
  - list:
      elements: []
",
        )
        .await
        .expect("generated");
        assert!(elements.is_empty());
    }

    #[tokio::test]
    async fn test_no_nested_generators() {
        assert!(run("generators: []\n").await.expect("generated").is_empty());
    }

    #[tokio::test]
    async fn test_single_element() {
        let elements = run(
            r"
singleElement: true
generators:
  - name: envs
    list:
      elements: [{env: dev}, {env: prod}]
  - list:
      elements: [{region: eu}, {zone: b}]
",
        )
        .await
        .expect("generated");
        assert_eq!(
            elements,
            vec![element(json!({
                "envs": [{"env": "dev"}, {"env": "prod"}],
                "region": "eu",
                "zone": "b"
            }))]
        );
    }

    #[tokio::test]
    async fn test_unknown_leaf_not_enabled() {
        let err = run(
            r"
generators:
  - config:
      kind: ConfigMap
      name: cm
",
        )
        .await
        .expect_err("config missing");
        assert_eq!(err.to_string(), "generator Config not enabled");
    }
}
