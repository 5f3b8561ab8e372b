//! Template rendering.
//!
//! The [`Renderer`] expands every template of a set once per generated
//! element (or once per repeat item) and normalizes the result into
//! [`RenderedResource`]s. Rendering is deterministic: the same set and the
//! same elements always produce the same resources in the same order.
//!
//! Object content is walked structurally so that a string made of exactly
//! one expression keeps the type of its value. Text content is rendered as
//! a whole and parsed as a YAML stream.

mod delimiters;
mod functions;
mod repeat;
mod resource;

pub use delimiters::Delimiters;
pub use functions::{FunctionLibrary, sanitize};
pub use repeat::normalize_json_path;
pub use resource::RenderedResource;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tera::{Context, Tera};
use tracing::debug;

use crate::api::GitOpsSet;
use crate::cluster::ScopeResolver;
use crate::error::{Result, TemplateError};
use crate::generators::{Element, GeneratorRegistry};

/// Variable holding the value of a single-expression string.
const TYPED_VALUE_VAR: &str = "gitopsset_value";

/// Renders GitOpsSet templates into resources.
#[derive(Clone)]
pub struct Renderer {
    functions: FunctionLibrary,
    scope: Arc<dyn ScopeResolver>,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer").field("functions", &self.functions).finish_non_exhaustive()
    }
}

impl Renderer {
    /// Creates a renderer with the default function library.
    #[must_use]
    pub fn new(scope: Arc<dyn ScopeResolver>) -> Self {
        Self {
            functions: FunctionLibrary::default(),
            scope,
        }
    }

    /// Replaces the function library.
    #[must_use]
    pub fn with_functions(mut self, functions: FunctionLibrary) -> Self {
        self.functions = functions;
        self
    }

    /// Runs the set's generators through `registry`, then renders.
    ///
    /// # Errors
    ///
    /// Returns generator errors (including `NotReady`) or template errors.
    pub async fn render_set(&self, set: &GitOpsSet, registry: &GeneratorRegistry) -> Result<Vec<RenderedResource>> {
        let groups = registry.generate(set).await?;
        Ok(self.render(set, &groups).await?)
    }

    /// Renders the set's templates against generated element groups, one
    /// group per generator entry.
    ///
    /// # Errors
    ///
    /// Returns the first template error, naming the set and the field path.
    pub async fn render(
        &self,
        set: &GitOpsSet,
        groups: &[Vec<Element>],
    ) -> std::result::Result<Vec<RenderedResource>, TemplateError> {
        let documents = self.expand(set, groups)?;
        let mut resources = Vec::with_capacity(documents.len());
        for (path, document) in documents {
            resources.push(resource::normalize(document, set, self.scope.as_ref(), &path).await?);
        }
        debug!(set = %set.namespaced_name(), count = resources.len(), "Rendered resources");
        Ok(resources)
    }

    /// Produces the raw documents, paired with the template path they came from.
    fn expand(
        &self,
        set: &GitOpsSet,
        groups: &[Vec<Element>],
    ) -> std::result::Result<Vec<(String, Value)>, TemplateError> {
        let set_name = set.namespaced_name();
        let delimiters = match set.delimiters_annotation() {
            Some(value) => Delimiters::parse(value).ok_or_else(|| TemplateError::Delimiters {
                set: set_name.clone(),
                value: value.to_string(),
            })?,
            None => Delimiters::default(),
        };
        let mut tera = Tera::default();
        tera.autoescape_on(Vec::new());
        self.functions.register(&mut tera);
        let mut pass = RenderPass {
            tera,
            delimiters,
            set_name,
        };

        let identity = json!({
            "Name": set.metadata.name.clone().unwrap_or_default(),
            "Namespace": set.namespace_or_default(),
        });
        let mut documents = Vec::new();
        for group in groups {
            for (index, element) in group.iter().enumerate() {
                for (template_index, template) in set.spec.templates.iter().enumerate() {
                    let path = format!("templates[{template_index}]");
                    let mut context = Context::new();
                    context.insert("Element", element);
                    context.insert("ElementIndex", &index);
                    context.insert("GitOpsSet", &identity);

                    let Some(expression) = template.repeat.as_deref().filter(|r| !r.trim().is_empty()) else {
                        pass.render_content(&template.content, &context, &path, &mut documents)?;
                        continue;
                    };
                    let items = repeat::expand(expression, element).map_err(|message| TemplateError::Repeat {
                        set: pass.set_name.clone(),
                        path: format!("{path}.repeat"),
                        expression: expression.to_string(),
                        message,
                    })?;
                    for item in &items {
                        context.insert("Repeat", item);
                        pass.render_content(&template.content, &context, &path, &mut documents)?;
                    }
                }
            }
        }
        Ok(documents)
    }
}

/// State of one render: a Tera instance carrying the function library.
struct RenderPass {
    tera: Tera,
    delimiters: Delimiters,
    set_name: String,
}

impl RenderPass {
    fn render_content(
        &mut self,
        content: &Value,
        context: &Context,
        template_path: &str,
        documents: &mut Vec<(String, Value)>,
    ) -> std::result::Result<(), TemplateError> {
        let path = format!("{template_path}.content");
        match content {
            Value::Object(_) => {
                let document = self.walk(content, context, &path)?;
                documents.push((path, document));
            }
            Value::String(text) => {
                let rendered = self.render_text(text, context, &path)?;
                for document in serde_yaml::Deserializer::from_str(&rendered) {
                    let value = Value::deserialize(document).map_err(|e| TemplateError::Parse {
                        set: self.set_name.clone(),
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                    if !value.is_null() {
                        documents.push((path.clone(), value));
                    }
                }
            }
            other => {
                return Err(TemplateError::Parse {
                    set: self.set_name.clone(),
                    path,
                    message: format!("content must be an object or YAML text, got {other}"),
                });
            }
        }
        Ok(())
    }

    /// Renders every string in `value`, keeping the type of single expressions.
    fn walk(&mut self, value: &Value, context: &Context, path: &str) -> std::result::Result<Value, TemplateError> {
        match value {
            Value::String(text) if self.delimiters.has_expression(text) => {
                match self.delimiters.single_expression(text) {
                    Some(expression) => self.evaluate(expression, context, path),
                    None => Ok(Value::String(self.render_text(text, context, path)?)),
                }
            }
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.walk(item, context, &format!("{path}[{i}]")))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => {
                let mut rendered = Map::with_capacity(fields.len());
                for (key, field) in fields {
                    let field_path = format!("{path}.{key}");
                    let key = if self.delimiters.has_expression(key) {
                        self.render_text(key, context, &field_path)?
                    } else {
                        key.clone()
                    };
                    rendered.insert(key, self.walk(field, context, &field_path)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    fn render_text(&mut self, text: &str, context: &Context, path: &str) -> std::result::Result<String, TemplateError> {
        let source = self.delimiters.to_tera(text);
        self.tera
            .render_str(&source, context)
            .map_err(|e| self.render_error(path, &e))
    }

    /// Evaluates one expression to a JSON value.
    fn evaluate(&mut self, expression: &str, context: &Context, path: &str) -> std::result::Result<Value, TemplateError> {
        let source = format!(
            "{{% set {TYPED_VALUE_VAR} = {} %}}{{{{ {TYPED_VALUE_VAR} | json_encode() | safe }}}}",
            delimiters::normalize_expression(expression)
        );
        let encoded = self
            .tera
            .render_str(&source, context)
            .map_err(|e| self.render_error(path, &e))?;
        serde_json::from_str(&encoded).map_err(|e| TemplateError::Render {
            set: self.set_name.clone(),
            path: path.to_string(),
            message: format!("expression {expression:?} did not produce a value: {e}"),
        })
    }

    fn render_error(&self, path: &str, err: &tera::Error) -> TemplateError {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        TemplateError::Render {
            set: self.set_name.clone(),
            path: path.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DELIMITERS_ANNOTATION, GitOpsSetSpec};
    use crate::cluster::StaticScopeResolver;
    use std::collections::BTreeMap;

    fn renderer() -> Renderer {
        Renderer::new(Arc::new(StaticScopeResolver::default()))
    }

    fn set(templates: &str) -> GitOpsSet {
        let spec: GitOpsSetSpec = serde_yaml::from_str(templates).expect("valid spec");
        let mut set = GitOpsSet::new("demo", spec);
        set.metadata.namespace = Some(String::from("default"));
        set
    }

    fn elements(values: Value) -> Vec<Vec<Element>> {
        vec![serde_json::from_value(values).expect("elements")]
    }

    const CONFIG_MAP_TEMPLATE: &str = r#"
templates:
  - content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: "{{ .Element.env }}-config"
      data:
        index: "{{ ElementIndex }}"
        owner: "{{ .GitOpsSet.Name }}"
"#;

    #[tokio::test]
    async fn test_one_resource_per_element() {
        let resources = renderer()
            .render(
                &set(CONFIG_MAP_TEMPLATE),
                &elements(json!([{"env": "dev"}, {"env": "staging"}, {"env": "prod"}])),
            )
            .await
            .expect("rendered");
        assert_eq!(resources.len(), 3);
        assert_eq!(resources[1].object.metadata.name.as_deref(), Some("staging-config"));
        assert_eq!(resources[2].object.data["data"]["index"], json!(2));
        assert_eq!(resources[0].object.data["data"]["owner"], json!("demo"));
        assert_eq!(resources[0].object.metadata.namespace.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_single_expressions_keep_type() {
        let set = set(r#"
templates:
  - content:
      apiVersion: apps/v1
      kind: Deployment
      metadata:
        name: "{{ .Element.name }}"
      spec:
        replicas: "{{ .Element.replicas }}"
        paused: "{{ .Element.paused }}"
        selector: "{{ .Element.selector }}"
        label: "replicas-{{ .Element.replicas }}"
"#);
        let resources = renderer()
            .render(
                &set,
                &elements(json!([{"name": "app", "replicas": 3, "paused": false, "selector": {"app": "x"}}])),
            )
            .await
            .expect("rendered");
        let spec = &resources[0].object.data["spec"];
        assert_eq!(spec["replicas"], json!(3));
        assert_eq!(spec["paused"], json!(false));
        assert_eq!(spec["selector"], json!({"app": "x"}));
        assert_eq!(spec["label"], json!("replicas-3"));
    }

    #[tokio::test]
    async fn test_repeat_items() {
        let set = set(r#"
templates:
  - repeat: "{ .teams }"
    content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: "{{ .Element.env }}-{{ .Repeat.name }}"
"#);
        let resources = renderer()
            .render(
                &set,
                &elements(json!([
                    {"env": "dev", "teams": [{"name": "a"}, {"name": "b"}]},
                    {"env": "prod", "teams": []}
                ])),
            )
            .await
            .expect("rendered");
        let names: Vec<_> = resources
            .iter()
            .filter_map(|r| r.object.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["dev-a", "dev-b"]);
    }

    #[tokio::test]
    async fn test_cel_repeat() {
        let set = set(r#"
templates:
  - repeat: "cel: Element.ports.filter(p, p > 8000)"
    content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: "port-{{ .Repeat }}"
"#);
        let resources = renderer()
            .render(&set, &elements(json!([{"ports": [80, 8080, 9090]}])))
            .await
            .expect("rendered");
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].object.metadata.name.as_deref(), Some("port-8080"));
    }

    #[tokio::test]
    async fn test_hash_brace_in_text_is_literal() {
        let set = set(r#"
templates:
  - content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: "{{ .Element.cluster }}-script"
      data:
        script: "echo {{ .Element.cluster }} ${#ARGS[@]}"
"#);
        let resources = renderer()
            .render(&set, &elements(json!([{"cluster": "east"}])))
            .await
            .expect("rendered");
        assert_eq!(resources[0].object.data["data"]["script"], json!("echo east ${#ARGS[@]}"));
    }

    #[tokio::test]
    async fn test_text_content_multiple_documents() {
        let set = set(r#"
templates:
  - content: |
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: {{ .Element.env }}-a
      ---
      ---
      apiVersion: v1
      kind: Namespace
      metadata:
        name: {{ .Element.env }}
"#);
        let resources = renderer()
            .render(&set, &elements(json!([{"env": "dev"}])))
            .await
            .expect("rendered");
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].reference.id, "default_dev-a__ConfigMap");
        assert_eq!(resources[1].reference.id, "_dev__Namespace");
    }

    #[tokio::test]
    async fn test_custom_delimiters() {
        let mut set = set(r#"
templates:
  - content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: "${{ .Element.env }}"
      data:
        helm: "{{ .Values.image }}"
        replicas: "${{ .Element.replicas }}"
"#);
        set.metadata.annotations = Some(BTreeMap::from([(
            String::from(DELIMITERS_ANNOTATION),
            String::from("${{,}}"),
        )]));
        let resources = renderer()
            .render(&set, &elements(json!([{"env": "dev", "replicas": 2}])))
            .await
            .expect("rendered");
        assert_eq!(resources[0].object.metadata.name.as_deref(), Some("dev"));
        assert_eq!(resources[0].object.data["data"]["helm"], json!("{{ .Values.image }}"));
        assert_eq!(resources[0].object.data["data"]["replicas"], json!(2));
    }

    #[tokio::test]
    async fn test_invalid_delimiters_annotation() {
        let mut set = set(CONFIG_MAP_TEMPLATE);
        set.metadata.annotations = Some(BTreeMap::from([(
            String::from(DELIMITERS_ANNOTATION),
            String::from("<<"),
        )]));
        let err = renderer()
            .render(&set, &elements(json!([{"env": "dev"}])))
            .await
            .expect_err("bad annotation");
        assert!(matches!(err, TemplateError::Delimiters { .. }));
    }

    #[tokio::test]
    async fn test_blocked_function_names_path() {
        let set = set(r#"
templates:
  - content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: cm
      data:
        home: "home={{ get_env(name='HOME') }}"
"#);
        let err = renderer()
            .render(&set, &elements(json!([{}])))
            .await
            .expect_err("blocked");
        let message = err.to_string();
        assert!(message.contains("default/demo"), "{message}");
        assert!(message.contains("templates[0].content.data.home"), "{message}");
        assert!(message.contains("get_env is not allowed"), "{message}");
    }

    #[tokio::test]
    async fn test_keys_are_rendered() {
        let set = set(r#"
templates:
  - content:
      apiVersion: v1
      kind: ConfigMap
      metadata:
        name: cm-{{ ElementIndex }}
      data:
        "{{ .Element.key }}": value
"#);
        let resources = renderer()
            .render(&set, &elements(json!([{"key": "color"}])))
            .await
            .expect("rendered");
        assert_eq!(resources[0].object.metadata.name.as_deref(), Some("cm-0"));
        assert_eq!(resources[0].object.data["data"]["color"], json!("value"));
    }

    #[tokio::test]
    async fn test_no_elements_no_resources() {
        let resources = renderer()
            .render(&set(CONFIG_MAP_TEMPLATE), &[Vec::new()])
            .await
            .expect("rendered");
        assert!(resources.is_empty());
    }
}
