//! The `GitOpsSet` custom resource.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::{Schema, SchemaObject};
use serde::{Deserialize, Serialize};

use super::condition::{Condition, READY_CONDITION};
use super::generator::GitOpsSetGenerator;
use crate::inventory::ResourceInventory;

/// Finalizer guarding deletion until generated resources are removed.
pub const FINALIZER: &str = "finalizers.templates.weave.works";

/// Annotation overriding the template delimiters, e.g. `"${{,}}"`.
pub const DELIMITERS_ANNOTATION: &str = "templates.weave.works/delimiters";

/// Annotation requesting an out-of-band reconcile (RFC3339 timestamp).
pub const RECONCILE_REQUESTED_AT_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// Label carrying the owning set's name on every generated resource.
pub const LABEL_SET_NAME: &str = "templates.weave.works/name";

/// Label carrying the owning set's namespace on every generated resource.
pub const LABEL_SET_NAMESPACE: &str = "templates.weave.works/namespace";

/// Desired state of a GitOpsSet.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "templates.weave.works",
    version = "v1alpha1",
    kind = "GitOpsSet",
    plural = "gitopssets",
    shortname = "gs",
    namespaced,
    status = "GitOpsSetStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSetSpec {
    /// Suspend stops generation and apply; inventory is left untouched.
    #[serde(default)]
    pub suspend: bool,

    /// Service account impersonated for every cluster write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Generators producing the elements fed to the templates.
    #[serde(default)]
    pub generators: Vec<GitOpsSetGenerator>,

    /// Templates rendered once per element (or per repeat item).
    #[serde(default)]
    pub templates: Vec<GitOpsSetTemplate>,
}

/// A template rendered against every generated element.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSetTemplate {
    /// JSONPath or `cel:`-prefixed expression expanding one element into many.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<String>,

    /// The resource document: an object, or YAML text holding one or more documents.
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub content: serde_json::Value,
}

/// Observed state of a GitOpsSet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsSetStatus {
    /// Generation last processed to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions; only `Ready` is maintained.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Resources applied by the last reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<ResourceInventory>,

    /// Last handled value of the requested-at annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

/// Schema for free-form documents kept verbatim by the API server.
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject::default();
    schema.extensions.insert(
        String::from("x-kubernetes-preserve-unknown-fields"),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

impl GitOpsSet {
    /// Namespace of the set; empty when unset.
    #[must_use]
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// `namespace/name` used in log lines and error messages.
    #[must_use]
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }

    /// Whether the controller finalizer is attached.
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Whether deletion has been requested.
    #[must_use]
    pub const fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Value of the delimiters annotation, if set.
    #[must_use]
    pub fn delimiters_annotation(&self) -> Option<&str> {
        self.annotations().get(DELIMITERS_ANNOTATION).map(String::as_str)
    }

    /// Value of the requested-at annotation if it has not been handled yet.
    #[must_use]
    pub fn pending_reconcile_request(&self) -> Option<&str> {
        let requested = self.annotations().get(RECONCILE_REQUESTED_AT_ANNOTATION)?;
        let handled = self
            .status
            .as_ref()
            .and_then(|s| s.last_handled_reconcile_at.as_deref());
        (handled != Some(requested.as_str())).then_some(requested.as_str())
    }

    /// The current inventory, if any.
    #[must_use]
    pub fn inventory(&self) -> Option<&ResourceInventory> {
        self.status.as_ref().and_then(|s| s.inventory.as_ref())
    }

    /// The `Ready` condition, if any.
    #[must_use]
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == READY_CONDITION))
    }
}

impl GitOpsSetStatus {
    /// Replaces the `Ready` condition, keeping the transition time when the
    /// status value does not change.
    pub fn set_ready(&mut self, mut condition: Condition) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == READY_CONDITION) {
            if existing.status == condition.status {
                condition
                    .last_transition_time
                    .clone_from(&existing.last_transition_time);
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ConditionStatus;
    use kube::CustomResourceExt;
    use std::collections::BTreeMap;

    fn set_with_annotations(annotations: &[(&str, &str)]) -> GitOpsSet {
        let mut set = GitOpsSet::new("demo", GitOpsSetSpec::default());
        set.metadata.namespace = Some(String::from("default"));
        set.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        set
    }

    #[test]
    fn test_parse_gitopsset_yaml() {
        let yaml = r#"
apiVersion: templates.weave.works/v1alpha1
kind: GitOpsSet
metadata:
  name: demo
  namespace: default
spec:
  serviceAccountName: deployer
  generators:
    - list:
        elements:
          - env: dev
          - env: prod
  templates:
    - repeat: "{ .items }"
      content:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: "{{ .Element.env }}"
"#;
        let set: GitOpsSet = serde_yaml::from_str(yaml).expect("valid GitOpsSet");
        assert_eq!(set.namespaced_name(), "default/demo");
        assert_eq!(set.spec.service_account_name.as_deref(), Some("deployer"));
        assert_eq!(set.spec.generators.len(), 1);
        assert_eq!(set.spec.templates[0].repeat.as_deref(), Some("{ .items }"));
        assert!(!set.spec.suspend);
    }

    #[test]
    fn test_pending_reconcile_request() {
        let mut set = set_with_annotations(&[(
            RECONCILE_REQUESTED_AT_ANNOTATION,
            "2024-01-01T00:00:00Z",
        )]);
        assert_eq!(set.pending_reconcile_request(), Some("2024-01-01T00:00:00Z"));

        set.status = Some(GitOpsSetStatus {
            last_handled_reconcile_at: Some(String::from("2024-01-01T00:00:00Z")),
            ..GitOpsSetStatus::default()
        });
        assert_eq!(set.pending_reconcile_request(), None);
    }

    #[test]
    fn test_set_ready_keeps_transition_time() {
        let mut status = GitOpsSetStatus::default();
        let mut first = Condition::ready(ConditionStatus::True, "ReconciliationSucceeded", "1 resources created", None);
        first.last_transition_time = String::from("2024-01-01T00:00:00Z");
        status.set_ready(first);

        let second = Condition::ready(ConditionStatus::True, "ReconciliationSucceeded", "2 resources created", None);
        status.set_ready(second);

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].message, "2 resources created");
        assert_eq!(status.conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_crd_generation() {
        let crd = GitOpsSet::crd();
        assert_eq!(crd.spec.group, "templates.weave.works");
        assert_eq!(crd.spec.names.kind, "GitOpsSet");
    }
}
