//! Rendered resources and their normalization.

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use crate::api::{GitOpsSet, LABEL_SET_NAME, LABEL_SET_NAMESPACE};
use crate::cluster::ScopeResolver;
use crate::error::{ClusterError, TemplateError};
use crate::inventory::ResourceRef;

/// A resource produced by rendering, ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResource {
    /// The object to send to the API server.
    pub object: DynamicObject,
    /// Inventory identity of the object.
    pub reference: ResourceRef,
    /// Whether the kind lives in a namespace.
    pub namespaced: bool,
}

impl RenderedResource {
    /// Wraps an object, computing its inventory reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the object has no type information or no name.
    pub fn new(object: DynamicObject, namespaced: bool) -> Result<Self, ClusterError> {
        let reference = ResourceRef::from_object(&object)?;
        Ok(Self {
            object,
            reference,
            namespaced,
        })
    }
}

/// Turns one rendered document into a resource.
///
/// `status` is dropped, the namespace is defaulted to the set's for
/// namespaced kinds and removed for cluster-scoped ones, and the set labels
/// are added under any labels the template sets.
pub(crate) async fn normalize(
    mut document: Value,
    set: &GitOpsSet,
    scope: &dyn ScopeResolver,
    path: &str,
) -> Result<RenderedResource, TemplateError> {
    let set_name = set.namespaced_name();
    let parse_error = |message: String| TemplateError::Parse {
        set: set_name.clone(),
        path: path.to_string(),
        message,
    };

    if !document.is_object() {
        return Err(parse_error(format!("rendered document is not an object: {document}")));
    }
    let Value::Object(fields) = &mut document else {
        return Err(parse_error(String::from("rendered document is not an object")));
    };
    let required = |fields: &Map<String, Value>, key: &str| {
        fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let api_version = required(fields, "apiVersion").ok_or_else(|| parse_error(String::from("missing apiVersion")))?;
    let kind = required(fields, "kind").ok_or_else(|| parse_error(String::from("missing kind")))?;
    fields.remove("status");

    let metadata = fields
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(metadata) = metadata else {
        return Err(parse_error(String::from("metadata is not an object")));
    };
    if metadata
        .get("name")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty)
    {
        return Err(parse_error(format!("{kind} has no metadata.name")));
    }

    let namespaced = scope
        .is_namespaced(&api_version, &kind)
        .await
        .map_err(|source| TemplateError::Scope {
            set: set_name.clone(),
            kind: kind.clone(),
            source,
        })?;
    if namespaced {
        let blank = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty);
        if blank {
            metadata.insert(String::from("namespace"), Value::String(set.namespace_or_default()));
        }
    } else {
        metadata.remove("namespace");
    }

    let mut labels = Map::from_iter([
        (String::from(LABEL_SET_NAME), Value::String(set.metadata.name.clone().unwrap_or_default())),
        (String::from(LABEL_SET_NAMESPACE), Value::String(set.namespace_or_default())),
    ]);
    match metadata.get("labels") {
        Some(Value::Object(template_labels)) => {
            labels.extend(template_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        None | Some(Value::Null) => {}
        Some(other) => return Err(parse_error(format!("metadata.labels is not an object: {other}"))),
    }
    metadata.insert(String::from("labels"), Value::Object(labels));

    let object: DynamicObject = serde_json::from_value(document).map_err(|e| parse_error(e.to_string()))?;
    RenderedResource::new(object, namespaced).map_err(|e| parse_error(e.to_string()))
}
