//! Repeat expansion.
//!
//! A template's `repeat` expression turns one element into a list of repeat
//! items. Plain expressions are JSONPath, accepting the Kubernetes forms
//! `{ .items }` and `.items`; expressions prefixed with `cel:` are CEL with
//! the element bound as `Element`.

use cel_interpreter::{Context, Program};
use serde_json::Value;
use serde_json_path::JsonPath;
use std::borrow::Cow;

use crate::generators::Element;

const CEL_PREFIX: &str = "cel:";

/// Rewrites a Kubernetes-style JSONPath into RFC 9535 syntax.
#[must_use]
pub fn normalize_json_path(expression: &str) -> Cow<'_, str> {
    let mut path = expression.trim();
    if let Some(inner) = path.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
        path = inner.trim();
    }
    if path.starts_with('$') {
        Cow::Borrowed(path)
    } else if path.starts_with('.') || path.starts_with('[') {
        Cow::Owned(format!("${path}"))
    } else {
        Cow::Owned(format!("$.{path}"))
    }
}

/// Evaluates `expression` against `element`.
///
/// Array results are flattened into their items; an empty result yields no
/// items.
///
/// # Errors
///
/// Returns a description of the failure when the expression does not parse
/// or cannot be evaluated.
pub fn expand(expression: &str, element: &Element) -> Result<Vec<Value>, String> {
    if let Some(cel) = expression.trim().strip_prefix(CEL_PREFIX) {
        return expand_cel(cel.trim(), element);
    }

    let path = JsonPath::parse(&normalize_json_path(expression)).map_err(|e| e.to_string())?;
    let document = Value::Object(element.clone().into_iter().collect());
    let mut items = Vec::new();
    for node in path.query(&document).all() {
        match node {
            Value::Array(values) => items.extend(values.iter().cloned()),
            other => items.push(other.clone()),
        }
    }
    Ok(items)
}

fn expand_cel(source: &str, element: &Element) -> Result<Vec<Value>, String> {
    let program = Program::compile(source).map_err(|e| e.to_string())?;
    let mut context = Context::default();
    context
        .add_variable("Element", element)
        .map_err(|e| e.to_string())?;
    let result = program.execute(&context).map_err(|e| e.to_string())?;
    match result.json().map_err(|e| e.to_string())? {
        Value::Array(values) => Ok(values),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}
