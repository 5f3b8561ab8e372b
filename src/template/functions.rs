//! Functions and filters available to templates.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tera::Tera;

/// Longest name accepted by DNS-1123 labels.
const MAX_NAME_LEN: usize = 63;

/// Functions that read the environment or are not deterministic.
const DEFAULT_BLOCKED: &[&str] = &["get_env", "now", "get_random"];

/// The filters and functions templates may call.
///
/// The library is immutable once built; the renderer registers it on every
/// Tera instance it creates.
#[derive(Debug, Clone)]
pub struct FunctionLibrary {
    blocked: BTreeSet<String>,
}

impl Default for FunctionLibrary {
    fn default() -> Self {
        Self {
            blocked: DEFAULT_BLOCKED.iter().map(|name| (*name).to_string()).collect(),
        }
    }
}

impl FunctionLibrary {
    /// Also blocks `name`, whether it is a function or a filter.
    #[must_use]
    pub fn with_blocked(mut self, name: impl Into<String>) -> Self {
        self.blocked.insert(name.into());
        self
    }

    /// Names that templates may not call.
    pub fn blocked(&self) -> impl Iterator<Item = &str> {
        self.blocked.iter().map(String::as_str)
    }

    /// Installs the library on `tera`.
    pub fn register(&self, tera: &mut Tera) {
        tera.register_filter("sanitize", sanitize_filter);
        tera.register_filter("to_yaml", to_yaml_filter);
        tera.register_filter("to_json", to_json_filter);
        tera.register_filter("quote", quote_filter);
        tera.register_filter("sha256", sha256_filter);
        tera.register_filter("indent", indent_filter);
        tera.register_filter("nindent", nindent_filter);

        for name in &self.blocked {
            let message = format!("function {name} is not allowed in templates");
            let function_message = message.clone();
            tera.register_function(name, move |_: &HashMap<String, Value>| {
                Err(tera::Error::msg(function_message.clone()))
            });
            tera.register_filter(name, move |_: &Value, _: &HashMap<String, Value>| {
                Err(tera::Error::msg(message.clone()))
            });
        }
    }
}

/// Text form of a value: strings as-is, everything else as JSON.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Lowercases `input` and strips characters not allowed in a DNS-1123 label.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let cleaned: String = input
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    let trimmed = cleaned.trim_matches('-');
    let mut name: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

fn sanitize_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(sanitize(&text(value))))
}

fn to_yaml_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let yaml = serde_yaml::to_string(value).map_err(|e| tera::Error::msg(format!("to_yaml: {e}")))?;
    Ok(Value::String(yaml.trim_end_matches('\n').to_string()))
}

fn to_json_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(value.to_string()))
}

fn quote_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(Value::String(text(value)).to_string()))
}

fn sha256_filter(value: &Value, _: &HashMap<String, Value>) -> tera::Result<Value> {
    let digest = Sha256::digest(text(value).as_bytes());
    Ok(Value::String(hex::encode(digest)))
}

fn indent_width(args: &HashMap<String, Value>) -> tera::Result<usize> {
    match args.get("width") {
        None => Ok(2),
        Some(width) => width
            .as_u64()
            .and_then(|w| usize::try_from(w).ok())
            .ok_or_else(|| tera::Error::msg(format!("indent width must be a positive integer, got {width}"))),
    }
}

/// Prefixes every non-empty line of `input` with `width` spaces.
fn indent_lines(input: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    input
        .split('\n')
        .map(|line| if line.is_empty() { String::new() } else { format!("{pad}{line}") })
        .collect::<Vec<_>>()
        .join("\n")
}

fn indent_filter(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(indent_lines(&text(value), indent_width(args)?)))
}

fn nindent_filter(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(format!("\n{}", indent_lines(&text(value), indent_width(args)?))))
}
