//! ConfigMap and Secret data generator.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::{Element, Generator, unexpected_spec};
use crate::api::{ConfigKind, GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::cluster::ObjectReader;
use crate::error::GeneratorError;

/// Yields one element holding the `data` of a ConfigMap or Secret.
#[derive(Clone)]
pub struct ConfigData {
    reader: Arc<dyn ObjectReader>,
}

impl ConfigData {
    /// Creates the generator.
    #[must_use]
    pub fn new(reader: Arc<dyn ObjectReader>) -> Self {
        Self { reader }
    }
}

/// Reads the string data of a ConfigMap or Secret. Secret values are decoded.
pub(crate) async fn read_config_data(
    reader: &dyn ObjectReader,
    generator: GeneratorKind,
    kind: ConfigKind,
    namespace: &str,
    name: &str,
) -> Result<Element, GeneratorError> {
    let kind_name = match kind {
        ConfigKind::ConfigMap => "ConfigMap",
        ConfigKind::Secret => "Secret",
    };
    let object = reader
        .get("v1", kind_name, namespace, name)
        .await?
        .ok_or_else(|| GeneratorError::NotFound {
            kind: kind_name.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;

    let Some(data) = object.get("data").and_then(Value::as_object) else {
        return Ok(Element::new());
    };

    let mut element = Element::new();
    for (key, value) in data {
        let raw = value.as_str().unwrap_or_default();
        let text = match kind {
            ConfigKind::ConfigMap => raw.to_string(),
            ConfigKind::Secret => {
                let bytes = STANDARD.decode(raw).map_err(|e| {
                    GeneratorError::invalid(generator, format!("Secret {namespace}/{name} key {key}: {e}"))
                })?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
        };
        element.insert(key.clone(), Value::String(text));
    }
    Ok(element)
}

#[async_trait]
impl Generator for ConfigData {
    async fn generate(&self, spec: GeneratorSpec<'_>, set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError> {
        let GeneratorSpec::Config(config) = spec else {
            return Err(unexpected_spec(GeneratorKind::Config, spec));
        };
        let element = read_config_data(
            self.reader.as_ref(),
            GeneratorKind::Config,
            config.kind,
            &set.namespace_or_default(),
            &config.name,
        )
        .await?;
        Ok(vec![element])
    }

    fn interval(&self, _spec: GeneratorSpec<'_>) -> Duration {
        Duration::ZERO
    }
}
