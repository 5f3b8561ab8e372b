//! HTTP API generator.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Method};
use serde_json::Value;
use serde_json_path::JsonPath;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::config::read_config_data;
use super::{Element, Generator, element_from_value, interval_or, unexpected_spec};
use crate::api::{ApiClientGenerator, ConfigKind, GeneratorKind, GeneratorSpec, GitOpsSet};
use crate::cluster::ObjectReader;
use crate::error::GeneratorError;
use crate::template::normalize_json_path;

const KIND: GeneratorKind = GeneratorKind::ApiClient;

/// Key of the Secret entry holding a PEM CA bundle.
const CA_FILE_KEY: &str = "caFile";

/// Polling interval when the spec does not set one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Yields elements from a JSON HTTP endpoint.
#[derive(Clone)]
pub struct ApiClient {
    reader: Arc<dyn ObjectReader>,
    timeout: Duration,
}

impl ApiClient {
    /// Creates the generator. `timeout` bounds each request.
    #[must_use]
    pub fn new(reader: Arc<dyn ObjectReader>, timeout: Duration) -> Self {
        Self { reader, timeout }
    }

    async fn headers(&self, spec: &ApiClientGenerator, namespace: &str) -> Result<HeaderMap, GeneratorError> {
        let mut headers = HeaderMap::new();
        let Some(reference) = &spec.headers_ref else {
            return Ok(headers);
        };
        let data = read_config_data(self.reader.as_ref(), KIND, reference.kind, namespace, &reference.name).await?;
        for (key, value) in data {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| GeneratorError::invalid(KIND, format!("header name {key:?}: {e}")))?;
            let value = HeaderValue::from_str(value.as_str().unwrap_or_default())
                .map_err(|e| GeneratorError::invalid(KIND, format!("header {key:?}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn client(&self, spec: &ApiClientGenerator, namespace: &str) -> Result<reqwest::Client, GeneratorError> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(secret) = &spec.secret_ref {
            let data = read_config_data(self.reader.as_ref(), KIND, ConfigKind::Secret, namespace, secret).await?;
            let pem = data.get(CA_FILE_KEY).and_then(Value::as_str).ok_or_else(|| {
                GeneratorError::invalid(KIND, format!("Secret {namespace}/{secret} has no {CA_FILE_KEY} key"))
            })?;
            let certificate = Certificate::from_pem(pem.as_bytes())
                .map_err(|e| GeneratorError::invalid(KIND, format!("invalid CA in Secret {namespace}/{secret}: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        builder
            .build()
            .map_err(|e| GeneratorError::http(&spec.endpoint, e.to_string()))
    }
}

/// Applies the optional JSONPath projection to a response body.
fn project(spec: &ApiClientGenerator, body: Value) -> Result<Value, GeneratorError> {
    let Some(expression) = spec.json_path.as_deref().filter(|p| !p.trim().is_empty()) else {
        return Ok(body);
    };
    let path = JsonPath::parse(&normalize_json_path(expression))
        .map_err(|e| GeneratorError::invalid(KIND, format!("jsonPath {expression:?}: {e}")))?;
    let nodes = path.query(&body).all();
    Ok(match nodes.as_slice() {
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    })
}

/// Turns a projected response into elements.
fn response_elements(spec: &ApiClientGenerator, value: Value) -> Result<Vec<Element>, GeneratorError> {
    if spec.single_element {
        return Ok(vec![match value {
            Value::Object(map) => map.into_iter().collect(),
            other => Element::from([(String::from("Elements"), other)]),
        }]);
    }
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| element_from_value(KIND, item))
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![element_from_value(KIND, other)?]),
    }
}

#[async_trait]
impl Generator for ApiClient {
    async fn generate(&self, spec: GeneratorSpec<'_>, set: &GitOpsSet) -> Result<Vec<Element>, GeneratorError> {
        let GeneratorSpec::ApiClient(api) = spec else {
            return Err(unexpected_spec(KIND, spec));
        };
        if api.endpoint.is_empty() {
            return Err(GeneratorError::invalid(KIND, "endpoint is required"));
        }
        let method = match api.method.to_uppercase().as_str() {
            "" | "GET" => Method::GET,
            "POST" => Method::POST,
            other => return Err(GeneratorError::invalid(KIND, format!("unsupported method {other}"))),
        };

        let namespace = set.namespace_or_default();
        let client = self.client(api, &namespace).await?;
        let headers = self.headers(api, &namespace).await?;

        debug!(endpoint = %api.endpoint, %method, "Querying API");
        let mut request = client.request(method.clone(), &api.endpoint).headers(headers);
        if method == Method::POST
            && let Some(body) = &api.body
        {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GeneratorError::http(&api.endpoint, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeneratorError::http(&api.endpoint, format!("unexpected status {status}")));
        }
        let body: Value = response.json().await.map_err(|e| GeneratorError::Parse {
            path: api.endpoint.clone(),
            message: e.to_string(),
        })?;

        response_elements(api, project(api, body)?)
    }

    fn interval(&self, spec: GeneratorSpec<'_>) -> Duration {
        match spec {
            GeneratorSpec::ApiClient(api) => interval_or(api.interval.as_deref(), DEFAULT_INTERVAL),
            _ => Duration::ZERO,
        }
    }
}
