//! HTTP adapter for synchronous inference job endpoints
//!
//! Request: `POST {url}{path}` with body `{"input": {...}}`.
//! Response: either the payload itself or an envelope
//! `{"status": "COMPLETED", "output": {...}}`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{BackendError, InferenceBackend, InferenceRequest};
use crate::config::EndpointConfig;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    invoke_url: String,
    health_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        path: &str,
        health_path: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Connection {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            invoke_url: format!("{base}{path}"),
            health_url: format!("{base}{health_path}"),
            api_key,
            timeout,
        })
    }

    /// Build from endpoint configuration, resolving the API key from the
    /// configured environment variable.
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Result<Self, BackendError> {
        let api_key = endpoint.api_key_env.as_deref().and_then(|var| {
            let key = std::env::var(var).ok();
            if key.is_none() {
                warn!(env_var = var, url = %endpoint.url, "API key environment variable not set");
            }
            key
        });
        Self::new(
            &endpoint.url,
            &endpoint.path,
            &endpoint.health_path,
            api_key,
            Duration::from_secs(endpoint.timeout_secs),
        )
    }

    pub fn invoke_url(&self) -> &str {
        &self.invoke_url
    }

    fn classify_transport(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            BackendError::Connection {
                message: err.to_string(),
            }
        }
    }

    /// Extract the payload from a decoded response body
    fn unwrap_envelope(&self, body: Value, output: &str) -> Result<Map<String, Value>, BackendError> {
        let Value::Object(mut body) = body else {
            return Err(BackendError::MalformedResponse {
                message: "response body is not a JSON object".to_string(),
            });
        };

        if let Some(status) = body.get("status").and_then(Value::as_str) {
            match status {
                "COMPLETED" => {}
                "FAILED" | "CANCELLED" | "TIMED_OUT" => {
                    let detail = body
                        .get("error")
                        .map(|e| match e {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_else(|| "no error detail".to_string());
                    return Err(BackendError::Rejected {
                        message: format!("job {status}: {detail}"),
                    });
                }
                // IN_QUEUE / IN_PROGRESS: the synchronous wait elapsed first
                _ => {
                    return Err(BackendError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    })
                }
            }
        }

        match body.remove("output") {
            Some(Value::Object(payload)) => Ok(payload),
            Some(Value::Null) => Err(BackendError::MalformedResponse {
                message: "response output is null".to_string(),
            }),
            Some(other) => {
                let mut payload = Map::new();
                payload.insert(output.to_string(), other);
                Ok(payload)
            }
            None => Ok(body),
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_BODY_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{cut}...")
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn invoke(&self, request: InferenceRequest) -> Result<Map<String, Value>, BackendError> {
        let body = json!({ "input": Value::Object(request.inputs) });

        let mut req = self.client.post(&self.invoke_url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await.map_err(|e| self.classify_transport(e))?;
        let status = resp.status();
        debug!(
            service_id = %request.service,
            url = %self.invoke_url,
            status = status.as_u16(),
            "Inference call returned"
        );

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message: truncate(&text),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.classify_transport(e))?;
        let decoded: Value =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::MalformedResponse {
                message: format!("invalid JSON: {e}"),
            })?;

        self.unwrap_envelope(decoded, &request.output)
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let mut req = self.client.get(&self.health_url);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await.map_err(|e| self.classify_transport(e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: resp.status().as_u16(),
                message: format!("health probe to {} failed", self.health_url),
            })
        }
    }
}
