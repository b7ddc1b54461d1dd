//! HTTP handler for the inference API.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::handler::{HandlerError, HandlerRegistry, JobHandler};

/// Longest upstream error body kept in `last_error`.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Clone, Debug)]
pub struct InferenceConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Job types routed to the inference endpoint.
    pub job_types: Vec<String>,
}

impl InferenceConfig {
    pub fn from_env() -> Self {
        let url = std::env::var("INFERENCE_URL")
            .unwrap_or_else(|_| "http://localhost:9000/v1/infer".to_string());
        let api_key = std::env::var("INFERENCE_API_KEY").ok().filter(|k| !k.is_empty());
        let job_types = std::env::var("JOB_TYPES")
            .unwrap_or_else(|_| "kb.ingest,diary.entry".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            url,
            api_key,
            job_types,
        }
    }

    pub fn registry(&self) -> HandlerRegistry {
        self.registry_with(Client::new())
    }

    /// One [`InferenceHandler`] per configured job type, sharing `client`.
    pub fn registry_with(&self, client: Client) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for kind in &self.job_types {
            let handler = InferenceHandler {
                client: client.clone(),
                url: self.url.clone(),
                api_key: self.api_key.clone(),
                kind: kind.clone(),
            };
            registry.register(kind.clone(), Arc::new(handler));
        }
        registry
    }
}

/// POSTs `{"type", "payload"}` upstream; the JSON response body is the result.
pub struct InferenceHandler {
    client: Client,
    url: String,
    api_key: Option<String>,
    kind: String,
}

#[async_trait]
impl JobHandler for InferenceHandler {
    async fn handle(&self, payload: &Value) -> Result<Value, HandlerError> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&json!({ "type": self.kind, "payload": payload }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut end = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(HandlerError::new(format!("upstream returned {status}: {body}"))
                .with_status(status.as_u16())
                .with_headers(headers));
        }

        Ok(resp.json::<Value>().await?)
    }
}
