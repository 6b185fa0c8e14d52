//! Local OpenAI-compatible server (LM Studio by default).

use super::client::{build_request, send_chat, RequestKind};
use super::{http_client, BackendError, ReviewBackend};
use async_trait::async_trait;
use std::time::Duration;

pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LocalClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    health_timeout: Duration,
}

impl LocalClient {
    pub fn new(endpoint: &str, model: &str, max_tokens: u32) -> Result<Self, BackendError> {
        Ok(Self {
            http: http_client()?,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            max_tokens,
            health_timeout: HEALTH_CHECK_TIMEOUT,
        })
    }

    /// Bound on the whole liveness probe, connect to last byte.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    /// Sibling model-listing URL used for liveness checks.
    pub fn models_url(&self) -> String {
        models_url(&self.endpoint)
    }

    async fn chat(
        &self,
        kind: RequestKind,
        prompt: &str,
        code: &str,
        language: &str,
    ) -> Result<String, BackendError> {
        let request = build_request(&self.model, self.max_tokens, kind, prompt, code, language);
        send_chat(&self.http, self.name(), &self.endpoint, None, &request).await
    }
}

fn models_url(endpoint: &str) -> String {
    match endpoint.strip_suffix("/chat/completions") {
        Some(base) => format!("{}/models", base),
        None => format!("{}/v1/models", endpoint.trim_end_matches('/')),
    }
}

#[async_trait]
impl ReviewBackend for LocalClient {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn review(&self, prompt: &str, code: &str, language: &str) -> Result<String, BackendError> {
        self.chat(RequestKind::Review, prompt, code, language).await
    }

    async fn generate_tests(
        &self,
        prompt: &str,
        code: &str,
        language: &str,
    ) -> Result<String, BackendError> {
        self.chat(RequestKind::TestGeneration, prompt, code, language)
            .await
    }

    /// GET the models listing; anything but 200, or no answer within the
    /// health timeout, is a failure.
    async fn health_check(&self) -> Result<(), BackendError> {
        let response = self
            .http
            .get(self.models_url())
            .timeout(self.health_timeout)
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(BackendError::Status {
                backend: self.name(),
                status: status.as_u16(),
                body: "health check failed".to_string(),
            });
        }
        Ok(())
    }
}
