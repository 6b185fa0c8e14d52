//! Hosted chat-completion API (OpenAI).

use super::client::{build_request, send_chat, RequestKind};
use super::{http_client, BackendError, ReviewBackend};
use async_trait::async_trait;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
const HOSTED_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct HostedClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl HostedClient {
    pub fn new(api_key: String, model: &str, max_tokens: u32) -> Result<Self, BackendError> {
        if api_key.trim().is_empty() {
            return Err(BackendError::MissingCredential(API_KEY_ENV));
        }
        Ok(Self {
            http: http_client()?,
            url: HOSTED_URL.to_string(),
            api_key,
            model: model.to_string(),
            max_tokens,
        })
    }

    /// Read the credential from the environment; a missing key is fatal.
    pub fn from_env(model: &str, max_tokens: u32) -> Result<Self, BackendError> {
        let api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
        Self::new(api_key, model, max_tokens)
    }

    /// Point at a different endpoint (proxies, tests).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    async fn chat(
        &self,
        kind: RequestKind,
        prompt: &str,
        code: &str,
        language: &str,
    ) -> Result<String, BackendError> {
        let request = build_request(&self.model, self.max_tokens, kind, prompt, code, language);
        send_chat(&self.http, self.name(), &self.url, Some(&self.api_key), &request).await
    }
}

#[async_trait]
impl ReviewBackend for HostedClient {
    fn name(&self) -> &'static str {
        "hosted"
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

    /// Credential presence only; no network probe.
    async fn health_check(&self) -> Result<(), BackendError> {
        if self.api_key.trim().is_empty() {
            return Err(BackendError::MissingCredential(API_KEY_ENV));
        }
        Ok(())
    }
}
