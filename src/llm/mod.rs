//! Model backends
//!
//! Everything the review loop needs from a language model goes through
//! [`ReviewBackend`]. The concrete backend is picked once at startup by
//! [`connect`] and never switched mid-run.

pub mod client;
pub mod hosted;
pub mod local;

use crate::config::{Config, Provider};
use crate::retry::Aborted;
use async_trait::async_trait;
use std::time::Duration;

pub use client::RequestKind;
pub use hosted::HostedClient;
pub use local::LocalClient;

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{backend} returned status {status}: {body}")]
    Status {
        backend: &'static str,
        status: u16,
        body: String,
    },
    #[error("could not decode {backend} response: {source}")]
    Decode {
        backend: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} is not set")]
    MissingCredential(&'static str),
    #[error(transparent)]
    Aborted(#[from] Aborted),
}

impl BackendError {
    /// Deadline-style failures, counted separately by the review loop.
    pub fn is_timeout(&self) -> bool {
        match self {
            BackendError::Aborted(Aborted::DeadlineExceeded(_)) => true,
            BackendError::Http(err) => err.is_timeout(),
            _ => false,
        }
    }
}

/// The three things a model backend must be able to do.
#[async_trait]
pub trait ReviewBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn review(&self, prompt: &str, code: &str, language: &str) -> Result<String, BackendError>;

    async fn generate_tests(
        &self,
        prompt: &str,
        code: &str,
        language: &str,
    ) -> Result<String, BackendError>;

    async fn health_check(&self) -> Result<(), BackendError>;
}

/// Dispatch one request kind onto the matching trait method.
pub async fn request(
    backend: &dyn ReviewBackend,
    kind: RequestKind,
    prompt: &str,
    code: &str,
    language: &str,
) -> Result<String, BackendError> {
    match kind {
        RequestKind::Review => backend.review(prompt, code, language).await,
        RequestKind::TestGeneration => backend.generate_tests(prompt, code, language).await,
    }
}

/// Build the backend the config asks for.
///
/// Fails when the hosted provider has no credential or the local model is
/// outside the allow-list; both are startup faults.
pub fn connect(config: &Config) -> anyhow::Result<Box<dyn ReviewBackend>> {
    let model = config.effective_model();
    let backend: Box<dyn ReviewBackend> = match config.llm_provider {
        Provider::Hosted => Box::new(HostedClient::from_env(model, config.max_tokens)?),
        Provider::Local => {
            config.check_local_model()?;
            Box::new(LocalClient::new(&config.local_endpoint, model, config.max_tokens)?)
        }
    };
    Ok(backend)
}

/// Request bodies are bounded by each call's deadline; only connecting
/// gets a fixed limit here.
pub(crate) fn http_client() -> Result<reqwest::Client, BackendError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_counts_as_timeout() {
        let err = BackendError::from(Aborted::DeadlineExceeded(Duration::from_secs(1)));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn test_status_is_not_timeout() {
        let err = BackendError::Status {
            backend: "local",
            status: 503,
            body: "busy".into(),
        };
        assert!(!err.is_timeout());
        assert!(!BackendError::from(Aborted::Cancelled).is_timeout());
    }

    #[test]
    fn test_connect_local_respects_allow_list() {
        let mut config = Config {
            llm_provider: Provider::Local,
            llm_model: "not-allowed".into(),
            allowed_local_models: vec!["google/gemma-3-12b".into()],
            ..Config::default()
        };
        assert!(connect(&config).is_err());

        config.llm_model = "google/gemma-3-12b".into();
        let backend = connect(&config).unwrap();
        assert_eq!(backend.name(), "local");
    }
}
