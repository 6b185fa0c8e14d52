//! OpenAI-compatible chat-completion wire format shared by both backends.

use super::BackendError;
use crate::util::head_chars;
use serde::{Deserialize, Serialize};

/// Which of the two request kinds is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Review,
    TestGeneration,
}

impl RequestKind {
    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Review => "review",
            RequestKind::TestGeneration => "test generation",
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// User-role text: an instruction line followed by the chunk fenced and
/// labeled with its language.
pub(crate) fn user_message(kind: RequestKind, code: &str, language: &str) -> String {
    let lead = match kind {
        RequestKind::Review => format!("Here is the {} code diff chunk to review:", language),
        RequestKind::TestGeneration => {
            format!("Generate unit tests for this {} code diff:", language)
        }
    };
    format!("{}\n\n```{}\n{}\n```", lead, language, code.trim_end_matches('\n'))
}

pub(crate) fn build_request(
    model: &str,
    max_tokens: u32,
    kind: RequestKind,
    prompt: &str,
    code: &str,
    language: &str,
) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![
            Message {
                role: "system".to_string(),
                content: prompt.to_string(),
            },
            Message {
                role: "user".to_string(),
                content: user_message(kind, code, language),
            },
        ],
        max_tokens,
        stream: false,
    }
}

/// POST a chat request and pull out the first choice's content.
///
/// Zero choices is not an error: the backend answered, it just had nothing
/// to say, and the caller gets an empty string.
pub(crate) async fn send_chat(
    http: &reqwest::Client,
    backend: &'static str,
    url: &str,
    bearer: Option<&str>,
    request: &ChatRequest,
) -> Result<String, BackendError> {
    let mut builder = http
        .post(url)
        .header("Content-Type", "application/json")
        .json(request);
    if let Some(token) = bearer {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    let response = builder.send().await?;
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(BackendError::Status {
            backend,
            status: status.as_u16(),
            body: head_chars(text.trim(), 200),
        });
    }

    parse_chat_response(backend, &text)
}

pub(crate) fn parse_chat_response(
    backend: &'static str,
    text: &str,
) -> Result<String, BackendError> {
    let parsed: ChatResponse =
        serde_json::from_str(text).map_err(|source| BackendError::Decode { backend, source })?;

    match parsed.choices.into_iter().next() {
        Some(choice) => Ok(choice.message.content.unwrap_or_default()),
        None => {
            tracing::warn!(backend, "backend returned no choices; treating as empty response");
            Ok(String::new())
        }
    }
}
