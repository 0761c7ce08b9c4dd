//! Language-model gateway.
//!
//! [`LanguageModel`] is the seam to an external completion/embedding service
//! ([`openai::OpenAiModel`] in production, scripted mocks in tests).
//! [`Gateway`] sits in front of it and turns free-form completions into
//! validated values:
//!
//! 1. send the prompt with a JSON-only system instruction,
//! 2. recover JSON from the reply (direct parse, fenced block, outermost span),
//! 3. check it against the [`ExpectedShape`],
//! 4. log and collapse every failure to `None`, except authentication.
//!
//! Authentication failures come back as [`AuthenticationFailed`] because no
//! later unit in the same run could succeed either.

pub mod openai;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::error::{AuthenticationFailed, GatewayError};

const JSON_SYSTEM_PROMPT: &str = "You are an expert compliance auditor. \
Respond strictly with the JSON object requested, without commentary.";

const TEXT_SYSTEM_PROMPT: &str = "You are an expert compliance auditor.";

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid regex"));

/// External completion and embedding service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Single-turn chat completion; returns the assistant message text.
    async fn complete(&self, model: &str, system: &str, prompt: &str)
        -> Result<String, GatewayError>;

    /// One embedding vector per input text, in input order.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError>;
}

/// What the caller expects the completion to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    /// `{"<key>": true|false}`
    BooleanFlag { key: &'static str },
    /// `{"<key>": [{...}, ...]}` or a bare `[{...}, ...]`
    ObjectList { key: &'static str },
    GenericObject,
    RawText,
}

/// A completion that passed shape validation.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmOutput {
    Flag(bool),
    List(Vec<Map<String, Value>>),
    Object(Map<String, Value>),
    Text(String),
}

impl LlmOutput {
    pub fn into_flag(self) -> Option<bool> {
        match self {
            LlmOutput::Flag(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Map<String, Value>>> {
        match self {
            LlmOutput::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<Map<String, Value>> {
        match self {
            LlmOutput::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

pub struct Gateway<'a> {
    backend: &'a dyn LanguageModel,
}

impl<'a> Gateway<'a> {
    pub fn new(backend: &'a dyn LanguageModel) -> Self {
        Self { backend }
    }

    /// Ask `model` for a reply of the given shape.
    ///
    /// `Ok(None)` means "no usable answer this time"; the cause has been logged.
    pub async fn call(
        &self,
        prompt: &str,
        model: &str,
        shape: ExpectedShape,
    ) -> Result<Option<LlmOutput>, AuthenticationFailed> {
        let system = match shape {
            ExpectedShape::RawText => TEXT_SYSTEM_PROMPT,
            _ => JSON_SYSTEM_PROMPT,
        };
        tracing::debug!(model, ?shape, "llm call");

        let reply = match self.backend.complete(model, system, prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                log_gateway_error(model, &e);
                return match e {
                    GatewayError::Authentication(msg) => Err(AuthenticationFailed(msg)),
                    _ => Ok(None),
                };
            }
        };

        if let ExpectedShape::RawText = shape {
            let text = reply.trim();
            if text.is_empty() {
                tracing::warn!(model, "llm: empty text reply");
                return Ok(None);
            }
            return Ok(Some(LlmOutput::Text(text.to_string())));
        }

        let Some(value) = extract_json(&reply) else {
            tracing::warn!(model, reply = %truncate(&reply, 200), "llm: reply is not JSON");
            return Ok(None);
        };

        match validate_shape(value, shape) {
            Ok(output) => Ok(Some(output)),
            Err(reason) => {
                tracing::warn!(model, ?shape, %reason, "llm: reply failed shape validation");
                Ok(None)
            }
        }
    }

    /// Embed a batch, checking that one vector came back per text.
    pub async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let vectors = self.backend.embed(model, texts).await.inspect_err(|e| {
            log_gateway_error(model, e);
        })?;
        if vectors.len() != texts.len() {
            let err = GatewayError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            ));
            log_gateway_error(model, &err);
            return Err(err);
        }
        Ok(vectors)
    }
}

fn log_gateway_error(model: &str, err: &GatewayError) {
    match err {
        GatewayError::RateLimited(msg) => {
            tracing::warn!(model, %msg, "llm: rate limited, leaving result undetermined")
        }
        GatewayError::Authentication(msg) => {
            tracing::error!(model, %msg, "llm: authentication failed")
        }
        GatewayError::Connection(msg) => tracing::warn!(model, %msg, "llm: connection failed"),
        GatewayError::Api { status, body } => {
            tracing::warn!(model, status, body = %truncate(body, 200), "llm: API error")
        }
        GatewayError::InvalidResponse(msg) => {
            tracing::warn!(model, %msg, "llm: invalid response")
        }
    }
}

/// Recover a JSON value from a reply that may wrap it in prose or fences.
pub fn extract_json(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    for caps in FENCED_BLOCK.captures_iter(trimmed) {
        if let Ok(value) = serde_json::from_str(caps[1].trim()) {
            return Some(value);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }

    None
}

/// Check a parsed reply against `shape`.
pub fn validate_shape(value: Value, shape: ExpectedShape) -> Result<LlmOutput, String> {
    match shape {
        ExpectedShape::BooleanFlag { key } => match value.get(key) {
            Some(Value::Bool(b)) => Ok(LlmOutput::Flag(*b)),
            Some(other) => Err(format!("'{}' is not a boolean: {}", key, other)),
            None => Err(format!("missing key '{}'", key)),
        },
        ExpectedShape::ObjectList { key } => {
            let items = match value {
                Value::Array(items) => items,
                Value::Object(mut obj) => match obj.remove(key) {
                    Some(Value::Array(items)) => items,
                    Some(_) => return Err(format!("'{}' is not a list", key)),
                    None => return Err(format!("missing key '{}'", key)),
                },
                _ => return Err("expected an object or a list".to_string()),
            };
            items
                .into_iter()
                .map(|item| match item {
                    Value::Object(obj) => Ok(obj),
                    other => Err(format!("list item is not an object: {}", other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(LlmOutput::List)
        }
        ExpectedShape::GenericObject => match value {
            Value::Object(obj) => Ok(LlmOutput::Object(obj)),
            other => Err(format!("expected an object, got {}", other)),
        },
        ExpectedShape::RawText => match value {
            Value::String(s) => Ok(LlmOutput::Text(s)),
            other => Ok(LlmOutput::Text(other.to_string())),
        },
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
