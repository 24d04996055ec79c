//! The model-service boundary: request/response types, failure kinds, the
//! [`ModelService`] trait, and the bundled HTTP-backed client.
//!
//! The engine never assumes a concrete backend — the feedback loop and the
//! subagent coordinator speak only [`ModelService`]. The bundled
//! [`HttpModelClient`] targets an OpenAI-style chat completions endpoint and
//! is what the `drover` binary wires in.
//!
//! - [`retry`] — exponential backoff with deterministic jitter, shared by the
//!   model boundary, the work queue, and the feedback loop.

pub mod retry;

pub use retry::RetryConfig;

use crate::error::EngineError;
use crate::{ToolCallRequest, ToolContract, Turn, TurnRole};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default request timeout for the HTTP client.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

// ── Request / response types ───────────────────────────────────────

/// A single request across the model boundary.
#[derive(Debug)]
pub struct ModelRequest {
    /// The conversation context, in order.
    pub turns: Vec<Turn>,
    /// Capability contracts the model may invoke this step.
    pub tool_contracts: Vec<ToolContract>,
    /// Maximum tokens the model may spend on its response.
    pub token_budget: u32,
}

/// The model's decision for one step: free text, tool calls, or both.
#[derive(Debug, Default)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelResponse {
    /// Whether the model produced neither text nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty) && self.tool_calls.is_empty()
    }
}

/// Failure kinds at the model boundary.
#[derive(Debug)]
pub enum ModelError {
    /// The backend rejected the call for load reasons — retry with backoff.
    RateLimited(String),
    /// The request itself is malformed — fatal, never retried.
    InvalidRequest(String),
    /// The call did not complete in time — treated as a verify failure.
    Timeout(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::RateLimited(m) => write!(f, "rate limited: {m}"),
            ModelError::InvalidRequest(m) => write!(f, "invalid request: {m}"),
            ModelError::Timeout(m) => write!(f, "timed out: {m}"),
        }
    }
}

impl From<ModelError> for EngineError {
    /// Classification at the ACT boundary: rate limits are transient,
    /// malformed requests are fatal validation failures, timeouts feed the
    /// verify/retry path like any other tool failure.
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::RateLimited(m) => EngineError::TransientBackend(m),
            ModelError::InvalidRequest(m) => EngineError::Validation(m),
            ModelError::Timeout(m) => EngineError::ToolExecution(format!("model call {m}")),
        }
    }
}

/// Boxed future returned by [`ModelService::complete`].
///
/// Type alias to keep the trait dyn-compatible, matching the capability
/// traits in [`crate::tools`].
pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<ModelResponse, ModelError>> + Send + 'a>>;

/// The external reasoning backend, as the engine sees it.
pub trait ModelService: Send + Sync {
    fn complete(&self, request: &ModelRequest) -> ModelFuture<'_>;
}

// ── HTTP client ────────────────────────────────────────────────────

/// Raw chat-completions response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<RawApiError>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawMessage,
}

#[derive(Deserialize, Debug)]
struct RawMessage {
    content: Option<String>,
    tool_calls: Option<Vec<RawToolCall>>,
}

#[derive(Deserialize, Debug)]
struct RawToolCall {
    id: String,
    function: RawFunctionCall,
}

#[derive(Deserialize, Debug)]
struct RawFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Debug)]
struct RawApiError {
    message: String,
}

/// Async HTTP client for an OpenAI-style chat completions endpoint.
///
/// The default [`ModelService`] implementation. Status codes are mapped onto
/// the three boundary failure kinds: 429 and 5xx become
/// [`ModelError::RateLimited`], 4xx becomes [`ModelError::InvalidRequest`],
/// and network timeouts become [`ModelError::Timeout`].
pub struct HttpModelClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl HttpModelClient {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .user_agent("drover-rs/0.1")
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Validation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    /// Build the JSON request body from a [`ModelRequest`].
    fn body(&self, request: &ModelRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .turns
            .iter()
            .map(|t| {
                serde_json::json!({
                    "role": role_str(t.role),
                    "content": t.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.token_budget,
        });

        if !request.tool_contracts.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tool_contracts
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "description": c.description,
                            "parameters": c.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
        }

        body
    }

    /// Post a prepared body. Split from [`ModelService::complete`] so the
    /// boxed future owns its payload instead of borrowing the request.
    async fn send(&self, body: serde_json::Value) -> Result<ModelResponse, ModelError> {
        let start = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(format!("request to {}: {e}", self.endpoint))
                } else {
                    ModelError::RateLimited(format!("request failed: {e}"))
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ModelError::RateLimited(format!("failed to read response: {e}")))?;

        debug!(
            "model response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            let msg = format!("HTTP {status}: {text}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(ModelError::RateLimited(msg))
            } else {
                Err(ModelError::InvalidRequest(msg))
            };
        }

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| ModelError::InvalidRequest(format!("failed to parse response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(ModelError::InvalidRequest(err.message));
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());
        let response = match choice {
            Some(c) => ModelResponse {
                text: c.message.content,
                tool_calls: c
                    .message
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tc| ToolCallRequest {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect(),
            },
            None => ModelResponse::default(),
        };

        trace!(
            "model output: {} chars text, {} tool call(s)",
            response.text.as_ref().map_or(0, |s| s.len()),
            response.tool_calls.len()
        );
        Ok(response)
    }
}

impl ModelService for HttpModelClient {
    fn complete(&self, request: &ModelRequest) -> ModelFuture<'_> {
        debug!(
            "model request: model={}, turns={}, contracts={}, budget={}",
            self.model,
            request.turns.len(),
            request.tool_contracts.len(),
            request.token_budget,
        );
        let body = self.body(request);
        Box::pin(self.send(body))
    }
}

fn role_str(role: TurnRole) -> &'static str {
    match role {
        TurnRole::System => "system",
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
        TurnRole::Tool => "tool",
    }
}
