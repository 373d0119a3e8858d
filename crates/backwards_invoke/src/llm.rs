//! Model completions requested from the daemon.
//!
//! Each [`LlmInvocation`] is one owning object for timing purposes: a second
//! call started while the first is still producing fails with
//! [`InvokeError::Race`]. Clone the session, not the invocation, to run calls
//! in parallel.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{InvokeError, Result};
use crate::invocation::{BackwardsInvocation, InvocationStream};
use crate::kind::InvokeType;
use crate::session::Session;
use crate::timing::{TimingContext, TimingGuard};

// -----------------------------------------------------------------------------
// Entities
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub completion_params: HashMap<String, Value>,
}

fn default_mode() -> String {
    "chat".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    /// Plain text or a list of content parts, passed through untouched.
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PromptMessage {
    pub fn new(role: PromptRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Value::String(text.into()),
            name: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(PromptRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(PromptRole::User, text)
    }

    /// Text content, if the message carries a plain string.
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessageTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool arguments.
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    /// Seconds, as reported by the daemon.
    #[serde(default)]
    pub latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResult {
    pub model: String,
    #[serde(default)]
    pub prompt_messages: Vec<PromptMessage>,
    pub message: PromptMessage,
    #[serde(default)]
    pub usage: LlmUsage,
    #[serde(default)]
    pub system_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResultChunkDelta {
    #[serde(default)]
    pub index: u32,
    pub message: PromptMessage,
    #[serde(default)]
    pub usage: Option<LlmUsage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResultChunk {
    pub model: String,
    #[serde(default)]
    pub prompt_messages: Vec<PromptMessage>,
    #[serde(default)]
    pub system_fingerprint: Option<String>,
    pub delta: LlmResultChunkDelta,
}

/// Everything a completion call needs besides the stream flag.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model_config: LlmModelConfig,
    pub prompt_messages: Vec<PromptMessage>,
    pub tools: Vec<PromptMessageTool>,
    pub stop: Vec<String>,
}

impl LlmRequest {
    pub fn new(model_config: LlmModelConfig, prompt_messages: Vec<PromptMessage>) -> Self {
        Self {
            model_config,
            prompt_messages,
            tools: Vec::new(),
            stop: Vec::new(),
        }
    }

    /// Flattened request body: the model config fields plus messages, tools,
    /// stop words and the stream flag.
    fn to_payload(&self, stream: bool) -> Result<Value> {
        let mut body: Map<String, Value> = match serde_json::to_value(&self.model_config)
            .map_err(InvokeError::Encode)?
        {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.insert(
            "prompt_messages".into(),
            serde_json::to_value(&self.prompt_messages).map_err(InvokeError::Encode)?,
        );
        let tools = if self.tools.is_empty() {
            Value::Null
        } else {
            serde_json::to_value(&self.tools).map_err(InvokeError::Encode)?
        };
        body.insert("tools".into(), tools);
        let stop = if self.stop.is_empty() {
            Value::Null
        } else {
            Value::from(self.stop.clone())
        };
        body.insert("stop".into(), stop);
        body.insert("stream".into(), Value::Bool(stream));
        Ok(Value::Object(body))
    }
}

// -----------------------------------------------------------------------------
// Invocation
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub struct LlmInvocation {
    inner: BackwardsInvocation,
    timing: TimingContext,
}

impl LlmInvocation {
    pub fn new(session: Session, session_id: Option<String>) -> Self {
        Self::with_invocation(BackwardsInvocation::new(session, session_id))
    }

    /// Over an existing invocation, duplex or serverless.
    pub fn with_invocation(inner: BackwardsInvocation) -> Self {
        Self {
            inner,
            timing: TimingContext::new(),
        }
    }

    pub fn timing(&self) -> &TimingContext {
        &self.timing
    }

    /// Stream result chunks. The timed section lasts until the stream ends
    /// or is dropped.
    pub fn invoke_stream(&self, request: &LlmRequest) -> Result<TimedStream<LlmResultChunk>> {
        let guard = self.timing.enter()?;
        let payload = request.to_payload(true)?;
        let inner = self.inner.invoke::<LlmResultChunk>(InvokeType::Llm, payload)?;
        Ok(TimedStream {
            inner,
            guard: Some(guard),
        })
    }

    /// Single, non-streamed completion.
    pub async fn invoke(&self, request: &LlmRequest) -> Result<LlmResult> {
        let guard = self.timing.enter()?;
        let payload = request.to_payload(false)?;
        let result = self
            .inner
            .invoke_single::<LlmResult>(InvokeType::Llm, payload)
            .await;
        let elapsed = guard.finish();
        debug!(elapsed_ms = elapsed.as_millis() as u64, model = %request.model_config.model, "llm invocation finished");
        result?.ok_or(InvokeError::NoResponse { kind: InvokeType::Llm })
    }
}

/// An [`InvocationStream`] holding the owner's timing guard until it ends.
#[derive(Debug)]
pub struct TimedStream<T> {
    inner: InvocationStream<T>,
    guard: Option<TimingGuard>,
}

impl<T: serde::de::DeserializeOwned> TimedStream<T> {
    pub fn request_id(&self) -> &str {
        self.inner.request_id()
    }

    pub async fn next(&mut self) -> Option<Result<T>> {
        let item = self.inner.next().await;
        if matches!(item, None | Some(Err(_))) {
            self.stop_timer();
        }
        item
    }

    /// Time spent so far; stays fixed once the stream has ended.
    pub fn elapsed(&self) -> Option<Duration> {
        self.guard.as_ref().map(TimingGuard::elapsed)
    }

    fn stop_timer(&mut self) {
        if let Some(guard) = self.guard.take() {
            let elapsed = guard.finish();
            debug!(request_id = %self.inner.request_id(), elapsed_ms = elapsed.as_millis() as u64, "timed stream finished");
        }
    }
}
