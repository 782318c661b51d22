//! Abstract provider contract (§6)
//!
//! TAKT never talks to a model API directly. A provider implements
//! [`Provider`] to turn a persona spec into an [`AgentRunner`]; the engine
//! only ever calls `run`/`interrupt` against the runner it gets back.
//! Concrete adapters (Anthropic, etc.) are out of scope here — this module
//! is the seam, plus a mock used across the engine's own test suite.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::PermissionMode;
use crate::response::Response;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call failed: {0}")]
    CallFailed(String),

    #[error("provider call timed out after {0}ms")]
    Timeout(u64),

    #[error("provider call was cancelled")]
    Cancelled,

    #[error("malformed provider output: {0}")]
    MalformedOutput(String),
}

/// What an `AgentRunner` is told about its persona before the first call.
#[derive(Debug, Clone, Default)]
pub struct PersonaSpec {
    pub persona_text: String,
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum McpServerSpec {
    Stdio { command: String, args: Vec<String> },
    Sse { url: String },
    Http { url: String },
}

/// Per-call execution constraints, threaded straight from the movement's
/// resolved permission mode and allowed-tools set.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub cwd: std::path::PathBuf,
    pub allowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub mcp_servers: HashMap<String, McpServerSpec>,
    pub session_id: Option<String>,
    pub abort_signal: CancellationToken,
    pub output_schema: Option<Value>,
}

impl CallOptions {
    pub fn new(cwd: std::path::PathBuf, permission_mode: PermissionMode) -> Self {
        Self {
            cwd,
            allowed_tools: Vec::new(),
            permission_mode,
            mcp_servers: HashMap::new(),
            session_id: None,
            abort_signal: CancellationToken::new(),
            output_schema: None,
        }
    }

    pub fn with_abort(mut self, abort_signal: CancellationToken) -> Self {
        self.abort_signal = abort_signal;
        self
    }

    pub fn with_allowed_tools(mut self, allowed_tools: Vec<String>) -> Self {
        self.allowed_tools = allowed_tools;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_output_schema(mut self, output_schema: Option<Value>) -> Self {
        self.output_schema = output_schema;
        self
    }
}

/// A live, persona-bound handle a provider hands back from `setup`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, prompt: &str, options: CallOptions) -> Result<Response, ProviderError>;

    /// Best-effort cancel of an in-flight or session-resumed call.
    async fn interrupt(&self, session_id: &str) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn setup(&self, persona: PersonaSpec) -> Result<Arc<dyn AgentRunner>, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockTurn {
    pub content: String,
    pub status: crate::response::ResponseStatus,
    #[serde(default)]
    pub structured_output: Option<Value>,
}

/// Deterministic in-memory provider for engine tests: a canned queue of
/// responses, served in order, one per `run` call.
pub struct MockAgentRunner {
    responses: std::sync::Mutex<std::collections::VecDeque<MockTurn>>,
    call_count: std::sync::atomic::AtomicUsize,
}

impl MockAgentRunner {
    pub fn new(responses: Vec<MockTurn>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().collect()),
            call_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRunner for MockAgentRunner {
    async fn run(&self, _prompt: &str, _options: CallOptions) -> Result<Response, ProviderError> {
        self.call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let turn = self
            .responses
            .lock()
            .expect("mock response queue lock poisoned")
            .pop_front()
            .ok_or_else(|| ProviderError::CallFailed("no more mock responses queued".into()))?;

        let mut response = Response {
            content: turn.content,
            status: turn.status,
            structured_output: turn.structured_output,
            session_id: None,
            timestamp: "1970-01-01T00:00:00Z".to_string(),
        };
        if response.is_error() && response.content.is_empty() {
            response.content = "mock provider error".to_string();
        }
        Ok(response)
    }

    async fn interrupt(&self, _session_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// `setup` is called once per agent invocation in the real engine, not once
/// per run — so the runner handed back has to be the same shared instance
/// every time, or a multi-call movement would see its queue emptied after
/// the first call. All `setup` calls are handed clones of the one `Arc`.
pub struct MockProvider {
    runner: Arc<MockAgentRunner>,
}

impl MockProvider {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            runner: Arc::new(MockAgentRunner::new(turns)),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn setup(&self, _persona: PersonaSpec) -> Result<Arc<dyn AgentRunner>, ProviderError> {
        Ok(Arc::clone(&self.runner) as Arc<dyn AgentRunner>)
    }
}
