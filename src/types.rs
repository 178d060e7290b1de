use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ToolCallId(pub String);

impl ToolCallId {
    pub fn new() -> Self {
        Self(format!("call_{}", Uuid::new_v4().simple()))
    }
}

impl Default for ToolCallId {
    fn default() -> Self {
        Self::new()
    }
}

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// --- TRANSCRIPT ---

/// Authoritative token/cost accounting for one completion.
///
/// Field names follow OpenRouter's `/generation` payload so the record can be
/// deserialized straight from `data`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct GenerationInfo {
    #[serde(default)]
    pub tokens_prompt: u64,
    #[serde(default)]
    pub tokens_completion: u64,
    #[serde(default)]
    pub total_cost: f64,
}

impl GenerationInfo {
    pub fn total_tokens(&self) -> u64 {
        self.tokens_prompt + self.tokens_completion
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DiffStats {
    pub added: u32,
    pub removed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text, exactly as the model produced it.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub r#type: String, // Always "function"
    pub function: FunctionCall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_stats: Option<DiffStats>,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            r#type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
            status: None,
            diff_stats: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachedItemKind {
    File,
    Folder,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachedItem {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttachedItemKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    /// Sent to the model in front of `content`, never rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_info: Option<GenerationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_files: Option<Vec<AttachedItem>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            hidden_content: None,
            tool_calls: None,
            reasoning: None,
            generation_info: None,
            attached_files: None,
            hidden: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// Assistant turn that only carries tool calls.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, None);
        msg.tool_calls = Some(tool_calls);
        msg
    }

    /// A user-role message kept in history but excluded from rendering.
    pub fn hidden_user(content: impl Into<String>) -> Self {
        let mut msg = Self::user(content);
        msg.hidden = true;
        msg
    }

    /// Text actually transmitted to a provider: hidden context first.
    pub fn wire_content(&self) -> String {
        let mut text = String::new();
        if let Some(hidden) = &self.hidden_content {
            text.push_str(hidden);
        }
        if let Some(content) = &self.content {
            text.push_str(content);
        }
        text
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

/// --- SESSIONS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub title: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl Session {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: chrono::Utc::now(),
            messages: Vec::new(),
            total_tokens: None,
            total_cost: None,
        }
    }

    pub fn header(&self) -> SessionHeader {
        SessionHeader {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
        }
    }

    /// Sums usage over every message that carries `generation_info`.
    ///
    /// Messages without usage (cancelled turns, user turns) contribute zero; a
    /// session where no message carries usage has no totals at all.
    pub fn recompute_totals(&mut self) {
        let mut tokens = 0u64;
        let mut cost = 0f64;
        let mut seen = false;
        for info in self.messages.iter().filter_map(|m| m.generation_info.as_ref()) {
            seen = true;
            tokens += info.total_tokens();
            cost += info.total_cost;
        }
        if seen {
            self.total_tokens = Some(tokens);
            self.total_cost = Some(cost);
        } else {
            self.total_tokens = None;
            self.total_cost = None;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub id: String,
    pub title: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Sessions live per project and per profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionScope {
    pub project: String,
    pub profile: String,
}

impl SessionScope {
    pub fn new(project: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            profile: profile.into(),
        }
    }
}

/// --- STREAMING HUB (Micro Representation) ---

/// One incremental fragment of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Reasoning(String),
    ToolCall(ToolCall),
    Usage(GenerationInfo),
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum ColloquyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("API key for {0} is not set")]
    MissingApiKey(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No active chat session")]
    NoActiveSession,

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ColloquyError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ColloquyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
