use crate::constants::{
    DEFAULT_THINKING_BUDGET, GOOGLE_API_KEY_HEADER, GOOGLE_BASE_URL, MAX_ERROR_BODY_CHARS,
    OPENROUTER_BASE_URL,
};
use crate::specs::google::*;
use crate::specs::openai::*;
use crate::streaming::{GoogleStreamDecoder, SseDecoder, StreamDecoder};
use crate::tool_schema::{google_tools, openrouter_tools, ToolDefinition};
use crate::types::*;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenRouter,
    Google,
}

impl ProviderKind {
    /// Bare Gemini ids (`gemini-2.5-pro`) go straight to Google; anything
    /// namespaced (`google/gemini-2.5-pro`, `openai/gpt-4o`) is routed through
    /// OpenRouter.
    pub fn from_model_name(model: &str) -> Self {
        let model = model.trim().to_ascii_lowercase();
        let bare = model.strip_prefix("models/").unwrap_or(&model);
        if !bare.contains('/') && (bare.starts_with("gemini") || bare.starts_with("gemma")) {
            Self::Google
        } else {
            Self::OpenRouter
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::Google => "google",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::Google => "GOOGLE_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openrouter" => Ok(Self::OpenRouter),
            "google" | "gemini" => Ok(Self::Google),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Base URLs, overridable so tests can point at a local mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub openrouter: String,
    pub google: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            openrouter: OPENROUTER_BASE_URL.to_string(),
            google: GOOGLE_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    /// Sent only when > 0.
    pub top_k: u32,
    /// Sent only when > 0.
    pub max_tokens: u32,
    pub thinking_budget: i32,
    pub include_thoughts: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            max_tokens: 0,
            thinking_budget: DEFAULT_THINKING_BUDGET,
            include_thoughts: true,
        }
    }
}

impl SamplingConfig {
    fn top_k(&self) -> Option<u32> {
        (self.top_k > 0).then_some(self.top_k)
    }

    fn max_tokens(&self) -> Option<u32> {
        (self.max_tokens > 0).then_some(self.max_tokens)
    }
}

/// Everything an adapter needs to shape one outbound request.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub system_prompt: Option<&'a str>,
    pub sampling: &'a SamplingConfig,
    pub tools: &'a [ToolDefinition],
    pub stream: bool,
}

impl ChatRequest<'_> {
    fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.filter(|p| !p.trim().is_empty())
    }
}

/// A finished single-shot response.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResponse {
    pub message: Message,
    pub generation_id: Option<String>,
}

pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn endpoint(&self, endpoints: &Endpoints, model: &str, stream: bool) -> String;

    fn authorize(&self, request: RequestBuilder, api_key: &str) -> RequestBuilder;

    fn build_payload(&self, request: &ChatRequest<'_>) -> Result<serde_json::Value>;

    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse>;

    /// Human-readable error for a non-2xx response.
    fn parse_error(&self, status: StatusCode, body: &str) -> String {
        let from_body = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                // Gemini streaming errors arrive wrapped in an array.
                let v = match v {
                    serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
                    other => other,
                };
                v.get("error")?
                    .get("message")?
                    .as_str()
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
            });
        if let Some(message) = from_body {
            return message;
        }
        if let Some(reason) = status.canonical_reason() {
            return reason.to_string();
        }
        body.chars().take(MAX_ERROR_BODY_CHARS).collect()
    }
}

/// --- OPENROUTER ---

pub struct OpenRouterAdapter;

impl OpenRouterAdapter {
    fn project_message(msg: &Message) -> OpenAiMessage {
        let tool_calls = msg
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|tc| OpenAiToolCall {
                id: tc.id.clone(),
                r#type: tc.r#type.clone(),
                function: OpenAiFunctionCall {
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                },
            })
            .collect();
        OpenAiMessage {
            role: msg.role,
            content: msg.wire_content(),
            tool_calls,
        }
    }

    pub fn project(request: &ChatRequest<'_>) -> OpenAiRequest {
        tracing::debug!("[⚙️  -> ⚙️ ] Projecting turn for OpenRouter model: {}", request.model);
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system_prompt() {
            messages.push(OpenAiMessage {
                role: Role::System,
                content: system.to_string(),
                tool_calls: Vec::new(),
            });
        }
        messages.extend(request.messages.iter().map(Self::project_message));

        OpenAiRequest {
            model: request.model.to_string(),
            messages,
            stream: request.stream,
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            top_k: request.sampling.top_k(),
            max_tokens: request.sampling.max_tokens(),
            tools: openrouter_tools(request.tools),
        }
    }
}

impl ProviderAdapter for OpenRouterAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
    }

    fn endpoint(&self, endpoints: &Endpoints, _model: &str, _stream: bool) -> String {
        format!("{}/chat/completions", endpoints.openrouter.trim_end_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder, api_key: &str) -> RequestBuilder {
        request.bearer_auth(api_key)
    }

    fn build_payload(&self, request: &ChatRequest<'_>) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(Self::project(request))?)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(SseDecoder::new())
    }

    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse> {
        let completion: OpenAiCompletion = serde_json::from_slice(body)?;
        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(ColloquyError::Protocol("completion carried no choices".into()).into());
        };

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall::function(tc.id, tc.function.name, tc.function.arguments))
            .collect();

        let message = if tool_calls.is_empty() {
            Message::assistant(choice.message.content.unwrap_or_default())
        } else {
            Message::assistant_tool_calls(tool_calls)
        };

        Ok(DecodedResponse {
            message,
            generation_id: completion.id.filter(|id| !id.is_empty()),
        })
    }
}

/// --- GOOGLE ---

pub struct GoogleAdapter;

impl GoogleAdapter {
    pub fn project(request: &ChatRequest<'_>) -> GoogleRequest {
        tracing::debug!("[⚙️  -> ⚙️ ] Projecting turn for Gemini model: {}", request.model);
        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .filter(|m| m.content.is_some() || m.hidden_content.is_some())
            .map(|m| GoogleContent {
                role: match m.role {
                    Role::Assistant => "model".to_string(),
                    _ => "user".to_string(),
                },
                parts: vec![GoogleTextPart {
                    text: m.wire_content(),
                }],
            })
            .collect();

        let system_instruction = request.system_prompt().map(|p| GoogleSystemInstruction {
            parts: vec![GoogleTextPart { text: p.to_string() }],
        });

        GoogleRequest {
            contents,
            system_instruction,
            generation_config: GoogleGenerationConfig {
                temperature: request.sampling.temperature,
                top_p: request.sampling.top_p,
                top_k: request.sampling.top_k(),
                max_output_tokens: request.sampling.max_tokens(),
                thinking_config: GoogleThinkingConfig {
                    thinking_budget: request.sampling.thinking_budget,
                    include_thoughts: request.sampling.include_thoughts,
                },
            },
            tools: google_tools(request.tools),
        }
    }
}

impl ProviderAdapter for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn endpoint(&self, endpoints: &Endpoints, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/models/{}:{}",
            endpoints.google.trim_end_matches('/'),
            model,
            method
        )
    }

    fn authorize(&self, request: RequestBuilder, api_key: &str) -> RequestBuilder {
        request.header(GOOGLE_API_KEY_HEADER, api_key)
    }

    fn build_payload(&self, request: &ChatRequest<'_>) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(Self::project(request))?)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GoogleStreamDecoder::new())
    }

    fn decode_response(&self, body: &[u8]) -> Result<DecodedResponse> {
        let response: GoogleResponse = serde_json::from_slice(body)?;

        let Some(candidate) = response.candidates.into_iter().next() else {
            let reason = response
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "UNKNOWN".to_string());
            tracing::warn!("[☁️  -> ⚙️ ] Gemini returned no candidates (block reason: {})", reason);
            return Ok(DecodedResponse {
                message: Message::assistant(format!(
                    "The response was blocked by the provider. Reason: {}",
                    reason
                )),
                generation_id: None,
            });
        };

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                let arguments = serde_json::to_string(&call.args)?;
                tool_calls.push(ToolCall::function(ToolCallId::new().0, call.name, arguments));
                break;
            }
            if let Some(t) = part.text {
                if part.thought {
                    reasoning.push_str(&t);
                } else {
                    text.push_str(&t);
                }
            }
        }

        let mut message = if tool_calls.is_empty() {
            Message::assistant(text)
        } else {
            let mut msg = Message::assistant_tool_calls(tool_calls);
            msg.content = (!text.is_empty()).then_some(text);
            msg
        };
        message.reasoning = (!reasoning.is_empty()).then_some(reasoning);
        message.generation_info = response.usage_metadata.map(GenerationInfo::from);

        Ok(DecodedResponse {
            message,
            generation_id: None,
        })
    }
}

/// --- REGISTRY ---

#[derive(Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(OpenRouterAdapter));
        registry.register(Arc::new(GoogleAdapter));
        registry
    }
}
