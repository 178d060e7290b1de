use serde::{Deserialize, Serialize};

/// --- GEMINI generateContent / streamGenerateContent SCHEMA ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleRequest {
    pub contents: Vec<GoogleContent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GoogleSystemInstruction>,

    #[serde(rename = "generationConfig")]
    pub generation_config: GoogleGenerationConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GoogleToolset>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleContent {
    pub role: String, // "user" | "model"
    pub parts: Vec<GoogleTextPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleTextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleSystemInstruction {
    pub parts: Vec<GoogleTextPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleGenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    pub thinking_config: GoogleThinkingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleThinkingConfig {
    pub thinking_budget: i32,
    pub include_thoughts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleToolset {
    pub function_declarations: Vec<serde_json::Value>,
}

/// --- RESPONSES (streamed objects share this shape) ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleResponse {
    #[serde(default)]
    pub candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<GoogleUsage>,
    #[serde(default)]
    pub prompt_feedback: Option<GooglePromptFeedback>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCandidate {
    #[serde(default)]
    pub content: Option<GoogleCandidateContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleCandidateContent {
    #[serde(default)]
    pub parts: Vec<GooglePart>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GooglePart {
    #[serde(default)]
    pub text: Option<String>,
    /// Set on parts that belong to the model's thinking trace.
    #[serde(default)]
    pub thought: bool,
    #[serde(default)]
    pub function_call: Option<GoogleFunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleFunctionCall {
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: serde_json::Value,
}

fn empty_args() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleUsage {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

impl From<GoogleUsage> for crate::types::GenerationInfo {
    fn from(usage: GoogleUsage) -> Self {
        Self {
            tokens_prompt: usage.prompt_token_count,
            tokens_completion: usage.candidates_token_count,
            total_cost: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GooglePromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleErrorBody {
    pub error: GoogleErrorDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleErrorDetails {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}
