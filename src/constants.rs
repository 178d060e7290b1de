/// OpenRouter API endpoints
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Google Generative Language API endpoints
pub const GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const GOOGLE_API_KEY_HEADER: &str = "x-goog-api-key";

/// Generation info lookup: the record can lag behind the end of the stream.
pub const GENERATION_INFO_MAX_ATTEMPTS: u32 = 3;
pub const GENERATION_INFO_RETRY_DELAY_MS: u64 = 500;

/// Upper bound on tool-call round trips inside one user turn.
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 8;

/// Session titles are cut from the first prompt of a conversation.
pub const SESSION_TITLE_MAX_CHARS: usize = 50;

pub const DEFAULT_ERROR_HEADER: &str = "**Error**";

pub const TOOL_RESULT_PREFIX: &str = "[TOOL_RESULT for";

/// Gemini dynamic thinking budget.
pub const DEFAULT_THINKING_BUDGET: i32 = -1;

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];

/// Longest provider error body echoed back into the transcript.
pub const MAX_ERROR_BODY_CHARS: usize = 500;
