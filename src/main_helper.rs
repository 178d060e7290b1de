use crate::constants::{DEFAULT_ERROR_HEADER, DEFAULT_MAX_TOOL_ROUNDS, DEFAULT_THINKING_BUDGET};
use crate::db::SqliteSessionStore;
use crate::engine::EngineConfig;
use crate::projections::{Endpoints, ProviderKind, SamplingConfig};
use crate::session::{MemorySessionStore, SessionStore};
use crate::tool_schema::ChatMode;
use crate::types::*;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Model id. Bare `gemini-*` ids go to Google, namespaced ids to OpenRouter.
    #[arg(long, default_value = "google/gemini-2.5-flash")]
    pub model: String,
    #[arg(long)]
    pub provider: Option<ProviderKind>,
    #[arg(long, default_value = "colloquy.db")]
    pub database: String,
    /// Keep sessions in memory only.
    #[arg(long, default_value_t = false)]
    pub ephemeral: bool,
    /// Project directory; sessions and `read_file` are scoped to it.
    #[arg(long)]
    pub project: Option<PathBuf>,
    #[arg(long, default_value = "default")]
    pub profile: String,
    /// Resume an existing session.
    #[arg(long)]
    pub session: Option<String>,
    #[arg(long)]
    pub system_prompt: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f32,
    #[arg(long, default_value_t = 1.0)]
    pub top_p: f32,
    #[arg(long, default_value_t = 0)]
    pub top_k: u32,
    #[arg(long, default_value_t = 0)]
    pub max_tokens: u32,
    #[arg(long, default_value_t = DEFAULT_THINKING_BUDGET, allow_negative_numbers = true)]
    pub thinking_budget: i32,
    #[arg(long, default_value_t = false)]
    pub hide_thoughts: bool,
    #[arg(long, default_value_t = ChatMode::Ask)]
    pub mode: ChatMode,
    #[arg(long)]
    pub editing_group: Option<String>,
    #[arg(long, default_value_t = false)]
    pub no_stream: bool,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_TOOL_ROUNDS)]
    pub max_tool_rounds: u32,
    #[arg(long, default_value = DEFAULT_ERROR_HEADER)]
    pub error_header: String,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
    #[arg(long, default_value_t = false)]
    pub list_sessions: bool,
    /// Rename the session with this id (requires --title).
    #[arg(long, requires = "title")]
    pub rename_session: Option<String>,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub delete_session: Option<String>,
    #[arg(long, default_value_t = false)]
    pub delete_all_sessions: bool,
    /// Project-relative files to attach to the first prompt.
    #[arg(long)]
    pub attach: Vec<String>,
    /// One-shot prompt. Without it, prompts are read from stdin line by line.
    pub prompt: Vec<String>,
}

impl Args {
    pub fn project_root(&self) -> PathBuf {
        match &self.project {
            Some(p) => p.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn scope(&self) -> SessionScope {
        SessionScope::new(self.project_root().to_string_lossy(), self.profile.clone())
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_tokens: self.max_tokens,
            thinking_budget: self.thinking_budget,
            include_thoughts: !self.hide_thoughts,
        }
    }

    pub fn one_shot_prompt(&self) -> Option<String> {
        let prompt = self.prompt.join(" ");
        (!prompt.trim().is_empty()).then_some(prompt)
    }

    /// Attachments are referenced by project-relative path. Directories
    /// attach as folders.
    pub fn attachments(&self) -> Vec<AttachedItem> {
        let root = self.project_root();
        self.attach
            .iter()
            .map(|path| AttachedItem {
                id: path.clone(),
                name: Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone()),
                kind: if root.join(path).is_dir() {
                    AttachedItemKind::Folder
                } else {
                    AttachedItemKind::File
                },
            })
            .collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.model.clone(), self.scope());
        config.provider = self.provider;
        config.openrouter_api_key = api_key_from_env(ProviderKind::OpenRouter);
        config.google_api_key = api_key_from_env(ProviderKind::Google);
        config.system_prompt = self.system_prompt.clone();
        config.sampling = self.sampling();
        config.stream = !self.no_stream;
        config.mode = self.mode;
        config.editing_group = self.editing_group.clone();
        config.error_header = self.error_header.clone();
        config.max_tool_rounds = self.max_tool_rounds;
        config.endpoints = Endpoints::default();
        config
    }
}

fn api_key_from_env(kind: ProviderKind) -> Option<String> {
    match std::env::var(kind.api_key_env()) {
        Ok(k) if !k.trim().is_empty() => Some(k),
        _ => None,
    }
}

pub fn build_client(args: &Args) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()?;
    Ok(client)
}

pub async fn open_store(args: &Args) -> Result<Arc<dyn SessionStore>> {
    if args.ephemeral {
        tracing::info!("Using in-memory session store");
        return Ok(Arc::new(MemorySessionStore::new()));
    }
    let store = SqliteSessionStore::open(&args.database).await?;
    Ok(Arc::new(store))
}
