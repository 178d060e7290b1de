use crate::tool_schema::{self, READ_FILE};
use crate::types::{AttachedItem, AttachedItemKind, DiffStats, Result, ToolCall};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

/// Result of executing one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub succeeded: bool,
    pub content: String,
    pub diff_stats: Option<DiffStats>,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            content: content.into(),
            diff_stats: None,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            content: content.into(),
            diff_stats: None,
        }
    }

    pub fn with_diff_stats(mut self, stats: DiffStats) -> Self {
        self.diff_stats = Some(stats);
        self
    }
}

/// Executes the tools a model asks for. The engine only sees the outcome.
#[async_trait]
pub trait ToolCallDispatcher: Send + Sync {
    async fn dispatch(&self, call: &ToolCall) -> ToolOutcome;
}

/// Refuses everything. Used when no tools are advertised.
pub struct NoTools;

#[async_trait]
impl ToolCallDispatcher for NoTools {
    async fn dispatch(&self, call: &ToolCall) -> ToolOutcome {
        ToolOutcome::failure(format!(
            "Error: Tool '{}' not found or failed to execute.",
            call.function.name
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    file_path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
}

/// Read-only access to one project directory, for the command-line host.
pub struct ProjectReader {
    root: PathBuf,
}

impl ProjectReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Joins a model-supplied relative path onto the root, refusing anything
    /// that could climb out of it.
    fn resolve(&self, rel: &str) -> Option<PathBuf> {
        let rel = Path::new(rel);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        safe.then(|| self.root.join(rel))
    }

    /// Reads attached items into the hidden context that rides along with a
    /// prompt. Files are inlined, folders contribute their file listing.
    pub async fn attachment_context(&self, items: &[AttachedItem]) -> Result<Option<String>> {
        if items.is_empty() {
            return Ok(None);
        }
        let mut sections = Vec::with_capacity(items.len());
        for item in items {
            let path = self.resolve(&item.id).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("attachment '{}' is outside the project", item.id),
                )
            })?;
            let section = match item.kind {
                AttachedItemKind::File => {
                    let content = tokio::fs::read_to_string(&path).await?;
                    format!(
                        "--- START OF FILE {0} ---\n{1}\n--- END OF FILE {0} ---",
                        item.name, content
                    )
                }
                AttachedItemKind::Folder => {
                    let listing = directory_listing(&path).await?;
                    format!(
                        "--- START OF DIRECTORY STRUCTURE FOR {0} ---\n{1}\n--- END OF DIRECTORY STRUCTURE FOR {0} ---",
                        item.name, listing
                    )
                }
                AttachedItemKind::Group => {
                    tracing::warn!("Skipping group attachment {}: groups are not known here", item.name);
                    continue;
                }
            };
            sections.push(section);
        }
        tracing::debug!("Attached {} items as hidden context", sections.len());
        Ok((!sections.is_empty()).then(|| sections.join("\n\n")))
    }

    async fn read_file(&self, args: ReadFileArgs) -> ToolOutcome {
        let Some(path) = self.resolve(&args.file_path) else {
            return ToolOutcome::failure(format!(
                "Error reading file: '{}' is outside the project",
                args.file_path
            ));
        };

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) => return ToolOutcome::failure(format!("Error reading file: {}", e)),
        };

        let start = args.start_line.unwrap_or(1).max(1);
        let body = if args.start_line.is_some() || args.end_line.is_some() {
            let end = args.end_line.unwrap_or(usize::MAX);
            text.lines()
                .enumerate()
                .filter(|(i, _)| (start..=end).contains(&(i + 1)))
                .map(|(_, line)| line)
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            text
        };

        let mut header = format!("Here is the content of {}", args.file_path);
        if let Some(s) = args.start_line {
            header.push_str(&format!(" from line {}", s));
        }
        if let Some(e) = args.end_line {
            header.push_str(&format!(" to line {}", e));
        }
        ToolOutcome::success(format!("{}:\n\n{}", header, body))
    }
}

/// Relative paths under `root`, sorted, directories with a trailing slash.
async fn directory_listing(root: &Path) -> std::io::Result<String> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(path.as_path()).to_string_lossy().replace('\\', "/");
            if entry.file_type().await?.is_dir() {
                entries.push(format!("{}/", rel));
                pending.push(path);
            } else {
                entries.push(rel);
            }
        }
    }
    entries.sort();
    Ok(entries.join("\n"))
}

#[async_trait]
impl ToolCallDispatcher for ProjectReader {
    async fn dispatch(&self, call: &ToolCall) -> ToolOutcome {
        let name = call.function.name.as_str();
        tracing::info!("[⚙️  -> 🔧] Dispatching {} ({})", name, call.id);

        let args: serde_json::Value = match serde_json::from_str(&call.function.arguments) {
            Ok(v) => v,
            Err(e) => return ToolOutcome::failure(format!("Error: invalid arguments for '{}': {}", name, e)),
        };

        if let Some(def) = tool_schema::definition(name) {
            let missing = def.missing_params(&args);
            if !missing.is_empty() {
                return ToolOutcome::failure(format!(
                    "Error: '{}' is missing required arguments: {}",
                    name,
                    missing.join(", ")
                ));
            }
        }

        match name {
            READ_FILE => match serde_json::from_value::<ReadFileArgs>(args) {
                Ok(args) => self.read_file(args).await,
                Err(e) => ToolOutcome::failure(format!("Error: invalid arguments for '{}': {}", name, e)),
            },
            other => ToolOutcome::failure(format!(
                "Error: Tool '{}' is not available in this host.",
                other
            )),
        }
    }
}
