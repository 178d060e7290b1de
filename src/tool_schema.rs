//! Tool Manifest Module
//!
//! Provider-neutral tool definitions, the chat-mode filter that decides which
//! of them a request may carry, and the two provider-specific shapes.

use crate::specs::google::GoogleToolset;
use crate::specs::openai::{OpenAiFunctionDefinition, OpenAiTool};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// How much the model is allowed to touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Ask,
    Context,
    Agent,
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ask => write!(f, "ask"),
            Self::Context => write!(f, "context"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ask" => Ok(Self::Ask),
            "context" => Ok(Self::Context),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown chat mode '{}'", other)),
        }
    }
}

/// Metadata about a tool and its JSON-schema parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn required_params(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// Required parameters absent from a parsed argument object.
    pub fn missing_params<'a>(&'a self, args: &Value) -> Vec<&'a str> {
        self.required_params()
            .into_iter()
            .filter(|p| args.get(*p).map_or(true, Value::is_null))
            .collect()
    }
}

pub const GET_PROJECT_FILE_TREE: &str = "get_project_file_tree";
pub const READ_FILE: &str = "read_file";
pub const GET_CURRENT_CONTEXT_GROUP_FILES: &str = "get_current_context_group_files";
pub const MODIFY_CONTEXT_GROUP: &str = "modify_context_group";
pub const ADD_EXCLUSION_RANGE_TO_FILE: &str = "add_exclusion_range_to_file";
pub const WRITE_FILE: &str = "write_file";
pub const CREATE_FILE: &str = "create_file";
pub const DELETE_FILE: &str = "delete_file";

/// Looks a tool up by name.
pub fn definition(name: &str) -> Option<ToolDefinition> {
    let (description, parameters) = match name {
        GET_PROJECT_FILE_TREE => (
            "Get the complete file and directory structure of the current project.",
            json!({ "type": "object", "properties": {} }),
        ),
        READ_FILE => (
            "Read the contents of a project file, either whole or a specific line range.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path relative to the project root." },
                    "start_line": { "type": "number", "description": "Optional. First line to read (1-based)." },
                    "end_line": { "type": "number", "description": "Optional. Last line to read (1-based)." }
                },
                "required": ["file_path"]
            }),
        ),
        GET_CURRENT_CONTEXT_GROUP_FILES => (
            "List every file currently in the context group the user is editing.",
            json!({ "type": "object", "properties": {}, "required": [] }),
        ),
        MODIFY_CONTEXT_GROUP => (
            "Add files and folders to, or remove them from, the selected context group.",
            json!({
                "type": "object",
                "properties": {
                    "files_to_add": {
                        "type": "array",
                        "description": "Project-relative file or folder paths to add to the group.",
                        "items": { "type": "string" }
                    },
                    "files_to_remove": {
                        "type": "array",
                        "description": "Project-relative file or folder paths to remove from the group.",
                        "items": { "type": "string" }
                    }
                }
            }),
        ),
        ADD_EXCLUSION_RANGE_TO_FILE => (
            "Exclude a line range of a file from the context.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path relative to the project root." },
                    "start_line": { "type": "number", "description": "First excluded line (1-based)." },
                    "end_line": { "type": "number", "description": "Last excluded line (1-based)." }
                },
                "required": ["file_path", "start_line", "end_line"]
            }),
        ),
        WRITE_FILE => (
            "Write or overwrite file content. Replaces the whole file, or only the range \
             start_line..end_line when start_line is given. Set end_line equal to start_line \
             to insert; pass empty content with both lines to delete.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path relative to the project root." },
                    "content": { "type": "string", "description": "New content to write." },
                    "start_line": { "type": "number", "description": "Optional. First replaced line (1-based)." },
                    "end_line": { "type": "number", "description": "Optional. Last replaced line (1-based)." }
                },
                "required": ["file_path", "content"]
            }),
        ),
        CREATE_FILE => (
            "Create a new file at the given path with optional initial content.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path relative to the project root." },
                    "content": { "type": "string", "description": "Optional. Initial file content." }
                },
                "required": ["file_path"]
            }),
        ),
        DELETE_FILE => (
            "Delete a file from the project.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Path relative to the project root." }
                },
                "required": ["file_path"]
            }),
        ),
        _ => return None,
    };

    let name = ALL_TOOLS.iter().copied().find(|n| *n == name)?;
    Some(ToolDefinition {
        name,
        description,
        parameters,
    })
}

const ALL_TOOLS: &[&str] = &[
    GET_PROJECT_FILE_TREE,
    READ_FILE,
    GET_CURRENT_CONTEXT_GROUP_FILES,
    MODIFY_CONTEXT_GROUP,
    ADD_EXCLUSION_RANGE_TO_FILE,
    WRITE_FILE,
    CREATE_FILE,
    DELETE_FILE,
];

/// Tools a request may carry in `mode`. Empty in ask mode.
pub fn available_tools(mode: ChatMode, editing_group: Option<&str>) -> Vec<ToolDefinition> {
    if mode == ChatMode::Ask {
        return Vec::new();
    }

    let mut names = vec![GET_PROJECT_FILE_TREE, READ_FILE];

    if editing_group.is_some() {
        names.push(GET_CURRENT_CONTEXT_GROUP_FILES);
        if mode == ChatMode::Context {
            names.push(MODIFY_CONTEXT_GROUP);
            names.push(ADD_EXCLUSION_RANGE_TO_FILE);
        }
    }

    if mode == ChatMode::Agent {
        names.extend([
            WRITE_FILE,
            CREATE_FILE,
            DELETE_FILE,
            MODIFY_CONTEXT_GROUP,
            ADD_EXCLUSION_RANGE_TO_FILE,
        ]);
    }

    let mut seen = Vec::with_capacity(names.len());
    for name in names {
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen.into_iter().filter_map(definition).collect()
}

pub fn openrouter_tools(tools: &[ToolDefinition]) -> Option<Vec<OpenAiTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| OpenAiTool {
                r#type: "function".to_string(),
                function: OpenAiFunctionDefinition {
                    name: tool.name.to_string(),
                    description: Some(tool.description.to_string()),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect(),
    )
}

pub fn google_tools(tools: &[ToolDefinition]) -> Option<Vec<GoogleToolset>> {
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .iter()
        .map(|tool| {
            uppercase_types(json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }))
        })
        .collect();
    Some(vec![GoogleToolset {
        function_declarations: declarations,
    }])
}

/// Gemini's schema dialect spells JSON types in upper case.
fn uppercase_types(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(uppercase_types).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, v)| match v {
                    Value::String(s) if key == "type" => (key, Value::String(s.to_uppercase())),
                    other => (key, uppercase_types(other)),
                })
                .collect(),
        ),
        other => other,
    }
}
