//! Tool catalog and the tool-call input type.
//!
//! [`ToolKind`] names every tool the agent runtime may ask for. The mapping
//! from tool to sandbox operation is an exhaustive `match`, so adding a tool
//! without deciding how it is dispatched fails to compile.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Every tool the agent runtime is known to expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolKind {
    Read,
    Write,
    Edit,
    Bash,
    Glob,
    Grep,
    Search,
    Task,
    TaskOutput,
    WebFetch,
    WebSearch,
    NotebookEdit,
    TodoWrite,
    AskUserQuestion,
    Skill,
    SlashCommand,
    EnterPlanMode,
    ExitPlanMode,
    KillShell,
}

/// Sandbox operation a tool is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOperation {
    ExecuteCommand,
    ReadFile,
    WriteFile,
    /// Read, replace, write back.
    EditFile,
    /// File listing, run as a `find` command.
    ListFiles,
    SearchFiles,
}

/// How a tool touches the filesystem, for path checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAccess {
    Read,
    Write,
}

impl ToolKind {
    pub const ALL: [ToolKind; 19] = [
        ToolKind::Read,
        ToolKind::Write,
        ToolKind::Edit,
        ToolKind::Bash,
        ToolKind::Glob,
        ToolKind::Grep,
        ToolKind::Search,
        ToolKind::Task,
        ToolKind::TaskOutput,
        ToolKind::WebFetch,
        ToolKind::WebSearch,
        ToolKind::NotebookEdit,
        ToolKind::TodoWrite,
        ToolKind::AskUserQuestion,
        ToolKind::Skill,
        ToolKind::SlashCommand,
        ToolKind::EnterPlanMode,
        ToolKind::ExitPlanMode,
        ToolKind::KillShell,
    ];

    /// Exact (case-sensitive) lookup by the runtime's tool name.
    pub fn from_name(name: &str) -> Option<ToolKind> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Edit => "Edit",
            Self::Bash => "Bash",
            Self::Glob => "Glob",
            Self::Grep => "Grep",
            Self::Search => "Search",
            Self::Task => "Task",
            Self::TaskOutput => "TaskOutput",
            Self::WebFetch => "WebFetch",
            Self::WebSearch => "WebSearch",
            Self::NotebookEdit => "NotebookEdit",
            Self::TodoWrite => "TodoWrite",
            Self::AskUserQuestion => "AskUserQuestion",
            Self::Skill => "Skill",
            Self::SlashCommand => "SlashCommand",
            Self::EnterPlanMode => "EnterPlanMode",
            Self::ExitPlanMode => "ExitPlanMode",
            Self::KillShell => "KillShell",
        }
    }

    /// The sandbox operation this tool runs as, or `None` when it has no
    /// sandbox counterpart.
    pub fn operation(self) -> Option<ToolOperation> {
        match self {
            Self::Bash => Some(ToolOperation::ExecuteCommand),
            Self::Read => Some(ToolOperation::ReadFile),
            Self::Write => Some(ToolOperation::WriteFile),
            Self::Edit => Some(ToolOperation::EditFile),
            Self::Glob => Some(ToolOperation::ListFiles),
            Self::Grep | Self::Search => Some(ToolOperation::SearchFiles),
            Self::Task
            | Self::TaskOutput
            | Self::WebFetch
            | Self::WebSearch
            | Self::NotebookEdit
            | Self::TodoWrite
            | Self::AskUserQuestion
            | Self::Skill
            | Self::SlashCommand
            | Self::EnterPlanMode
            | Self::ExitPlanMode
            | Self::KillShell => None,
        }
    }

    /// Tools that may change state outside the agent's own bookkeeping.
    pub fn is_high_risk(self) -> bool {
        matches!(
            self,
            Self::Bash | Self::Write | Self::Edit | Self::Task | Self::NotebookEdit
        )
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, Self::Read | Self::Glob | Self::Grep | Self::Search)
    }

    /// Path access this tool performs, if any.
    pub fn path_access(self) -> Option<PathAccess> {
        match self {
            Self::Read | Self::Glob | Self::Grep | Self::Search => Some(PathAccess::Read),
            Self::Write | Self::Edit | Self::NotebookEdit => Some(PathAccess::Write),
            _ => None,
        }
    }

    pub fn touches_files(self) -> bool {
        self.path_access().is_some()
    }

    /// Argument key holding a shell command, for tools that take one.
    pub fn command_field(self) -> Option<&'static str> {
        match self {
            Self::Bash => Some("command"),
            _ => None,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown tool: {s}"))
    }
}

/// Argument keys a file path may arrive under, in lookup order.
pub const PATH_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

/// One tool call: the unit that is validated, executed and audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Identity used for rate limiting and audit attribution.
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

impl ToolInput {
    /// Build a call. Non-object `arguments` are stored under `"input"`.
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self {
            tool_name: tool_name.into(),
            arguments,
            caller_id: None,
            tool_use_id: None,
        }
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_tool_use_id(mut self, id: impl Into<String>) -> Self {
        self.tool_use_id = Some(id.into());
        self
    }

    pub fn kind(&self) -> Option<ToolKind> {
        ToolKind::from_name(&self.tool_name)
    }

    /// Unknown tools count as high-risk.
    pub fn is_high_risk(&self) -> bool {
        self.kind().map_or(true, ToolKind::is_high_risk)
    }

    /// Caller identity, `"default"` when unset.
    pub fn caller(&self) -> &str {
        self.caller_id.as_deref().unwrap_or("default")
    }

    /// First string argument found under any of `keys`.
    pub fn str_arg(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.arguments.get(*k).and_then(Value::as_str))
    }

    /// Shell command carried by this call, if the tool takes one.
    pub fn command(&self) -> Option<&str> {
        let field = self.kind()?.command_field()?;
        self.str_arg(&[field])
    }

    pub fn path(&self) -> Option<&str> {
        self.str_arg(&PATH_KEYS)
    }
}
