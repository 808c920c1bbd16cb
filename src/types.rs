//! 数据类型定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hook 事件类型
///
/// 字符串形式与 Claude Code 的 `hook_event_name` 保持一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    /// 工具开始 (begin)
    PreToolUse,
    /// 工具结束 (end)
    PostToolUse,
    SubagentStop,
    PreCompact,
    Notification,
    Stop,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::SessionStart,
        EventKind::SessionEnd,
        EventKind::UserPromptSubmit,
        EventKind::PreToolUse,
        EventKind::PostToolUse,
        EventKind::SubagentStop,
        EventKind::PreCompact,
        EventKind::Notification,
        EventKind::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "SessionStart",
            EventKind::SessionEnd => "SessionEnd",
            EventKind::UserPromptSubmit => "UserPromptSubmit",
            EventKind::PreToolUse => "PreToolUse",
            EventKind::PostToolUse => "PostToolUse",
            EventKind::SubagentStop => "SubagentStop",
            EventKind::PreCompact => "PreCompact",
            EventKind::Notification => "Notification",
            EventKind::Stop => "Stop",
        }
    }

    /// 该事件是否触发 transcript 增量入库
    pub fn triggers_ingest(&self) -> bool {
        matches!(
            self,
            EventKind::UserPromptSubmit
                | EventKind::PostToolUse
                | EventKind::Stop
                | EventKind::SessionEnd
        )
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Invalid event kind: {}", s))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// 工具调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    /// 已记录 begin，尚未匹配 end
    Pending,
    /// 已匹配 end（或无头 end）
    Completed,
}

/// Git 文件变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "added" => Ok(ChangeType::Added),
            "modified" => Ok(ChangeType::Modified),
            "deleted" => Ok(ChangeType::Deleted),
            _ => Err(format!("Invalid change type: {}", s)),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Added => write!(f, "added"),
            ChangeType::Modified => write!(f, "modified"),
            ChangeType::Deleted => write!(f, "deleted"),
        }
    }
}

/// 会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub claude_session_id: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub cwd: Option<String>,
    pub project_name: Option<String>,
    pub model: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    // transcript 增量游标
    pub transcript_offset: i64,
    pub transcript_lines: i64,
    pub transcript_file_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Hook 事件记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub session_id: String,
    pub event_kind: String,
    pub occurred_at: i64,
    pub raw_json: String,
    pub claude_session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: Option<String>,
}

/// 工具调用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: i64,
    pub event_id: i64,
    pub session_id: String,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub tool_input_json: Option<String>,
    pub tool_result: Option<String>,
    pub was_blocked: bool,
    pub block_reason: Option<String>,
}

impl ToolInvocation {
    pub fn state(&self) -> InvocationState {
        if self.completed_at.is_some() {
            InvocationState::Completed
        } else {
            InvocationState::Pending
        }
    }

    /// 无头行：end 没有匹配到 begin
    pub fn is_headless(&self) -> bool {
        self.completed_at.is_some() && self.started_at.is_none()
    }
}

/// 消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub message_uuid: Option<String>,
    pub parent_uuid: Option<String>,
    pub role: Role,
    pub content: Option<String>,
    pub content_blocks_json: Option<String>,
    pub thinking_content: Option<String>,
    pub model: Option<String>,
    pub timestamp: Option<i64>,
    pub trigger_event_id: Option<i64>,
}

/// Token 用量记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: i64,
    pub session_id: String,
    pub message_uuid: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub service_tier: Option<String>,
    pub estimated_cost_usd: Option<f64>,
}

/// Git 文件变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitChange {
    pub id: i64,
    pub session_id: String,
    pub file_path: String,
    pub change_type: ChangeType,
    pub lines_added: i64,
    pub lines_deleted: i64,
    pub diff_text: Option<String>,
    pub recorded_at: i64,
}

/// 统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub session_count: i64,
    pub event_count: i64,
    pub invocation_count: i64,
    pub pending_invocation_count: i64,
    pub message_count: i64,
    pub token_usage_count: i64,
}
