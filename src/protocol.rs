//! Hook 协议定义
//!
//! 输入：Claude Code 通过 stdin 传入的单个 JSON 对象。
//! 输出：写到 stdout 的单个 JSON 对象。
//!
//! 公共字段放在 [`HookPayload`]，事件专属字段按 [`EventKind`] 解析成 [`EventBody`]。
//! 原始 JSON 始终保留，用于归档和向前兼容。

use crate::types::EventKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 所有事件共有的字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
    /// Claude 的 session_id（外部 token）
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
}

/// SessionStart
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionStartBody {
    /// startup / resume / clear / compact
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// SessionEnd
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionEndBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// UserPromptSubmit
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UserPromptBody {
    #[serde(default, alias = "user_prompt")]
    pub prompt: Option<String>,
}

/// PreToolUse (begin)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolBeginBody {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
}

/// PostToolUse (end)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolEndBody {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_response: Option<Value>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
}

/// SubagentStop
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubagentBody {
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

/// PreCompact
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompactBody {
    /// manual / auto
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub summary_content: Option<Value>,
}

/// Notification
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationBody {
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default, alias = "message")]
    pub notification_content: Option<Value>,
}

/// Stop
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StopBody {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub stop_hook_active: bool,
}

/// 事件专属字段
#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    SessionStart(SessionStartBody),
    SessionEnd(SessionEndBody),
    UserPromptSubmit(UserPromptBody),
    PreToolUse(ToolBeginBody),
    PostToolUse(ToolEndBody),
    SubagentStop(SubagentBody),
    PreCompact(CompactBody),
    Notification(NotificationBody),
    Stop(StopBody),
    /// 字段形状不对：原始事件照常入库，跳过明细提取
    Malformed { reason: String },
}

impl EventBody {
    fn parse(kind: EventKind, value: &Value) -> Self {
        fn body<T: for<'de> Deserialize<'de>>(value: &Value) -> Result<T, serde_json::Error> {
            T::deserialize(value)
        }

        let parsed = match kind {
            EventKind::SessionStart => body(value).map(EventBody::SessionStart),
            EventKind::SessionEnd => body(value).map(EventBody::SessionEnd),
            EventKind::UserPromptSubmit => body(value).map(EventBody::UserPromptSubmit),
            EventKind::PreToolUse => body(value).map(EventBody::PreToolUse),
            EventKind::PostToolUse => body(value).map(EventBody::PostToolUse),
            EventKind::SubagentStop => body(value).map(EventBody::SubagentStop),
            EventKind::PreCompact => body(value).map(EventBody::PreCompact),
            EventKind::Notification => body(value).map(EventBody::Notification),
            EventKind::Stop => body(value).map(EventBody::Stop),
        };

        parsed.unwrap_or_else(|e| EventBody::Malformed {
            reason: e.to_string(),
        })
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, EventBody::Malformed { .. })
    }
}

/// 解析后的 hook 事件
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub kind: EventKind,
    pub payload: HookPayload,
    pub body: EventBody,
    /// 原始输入，原样归档
    pub raw_json: String,
}

impl HookEvent {
    /// 解析 stdin 内容
    ///
    /// 不会失败：无法解析的输入以 [`EventBody::Malformed`] 表示，原文照样保留。
    pub fn parse(kind: EventKind, raw: &str) -> Self {
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v) if v.is_object() => v,
            Ok(_) => {
                return Self::malformed(kind, raw, "payload is not a JSON object".to_string());
            }
            Err(e) => return Self::malformed(kind, raw, e.to_string()),
        };

        let payload = HookPayload::deserialize(&value).unwrap_or_else(|e| {
            tracing::warn!("{} 公共字段格式错误: {}", kind, e);
            HookPayload::default()
        });
        let body = EventBody::parse(kind, &value);
        if let EventBody::Malformed { reason } = &body {
            tracing::warn!("{} 事件字段格式错误，跳过明细提取: {}", kind, reason);
        }

        Self {
            kind,
            payload,
            body,
            raw_json: raw.to_string(),
        }
    }

    fn malformed(kind: EventKind, raw: &str, reason: String) -> Self {
        tracing::warn!("{} payload 无法解析: {}", kind, reason);
        Self {
            kind,
            payload: HookPayload::default(),
            body: EventBody::Malformed { reason },
            raw_json: raw.to_string(),
        }
    }
}

/// 写回 stdout 的响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

/// 事件专属输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpecificOutput {
    pub hook_event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_decision: Option<PermissionDecision>,
}

/// PreToolUse 决策
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
    Ask,
}

impl HookResponse {
    /// 空响应 `{}`
    pub fn empty() -> Self {
        Self::default()
    }

    /// PreToolUse 放行
    pub fn allow() -> Self {
        Self {
            hook_specific_output: Some(HookSpecificOutput {
                hook_event_name: EventKind::PreToolUse.as_str().to_string(),
                permission_decision: Some(PermissionDecision::Allow),
            }),
            system_message: None,
        }
    }

    /// 给用户的提示
    pub fn system_message(message: impl Into<String>) -> Self {
        Self {
            hook_specific_output: None,
            system_message: Some(message.into()),
        }
    }

    /// 各事件的中性响应：PreToolUse 始终放行，其他为空
    pub fn benign(kind: EventKind) -> Self {
        match kind {
            EventKind::PreToolUse => Self::allow(),
            _ => Self::empty(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pre_tool_use() {
        let raw = json!({
            "session_id": "sess-1",
            "transcript_path": "/tmp/t.jsonl",
            "cwd": "/work/app",
            "permission_mode": "default",
            "hook_event_name": "PreToolUse",
            "tool_name": "Read",
            "tool_use_id": "tu_1",
            "tool_input": {"file_path": "/work/app/main.rs"}
        })
        .to_string();

        let event = HookEvent::parse(EventKind::PreToolUse, &raw);
        assert_eq!(event.payload.session_id.as_deref(), Some("sess-1"));
        assert_eq!(event.payload.cwd.as_deref(), Some("/work/app"));
        assert_eq!(event.raw_json, raw);
        match event.body {
            EventBody::PreToolUse(body) => {
                assert_eq!(body.tool_name.as_deref(), Some("Read"));
                assert_eq!(body.tool_use_id.as_deref(), Some("tu_1"));
                assert_eq!(body.tool_input.unwrap()["file_path"], "/work/app/main.rs");
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_parse_aliases() {
        let event = HookEvent::parse(
            EventKind::UserPromptSubmit,
            r#"{"session_id":"s","user_prompt":"hello"}"#,
        );
        assert_eq!(
            event.body,
            EventBody::UserPromptSubmit(UserPromptBody {
                prompt: Some("hello".into())
            })
        );

        let event = HookEvent::parse(
            EventKind::Notification,
            r#"{"notification_type":"idle","message":"waiting"}"#,
        );
        match event.body {
            EventBody::Notification(n) => {
                assert_eq!(n.notification_type.as_deref(), Some("idle"));
                assert_eq!(n.notification_content, Some(json!("waiting")));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_parse_session_start_source() {
        let event = HookEvent::parse(EventKind::SessionStart, r#"{"session_id":"s","source":"resume"}"#);
        match event.body {
            EventBody::SessionStart(b) => assert_eq!(b.source.as_deref(), Some("resume")),
            other => panic!("unexpected body: {:?}", other),
        }
        let event = HookEvent::parse(EventKind::SessionStart, r#"{"session_id":"s"}"#);
        match event.body {
            EventBody::SessionStart(b) => assert!(b.source.is_none()),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_keeps_raw() {
        let event = HookEvent::parse(EventKind::PostToolUse, "{not json");
        assert!(event.body.is_malformed());
        assert_eq!(event.raw_json, "{not json");
        assert_eq!(event.payload, HookPayload::default());

        let event = HookEvent::parse(EventKind::Stop, "[1,2]");
        assert!(event.body.is_malformed());

        // 字段类型错误：公共字段仍可用
        let event = HookEvent::parse(
            EventKind::PreToolUse,
            r#"{"session_id":"s","tool_name":42}"#,
        );
        assert!(event.body.is_malformed());
        assert_eq!(event.payload.session_id.as_deref(), Some("s"));
    }

    #[test]
    fn test_response_json() {
        assert_eq!(HookResponse::empty().to_json(), "{}");
        assert_eq!(
            HookResponse::allow().to_json(),
            r#"{"hookSpecificOutput":{"hookEventName":"PreToolUse","permissionDecision":"allow"}}"#
        );
        assert_eq!(
            HookResponse::system_message("db down").to_json(),
            r#"{"systemMessage":"db down"}"#
        );
        assert_eq!(HookResponse::benign(EventKind::PreToolUse), HookResponse::allow());
        assert_eq!(HookResponse::benign(EventKind::Stop), HookResponse::empty());
    }
}
