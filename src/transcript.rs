//! Transcript 行解析
//!
//! Claude Code 的会话日志是 JSONL，每行一条记录。这里只做纯解析：
//! 一行进，一条 [`TranscriptRecord`] 出（或跳过），不碰数据库。
//!
//! 保留的记录类型：`user` / `assistant` / `system`。
//! 其他类型（progress、summary、file-history-snapshot、queue-operation …）跳过。

use crate::types::Role;
use serde_json::Value;

/// 解析出的消息
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptRecord {
    pub message_uuid: Option<String>,
    pub parent_uuid: Option<String>,
    pub role: Role,
    /// 渲染后的文本
    pub content: Option<String>,
    /// 原始 content block 数组（保持顺序和类型）
    pub content_blocks_json: Option<String>,
    /// thinking 内容：单个为纯文本，多个为 JSON 字符串数组
    pub thinking_content: Option<String>,
    pub model: Option<String>,
    /// 毫秒时间戳
    pub timestamp: Option<i64>,
    pub usage: Option<UsageBlock>,
}

/// assistant 消息上的 usage 块
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageBlock {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_creation_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub service_tier: Option<String>,
}

impl UsageBlock {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object().filter(|o| !o.is_empty())?;
        let int = |key: &str| obj.get(key).and_then(Value::as_i64);
        Some(Self {
            input_tokens: int("input_tokens"),
            output_tokens: int("output_tokens"),
            cache_creation_tokens: int("cache_creation_input_tokens"),
            cache_read_tokens: int("cache_read_input_tokens"),
            service_tier: obj
                .get("service_tier")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// 解析一行 JSONL；空行、非法 JSON、非消息记录返回 `None`
pub fn parse_line(line: &str) -> Option<TranscriptRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("跳过非法 transcript 行: {}", e);
            return None;
        }
    };
    parse_record(&value)
}

/// 解析一条已反序列化的记录
pub fn parse_record(obj: &Value) -> Option<TranscriptRecord> {
    match obj.get("type").and_then(Value::as_str)? {
        "user" => Some(parse_user(obj)),
        "assistant" => parse_assistant(obj),
        "system" => Some(parse_system(obj)),
        _ => None,
    }
}

/// ISO 8601 → 毫秒
pub fn parse_timestamp(ts: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn str_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn timestamp_of(obj: &Value) -> Option<i64> {
    obj.get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

fn parse_user(obj: &Value) -> TranscriptRecord {
    let content = obj.get("message").and_then(|m| m.get("content"));

    let (text, blocks_json) = match content {
        Some(Value::String(s)) => (s.clone(), None),
        Some(Value::Array(items)) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(_) if item.get("type").and_then(Value::as_str) == Some("text") => {
                        Some(item.get("text").and_then(Value::as_str).unwrap_or(""))
                    }
                    _ => None,
                })
                .collect();
            let raw = Value::Array(items.clone()).to_string();
            let text = if parts.is_empty() {
                // 只有 tool_result 等非文本 block 时保留原始 JSON
                raw.clone()
            } else {
                parts.join("\n")
            };
            let blocks_json = if items.is_empty() { None } else { Some(raw) };
            (text, blocks_json)
        }
        Some(Value::Null) | None => (String::new(), None),
        Some(other) => (other.to_string(), None),
    };

    TranscriptRecord {
        message_uuid: str_field(obj, "uuid"),
        parent_uuid: str_field(obj, "parentUuid"),
        role: Role::User,
        content: Some(text),
        content_blocks_json: blocks_json,
        thinking_content: None,
        model: None,
        timestamp: timestamp_of(obj),
        usage: None,
    }
}

fn parse_assistant(obj: &Value) -> Option<TranscriptRecord> {
    let message = obj.get("message");
    let blocks: &[Value] = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_uses = 0usize;

    for block in blocks.iter().filter(|b| b.is_object()) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                text_parts.push(block.get("text").and_then(Value::as_str).unwrap_or(""));
            }
            Some("thinking") => {
                thinking_parts.push(block.get("thinking").and_then(Value::as_str).unwrap_or(""));
            }
            Some("tool_use") => tool_uses += 1,
            _ => {}
        }
    }

    // 纯文本形式的 content
    let plain = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    if let Some(s) = plain {
        text_parts.push(s);
    }

    let usage = message
        .and_then(|m| m.get("usage"))
        .and_then(UsageBlock::from_value);

    if text_parts.is_empty() && thinking_parts.is_empty() && tool_uses == 0 && usage.is_none() {
        return None;
    }

    let thinking_content = match thinking_parts.len() {
        0 => None,
        1 => Some(thinking_parts[0].to_string()),
        _ => Some(Value::from(thinking_parts).to_string()),
    };

    Some(TranscriptRecord {
        message_uuid: str_field(obj, "uuid"),
        parent_uuid: str_field(obj, "parentUuid"),
        role: Role::Assistant,
        content: if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join("\n"))
        },
        content_blocks_json: if blocks.is_empty() {
            None
        } else {
            Some(Value::Array(blocks.to_vec()).to_string())
        },
        thinking_content,
        model: message.and_then(|m| str_field(m, "model")),
        timestamp: timestamp_of(obj),
        usage,
    })
}

fn parse_system(obj: &Value) -> TranscriptRecord {
    let content = match obj.get("content").and_then(Value::as_str) {
        Some(s) => s.to_string(),
        None => obj.to_string(),
    };

    TranscriptRecord {
        message_uuid: str_field(obj, "uuid"),
        parent_uuid: str_field(obj, "parentUuid"),
        role: Role::System,
        content: Some(content),
        content_blocks_json: None,
        thinking_content: None,
        model: None,
        timestamp: timestamp_of(obj),
        usage: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(content: Value) -> Value {
        json!({
            "type": "user",
            "uuid": "u1",
            "parentUuid": "p1",
            "timestamp": "2026-01-15T10:00:00.000Z",
            "message": {"role": "user", "content": content}
        })
    }

    fn assistant(content: Value) -> Value {
        json!({
            "type": "assistant",
            "uuid": "a1",
            "parentUuid": "u1",
            "message": {"model": "claude-sonnet-4-20250514", "content": content}
        })
    }

    #[test]
    fn test_user_simple_string() {
        let rec = parse_record(&user(json!("Hello world"))).unwrap();
        assert_eq!(rec.role, Role::User);
        assert_eq!(rec.content.as_deref(), Some("Hello world"));
        assert_eq!(rec.message_uuid.as_deref(), Some("u1"));
        assert_eq!(rec.parent_uuid.as_deref(), Some("p1"));
        assert!(rec.model.is_none());
        assert!(rec.thinking_content.is_none());
        assert!(rec.usage.is_none());
        assert!(rec.content_blocks_json.is_none());
        assert_eq!(rec.timestamp, Some(1_768_471_200_000));
    }

    #[test]
    fn test_user_text_blocks_joined() {
        let rec = parse_record(&user(json!([
            {"type": "text", "text": "part1"},
            "raw",
            {"type": "text", "text": "part2"}
        ])))
        .unwrap();
        assert_eq!(rec.content.as_deref(), Some("part1\nraw\npart2"));
        assert!(rec.content_blocks_json.is_some());
    }

    #[test]
    fn test_user_non_text_blocks_fall_back_to_json() {
        let blocks = json!([{"type": "tool_result", "tool_use_id": "tu_1", "content": "ok"}]);
        let rec = parse_record(&user(blocks.clone())).unwrap();
        assert_eq!(rec.content, Some(blocks.to_string()));

        let rec = parse_record(&user(json!([]))).unwrap();
        assert_eq!(rec.content.as_deref(), Some("[]"));
        assert!(rec.content_blocks_json.is_none());
    }

    #[test]
    fn test_user_without_message() {
        let rec = parse_record(&json!({"type": "user"})).unwrap();
        assert_eq!(rec.content.as_deref(), Some(""));
        assert!(rec.message_uuid.is_none());
    }

    #[test]
    fn test_assistant_text_and_tool_use() {
        let blocks = json!([
            {"type": "text", "text": "Let me read that file."},
            {"type": "tool_use", "id": "tu_1", "name": "Read", "input": {"file_path": "/a"}}
        ]);
        let rec = parse_record(&assistant(blocks.clone())).unwrap();
        assert_eq!(rec.role, Role::Assistant);
        assert_eq!(rec.content.as_deref(), Some("Let me read that file."));
        assert_eq!(rec.model.as_deref(), Some("claude-sonnet-4-20250514"));

        let stored: Value = serde_json::from_str(rec.content_blocks_json.as_deref().unwrap()).unwrap();
        assert_eq!(stored, blocks);
        assert_eq!(stored[1]["name"], "Read");
    }

    #[test]
    fn test_assistant_tool_use_only() {
        let rec = parse_record(&assistant(json!([
            {"type": "tool_use", "id": "tu_1", "name": "Bash", "input": {}}
        ])))
        .unwrap();
        assert!(rec.content.is_none());
        assert!(rec.content_blocks_json.is_some());
    }

    #[test]
    fn test_assistant_thinking() {
        let rec = parse_record(&assistant(json!([
            {"type": "thinking", "thinking": "deep thought"}
        ])))
        .unwrap();
        assert_eq!(rec.thinking_content.as_deref(), Some("deep thought"));
        assert!(rec.content.is_none());

        let rec = parse_record(&assistant(json!([
            {"type": "thinking", "thinking": "first thought"},
            {"type": "text", "text": "answer"},
            {"type": "thinking", "thinking": "second thought"}
        ])))
        .unwrap();
        let parsed: Vec<String> =
            serde_json::from_str(rec.thinking_content.as_deref().unwrap()).unwrap();
        assert_eq!(parsed, vec!["first thought", "second thought"]);
        assert_eq!(rec.content.as_deref(), Some("answer"));
    }

    #[test]
    fn test_assistant_usage() {
        let mut obj = assistant(json!([{"type": "text", "text": "hi"}]));
        obj["message"]["usage"] = json!({
            "input_tokens": 100,
            "output_tokens": 50,
            "cache_creation_input_tokens": 10,
            "cache_read_input_tokens": 20,
            "service_tier": "standard"
        });
        let usage = parse_record(&obj).unwrap().usage.unwrap();
        assert_eq!(usage.input_tokens, Some(100));
        assert_eq!(usage.output_tokens, Some(50));
        assert_eq!(usage.cache_creation_tokens, Some(10));
        assert_eq!(usage.cache_read_tokens, Some(20));
        assert_eq!(usage.service_tier.as_deref(), Some("standard"));

        obj["message"]["usage"] = json!({"input_tokens": 42});
        let usage = parse_record(&obj).unwrap().usage.unwrap();
        assert_eq!(usage.input_tokens, Some(42));
        assert!(usage.output_tokens.is_none());
    }

    #[test]
    fn test_assistant_empty_usage_is_none() {
        let mut obj = assistant(json!([{"type": "text", "text": "hi"}]));
        obj["message"]["usage"] = json!({});
        assert!(parse_record(&obj).unwrap().usage.is_none());
    }

    #[test]
    fn test_assistant_without_content_skipped() {
        assert!(parse_record(&assistant(json!([]))).is_none());
    }

    #[test]
    fn test_assistant_non_object_blocks_skipped() {
        let rec = parse_record(&assistant(json!(["stray", 42, {"type": "text", "text": "valid"}])))
            .unwrap();
        assert_eq!(rec.content.as_deref(), Some("valid"));
    }

    #[test]
    fn test_system_record() {
        let obj = json!({"type": "system", "uuid": "s1", "content": "Compacted", "timestamp": "2026-01-15T10:00:01Z"});
        let rec = parse_record(&obj).unwrap();
        assert_eq!(rec.role, Role::System);
        assert_eq!(rec.content.as_deref(), Some("Compacted"));
        assert_eq!(rec.message_uuid.as_deref(), Some("s1"));

        let obj = json!({"type": "system", "subtype": "hook"});
        let rec = parse_record(&obj).unwrap();
        assert_eq!(rec.content, Some(obj.to_string()));
    }

    #[test]
    fn test_other_types_skipped() {
        for kind in ["progress", "summary", "file-history-snapshot", "queue-operation"] {
            assert!(parse_record(&json!({"type": kind})).is_none(), "{}", kind);
        }
        assert!(parse_record(&json!({"no_type": true})).is_none());
    }

    #[test]
    fn test_parse_line_invalid() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
        assert!(parse_line("{not json").is_none());
        assert!(parse_line(r#"{"type":"user","message":{"content":"x"}}"#).is_some());
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_timestamp("1970-01-01T00:00:00.250+00:00"), Some(250));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
