//! 事件处理管线
//!
//! 每个 hook 进程处理一个事件：解析 → 解析会话 → 写事件行 → 按类型分发。
//! [`Pipeline::handle`] 不返回错误：任何失败都记日志并返回中性响应，
//! telemetry 故障不能阻塞工具调用。

use crate::config::DbConfig;
use crate::correlator::{BeginRecord, EndOutcome, EndRecord, InvocationRef};
use crate::db::{current_time_ms, NewEvent, TelemetryDB};
use crate::error::{Error, Result};
use crate::git::{self, GitProbe};
use crate::health::{self, MESSAGE_PREFIX};
use crate::ingest::IngestSummary;
use crate::protocol::{EventBody, HookEvent, HookResponse};
use crate::session::{SessionHandle, SessionMeta};
use crate::types::EventKind;
use serde_json::Value;
use std::path::Path;

/// 单个事件的处理结果
#[derive(Debug, Clone)]
pub struct HandledEvent {
    pub session: SessionHandle,
    pub event_id: i64,
    pub invocation: Option<InvocationRef>,
    pub end: Option<EndOutcome>,
    pub ingest: Option<IngestSummary>,
    pub git_changes: usize,
    pub session_ended: bool,
}

impl HandledEvent {
    fn new(session: SessionHandle, event_id: i64) -> Self {
        Self {
            session,
            event_id,
            invocation: None,
            end: None,
            ingest: None,
            git_changes: 0,
            session_ended: false,
        }
    }
}

/// 失败分类，决定日志口径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// 存储打不开、被锁、只读或磁盘满，通常是环境问题
    StoreUnreachable,
    /// 其余失败
    Internal,
}

impl Failure {
    pub fn of(error: &Error) -> Self {
        if error.is_store_unreachable() {
            Failure::StoreUnreachable
        } else {
            Failure::Internal
        }
    }

    /// 记一条错误日志并返回分类
    fn log(kind: EventKind, url: &str, error: &Error) -> Self {
        let failure = Self::of(error);
        match failure {
            Failure::StoreUnreachable => {
                tracing::error!("telemetry 存储不可达 ({})，跳过 {}: {}", url, kind, error)
            }
            Failure::Internal => tracing::error!("{} 记录失败: {}", kind, error),
        }
        failure
    }
}

/// 事件处理管线
pub struct Pipeline {
    config: DbConfig,
    git: Box<dyn GitProbe>,
}

impl Pipeline {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            git: git::default_probe(),
        }
    }

    /// 替换 git 探针
    pub fn with_git_probe(mut self, probe: Box<dyn GitProbe>) -> Self {
        self.git = probe;
        self
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// 处理一个事件，以当前时间作为发生时间
    pub fn handle(&self, kind: EventKind, raw: &str) -> HookResponse {
        self.handle_at(kind, raw, current_time_ms())
    }

    /// 处理一个事件
    pub fn handle_at(&self, kind: EventKind, raw: &str, now: i64) -> HookResponse {
        let event = HookEvent::parse(kind, raw);

        let db = match TelemetryDB::connect(self.config.clone()) {
            Ok(db) => db,
            Err(e) => {
                let failure = Failure::log(kind, &self.config.url, &e);
                if kind == EventKind::SessionStart {
                    let detail = match failure {
                        Failure::StoreUnreachable => health::diagnose_connection_error(&e.to_string()),
                        Failure::Internal => e.to_string(),
                    };
                    return HookResponse::system_message(format!("{} {}", MESSAGE_PREFIX, detail));
                }
                return HookResponse::benign(kind);
            }
        };

        if kind == EventKind::SessionStart {
            let report = health::check_health(&self.config);
            if !report.healthy {
                tracing::error!("telemetry 健康检查失败: {:?}", report.message);
                return match report.message {
                    Some(msg) => HookResponse::system_message(msg),
                    None => HookResponse::benign(kind),
                };
            }
        }

        match self.record(&db, &event, now) {
            Ok(handled) => {
                tracing::debug!(
                    "{} 已记录: session={}, event={}",
                    kind,
                    handled.session.id,
                    handled.event_id
                );
            }
            Err(e) => {
                Failure::log(kind, &self.config.url, &e);
            }
        }

        HookResponse::benign(kind)
    }

    /// 入库一个事件
    ///
    /// 会话解析和事件行失败时返回错误；之后的明细、transcript、git 采集失败只记日志。
    pub fn record(&self, db: &TelemetryDB, event: &HookEvent, now: i64) -> Result<HandledEvent> {
        let payload = &event.payload;
        let cwd = payload.cwd.as_deref().map(Path::new);

        let mut meta = SessionMeta {
            cwd: payload.cwd.clone(),
            observed_at: now,
            ..Default::default()
        };
        if let EventBody::SessionStart(start) = &event.body {
            let info = self.git.branch_and_commit(cwd);
            meta.model = start.model.clone();
            meta.git_branch = info.branch;
            meta.git_commit = info.commit;
            meta.reopen_if_ended = true;
        }

        let session = db.resolve_session(payload.session_id.as_deref(), &meta)?;
        let event_id = db.insert_event(
            &session.id,
            &NewEvent {
                kind: event.kind,
                occurred_at: now,
                raw_json: event.raw_json.clone(),
                claude_session_id: payload.session_id.clone(),
                transcript_path: payload.transcript_path.clone(),
                cwd: payload.cwd.clone(),
                permission_mode: payload.permission_mode.clone(),
            },
        )?;

        let mut handled = HandledEvent::new(session, event_id);
        let session_id = handled.session.id.clone();

        match &event.body {
            EventBody::SessionStart(start) => {
                if handled.session.reopened {
                    tracing::info!(
                        "会话恢复: session={}, source={:?}",
                        session_id,
                        start.source
                    );
                }
            }
            EventBody::PreToolUse(body) => {
                let begin = BeginRecord {
                    tool_name: body.tool_name.clone().unwrap_or_else(|| "Unknown".to_string()),
                    tool_use_id: body.tool_use_id.clone(),
                    tool_input_json: body
                        .tool_input
                        .as_ref()
                        .filter(|v| !v.is_null())
                        .map(Value::to_string),
                    started_at: now,
                };
                handled.invocation = Some(db.record_begin(&session_id, event_id, &begin)?);
            }
            EventBody::PostToolUse(body) => {
                let end = EndRecord {
                    tool_name: body.tool_name.clone(),
                    tool_use_id: body.tool_use_id.clone(),
                    tool_result: body.tool_response.as_ref().and_then(value_to_text),
                    was_blocked: body.blocked,
                    block_reason: body.block_reason.clone(),
                    completed_at: now,
                };
                handled.end = Some(db.record_end(&session_id, event_id, &end)?);
            }
            EventBody::UserPromptSubmit(body) => {
                let prompt = body.prompt.as_deref().unwrap_or("");
                db.insert_user_prompt(event_id, prompt)?;
            }
            EventBody::Stop(body) => {
                db.insert_stop_event(event_id, body.reason.as_deref())?;
            }
            EventBody::SubagentStop(body) => {
                let result = body.result.as_ref().and_then(value_to_text);
                db.insert_subagent_event(
                    event_id,
                    body.agent_type.as_deref().unwrap_or("Unknown"),
                    body.task_description.as_deref(),
                    result.as_deref(),
                    body.tool_use_id.as_deref(),
                )?;
            }
            EventBody::PreCompact(body) => {
                let summary = body.summary_content.as_ref().and_then(value_to_text);
                db.insert_compact_event(event_id, summary.as_deref())?;
            }
            EventBody::Notification(body) => {
                let content = body.notification_content.as_ref().and_then(value_to_text);
                db.insert_notification_event(
                    event_id,
                    body.notification_type.as_deref(),
                    content.as_deref(),
                )?;
            }
            EventBody::SessionEnd(_) => {}
            EventBody::Malformed { reason } => {
                tracing::warn!(
                    "{} 明细无法提取，仅保留原始事件: event={}, {}",
                    event.kind,
                    event_id,
                    reason
                );
            }
        }

        if event.kind.triggers_ingest() {
            if let Some(path) = payload.transcript_path.as_deref() {
                handled.ingest = self.ingest(db, &session_id, Path::new(path), event_id);
            }
        }

        if event.kind == EventKind::SessionEnd {
            handled.git_changes = self.capture_git_changes(db, &session_id, cwd, now);
            handled.session_ended = db.end_session(&session_id, now)?;
        }

        Ok(handled)
    }

    fn ingest(
        &self,
        db: &TelemetryDB,
        session_id: &str,
        path: &Path,
        event_id: i64,
    ) -> Option<IngestSummary> {
        match db.ingest_transcript(session_id, path, Some(event_id)) {
            Ok(summary) => {
                if summary.stale {
                    tracing::debug!("transcript 已由并发事件入库: session={}", session_id);
                }
                Some(summary)
            }
            Err(e) => {
                tracing::warn!("transcript 入库失败 {:?}: {}", path, e);
                None
            }
        }
    }

    fn capture_git_changes(
        &self,
        db: &TelemetryDB,
        session_id: &str,
        cwd: Option<&Path>,
        now: i64,
    ) -> usize {
        let changes = match self.git.changes(cwd) {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!("git 变更采集失败: {}", e);
                return 0;
            }
        };
        if changes.is_empty() {
            return 0;
        }
        match db.record_git_changes(session_id, &changes, now) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("git 变更写入失败: {}", e);
                0
            }
        }
    }
}

/// 字符串原样保留，其他 JSON 值序列化
fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&Value::Null), None);
        assert_eq!(value_to_text(&json!("plain")), Some("plain".to_string()));
        assert_eq!(value_to_text(&json!({"a": 1})), Some(r#"{"a":1}"#.to_string()));
        assert_eq!(value_to_text(&json!([1, 2])), Some("[1,2]".to_string()));
    }
}
