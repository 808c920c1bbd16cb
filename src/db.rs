//! 数据库连接和操作
//!
//! 所有可能冲突的写入都走 `ON CONFLICT DO NOTHING`：唯一约束冲突是
//! 设计内的结果（重复投递），返回 [`WriteOutcome::Duplicate`] 而不是错误。

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::migrations;
use crate::schema;
use crate::types::{
    ChangeType, EventKind, EventRecord, GitChange, Message, Role, Session, Stats,
    TokenUsageRecord, ToolInvocation,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 诊断计数器名
pub mod counter {
    /// end 事件没有匹配到 pending begin
    pub const CORRELATION_MISS: &str = "correlation_miss";
    /// 缺少 session token，走了 cwd 回退解析
    pub const DEGRADED_RESOLUTION: &str = "degraded_resolution";
}

/// 幂等写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 新插入，带 rowid
    Inserted(i64),
    /// 唯一键已存在，未写入
    Duplicate,
}

impl WriteOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, WriteOutcome::Inserted(_))
    }

    fn from_changes(conn: &Connection, changed: usize) -> Self {
        if changed > 0 {
            WriteOutcome::Inserted(conn.last_insert_rowid())
        } else {
            WriteOutcome::Duplicate
        }
    }
}

/// 数据库连接
#[derive(Debug)]
pub struct TelemetryDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
    config: DbConfig,
}

impl TelemetryDB {
    /// 连接数据库
    pub fn connect(config: DbConfig) -> Result<Self> {
        // 空路径会让 SQLite 打开临时库，数据随进程丢失
        if config.url.trim().is_empty() {
            return Err(Error::Config("数据库路径为空".to_string()));
        }
        let path = config.path();

        // 确保目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Connection(format!("unable to open {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(&path)
            .map_err(|e| Error::Connection(format!("{} ({})", e, path.display())))?;
        Self::prepare(conn, config)
    }

    /// 初始化连接：PRAGMA、迁移、schema
    fn prepare(conn: Connection, config: DbConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(schema::PRAGMA_SQL)?;

        // 执行数据库迁移（先于 schema，为老数据库添加缺失的列）
        migrations::run_migrations(&conn)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        tracing::debug!("数据库已连接: {}", config.url);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// 当前配置
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== Event 操作 ====================

    /// 写入 hook 事件，返回 event id
    ///
    /// 事件行不做去重：每次投递各占一行。
    pub fn insert_event(&self, session_id: &str, event: &NewEvent) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO hook_events (session_id, event_kind, occurred_at, raw_json,
                                     claude_session_id, transcript_path, cwd, permission_mode)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                session_id,
                event.kind.as_str(),
                event.occurred_at,
                &event.raw_json,
                &event.claude_session_id,
                &event.transcript_path,
                &event.cwd,
                &event.permission_mode,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 获取 Session 的事件（按时间排序）
    pub fn list_events(&self, session_id: &str) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, event_kind, occurred_at, raw_json,
                   claude_session_id, transcript_path, cwd, permission_mode
            FROM hook_events
            WHERE session_id = ?1
            ORDER BY occurred_at ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(EventRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                event_kind: row.get(2)?,
                occurred_at: row.get(3)?,
                raw_json: row.get(4)?,
                claude_session_id: row.get(5)?,
                transcript_path: row.get(6)?,
                cwd: row.get(7)?,
                permission_mode: row.get(8)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== 事件明细 ====================

    /// 记录用户输入
    pub fn insert_user_prompt(&self, event_id: i64, prompt: &str) -> Result<WriteOutcome> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT INTO user_prompts (event_id, prompt_text) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![event_id, prompt],
        )?;
        Ok(WriteOutcome::from_changes(&conn, n))
    }

    /// 记录 Stop 事件
    pub fn insert_stop_event(&self, event_id: i64, reason: Option<&str>) -> Result<WriteOutcome> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT INTO stop_events (event_id, reason) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![event_id, reason],
        )?;
        Ok(WriteOutcome::from_changes(&conn, n))
    }

    /// 记录子 agent 完成事件
    pub fn insert_subagent_event(
        &self,
        event_id: i64,
        agent_type: &str,
        task_description: Option<&str>,
        result: Option<&str>,
        tool_use_id: Option<&str>,
    ) -> Result<WriteOutcome> {
        let conn = self.conn.lock();
        let n = conn.execute(
            r#"
            INSERT INTO subagent_events (event_id, agent_type, task_description, result, tool_use_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT DO NOTHING
            "#,
            params![event_id, agent_type, task_description, result, tool_use_id],
        )?;
        Ok(WriteOutcome::from_changes(&conn, n))
    }

    /// 记录 compact 事件
    pub fn insert_compact_event(
        &self,
        event_id: i64,
        summary_content: Option<&str>,
    ) -> Result<WriteOutcome> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT INTO compact_events (event_id, summary_content) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![event_id, summary_content],
        )?;
        Ok(WriteOutcome::from_changes(&conn, n))
    }

    /// 记录通知事件
    pub fn insert_notification_event(
        &self,
        event_id: i64,
        notification_type: Option<&str>,
        content: Option<&str>,
    ) -> Result<WriteOutcome> {
        let conn = self.conn.lock();
        let n = conn.execute(
            r#"
            INSERT INTO notification_events (event_id, notification_type, notification_content)
            VALUES (?1, ?2, ?3)
            ON CONFLICT DO NOTHING
            "#,
            params![event_id, notification_type, content],
        )?;
        Ok(WriteOutcome::from_changes(&conn, n))
    }

    /// 读取用户输入文本
    pub fn get_user_prompt(&self, event_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT prompt_text FROM user_prompts WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    // ==================== Git 变更 ====================

    /// 写入会话结束时的 git 变更
    ///
    /// 同一 (session, file) 只保留第一次写入，返回实际插入数量。
    pub fn record_git_changes(
        &self,
        session_id: &str,
        changes: &[GitChangeInput],
        recorded_at: i64,
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut inserted = 0;
        for change in changes {
            inserted += tx.execute(
                r#"
                INSERT INTO git_changes (session_id, file_path, change_type, lines_added, lines_deleted, diff_text, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT DO NOTHING
                "#,
                params![
                    session_id,
                    &change.file_path,
                    change.change_type.to_string(),
                    change.lines_added,
                    change.lines_deleted,
                    &change.diff_text,
                    recorded_at,
                ],
            )?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// 获取 Session 的 git 变更
    pub fn list_git_changes(&self, session_id: &str) -> Result<Vec<GitChange>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, file_path, change_type, lines_added, lines_deleted, diff_text, recorded_at
            FROM git_changes
            WHERE session_id = ?1
            ORDER BY file_path ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            let change_type: String = row.get(3)?;
            Ok(GitChange {
                id: row.get(0)?,
                session_id: row.get(1)?,
                file_path: row.get(2)?,
                change_type: change_type.parse().unwrap_or(ChangeType::Modified),
                lines_added: row.get(4)?,
                lines_deleted: row.get(5)?,
                diff_text: row.get(6)?,
                recorded_at: row.get(7)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== 查询 ====================

    /// 获取单个 Session
    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
            params![id],
            session_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 根据 Claude session_id 获取 Session
    pub fn get_session_by_token(&self, claude_session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions WHERE claude_session_id = ?1",
                SESSION_COLUMNS
            ),
            params![claude_session_id],
            session_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 获取 Session 的工具调用（按 id 排序）
    pub fn list_tool_invocations(&self, session_id: &str) -> Result<Vec<ToolInvocation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tool_invocations WHERE session_id = ?1 ORDER BY id ASC",
            INVOCATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![session_id], invocation_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 根据关联键获取工具调用
    pub fn find_invocations_by_key(&self, tool_use_id: &str) -> Result<Vec<ToolInvocation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tool_invocations WHERE tool_use_id = ?1 ORDER BY id ASC",
            INVOCATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![tool_use_id], invocation_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 获取 Session 的 Messages
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, message_uuid, parent_uuid, role, content, content_blocks_json,
                   thinking_content, model, timestamp, trigger_event_id
            FROM messages
            WHERE session_id = ?1
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            let role: String = row.get(4)?;
            Ok(Message {
                id: row.get(0)?,
                session_id: row.get(1)?,
                message_uuid: row.get(2)?,
                parent_uuid: row.get(3)?,
                role: role.parse().unwrap_or(Role::System),
                content: row.get(5)?,
                content_blocks_json: row.get(6)?,
                thinking_content: row.get(7)?,
                model: row.get(8)?,
                timestamp: row.get(9)?,
                trigger_event_id: row.get(10)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 获取 Session 的 token 用量
    pub fn list_token_usage(&self, session_id: &str) -> Result<Vec<TokenUsageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, message_uuid, model, input_tokens, output_tokens,
                   cache_creation_tokens, cache_read_tokens, service_tier, estimated_cost_usd
            FROM token_usage
            WHERE session_id = ?1
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(TokenUsageRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                message_uuid: row.get(2)?,
                model: row.get(3)?,
                input_tokens: row.get(4)?,
                output_tokens: row.get(5)?,
                cache_creation_tokens: row.get(6)?,
                cache_read_tokens: row.get(7)?,
                service_tier: row.get(8)?,
                estimated_cost_usd: row.get(9)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 读取诊断计数器
    pub fn get_counter(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM telemetry_counters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    // ==================== 统计 ====================

    /// 获取统计信息
    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |row| row.get(0)) };

        Ok(Stats {
            session_count: count("SELECT COUNT(*) FROM sessions")?,
            event_count: count("SELECT COUNT(*) FROM hook_events")?,
            invocation_count: count("SELECT COUNT(*) FROM tool_invocations")?,
            pending_invocation_count: count(
                "SELECT COUNT(*) FROM tool_invocations WHERE completed_at IS NULL",
            )?,
            message_count: count("SELECT COUNT(*) FROM messages")?,
            token_usage_count: count("SELECT COUNT(*) FROM token_usage")?,
        })
    }
}

/// 计数器 +1（在调用方的事务内执行）
pub(crate) fn increment_counter(conn: &Connection, name: &str) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO telemetry_counters (name, value) VALUES (?1, 1)
        ON CONFLICT(name) DO UPDATE SET value = value + 1
        "#,
        params![name],
    )?;
    Ok(())
}

pub(crate) const SESSION_COLUMNS: &str = "id, claude_session_id, started_at, ended_at, cwd, project_name, model, \
     git_branch, git_commit, transcript_offset, transcript_lines, transcript_file_id, \
     created_at, updated_at";

pub(crate) fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        claude_session_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        cwd: row.get(4)?,
        project_name: row.get(5)?,
        model: row.get(6)?,
        git_branch: row.get(7)?,
        git_commit: row.get(8)?,
        transcript_offset: row.get(9)?,
        transcript_lines: row.get(10)?,
        transcript_file_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const INVOCATION_COLUMNS: &str = "id, event_id, session_id, tool_name, tool_use_id, started_at, \
     completed_at, duration_ms, tool_input_json, tool_result, was_blocked, block_reason";

fn invocation_from_row(row: &Row<'_>) -> rusqlite::Result<ToolInvocation> {
    let was_blocked: i64 = row.get(10)?;
    Ok(ToolInvocation {
        id: row.get(0)?,
        event_id: row.get(1)?,
        session_id: row.get(2)?,
        tool_name: row.get(3)?,
        tool_use_id: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        duration_ms: row.get(7)?,
        tool_input_json: row.get(8)?,
        tool_result: row.get(9)?,
        was_blocked: was_blocked != 0,
        block_reason: row.get(11)?,
    })
}

/// 事件输入 (写入用)
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: EventKind,
    pub occurred_at: i64,
    pub raw_json: String,
    pub claude_session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: Option<String>,
}

/// Git 变更输入 (写入用)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitChangeInput {
    pub file_path: String,
    pub change_type: ChangeType,
    pub lines_added: i64,
    pub lines_deleted: i64,
    pub diff_text: Option<String>,
}

/// 从路径提取项目名
pub(crate) fn extract_project_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// 获取当前时间戳 (毫秒)
pub fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
