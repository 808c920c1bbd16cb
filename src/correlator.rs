//! 工具调用关联
//!
//! PreToolUse (begin) 与 PostToolUse (end) 由两个独立进程投递，顺序不保证。
//! 关联状态只存在于数据库：每个入口在一个 IMMEDIATE 事务里完成
//! "条件更新，否则插入"，不会出现先读后写的竞态。

use crate::db::{counter, increment_counter, TelemetryDB};
use crate::error::Result;
use rusqlite::{params, OptionalExtension, TransactionBehavior};

/// begin 事件输入
#[derive(Debug, Clone)]
pub struct BeginRecord {
    pub tool_name: String,
    /// 关联键 (tool_use_id)
    pub tool_use_id: Option<String>,
    /// 工具参数，序列化后的单个 JSON 文档
    pub tool_input_json: Option<String>,
    pub started_at: i64,
}

/// end 事件输入
#[derive(Debug, Clone)]
pub struct EndRecord {
    pub tool_name: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_result: Option<String>,
    pub was_blocked: bool,
    pub block_reason: Option<String>,
    pub completed_at: i64,
}

/// begin 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationRef {
    /// 新建 Pending 行
    Inserted { id: i64 },
    /// end 先到：补全了无头行的开始时间
    Attached { id: i64, duration_ms: i64 },
    /// 同一关联键已有记录（重复投递）
    Duplicate { id: i64 },
}

impl InvocationRef {
    pub fn id(&self) -> i64 {
        match *self {
            InvocationRef::Inserted { id }
            | InvocationRef::Attached { id, .. }
            | InvocationRef::Duplicate { id } => id,
        }
    }
}

/// end 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// 匹配到 Pending 行，已计算耗时（可能为 0 或负数，时钟偏差不修正）
    Matched { id: i64, duration_ms: i64 },
    /// 没有 Pending 行：写入无头 Completed 行，计入 correlation_miss
    Headless { id: i64 },
    /// 该关联键已完成过（重复投递）
    Duplicate { id: i64 },
}

impl EndOutcome {
    pub fn duration_ms(&self) -> Option<i64> {
        match *self {
            EndOutcome::Matched { duration_ms, .. } => Some(duration_ms),
            _ => None,
        }
    }
}

impl TelemetryDB {
    /// 记录工具开始
    pub fn record_begin(
        &self,
        session_id: &str,
        event_id: i64,
        begin: &BeginRecord,
    ) -> Result<InvocationRef> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = begin.tool_use_id.as_deref() {
            // end 先到的情况：把 begin 补到无头行上
            let attached: Option<(i64, i64)> = tx
                .query_row(
                    r#"
                    UPDATE tool_invocations SET
                        event_id = ?1,
                        tool_name = ?2,
                        started_at = ?3,
                        duration_ms = completed_at - ?3,
                        tool_input_json = COALESCE(tool_input_json, ?4)
                    WHERE id = (
                        SELECT id FROM tool_invocations
                        WHERE session_id = ?5 AND tool_use_id = ?6
                          AND started_at IS NULL AND completed_at IS NOT NULL
                        ORDER BY id DESC
                        LIMIT 1
                    )
                    RETURNING id, duration_ms
                    "#,
                    params![
                        event_id,
                        &begin.tool_name,
                        begin.started_at,
                        &begin.tool_input_json,
                        session_id,
                        key,
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((id, duration_ms)) = attached {
                tx.commit()?;
                tracing::debug!(
                    "begin 晚于 end 到达，已补全: key={}, id={}, duration={}ms",
                    key,
                    id,
                    duration_ms
                );
                return Ok(InvocationRef::Attached { id, duration_ms });
            }

            // 同一关联键已有 begin（Pending 或已完成）
            let existing: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT id FROM tool_invocations
                    WHERE session_id = ?1 AND tool_use_id = ?2 AND started_at IS NOT NULL
                    ORDER BY id DESC
                    LIMIT 1
                    "#,
                    params![session_id, key],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = existing {
                tx.commit()?;
                tracing::debug!("重复的 begin: key={}, id={}", key, id);
                return Ok(InvocationRef::Duplicate { id });
            }
        }

        let n = tx.execute(
            r#"
            INSERT INTO tool_invocations (event_id, session_id, tool_name, tool_use_id, started_at, tool_input_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT DO NOTHING
            "#,
            params![
                event_id,
                session_id,
                &begin.tool_name,
                &begin.tool_use_id,
                begin.started_at,
                &begin.tool_input_json,
            ],
        )?;

        let outcome = if n > 0 {
            InvocationRef::Inserted {
                id: tx.last_insert_rowid(),
            }
        } else {
            // 唯一索引兜底：另一个 Pending 行已占用该键
            let id: i64 = tx.query_row(
                r#"
                SELECT id FROM tool_invocations
                WHERE session_id = ?1 AND tool_use_id = ?2 AND completed_at IS NULL
                "#,
                params![session_id, &begin.tool_use_id],
                |row| row.get(0),
            )?;
            InvocationRef::Duplicate { id }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// 记录工具结束
    ///
    /// 优先匹配同一会话内最近的 Pending 行；没有 Pending 行时写入无头 Completed 行，
    /// 事件不会被丢弃。
    pub fn record_end(&self, session_id: &str, event_id: i64, end: &EndRecord) -> Result<EndOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = end.tool_use_id.as_deref() {
            let matched: Option<(i64, i64)> = tx
                .query_row(
                    r#"
                    UPDATE tool_invocations SET
                        completed_at = ?1,
                        duration_ms = ?1 - started_at,
                        tool_result = ?2,
                        was_blocked = ?3,
                        block_reason = ?4
                    WHERE id = (
                        SELECT id FROM tool_invocations
                        WHERE tool_use_id = ?5 AND completed_at IS NULL
                        ORDER BY (session_id = ?6) DESC, id DESC
                        LIMIT 1
                    )
                    RETURNING id, duration_ms
                    "#,
                    params![
                        end.completed_at,
                        &end.tool_result,
                        end.was_blocked,
                        &end.block_reason,
                        key,
                        session_id,
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((id, duration_ms)) = matched {
                tx.commit()?;
                return Ok(EndOutcome::Matched { id, duration_ms });
            }

            // 已完成过（重复的 end）：不产生第二次 Completed
            let completed: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT id FROM tool_invocations
                    WHERE tool_use_id = ?1 AND completed_at IS NOT NULL
                    ORDER BY (session_id = ?2) DESC, id DESC
                    LIMIT 1
                    "#,
                    params![key, session_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = completed {
                tx.commit()?;
                tracing::debug!("重复的 end: key={}, id={}", key, id);
                return Ok(EndOutcome::Duplicate { id });
            }
        }

        tx.execute(
            r#"
            INSERT INTO tool_invocations (event_id, session_id, tool_name, tool_use_id, completed_at,
                                          tool_result, was_blocked, block_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                event_id,
                session_id,
                end.tool_name.as_deref().unwrap_or("Unknown"),
                &end.tool_use_id,
                end.completed_at,
                &end.tool_result,
                end.was_blocked,
                &end.block_reason,
            ],
        )?;
        let id = tx.last_insert_rowid();
        increment_counter(&tx, counter::CORRELATION_MISS)?;
        tx.commit()?;

        tracing::warn!(
            "end 没有匹配的 begin，写入无头行: key={:?}, tool={:?}, id={}",
            end.tool_use_id,
            end.tool_name,
            id
        );
        Ok(EndOutcome::Headless { id })
    }
}
