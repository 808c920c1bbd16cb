//! 会话身份解析
//!
//! 把 Claude 的 `session_id`（外部 token）映射到唯一的持久会话行。
//! 并发的首个事件通过 `INSERT … ON CONFLICT DO NOTHING` + 回读收敛到同一行，
//! 不依赖任何进程内锁。

use crate::db::{counter, current_time_ms, extract_project_name, increment_counter, TelemetryDB};
use crate::error::Result;
use rusqlite::{params, OptionalExtension, TransactionBehavior};

/// 事件携带的会话元数据
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    /// 事件发生时间 (毫秒)，新建会话时作为 started_at
    pub observed_at: i64,
    /// 已结束的会话是否重新打开（`/resume` 触发的 SessionStart）
    pub reopen_if_ended: bool,
}

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// 持久会话 ID
    pub id: String,
    pub claude_session_id: Option<String>,
    /// 本次调用新建了会话行
    pub created: bool,
    /// 缺少 token，走了 cwd 回退（尽力而为）
    pub degraded: bool,
    /// 已结束的会话被重新打开
    pub reopened: bool,
}

impl TelemetryDB {
    /// 解析会话身份
    ///
    /// 相同 token 的每次调用都返回同一个 `id`，包括两个进程同时抢先创建的情况。
    pub fn resolve_session(&self, token: Option<&str>, meta: &SessionMeta) -> Result<SessionHandle> {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => self.resolve_by_token(token, meta),
            None => self.resolve_without_token(meta),
        }
    }

    fn resolve_by_token(&self, token: &str, meta: &SessionMeta) -> Result<SessionHandle> {
        let conn = self.conn.lock();
        let now = current_time_ms();
        let candidate_id = uuid::Uuid::new_v4().to_string();
        let project_name = meta.cwd.as_deref().and_then(extract_project_name);

        // 1. 尝试插入；唯一索引冲突说明已被解析过（或被并发进程抢先）
        let inserted = conn.execute(
            r#"
            INSERT INTO sessions (id, claude_session_id, started_at, cwd, project_name, model,
                                  git_branch, git_commit, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT DO NOTHING
            "#,
            params![
                &candidate_id,
                token,
                meta.observed_at,
                &meta.cwd,
                &project_name,
                &meta.model,
                &meta.git_branch,
                &meta.git_commit,
                now,
            ],
        )?;

        if inserted > 0 {
            tracing::debug!("新会话: id={}, token={}", candidate_id, token);
            return Ok(SessionHandle {
                id: candidate_id,
                claude_session_id: Some(token.to_string()),
                created: true,
                degraded: false,
                reopened: false,
            });
        }

        // 2. 回读已有行
        let (id, ended_at): (String, Option<i64>) = conn.query_row(
            "SELECT id, ended_at FROM sessions WHERE claude_session_id = ?1",
            params![token],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        // 3. 合并新观测到的元数据（cwd 保留首次值）
        conn.execute(
            r#"
            UPDATE sessions SET
                cwd = COALESCE(cwd, ?1),
                project_name = COALESCE(project_name, ?2),
                model = COALESCE(?3, model),
                git_branch = COALESCE(?4, git_branch),
                git_commit = COALESCE(?5, git_commit),
                updated_at = ?6
            WHERE id = ?7
            "#,
            params![
                &meta.cwd,
                &project_name,
                &meta.model,
                &meta.git_branch,
                &meta.git_commit,
                now,
                &id,
            ],
        )?;

        // 4. /resume：重新打开已结束的会话
        let mut reopened = false;
        if meta.reopen_if_ended && ended_at.is_some() {
            reopened = conn.execute(
                "UPDATE sessions SET ended_at = NULL, updated_at = ?1 WHERE id = ?2 AND ended_at IS NOT NULL",
                params![now, &id],
            )? > 0;
            if reopened {
                tracing::info!("会话重新打开: id={}, token={}", id, token);
            }
        }

        Ok(SessionHandle {
            id,
            claude_session_id: Some(token.to_string()),
            created: false,
            degraded: false,
            reopened,
        })
    }

    /// 旧事件没有 token：取同一 cwd 下最近一个未结束的会话，没有则新建
    fn resolve_without_token(&self, meta: &SessionMeta) -> Result<SessionHandle> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = current_time_ms();

        let existing: Option<String> = tx
            .query_row(
                r#"
                SELECT id FROM sessions
                WHERE ended_at IS NULL AND cwd IS ?1
                ORDER BY started_at DESC, created_at DESC
                LIMIT 1
                "#,
                params![&meta.cwd],
                |row| row.get(0),
            )
            .optional()?;

        let (id, created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let project_name = meta.cwd.as_deref().and_then(extract_project_name);
                tx.execute(
                    r#"
                    INSERT INTO sessions (id, claude_session_id, started_at, cwd, project_name, model,
                                          git_branch, git_commit, created_at, updated_at)
                    VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                    "#,
                    params![
                        &id,
                        meta.observed_at,
                        &meta.cwd,
                        &project_name,
                        &meta.model,
                        &meta.git_branch,
                        &meta.git_commit,
                        now,
                    ],
                )?;
                (id, true)
            }
        };

        increment_counter(&tx, counter::DEGRADED_RESOLUTION)?;
        tx.commit()?;

        tracing::warn!(
            "事件缺少 session_id，按 cwd 回退解析: cwd={:?}, session={}, created={}",
            meta.cwd,
            id,
            created
        );

        Ok(SessionHandle {
            id,
            claude_session_id: None,
            created,
            degraded: true,
            reopened: false,
        })
    }

    /// 标记会话结束
    ///
    /// 只有第一次生效，重复的 SessionEnd 返回 `false`。
    pub fn end_session(&self, session_id: &str, ended_at: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE sessions SET ended_at = ?1, updated_at = ?2 WHERE id = ?3 AND ended_at IS NULL",
            params![ended_at, current_time_ms(), session_id],
        )?;
        Ok(n > 0)
    }

    /// 更新会话的模型和 git 信息（空值不覆盖）
    pub fn update_session_metadata(
        &self,
        session_id: &str,
        model: Option<&str>,
        git_branch: Option<&str>,
        git_commit: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE sessions SET
                model = COALESCE(?1, model),
                git_branch = COALESCE(?2, git_branch),
                git_commit = COALESCE(?3, git_commit),
                updated_at = ?4
            WHERE id = ?5
            "#,
            params![model, git_branch, git_commit, current_time_ms(), session_id],
        )?;
        Ok(())
    }
}
