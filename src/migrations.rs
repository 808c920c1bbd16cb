//! 数据库迁移模块

use rusqlite::{Connection, Result as SqliteResult, Transaction, TransactionBehavior};
use tracing::{info, warn};

/// 迁移版本
const MIGRATION_VERSION: i64 = 2;

/// 初始化迁移系统
pub fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    // 创建迁移版本表
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    Ok(())
}

/// 获取当前数据库版本
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: SqliteResult<Option<i64>> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        });

    match version {
        Ok(v) => Ok(v.unwrap_or(0)),
        Err(_) => Ok(0), // 如果表为空，返回 0
    }
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    let current_time_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, current_time_ms],
    )?;

    Ok(())
}

/// 检查表是否存在
pub(crate) fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// 检查列是否存在
fn column_exists(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt.query_map([], |row| {
        let col_name: String = row.get(1)?;
        Ok(col_name)
    })?;

    for col_name in columns.flatten() {
        if col_name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

/// 迁移 1: 为老 sessions 表添加 transcript 游标字段
fn migration_001_add_transcript_cursor(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 001: Add transcript cursor fields");

    // 如果表不存在，跳过迁移（schema 会创建完整表）
    if !table_exists(conn, "sessions")? {
        info!("sessions table does not exist, skipping migration (will be created by schema)");
        return Ok(());
    }

    if !column_exists(conn, "sessions", "transcript_offset")? {
        info!("Adding transcript_offset column");
        conn.execute(
            "ALTER TABLE sessions ADD COLUMN transcript_offset INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    if !column_exists(conn, "sessions", "transcript_lines")? {
        info!("Adding transcript_lines column");
        conn.execute(
            "ALTER TABLE sessions ADD COLUMN transcript_lines INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    if !column_exists(conn, "sessions", "transcript_file_id")? {
        info!("Adding transcript_file_id column");
        conn.execute("ALTER TABLE sessions ADD COLUMN transcript_file_id TEXT", [])?;
    }

    info!("Migration 001 complete");
    Ok(())
}

/// 迁移 2: 旧 EAV 参数表 (tool_parameters) 折叠进 tool_input_json
///
/// 每个 invocation 的 (param_name, param_value) 行合并为一个 JSON 对象，
/// 只填充 tool_input_json 仍为空的行，然后删除旧表。
fn migration_002_fold_tool_parameters(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 002: Fold tool_parameters into tool_input_json");

    if !table_exists(conn, "tool_parameters")? {
        info!("tool_parameters table does not exist, skipping migration");
        return Ok(());
    }

    if !table_exists(conn, "tool_invocations")? {
        warn!("tool_parameters exists without tool_invocations, dropping orphan table");
        conn.execute("DROP TABLE tool_parameters", [])?;
        return Ok(());
    }

    if !column_exists(conn, "tool_invocations", "tool_input_json")? {
        conn.execute("ALTER TABLE tool_invocations ADD COLUMN tool_input_json TEXT", [])?;
    }

    let folded = conn.execute(
        r#"
        UPDATE tool_invocations
        SET tool_input_json = (
            SELECT json_group_object(p.param_name, p.param_value)
            FROM tool_parameters p
            WHERE p.invocation_id = tool_invocations.id
        )
        WHERE tool_input_json IS NULL
          AND EXISTS (SELECT 1 FROM tool_parameters p WHERE p.invocation_id = tool_invocations.id)
        "#,
        [],
    )?;
    info!("Folded parameters of {} invocations", folded);

    conn.execute("DROP TABLE tool_parameters", [])?;

    info!("Migration 002 complete");
    Ok(())
}

/// 执行所有待应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    // 初始化迁移系统
    initialize_migrations(conn)?;

    // 获取当前版本
    let current_version = get_current_version(conn)?;

    // 如果已经是最新版本，直接返回
    if current_version >= MIGRATION_VERSION {
        return Ok(());
    }
    info!("Current database version: {}", current_version);

    // 执行迁移（IMMEDIATE 事务：并发进程在此排队，拿到写锁后重新读版本）
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let current_version = get_current_version(&tx)?;
    if current_version >= MIGRATION_VERSION {
        return Ok(());
    }

    if current_version < 1 {
        match migration_001_add_transcript_cursor(&tx) {
            Ok(_) => {
                record_migration(&tx, 1)?;
                info!("Migration 1 applied");
            }
            Err(e) => {
                warn!("Migration 1 failed: {}", e);
                return Err(e);
            }
        }
    }

    if current_version < 2 {
        match migration_002_fold_tool_parameters(&tx) {
            Ok(_) => {
                record_migration(&tx, 2)?;
                info!("Migration 2 applied");
            }
            Err(e) => {
                warn!("Migration 2 failed: {}", e);
                return Err(e);
            }
        }
    }

    // 提交事务
    tx.commit()?;

    info!("All migrations applied successfully, current version: {}", MIGRATION_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_migrations() {
        // 创建内存数据库
        let conn = Connection::open_in_memory().unwrap();

        // 模拟老版本数据库：没有游标列，参数以 EAV 行存储
        conn.execute_batch(
            r#"
            CREATE TABLE sessions (
                id TEXT PRIMARY KEY,
                claude_session_id TEXT,
                started_at INTEGER NOT NULL
            );
            CREATE TABLE tool_invocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                tool_name TEXT NOT NULL
            );
            CREATE TABLE tool_parameters (
                invocation_id INTEGER NOT NULL,
                param_name TEXT NOT NULL,
                param_value TEXT
            );
            INSERT INTO tool_invocations (event_id, session_id, tool_name) VALUES (1, 's', 'Read');
            INSERT INTO tool_invocations (event_id, session_id, tool_name) VALUES (2, 's', 'Bash');
            INSERT INTO tool_parameters VALUES (1, 'file_path', '/tmp/a.rs');
            INSERT INTO tool_parameters VALUES (1, 'limit', '20');
            "#,
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        // 迁移 1 的列
        assert!(column_exists(&conn, "sessions", "transcript_offset").unwrap());
        assert!(column_exists(&conn, "sessions", "transcript_lines").unwrap());
        assert!(column_exists(&conn, "sessions", "transcript_file_id").unwrap());

        // 迁移 2：参数折叠为 JSON，旧表删除
        assert!(!table_exists(&conn, "tool_parameters").unwrap());
        let json: String = conn
            .query_row(
                "SELECT tool_input_json FROM tool_invocations WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["file_path"], "/tmp/a.rs");
        assert_eq!(value["limit"], "20");

        // 没有参数的行保持 NULL
        let empty: Option<String> = conn
            .query_row(
                "SELECT tool_input_json FROM tool_invocations WHERE id = 2",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(empty.is_none());

        assert_eq!(get_current_version(&conn).unwrap(), 2);

        // 再次运行迁移应该是幂等的
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_migrations_on_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 2);
        assert!(!table_exists(&conn, "sessions").unwrap());
    }
}
