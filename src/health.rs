//! 存储健康检查
//!
//! 分层检查，遇到第一个失败即返回：
//! 1. 能否打开数据库
//! 2. 核心表是否存在

use crate::config::DbConfig;
use crate::migrations::table_exists;
use crate::schema::REQUIRED_TABLES;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;

/// 面向用户的消息前缀
pub const MESSAGE_PREFIX: &str = "[claude-telemetry]";

/// 健康检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    /// 不健康时给用户看的提示
    pub message: Option<String>,
    pub missing_tables: Vec<String>,
}

impl HealthReport {
    fn ok() -> Self {
        Self {
            healthy: true,
            message: None,
            missing_tables: Vec::new(),
        }
    }

    fn fail(message: String) -> Self {
        Self {
            healthy: false,
            message: Some(format!("{} {}", MESSAGE_PREFIX, message)),
            missing_tables: Vec::new(),
        }
    }
}

/// 执行健康检查
///
/// 不创建文件也不建表。
pub fn check_health(config: &DbConfig) -> HealthReport {
    let path = config.path();

    if !path.exists() {
        return HealthReport::fail(format!(
            "Telemetry database not found at {}. It is created on the first recorded event.",
            path.display()
        ));
    }

    let conn = match Connection::open_with_flags(
        &path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(c) => c,
        Err(e) => return HealthReport::fail(diagnose_connection_error(&e.to_string())),
    };
    if let Err(e) = conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms)) {
        return HealthReport::fail(diagnose_connection_error(&e.to_string()));
    }

    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        match table_exists(&conn, table) {
            Ok(true) => {}
            Ok(false) => missing.push(table.to_string()),
            Err(e) => {
                return HealthReport::fail(format!(
                    "Schema check failed: {}",
                    diagnose_connection_error(&e.to_string())
                ))
            }
        }
    }

    if missing.len() == REQUIRED_TABLES.len() {
        return HealthReport {
            missing_tables: missing,
            ..HealthReport::fail(
                "No telemetry tables found in database. Run `claude-telemetry health --init` to create them."
                    .to_string(),
            )
        };
    }

    if !missing.is_empty() {
        return HealthReport {
            message: Some(format!(
                "{} Schema incomplete, missing: {}. Run `claude-telemetry health --init` to migrate.",
                MESSAGE_PREFIX,
                missing.join(", ")
            )),
            missing_tables: missing,
            healthy: false,
        };
    }

    HealthReport::ok()
}

/// 把底层错误文本转成可操作的提示
pub fn diagnose_connection_error(error: &str) -> String {
    let lower = error.to_lowercase();

    if lower.contains("unable to open") || lower.contains("cannot open") {
        return format!(
            "Cannot open the telemetry database. Check that the directory exists and is writable \
             (set {} to override the location). ({})",
            crate::config::DB_URL_ENV,
            error
        );
    }

    if lower.contains("not a database") || lower.contains("malformed") {
        return format!(
            "The telemetry database file is corrupt or not a SQLite database. Move it aside to start fresh. ({})",
            error
        );
    }

    if lower.contains("locked") || lower.contains("busy") || lower.contains("timeout") {
        return format!(
            "The telemetry database is locked by another process. Retry shortly. ({})",
            error
        );
    }

    if lower.contains("readonly") || lower.contains("read-only") || lower.contains("permission") {
        return format!(
            "No permission to write the telemetry database. Check file ownership. ({})",
            error
        );
    }

    if lower.contains("disk") && lower.contains("full") {
        return format!("Disk is full, telemetry cannot be recorded. ({})", error);
    }

    format!("Database connection failed: {}", error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TelemetryDB;
    use tempfile::TempDir;

    #[test]
    fn test_healthy_after_connect() {
        let dir = TempDir::new().unwrap();
        let config = DbConfig::local(dir.path().join("t.db"));
        TelemetryDB::connect(config.clone()).unwrap();

        let report = check_health(&config);
        assert!(report.healthy, "{:?}", report.message);
        assert!(report.message.is_none());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let report = check_health(&DbConfig::local(dir.path().join("absent.db")));
        assert!(!report.healthy);
        assert!(report.message.unwrap().starts_with(MESSAGE_PREFIX));
    }

    #[test]
    fn test_empty_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path).unwrap().execute_batch("CREATE TABLE other (x);").unwrap();

        let report = check_health(&DbConfig::local(&path));
        assert!(!report.healthy);
        assert_eq!(report.missing_tables.len(), REQUIRED_TABLES.len());
        assert!(report.message.unwrap().contains("No telemetry tables"));
    }

    #[test]
    fn test_partial_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE sessions (id TEXT); CREATE TABLE hook_events (id INTEGER);")
            .unwrap();

        let report = check_health(&DbConfig::local(&path));
        assert!(!report.healthy);
        assert_eq!(report.missing_tables, vec!["tool_invocations", "messages", "token_usage"]);
        assert!(report.message.unwrap().contains("missing: tool_invocations, messages, token_usage"));
    }

    #[test]
    fn test_not_a_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let report = check_health(&DbConfig::local(&path));
        assert!(!report.healthy);
    }

    #[test]
    fn test_diagnose_connection_error() {
        assert!(diagnose_connection_error("unable to open database file").contains("Cannot open"));
        assert!(diagnose_connection_error("file is not a database").contains("corrupt"));
        assert!(diagnose_connection_error("database is locked").contains("locked"));
        assert!(diagnose_connection_error("attempt to write a readonly database").contains("permission"));
        assert!(diagnose_connection_error("database or disk is full").contains("Disk is full"));
        assert_eq!(
            diagnose_connection_error("weird"),
            "Database connection failed: weird"
        );
    }
}
