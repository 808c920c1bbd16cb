//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 连接错误 (存储不可达)
    #[error("连接错误: {0}")]
    Connection(String),
}

impl Error {
    /// 是否为存储不可达类错误（打不开、被锁、只读、磁盘满）
    pub fn is_store_unreachable(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::ReadOnly
                    | rusqlite::ErrorCode::DiskFull
                    | rusqlite::ErrorCode::PermissionDenied
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_constraint_error_is_not_unreachable() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();

        let err: Error = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(!err.is_store_unreachable());
    }

    #[test]
    fn test_connection_error_is_unreachable() {
        assert!(Error::Connection("refused".into()).is_store_unreachable());
        assert!(!Error::Config("empty".into()).is_store_unreachable());
    }
}
