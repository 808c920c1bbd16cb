//! 数据库配置

use std::path::PathBuf;

/// 连接描述符环境变量
pub const DB_URL_ENV: &str = "CLAUDE_TELEMETRY_DB_URL";

/// 默认 busy 等待时间 (毫秒)
///
/// 多个 hook 进程并发写同一个库时，SQLite 在这个时间内排队等锁。
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// 连接描述符
    /// - 直接路径: "/path/to/telemetry.db"
    /// - URL: "sqlite:///path/to/telemetry.db"
    pub url: String,

    /// 锁等待超时 (毫秒)
    pub busy_timeout_ms: u64,
}

impl DbConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    /// 从连接描述符创建配置
    pub fn from_url(url: &str) -> Self {
        match url.strip_prefix("sqlite://") {
            Some(path) => Self::local(path),
            None => Self::local(url),
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(url) = std::env::var(DB_URL_ENV) {
            if !url.trim().is_empty() {
                return Self::from_url(url.trim());
            }
        }

        // 默认路径: ~/.claude-telemetry/telemetry.db
        let default_path = dirs::home_dir()
            .map(|h| h.join(".claude-telemetry").join("telemetry.db"))
            .unwrap_or_else(|| PathBuf::from("claude-telemetry.db"));

        Self::local(default_path)
    }

    /// 设置锁等待超时
    pub fn with_busy_timeout_ms(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// 获取数据库文件路径
    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.url)
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_strips_scheme() {
        let config = DbConfig::from_url("sqlite:///tmp/telemetry.db");
        assert_eq!(config.path(), PathBuf::from("/tmp/telemetry.db"));

        let config = DbConfig::from_url("/var/data/t.db");
        assert_eq!(config.url, "/var/data/t.db");
    }

    #[test]
    fn test_busy_timeout_override() {
        let config = DbConfig::local("/tmp/x.db").with_busy_timeout_ms(10);
        assert_eq!(config.busy_timeout_ms, 10);
    }
}
