//! claude-telemetry-db - Claude Code hook 事件的持久化存储
//!
//! 每个 hook 事件由一个独立的短生命周期进程处理，进程之间不共享内存，
//! 所有协调都通过 SQLite 上的原子条件写入完成。
//!
//! # 核心功能
//!
//! - **会话解析**: Claude session_id → 唯一持久会话（并发首事件收敛）
//! - **工具调用关联**: PreToolUse / PostToolUse 配对，任意到达顺序
//! - **Transcript 增量入库**: 字节游标 + 唯一索引去重
//! - **故障隔离**: 存储不可用时返回中性响应，不阻塞工具调用
//!
//! # Feature Flags
//!
//! - `git`: 通过 git CLI 采集分支/提交/文件变更

pub mod config;
pub mod correlator;
pub mod db;
pub mod error;
pub mod git;
pub mod handler;
pub mod health;
pub mod ingest;
pub mod migrations;
pub mod pricing;
pub mod protocol;
pub mod schema;
pub mod session;
pub mod transcript;
pub mod types;

// Re-exports
pub use config::DbConfig;
pub use correlator::{BeginRecord, EndOutcome, EndRecord, InvocationRef};
pub use db::{counter, current_time_ms, GitChangeInput, NewEvent, TelemetryDB, WriteOutcome};
pub use error::{Error, Result};
pub use handler::{Failure, HandledEvent, Pipeline};
pub use health::{check_health, HealthReport};
pub use ingest::{IngestSummary, TranscriptBatch, TranscriptCursor};
pub use protocol::{EventBody, HookEvent, HookPayload, HookResponse};
pub use session::{SessionHandle, SessionMeta};
pub use transcript::{TranscriptRecord, UsageBlock};
pub use types::*;

#[cfg(feature = "git")]
pub use git::GitCli;
pub use git::{GitInfo, GitProbe, NoGit};
