//! 数据库 Schema 定义

/// 连接级 PRAGMA（每次打开连接执行）
pub const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
"#;

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Sessions 表
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,              -- UUID v4，持久会话 ID
    claude_session_id TEXT,           -- Claude 的 session_id（旧事件可能为空）
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    cwd TEXT,
    project_name TEXT,
    model TEXT,
    git_branch TEXT,
    git_commit TEXT,
    -- transcript 增量游标
    transcript_offset INTEGER NOT NULL DEFAULT 0,  -- 已入库的字节数
    transcript_lines INTEGER NOT NULL DEFAULT 0,   -- 已入库的完整行数
    transcript_file_id TEXT,                        -- 游标对应的文件标识
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- Hook 事件表（写入后不可变）
CREATE TABLE IF NOT EXISTS hook_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    event_kind TEXT NOT NULL,
    occurred_at INTEGER NOT NULL,
    raw_json TEXT NOT NULL,
    claude_session_id TEXT,
    transcript_path TEXT,
    cwd TEXT,
    permission_mode TEXT
);

-- 工具调用表（begin/end 关联）
CREATE TABLE IF NOT EXISTS tool_invocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES hook_events(id),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    tool_name TEXT NOT NULL,
    tool_use_id TEXT,                 -- 关联键
    started_at INTEGER,               -- 无头行为 NULL
    completed_at INTEGER,             -- NULL = Pending
    duration_ms INTEGER,
    tool_input_json TEXT,
    tool_result TEXT,
    was_blocked INTEGER NOT NULL DEFAULT 0,
    block_reason TEXT
);

-- Messages 表（transcript 解析结果）
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    message_uuid TEXT,
    parent_uuid TEXT,
    role TEXT NOT NULL,               -- user | assistant | system
    content TEXT,
    content_blocks_json TEXT,
    thinking_content TEXT,
    model TEXT,
    timestamp INTEGER,
    trigger_event_id INTEGER REFERENCES hook_events(id)
);

-- Token 用量表
CREATE TABLE IF NOT EXISTS token_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    message_uuid TEXT,
    model TEXT,
    input_tokens INTEGER,
    output_tokens INTEGER,
    cache_creation_tokens INTEGER,
    cache_read_tokens INTEGER,
    service_tier TEXT,
    estimated_cost_usd REAL
);

-- Git 变更表（会话结束时写入）
CREATE TABLE IF NOT EXISTS git_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    file_path TEXT NOT NULL,
    change_type TEXT NOT NULL,        -- added | modified | deleted
    lines_added INTEGER NOT NULL DEFAULT 0,
    lines_deleted INTEGER NOT NULL DEFAULT 0,
    diff_text TEXT,
    recorded_at INTEGER NOT NULL
);

-- 事件明细表
CREATE TABLE IF NOT EXISTS user_prompts (
    event_id INTEGER PRIMARY KEY REFERENCES hook_events(id),
    prompt_text TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stop_events (
    event_id INTEGER PRIMARY KEY REFERENCES hook_events(id),
    reason TEXT
);

CREATE TABLE IF NOT EXISTS subagent_events (
    event_id INTEGER PRIMARY KEY REFERENCES hook_events(id),
    agent_type TEXT NOT NULL,
    task_description TEXT,
    result TEXT,
    tool_use_id TEXT
);

CREATE TABLE IF NOT EXISTS compact_events (
    event_id INTEGER PRIMARY KEY REFERENCES hook_events(id),
    summary_content TEXT
);

CREATE TABLE IF NOT EXISTS notification_events (
    event_id INTEGER PRIMARY KEY REFERENCES hook_events(id),
    notification_type TEXT,
    notification_content TEXT
);

-- 诊断计数器
CREATE TABLE IF NOT EXISTS telemetry_counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL DEFAULT 0
);

-- 唯一索引（去重 / 并发收敛）
CREATE UNIQUE INDEX IF NOT EXISTS ux_sessions_claude_session
    ON sessions(claude_session_id) WHERE claude_session_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS ux_tool_invocations_pending
    ON tool_invocations(session_id, tool_use_id)
    WHERE completed_at IS NULL AND tool_use_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS ux_messages_uuid
    ON messages(message_uuid) WHERE message_uuid IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS ux_token_usage_uuid
    ON token_usage(message_uuid) WHERE message_uuid IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS ux_git_changes_file
    ON git_changes(session_id, file_path);

-- 查询索引
CREATE INDEX IF NOT EXISTS idx_sessions_open_cwd ON sessions(cwd, started_at DESC) WHERE ended_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_hook_events_session_time ON hook_events(session_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_messages_session_time ON messages(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_tool_invocations_key ON tool_invocations(tool_use_id);
CREATE INDEX IF NOT EXISTS idx_token_usage_session ON token_usage(session_id);
"#;

/// 健康检查要求存在的核心表
pub const REQUIRED_TABLES: &[&str] = &[
    "sessions",
    "hook_events",
    "tool_invocations",
    "messages",
    "token_usage",
];
