//! claude-telemetry - Claude Code hook 入口
//!
//! - `claude-telemetry hook <EventKind>`: stdin 读 payload，stdout 写响应，始终退出码 0
//! - `claude-telemetry health`: 检查存储
//! - `claude-telemetry stats`: 打印统计
//!
//! stdout 只留给 hook 响应，日志一律写 stderr。

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use claude_telemetry_db::{
    check_health, counter, config::DB_URL_ENV, DbConfig, EventKind, HookResponse, Pipeline,
    TelemetryDB,
};
use std::io::{Read, Write};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志过滤环境变量
const LOG_ENV: &str = "CLAUDE_TELEMETRY_LOG";

#[derive(Parser)]
#[command(name = "claude-telemetry", version, about = "Record Claude Code hook events into a local telemetry store")]
struct Cli {
    /// 数据库路径或 sqlite:// URL
    #[arg(long, global = true, env = DB_URL_ENV)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 处理一个 hook 事件（stdin → stdout）
    Hook {
        /// 事件类型，例如 PreToolUse
        kind: String,
    },
    /// 检查存储是否可用
    Health {
        /// 先创建/迁移 schema
        #[arg(long)]
        init: bool,
    },
    /// 打印统计信息
    Stats,
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            if !e.use_stderr() {
                // --help / --version
                std::process::exit(0);
            }
            // hook 的退出码 2 会被当作阻断，参数错误也只能回中性响应
            match fallback_response(args.get(1..).unwrap_or_default()) {
                Some(response) => {
                    write_response(&response);
                    std::process::exit(0);
                }
                None => std::process::exit(2),
            }
        }
    };

    let config = match cli.db.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(url) => DbConfig::from_url(url),
        None => DbConfig::from_env(),
    };

    let code = match cli.command {
        Command::Hook { kind } => {
            run_hook(config, &kind);
            0
        }
        Command::Health { init } => match run_health(config, init) {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(e) => {
                eprintln!("{:#}", e);
                1
            }
        },
        Command::Stats => match run_stats(config) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{:#}", e);
                1
            }
        },
    };

    std::process::exit(code);
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init();
}

/// 处理 hook：任何失败都输出中性响应
fn run_hook(config: DbConfig, kind: &str) {
    let response = match kind.parse::<EventKind>() {
        Ok(kind) => {
            let mut raw = String::new();
            match std::io::stdin().read_to_string(&mut raw) {
                Ok(_) => Pipeline::new(config).handle(kind, &raw),
                Err(e) => {
                    tracing::error!("读取 stdin 失败: {}", e);
                    HookResponse::benign(kind)
                }
            }
        }
        Err(e) => {
            tracing::warn!("{}", e);
            HookResponse::empty()
        }
    };

    write_response(&response);
}

fn write_response(response: &HookResponse) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", response.to_json());
    let _ = stdout.flush();
}

/// 参数解析失败时的 hook 响应；不是 hook 调用时返回 None
fn fallback_response(args: &[String]) -> Option<HookResponse> {
    let pos = args.iter().position(|a| a == "hook")?;
    let kind = args[pos + 1..]
        .iter()
        .find(|a| !a.starts_with('-'))
        .and_then(|a| a.parse::<EventKind>().ok());
    Some(match kind {
        Some(kind) => HookResponse::benign(kind),
        None => HookResponse::empty(),
    })
}

fn run_health(config: DbConfig, init: bool) -> Result<bool> {
    if init {
        TelemetryDB::connect(config.clone())
            .with_context(|| format!("无法初始化数据库 {}", config.url))?;
    }

    let report = check_health(&config);
    if report.healthy {
        println!("ok: {}", config.url);
    } else if let Some(msg) = &report.message {
        println!("{}", msg);
    }
    Ok(report.healthy)
}

fn run_stats(config: DbConfig) -> Result<()> {
    let db = TelemetryDB::connect(config.clone())
        .with_context(|| format!("无法打开数据库 {}", config.url))?;
    let stats = db.get_stats()?;

    println!("database:            {}", config.url);
    println!("sessions:            {}", stats.session_count);
    println!("events:              {}", stats.event_count);
    println!("tool invocations:    {}", stats.invocation_count);
    println!("  pending:           {}", stats.pending_invocation_count);
    println!("messages:            {}", stats.message_count);
    println!("token usage records: {}", stats.token_usage_count);
    println!("correlation misses:  {}", db.get_counter(counter::CORRELATION_MISS)?);
    println!("degraded sessions:   {}", db.get_counter(counter::DEGRADED_RESOLUTION)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fallback_response() {
        assert_eq!(
            fallback_response(&args(&["hook", "PreToolUse", "--bogus"])),
            Some(HookResponse::allow())
        );
        assert_eq!(
            fallback_response(&args(&["--db", "/tmp/t.db", "hook", "--bogus", "PostToolUse"])),
            Some(HookResponse::empty())
        );
        assert_eq!(fallback_response(&args(&["hook"])), Some(HookResponse::empty()));
        assert_eq!(fallback_response(&args(&["stats", "--bogus"])), None);
    }
}
