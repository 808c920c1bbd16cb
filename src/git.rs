//! Git 元数据采集
//!
//! 会话开始时记录分支/提交，会话结束时记录工作区相对 HEAD 的文件变更。
//! 采集失败只影响元数据，不影响事件入库。

use crate::db::GitChangeInput;
use crate::error::Result;
use crate::types::ChangeType;
use std::path::Path;

/// 分支和提交
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitInfo {
    pub branch: Option<String>,
    pub commit: Option<String>,
}

/// Git 探针
pub trait GitProbe: Send + Sync {
    /// 当前分支和短提交号，任一失败对应字段为 `None`
    fn branch_and_commit(&self, cwd: Option<&Path>) -> GitInfo;

    /// 工作区相对 HEAD 的文件变更
    fn changes(&self, cwd: Option<&Path>) -> Result<Vec<GitChangeInput>>;
}

/// 不采集 git 信息
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGit;

impl GitProbe for NoGit {
    fn branch_and_commit(&self, _cwd: Option<&Path>) -> GitInfo {
        GitInfo::default()
    }

    fn changes(&self, _cwd: Option<&Path>) -> Result<Vec<GitChangeInput>> {
        Ok(Vec::new())
    }
}

/// 调用 `git` 命令行
#[cfg(feature = "git")]
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCli;

#[cfg(feature = "git")]
impl GitCli {
    fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<Option<String>> {
        let mut cmd = std::process::Command::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd.output()?;
        if !output.status.success() {
            tracing::debug!(
                "git {:?} 失败 ({}): {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn run_trimmed(&self, cwd: Option<&Path>, args: &[&str]) -> Option<String> {
        match self.run(cwd, args) {
            Ok(out) => out.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                tracing::debug!("无法执行 git: {}", e);
                None
            }
        }
    }
}

#[cfg(feature = "git")]
impl GitProbe for GitCli {
    fn branch_and_commit(&self, cwd: Option<&Path>) -> GitInfo {
        GitInfo {
            branch: self.run_trimmed(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]),
            commit: self.run_trimmed(cwd, &["rev-parse", "--short", "HEAD"]),
        }
    }

    fn changes(&self, cwd: Option<&Path>) -> Result<Vec<GitChangeInput>> {
        Ok(self
            .run(cwd, &["diff", "--numstat", "HEAD"])?
            .map(|out| parse_numstat(&out))
            .unwrap_or_default())
    }
}

/// 默认探针：启用 `git` feature 时调用命令行，否则不采集
pub fn default_probe() -> Box<dyn GitProbe> {
    #[cfg(feature = "git")]
    {
        Box::new(GitCli)
    }
    #[cfg(not(feature = "git"))]
    {
        Box::new(NoGit)
    }
}

/// 解析 `git diff --numstat` 输出
///
/// 每行 `added\tdeleted\tpath`，二进制文件的行数为 `-`（按 0 计）。
/// 只有新增行视为 added，只有删除行视为 deleted，其余为 modified。
pub fn parse_numstat(output: &str) -> Vec<GitChangeInput> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let added = parts.next()?;
            let deleted = parts.next()?;
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }

            let count = |s: &str| -> Option<i64> {
                match s.trim() {
                    "-" => Some(0),
                    n => n.parse().ok(),
                }
            };
            let lines_added = count(added)?;
            let lines_deleted = count(deleted)?;

            let change_type = match (lines_added > 0, lines_deleted > 0) {
                (true, false) => ChangeType::Added,
                (false, true) => ChangeType::Deleted,
                _ => ChangeType::Modified,
            };

            Some(GitChangeInput {
                file_path: path.to_string(),
                change_type,
                lines_added,
                lines_deleted,
                diff_text: None,
            })
        })
        .collect()
}
