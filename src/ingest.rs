//! Transcript 增量入库
//!
//! 游标 `(transcript_offset, transcript_lines, transcript_file_id)` 保存在会话行上。
//! 每次只读取游标之后的完整行；半行留到下一次。消息、token 用量和游标推进
//! 在同一个事务里提交，游标推进是条件更新：并发的另一次入库先推进了游标时，
//! 本批回滚并标记为 stale。

use crate::db::{current_time_ms, TelemetryDB};
use crate::error::Result;
use crate::pricing;
use crate::transcript::{self, TranscriptRecord};
use rusqlite::{params, TransactionBehavior};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// 会话上的 transcript 游标
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptCursor {
    /// 已入库的字节数
    pub offset: u64,
    /// 已入库的完整行数
    pub lines: i64,
    /// 文件标识指纹
    pub file_id: Option<String>,
}

/// 一次读取的结果（尚未入库）
#[derive(Debug, Clone)]
pub struct TranscriptBatch {
    /// 读取时数据库中的游标
    pub base: TranscriptCursor,
    /// 入库成功后的游标
    pub next: TranscriptCursor,
    /// 文件被替换或截断，从头重读
    pub reset: bool,
    /// 消耗的完整行（含跳过的行）
    pub lines_consumed: usize,
    pub records: Vec<TranscriptRecord>,
}

impl TranscriptBatch {
    fn moves_cursor(&self) -> bool {
        self.base != self.next
    }
}

/// 入库结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub messages_inserted: usize,
    pub messages_duplicate: usize,
    pub usage_inserted: usize,
    pub usage_duplicate: usize,
    /// 消耗的完整行
    pub lines_consumed: usize,
    /// 入库后的字节游标
    pub offset: u64,
    /// 入库后的行游标
    pub total_lines: i64,
    pub reset: bool,
    /// 游标已被并发入库推进，本批已回滚
    pub stale: bool,
}

/// 从某个字节位置开始，按行读取追加内容
///
/// 只产出以 `\n` 结尾的完整行，附带读完该行后的字节位置。
/// 末尾没有换行的半行不产出。
pub struct AppendedLines<R> {
    reader: R,
    offset: u64,
    buf: Vec<u8>,
}

impl AppendedLines<BufReader<File>> {
    /// 打开文件并定位到 `offset`
    pub fn open(path: &Path, offset: u64) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self::new(BufReader::new(file), offset))
    }
}

impl<R: BufRead> AppendedLines<R> {
    pub fn new(reader: R, offset: u64) -> Self {
        Self {
            reader,
            offset,
            buf: Vec::new(),
        }
    }

    /// 已产出行之后的字节位置
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<R: BufRead> Iterator for AppendedLines<R> {
    type Item = std::io::Result<(String, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(n) => {
                if self.buf.last() != Some(&b'\n') {
                    // 写了一半的行
                    return None;
                }
                self.offset += n as u64;
                let line = String::from_utf8_lossy(&self.buf[..n - 1]).into_owned();
                Some(Ok((line, self.offset)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// 文件标识指纹 (inode / file index)
pub fn file_fingerprint(path: &Path) -> Option<String> {
    match file_id::get_file_id(path) {
        Ok(id) => Some(format!("{:?}", id)),
        Err(e) => {
            tracing::debug!("无法获取文件标识 {:?}: {}", path, e);
            None
        }
    }
}

/// 读取游标之后的新记录
///
/// 文件标识变化或文件比游标短时从 0 重新读取，依赖唯一索引去重。
pub fn read_appended(path: &Path, base: &TranscriptCursor) -> Result<TranscriptBatch> {
    let len = std::fs::metadata(path)?.len();
    let fingerprint = file_fingerprint(path);

    let replaced = matches!(
        (&base.file_id, &fingerprint),
        (Some(old), Some(new)) if old != new
    );
    let truncated = len < base.offset;
    let reset = replaced || truncated;

    if reset {
        tracing::info!(
            "transcript 被替换或截断，从头读取: {:?} (replaced={}, truncated={})",
            path,
            replaced,
            truncated
        );
    }

    let (start, start_lines) = if reset { (0, 0) } else { (base.offset, base.lines) };

    let mut lines = AppendedLines::open(path, start)?;
    let mut records = Vec::new();
    let mut consumed = 0usize;

    for item in &mut lines {
        let (line, _) = item?;
        consumed += 1;
        if let Some(record) = transcript::parse_line(&line) {
            records.push(record);
        }
    }

    let next = TranscriptCursor {
        offset: lines.offset(),
        lines: start_lines + consumed as i64,
        file_id: fingerprint.or_else(|| base.file_id.clone()),
    };

    Ok(TranscriptBatch {
        base: base.clone(),
        next,
        reset,
        lines_consumed: consumed,
        records,
    })
}

impl TelemetryDB {
    /// 读取会话的 transcript 游标
    pub fn transcript_cursor(&self, session_id: &str) -> Result<TranscriptCursor> {
        let conn = self.conn.lock();
        let (offset, lines, file_id): (i64, i64, Option<String>) = conn.query_row(
            "SELECT transcript_offset, transcript_lines, transcript_file_id FROM sessions WHERE id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(TranscriptCursor {
            offset: offset.max(0) as u64,
            lines,
            file_id,
        })
    }

    /// 增量入库 transcript
    ///
    /// 文件不存在时返回空结果（transcript 可能尚未写出）。
    pub fn ingest_transcript(
        &self,
        session_id: &str,
        path: &Path,
        trigger_event_id: Option<i64>,
    ) -> Result<IngestSummary> {
        if !path.exists() {
            tracing::debug!("transcript 不存在，跳过: {:?}", path);
            let cursor = self.transcript_cursor(session_id)?;
            return Ok(IngestSummary {
                offset: cursor.offset,
                total_lines: cursor.lines,
                ..Default::default()
            });
        }

        let base = self.transcript_cursor(session_id)?;
        let batch = read_appended(path, &base)?;
        self.commit_transcript_batch(session_id, &batch, trigger_event_id)
    }

    /// 把一批记录和游标推进一起提交
    ///
    /// 去重依赖 message uuid。没有 uuid 的用量不入库，否则游标重置后会重复计费；
    /// 没有 uuid 的消息照常写入，重置后可能重复出现。
    pub fn commit_transcript_batch(
        &self,
        session_id: &str,
        batch: &TranscriptBatch,
        trigger_event_id: Option<i64>,
    ) -> Result<IngestSummary> {
        let mut summary = IngestSummary {
            lines_consumed: batch.lines_consumed,
            offset: batch.next.offset,
            total_lines: batch.next.lines,
            reset: batch.reset,
            ..Default::default()
        };

        if !batch.moves_cursor() {
            return Ok(summary);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        {
            let mut insert_message = tx.prepare_cached(
                r#"
                INSERT INTO messages (session_id, message_uuid, parent_uuid, role, content, content_blocks_json,
                                      thinking_content, model, timestamp, trigger_event_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT DO NOTHING
                "#,
            )?;
            let mut insert_usage = tx.prepare_cached(
                r#"
                INSERT INTO token_usage (session_id, message_uuid, model, input_tokens, output_tokens,
                                         cache_creation_tokens, cache_read_tokens, service_tier, estimated_cost_usd)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT DO NOTHING
                "#,
            )?;

            for rec in &batch.records {
                let n = insert_message.execute(params![
                    session_id,
                    &rec.message_uuid,
                    &rec.parent_uuid,
                    rec.role.to_string(),
                    &rec.content,
                    &rec.content_blocks_json,
                    &rec.thinking_content,
                    &rec.model,
                    rec.timestamp,
                    trigger_event_id,
                ])?;
                if n > 0 {
                    summary.messages_inserted += 1;
                } else {
                    summary.messages_duplicate += 1;
                }

                if let (Some(usage), Some(_)) = (&rec.usage, &rec.message_uuid) {
                    let cost = pricing::estimate_cost(
                        rec.model.as_deref(),
                        usage.service_tier.as_deref(),
                        usage,
                    );
                    let n = insert_usage.execute(params![
                        session_id,
                        &rec.message_uuid,
                        &rec.model,
                        usage.input_tokens,
                        usage.output_tokens,
                        usage.cache_creation_tokens,
                        usage.cache_read_tokens,
                        &usage.service_tier,
                        cost,
                    ])?;
                    if n > 0 {
                        summary.usage_inserted += 1;
                    } else {
                        summary.usage_duplicate += 1;
                    }
                }
            }
        }

        let advanced = tx.execute(
            r#"
            UPDATE sessions SET
                transcript_offset = ?1,
                transcript_lines = ?2,
                transcript_file_id = ?3,
                updated_at = ?4
            WHERE id = ?5 AND transcript_offset = ?6 AND transcript_lines = ?7
              AND transcript_file_id IS ?8
            "#,
            params![
                batch.next.offset as i64,
                batch.next.lines,
                &batch.next.file_id,
                current_time_ms(),
                session_id,
                batch.base.offset as i64,
                batch.base.lines,
                &batch.base.file_id,
            ],
        )?;

        if advanced == 0 {
            // drop 时回滚
            drop(tx);
            tracing::debug!(
                "transcript 游标已被并发推进，放弃本批: session={}, base_offset={}",
                session_id,
                batch.base.offset
            );
            return Ok(IngestSummary {
                stale: true,
                lines_consumed: batch.lines_consumed,
                reset: batch.reset,
                offset: batch.base.offset,
                total_lines: batch.base.lines,
                ..Default::default()
            });
        }

        tx.commit()?;

        tracing::debug!(
            "transcript 入库: session={}, inserted={}, duplicate={}, usage={}, offset={}",
            session_id,
            summary.messages_inserted,
            summary.messages_duplicate,
            summary.usage_inserted,
            summary.offset
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &str, offset: u64) -> (Vec<(String, u64)>, u64) {
        let mut lines = AppendedLines::new(Cursor::new(input.as_bytes().to_vec()), offset);
        let items = (&mut lines).map(|r| r.unwrap()).collect();
        (items, lines.offset())
    }

    #[test]
    fn test_appended_lines_complete_only() {
        let (items, end) = collect("a\nbb\nccc", 0);
        assert_eq!(items, vec![("a".to_string(), 2), ("bb".to_string(), 5)]);
        assert_eq!(end, 5);
    }

    #[test]
    fn test_appended_lines_base_offset() {
        let (items, end) = collect("x\n\ny\n", 10);
        assert_eq!(
            items,
            vec![("x".to_string(), 12), ("".to_string(), 13), ("y".to_string(), 15)]
        );
        assert_eq!(end, 15);
    }

    #[test]
    fn test_appended_lines_empty() {
        let (items, end) = collect("", 7);
        assert!(items.is_empty());
        assert_eq!(end, 7);

        let (items, end) = collect("partial", 0);
        assert!(items.is_empty());
        assert_eq!(end, 0);
    }

    #[test]
    fn test_read_appended_skips_non_messages() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"type":"user","uuid":"u1","message":{"content":"hi"}}"#,
                "\n",
                r#"{"type":"progress"}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"type":"user","uuid":"u2","message":{"content":"half"#,
            ),
        )
        .unwrap();

        let batch = read_appended(&path, &TranscriptCursor::default()).unwrap();
        assert_eq!(batch.lines_consumed, 4);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.next.lines, 4);
        assert!(!batch.reset);
        assert!(batch.next.file_id.is_some());
    }

    #[test]
    fn test_read_appended_truncated_resets() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{\"type\":\"progress\"}\n").unwrap();

        let base = TranscriptCursor {
            offset: 10_000,
            lines: 50,
            file_id: file_fingerprint(&path),
        };
        let batch = read_appended(&path, &base).unwrap();
        assert!(batch.reset);
        assert_eq!(batch.next.lines, 1);
        assert_eq!(batch.next.offset, 20);
    }

    #[test]
    fn test_read_appended_replaced_file_resets() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{}\n{}\n").unwrap();

        let base = TranscriptCursor {
            offset: 3,
            lines: 1,
            file_id: Some("other-file".to_string()),
        };
        let batch = read_appended(&path, &base).unwrap();
        assert!(batch.reset);
        assert_eq!(batch.next.offset, 6);
        assert_eq!(batch.next.lines, 2);
    }
}
