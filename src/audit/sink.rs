//! 审计日志：单一有序追加流
//!
//! JsonlAuditLog 在一把 Mutex 下分配 seq、写一行并 sync_data，因此同一会话的条目顺序与动作尝试顺序一致，
//! 不同会话的条目可以交错但不会重排。写入失败绝不吞掉：返回 AuditWriteFailure 并以 error 级别记录。
//! 文件末尾若残留半行（写入中途失败或崩溃），下一条记录前先补换行，保证每行可独立解析。

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::entry::AuditEntry;
use crate::core::AgentError;

/// 审计汇：只有追加，没有更新或删除
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// 写入一条记录；底层不可用时返回 AuditWriteFailure
    async fn record(&self, entry: AuditEntry) -> Result<(), AgentError>;

    /// 探测是否可写；动作执行前调用，不可审计的动作不允许执行
    async fn check(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

struct JsonlState {
    file: Option<File>,
    next_seq: u64,
    /// 文件末尾是半行
    torn: bool,
}

/// 行式 JSON 审计日志文件
pub struct JsonlAuditLog {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlAuditLog {
    /// 打开（必要时创建）日志文件；seq 从已有最后一条继续
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| audit_failure(&path, e))?;
        }
        let next_seq = read_audit_log(&path)
            .await
            .map_err(|e| audit_failure(&path, e))?
            .iter()
            .map(|e| e.seq)
            .max()
            .map_or(1, |seq| seq + 1);
        let torn = !ends_with_newline(&path).await.map_err(|e| audit_failure(&path, e))?;
        let file = open_append(&path).await.map_err(|e| audit_failure(&path, e))?;
        Ok(Self {
            path,
            state: Mutex::new(JsonlState {
                file: Some(file),
                next_seq,
                torn,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

/// 空文件或不存在视为以换行结尾
async fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

fn audit_failure(path: &Path, e: impl std::fmt::Display) -> AgentError {
    tracing::error!(path = %path.display(), error = %e, "AUDIT LOG UNAVAILABLE");
    AgentError::AuditWriteFailure(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, mut entry: AuditEntry) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        entry.seq = state.next_seq;
        let mut line = serde_json::to_vec(&entry).map_err(|e| audit_failure(&self.path, e))?;
        line.push(b'\n');

        if state.file.is_none() {
            state.torn = !ends_with_newline(&self.path)
                .await
                .map_err(|e| audit_failure(&self.path, e))?;
            state.file = Some(open_append(&self.path).await.map_err(|e| audit_failure(&self.path, e))?);
        }
        if state.torn {
            line.insert(0, b'\n');
        }
        let result = match state.file.as_mut() {
            Some(file) => match file.write_all(&line).await {
                Ok(()) => file.sync_data().await,
                Err(e) => Err(e),
            },
            None => Err(std::io::Error::new(std::io::ErrorKind::Other, "audit file not open")),
        };
        if let Err(e) = result {
            // 下次写入时重新打开
            state.file = None;
            return Err(audit_failure(&self.path, e));
        }
        state.next_seq += 1;
        state.torn = false;
        Ok(())
    }

    async fn check(&self) -> Result<(), AgentError> {
        open_append(&self.path)
            .await
            .map(|_| ())
            .map_err(|e| audit_failure(&self.path, e))
    }
}

/// 逐行解析审计日志文件（每行独立，不依赖相邻行）
pub async fn read_audit_log(path: &Path) -> Result<Vec<AuditEntry>, AgentError> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AgentError::Storage(format!("{}: {}", path.display(), e))),
    };
    let mut entries = Vec::new();
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping malformed audit line");
            }
        }
    }
    Ok(entries)
}

/// 内存审计汇（测试用）；可切换为不可用以验证 fail-closed
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: std::sync::Mutex<Vec<AuditEntry>>,
    unavailable: AtomicBool,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> Result<(), AgentError> {
        if self.unavailable.load(Ordering::SeqCst) {
            tracing::error!("AUDIT LOG UNAVAILABLE (memory sink switched off)");
            return Err(AgentError::AuditWriteFailure("memory audit sink unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, mut entry: AuditEntry) -> Result<(), AgentError> {
        self.ensure_available()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AgentError::AuditWriteFailure("memory audit sink poisoned".to_string()))?;
        entry.seq = entries.len() as u64 + 1;
        entries.push(entry);
        Ok(())
    }

    async fn check(&self) -> Result<(), AgentError> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Outcome, Severity};

    fn entry(action: &str, session: &str) -> AuditEntry {
        AuditEntry::new(Severity::Info, "test", action, Outcome::Success).with_session(session)
    }

    #[tokio::test]
    async fn test_jsonl_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let log = JsonlAuditLog::open(&path).await.unwrap();
        log.record(entry("A", "s1")).await.unwrap();
        log.record(entry("B", "s2")).await.unwrap();
        log.record(entry("C", "s1")).await.unwrap();

        let entries = read_audit_log(&path).await.unwrap();
        let seqs: Vec<_> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        let s1: Vec<_> = entries
            .iter()
            .filter(|e| e.session_id.as_deref() == Some("s1"))
            .map(|e| e.action.as_str())
            .collect();
        assert_eq!(s1, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_seq_continues_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = JsonlAuditLog::open(&path).await.unwrap();
            log.record(entry("A", "s")).await.unwrap();
        }
        let log = JsonlAuditLog::open(&path).await.unwrap();
        log.record(entry("B", "s")).await.unwrap();
        let entries = read_audit_log(&path).await.unwrap();
        assert_eq!(entries.last().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_each_line_parses_independently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = JsonlAuditLog::open(&path).await.unwrap();
        log.record(entry("A", "s")).await.unwrap();
        log.record(entry("B", "s")).await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        for line in raw.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(v.get("timestamp").is_some());
            assert!(v.get("severity").is_some());
        }
    }

    #[tokio::test]
    async fn test_torn_tail_does_not_swallow_next_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut first = entry("A", "s");
        first.seq = 1;
        let mut raw = serde_json::to_string(&first).unwrap();
        raw.push('\n');
        raw.push_str(r#"{"seq":2,"timest"#);
        std::fs::write(&path, raw).unwrap();

        let log = JsonlAuditLog::open(&path).await.unwrap();
        log.record(entry("B", "s")).await.unwrap();
        log.record(entry("C", "s")).await.unwrap();

        let actions: Vec<_> = read_audit_log(&path)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.seq, e.action))
            .collect();
        assert_eq!(
            actions,
            vec![(1, "A".to_string()), (2, "B".to_string()), (3, "C".to_string())]
        );
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_unreadable_existing_log_is_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, [0xff, 0xfe, b'\n']).unwrap();

        let err = JsonlAuditLog::open(&path).await.err().unwrap();
        assert!(matches!(err, AgentError::AuditWriteFailure(_)));
    }

    #[tokio::test]
    async fn test_memory_sink_fails_loudly_when_unavailable() {
        let log = MemoryAuditLog::new();
        log.set_unavailable(true);
        assert!(matches!(
            log.record(entry("A", "s")).await.unwrap_err(),
            AgentError::AuditWriteFailure(_)
        ));
        assert!(log.check().await.is_err());
        assert!(log.entries().is_empty());
    }
}
