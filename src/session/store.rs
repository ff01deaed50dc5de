//! 会话存储抽象层
//!
//! 统一的会话 CRUD 接口，支持持久化（每会话一个 JSON 文件）与内存两种实现。
//! 并发约束：同一会话的 append 由该会话的 Mutex 串行化（tokio Mutex 公平排队，按到达顺序生效）；
//! 不同会话各自持锁，互不阻塞。持久化实现先落盘再更新内存，append 返回时数据已持久。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::model::{Metadata, Session, SessionId};
use crate::core::AgentError;
use crate::memory::{read_json, write_json_durable, Message};

/// 会话存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 创建新会话（生成新的唯一 ID）
    async fn create(&self, metadata: Metadata) -> Result<Session, AgentError>;

    /// 获取会话快照；未知 ID 返回 SessionNotFound
    async fn get(&self, id: &str) -> Result<Session, AgentError>;

    /// 追加一条消息，返回追加后的会话；未知 ID 返回 SessionNotFound
    async fn append(&self, id: &str, message: Message) -> Result<Session, AgentError>;

    /// 全部会话，按最后活跃时间倒序
    async fn list(&self) -> Result<Vec<Session>, AgentError>;
}

/// 会话槽位：map 级读写锁 + 每会话一把 Mutex
struct SessionManager {
    slots: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    /// None 表示纯内存
    dir: Option<PathBuf>,
}

impl SessionManager {
    fn new(dir: Option<PathBuf>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            dir,
        }
    }

    async fn persist(&self, session: &Session) -> Result<(), AgentError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", session.id));
        write_json_durable(&path, session).await.map_err(|e| {
            AgentError::Storage(format!("failed to persist session {}: {}", session.id, e))
        })
    }

    async fn slot(&self, id: &str) -> Result<Arc<Mutex<Session>>, AgentError> {
        self.slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
    }

    async fn create(&self, metadata: Metadata) -> Result<Session, AgentError> {
        let session = Session::new(metadata);
        self.persist(&session).await?;
        self.slots
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        tracing::info!(session_id = %session.id, "session created");
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Session, AgentError> {
        let slot = self.slot(id).await?;
        let session = slot.lock().await;
        Ok(session.clone())
    }

    async fn append(&self, id: &str, message: Message) -> Result<Session, AgentError> {
        let slot = self.slot(id).await?;
        let mut guard = slot.lock().await;
        let mut next = guard.clone();
        next.push(message);
        // 落盘成功后才替换内存副本
        self.persist(&next).await?;
        *guard = next;
        Ok(guard.clone())
    }

    async fn list(&self) -> Vec<Session> {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            sessions.push(slot.lock().await.clone());
        }
        sessions.sort_by(|a, b| {
            b.last_active
                .cmp(&a.last_active)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    async fn insert_loaded(&self, session: Session) {
        self.slots
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session)));
    }
}

/// 内存会话存储（测试与嵌入式场景；进程退出即丢失）
pub struct MemorySessionStore {
    inner: SessionManager,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: SessionManager::new(None),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, metadata: Metadata) -> Result<Session, AgentError> {
        self.inner.create(metadata).await
    }

    async fn get(&self, id: &str) -> Result<Session, AgentError> {
        self.inner.get(id).await
    }

    async fn append(&self, id: &str, message: Message) -> Result<Session, AgentError> {
        self.inner.append(id, message).await
    }

    async fn list(&self) -> Result<Vec<Session>, AgentError> {
        Ok(self.inner.list().await)
    }
}

/// 持久化会话存储：目录下每个会话一个 `<id>.json`
pub struct FileSessionStore {
    inner: SessionManager,
}

impl FileSessionStore {
    /// 打开（必要时创建）会话目录并加载已有会话；损坏的文件跳过并告警
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            AgentError::Storage(format!("cannot create sessions dir {}: {}", dir.display(), e))
        })?;
        let store = Self {
            inner: SessionManager::new(Some(dir.clone())),
        };

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            AgentError::Storage(format!("cannot read sessions dir {}: {}", dir.display(), e))
        })?;
        let mut loaded = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Session>(&path).await {
                Ok(Some(session)) => {
                    store.inner.insert_loaded(session).await;
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed session file");
                }
            }
        }
        tracing::info!(dir = %dir.display(), loaded, "session store opened");
        Ok(store)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, metadata: Metadata) -> Result<Session, AgentError> {
        self.inner.create(metadata).await
    }

    async fn get(&self, id: &str) -> Result<Session, AgentError> {
        self.inner.get(id).await
    }

    async fn append(&self, id: &str, message: Message) -> Result<Session, AgentError> {
        self.inner.append(id, message).await
    }

    async fn list(&self) -> Result<Vec<Session>, AgentError> {
        Ok(self.inner.list().await)
    }
}
