//! 会话记录
//!
//! 持久化格式：每个会话一条记录（id、创建/最后活跃时间、元数据、有序消息列表），
//! 序列化后再反序列化得到逻辑上完全相同的内容（时间戳保留完整精度）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{Message, Role};

/// 会话 ID（不透明字符串）
pub type SessionId = String;

/// 会话元数据（来源、外部聊天 ID 等）
pub type Metadata = BTreeMap<String, String>;

const TITLE_PREVIEW_CHARS: usize = 60;

/// 单个会话：消息只追加、不修改
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            created_at: now,
            last_active: now,
            metadata,
            messages: Vec::new(),
        }
    }

    /// 追加消息并刷新最后活跃时间（last_active 不回退）
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        let now = Utc::now();
        if now > self.last_active {
            self.last_active = now;
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let title = self
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| {
                let preview: String = m.content.chars().take(TITLE_PREVIEW_CHARS).collect();
                if m.content.chars().count() > TITLE_PREVIEW_CHARS {
                    format!("{}...", preview)
                } else {
                    preview
                }
            });
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            last_active: self.last_active,
            message_count: self.messages.len(),
            metadata: self.metadata.clone(),
            title,
        }
    }
}

/// 会话摘要（供 listSessions 展示）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: usize,
    pub metadata: Metadata,
    pub title: Option<String>,
}
