use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ModelError;

// --- Identifiers ---

/// Server-assigned identifier. Never empty.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ModelError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ModelError::EmptyField("id"));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type ChatId = EntityId;

/// Client-generated id of a provisional message, distinct from any server id.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TempId(Uuid);

impl TempId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

fn require_text(field: &'static str, value: impl Into<String>) -> Result<String, ModelError> {
    let value = value.into();
    if value.trim().is_empty() {
        return Err(ModelError::EmptyField(field));
    }
    Ok(value)
}

// --- Chat messages ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Coach,
    Assistant,
    System,
}

/// A message the backend has persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedMessage {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ProvisionalStatus {
    Pending,
    Failed { error: String },
}

/// A locally created message shown before the backend confirms it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionalMessage {
    pub temp_id: TempId,
    pub chat_id: ChatId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: ProvisionalStatus,
}

impl ProvisionalMessage {
    pub fn pending(chat_id: ChatId, content: String) -> Self {
        Self {
            temp_id: TempId::generate(),
            chat_id,
            content,
            created_at: Utc::now(),
            status: ProvisionalStatus::Pending,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ProvisionalStatus::Failed { .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Entry of the visible message list.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChatMessage {
    Provisional(ProvisionalMessage),
    Confirmed(ConfirmedMessage),
}

impl ChatMessage {
    pub fn status(&self) -> MessageStatus {
        match self {
            ChatMessage::Confirmed(_) => MessageStatus::Confirmed,
            ChatMessage::Provisional(p) => match p.status {
                ProvisionalStatus::Pending => MessageStatus::Pending,
                ProvisionalStatus::Failed { .. } => MessageStatus::Failed,
            },
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ChatMessage::Provisional(p) => &p.content,
            ChatMessage::Confirmed(c) => &c.content,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            // Provisional messages are always sent by the local user
            ChatMessage::Provisional(_) => Role::Client,
            ChatMessage::Confirmed(c) => c.role,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub has_more: bool,
}

// --- Flow entities ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chatbot {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub name: String,
}

impl Chatbot {
    pub fn new(id: &str, name: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: EntityId::new(id)?,
            name: require_text("name", name)?,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Program {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub name: String,
}

impl Program {
    pub fn new(id: &str, name: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: EntityId::new(id)?,
            name: require_text("name", name)?,
        })
    }
}

/// A coaching session attached to the selected program.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: &str, title: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: EntityId::new(id)?,
            title: require_text("title", title)?,
            scheduled_at: None,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KnowledgeBase {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub name: String,
}

impl KnowledgeBase {
    pub fn new(id: &str, name: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: EntityId::new(id)?,
            name: require_text("name", name)?,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl Document {
    pub fn new(id: &str, name: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: EntityId::new(id)?,
            name: require_text("name", name)?,
            size_bytes: None,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HumanMimicryStyle {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HumanMimicryStyle {
    pub fn new(id: &str, name: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: EntityId::new(id)?,
            name: require_text("name", name)?,
            description: None,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Prompt {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub name: String,
    pub content: String,
}

impl Prompt {
    pub fn new(id: &str, name: &str, content: &str) -> Result<Self, ModelError> {
        Ok(Self {
            id: EntityId::new(id)?,
            name: require_text("name", name)?,
            content: require_text("content", content)?,
        })
    }
}

// --- Training jobs ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TrainingStatus {
    /// The job still needs polling.
    pub fn is_active(self) -> bool {
        matches!(self, TrainingStatus::Pending | TrainingStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Snapshot of a training job owned by the backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJob {
    #[serde(rename = "_id", alias = "id")]
    pub id: EntityId,
    pub chatbot_id: EntityId,
    pub status: TrainingStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrainingJob {
    pub fn new(
        id: &str,
        chatbot_id: &str,
        status: TrainingStatus,
        progress: u8,
    ) -> Result<Self, ModelError> {
        let job = Self {
            id: EntityId::new(id)?,
            chatbot_id: EntityId::new(chatbot_id)?,
            status,
            progress,
            error_message: None,
            started_at: None,
            completed_at: None,
        };
        job.validate()?;
        Ok(job)
    }

    /// Checks invariants of snapshots received from the backend.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.progress > 100 {
            return Err(ModelError::ProgressOutOfRange(self.progress));
        }
        Ok(())
    }
}
