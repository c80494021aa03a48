use crate::entity::{Sender, UserIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(content: impl Into<String>, sender: Sender) -> Self {
        Self {
            content: content.into(),
            sender,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(content, Sender::User)
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Self::new(content, Sender::Bot)
    }

    /// Non-blank lines of the message, the way the widget lays out paragraphs.
    pub fn paragraphs(&self) -> impl Iterator<Item = &str> {
        self.content.lines().filter(|line| !line.trim().is_empty())
    }
}

/// One outbound chat turn with the full conversation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_name: String,
    pub user_email: String,
    pub user_phone: String,
    pub conversation_id: String,
    pub is_new_conversation: bool,
    pub message_count: u64,
    pub conversation_started_at: String,
}

/// Start/end telemetry sent outside of chat turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleMarker {
    ConversationStart {
        conversation_id: String,
        user_name: String,
        user_email: String,
        user_phone: String,
        timestamp: DateTime<Utc>,
        source: String,
    },
    ConversationEnd {
        conversation_id: String,
        total_messages: u64,
        /// Seconds since the conversation started.
        conversation_duration: i64,
        ended_at: DateTime<Utc>,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_email: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_phone: Option<String>,
    },
}

impl LifecycleMarker {
    pub fn start(conversation_id: String, identity: &UserIdentity, source: &str) -> Self {
        LifecycleMarker::ConversationStart {
            conversation_id,
            user_name: identity.name.clone(),
            user_email: identity.email.clone(),
            user_phone: identity.phone.clone(),
            timestamp: Utc::now(),
            source: source.to_string(),
        }
    }

    pub fn end(
        conversation_id: String,
        total_messages: u64,
        started_at: DateTime<Utc>,
        identity: Option<&UserIdentity>,
        source: &str,
    ) -> Self {
        let ended_at = Utc::now();
        LifecycleMarker::ConversationEnd {
            conversation_id,
            total_messages,
            conversation_duration: (ended_at - started_at).num_seconds().max(0),
            ended_at,
            source: source.to_string(),
            user_name: identity.map(|i| i.name.clone()),
            user_email: identity.map(|i| i.email.clone()),
            user_phone: identity.map(|i| i.phone.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleMarker::ConversationStart { .. } => "conversation_start",
            LifecycleMarker::ConversationEnd { .. } => "conversation_end",
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            LifecycleMarker::ConversationStart { conversation_id, .. }
            | LifecycleMarker::ConversationEnd { conversation_id, .. } => conversation_id,
        }
    }
}
