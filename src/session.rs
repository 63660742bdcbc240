use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::model::{ChatMessage, ChatRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp_ms: u64,
}

impl ConversationTurn {
    pub fn to_message(&self) -> ChatMessage {
        let role = match self.role {
            TurnRole::User => ChatRole::User,
            TurnRole::Assistant => ChatRole::Assistant,
        };
        ChatMessage::new(role, self.content.clone())
    }
}

/// Append-only turn history for one session. Only `clear` removes turns.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    turns: Vec<ConversationTurn>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: TurnRole, content: impl Into<String>) {
        self.turns.push(ConversationTurn {
            role,
            content: content.into(),
            timestamp_ms: now_ms(),
        });
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The newest `limit` turns, oldest first.
    pub fn recent(&self, limit: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(limit);
        &self.turns[start..]
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
