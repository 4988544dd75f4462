//! Per-user conversation history, kept in memory only.
use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Bounded turn lists keyed by sender id. The system prompt is not stored; it
/// is prepended whenever a prompt is built.
#[derive(Debug)]
pub struct ConversationStore {
    max_history: usize,
    system_prompt: String,
    conversations: Mutex<HashMap<String, Vec<Turn>>>,
}

impl ConversationStore {
    pub fn new(max_history: usize, system_prompt: impl Into<String>) -> Self {
        Self {
            max_history: max_history.max(1),
            system_prompt: system_prompt.into(),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn append(&self, user: &str, turn: Turn) -> Vec<Turn> {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let history = conversations.entry(user.to_string()).or_default();
        history.push(turn);
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
        history.clone()
    }

    /// Record a user turn and return the full prompt: system prompt first,
    /// then the retained history ending with this turn.
    pub fn push_user(&self, user: &str, text: &str) -> Vec<Turn> {
        let history = self.append(user, Turn::new(Role::User, text));
        let mut prompt = Vec::with_capacity(history.len() + 1);
        if !self.system_prompt.trim().is_empty() {
            prompt.push(Turn::new(Role::System, self.system_prompt.clone()));
        }
        prompt.extend(history);
        prompt
    }

    pub fn record_assistant(&self, user: &str, text: &str) {
        self.append(user, Turn::new(Role::Assistant, text));
    }

    pub fn history(&self, user: &str) -> Vec<Turn> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self, user: &str) {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user);
    }
}
