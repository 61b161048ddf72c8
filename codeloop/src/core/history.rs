//! Append-only conversation history.

use crate::core::types::Turn;

/// Ordered record of every turn exchanged with the model in a session.
///
/// The model keeps no server-side state, so the full history is resent with
/// every request. Turns can only be appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::user(content));
    }

    pub fn push_model(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::model(content));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Total content size in bytes, for request-size diagnostics.
    pub fn content_bytes(&self) -> usize {
        self.turns.iter().map(|turn| turn.content.len()).sum()
    }
}
