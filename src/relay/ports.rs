//! Collaborators the relay talks to: the chat transport and the conversation store.

use crate::types::{Message, MessageRole};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// Outbound side of the chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, sender_id: &str, text: &str) -> Result<()>;
}

/// Source and sink of conversation history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Stable client id for a sender, created on first contact.
    async fn get_or_create_client(&self, sender_id: &str) -> Result<String>;

    async fn append_turn(&self, client_id: &str, role: MessageRole, text: &str) -> Result<()>;

    /// Up to `limit` most recent turns, oldest first.
    async fn recent_turns(&self, client_id: &str, limit: usize) -> Result<Vec<Message>>;
}

#[derive(Default)]
struct StoreState {
    clients: HashMap<String, String>,
    turns: HashMap<String, Vec<Message>>,
}

/// Process-local [`ConversationStore`]. History is lost on restart.
#[derive(Default)]
pub struct InMemoryConversationStore {
    state: RwLock<StoreState>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clients
            .len()
    }

    /// Every stored turn for a client, oldest first.
    pub fn turns(&self, client_id: &str) -> Vec<Message> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .turns
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_or_create_client(&self, sender_id: &str) -> Result<String> {
        let mut st = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let id = st
            .clients
            .entry(sender_id.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        Ok(id)
    }

    async fn append_turn(&self, client_id: &str, role: MessageRole, text: &str) -> Result<()> {
        let mut st = self.state.write().unwrap_or_else(PoisonError::into_inner);
        st.turns
            .entry(client_id.to_string())
            .or_default()
            .push(Message::new(role, text));
        Ok(())
    }

    async fn recent_turns(&self, client_id: &str, limit: usize) -> Result<Vec<Message>> {
        let st = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let turns = st.turns.get(client_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }
}
