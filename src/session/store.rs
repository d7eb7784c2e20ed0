//! Durable persistence boundary for session snapshots.
//!
//! The in-memory session is authoritative during execution; the store
//! is consulted only at session boundaries (creation and terminal
//! transition). Store failures are logged by the manager and never fail
//! a coordination round.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use super::AgentSession;

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    #[error("session store serialization failed: {0}")]
    Serialization(String),
}

/// Get/put persistence for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, session: &AgentSession) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<AgentSession>, StoreError>;
}

/// In-memory store, the default for embedded use and tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, AgentSession>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, session: &AgentSession) -> Result<(), StoreError> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<AgentSession>, StoreError> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }
}
