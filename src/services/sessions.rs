use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::session::ActiveSession;

/// The set of running generation sessions, keyed by class id.
///
/// Owned by the application state and shared by clone; holds at most one
/// session per class.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, ActiveSession>>>,
}

impl SessionRegistry {
    /// Creates a new, empty `SessionRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session unless its class already has one.
    pub async fn try_insert(&self, session: ActiveSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let class_id = session.command.class_id.clone();

        if sessions.contains_key(&class_id) {
            return Err(AppError::SessionAlreadyActive(class_id));
        }

        sessions.insert(class_id, session);
        Ok(())
    }

    pub async fn get(&self, class_id: &str) -> Option<ActiveSession> {
        self.sessions.read().await.get(class_id).cloned()
    }

    pub async fn contains(&self, class_id: &str) -> bool {
        self.sessions.read().await.contains_key(class_id)
    }

    /// Removes and returns the session of a class.
    pub async fn remove(&self, class_id: &str) -> Option<ActiveSession> {
        self.sessions.write().await.remove(class_id)
    }

    /// Removes the class's session only if it is still `session_id`, so a
    /// finishing loop cannot evict its successor.
    pub async fn remove_if(&self, class_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(class_id) {
            Some(session) if session.session_id == session_id => {
                sessions.remove(class_id);
                true
            }
            _ => false,
        }
    }

    /// The classes with a running session, sorted.
    pub async fn class_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Cancels and forgets every session.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<ActiveSession> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.cancel.cancel();
        }
        drained.len()
    }
}
