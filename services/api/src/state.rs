//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the model gateway, the
//! transcriber and the registry of live study sessions.

use crate::config::Config;
use crate::transcription::Transcriber;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use study_buddy_core::{AiGateway, SessionHandle};
use tokio::sync::RwLock;
use uuid::Uuid;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<dyn AiGateway>,
    pub transcriber: Arc<dyn Transcriber>,
    pub sessions: SessionRegistry,
    pub config: Arc<Config>,
}

/// A running session as seen from the REST surface.
#[derive(Clone, Debug)]
pub struct LiveSession {
    pub handle: SessionHandle,
    pub started_at: DateTime<Utc>,
}

/// Sessions keyed by id. An entry lives exactly as long as its WebSocket.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, LiveSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: Uuid, handle: SessionHandle) {
        let session = LiveSession {
            handle,
            started_at: Utc::now(),
        };
        self.inner.write().await.insert(id, session);
    }

    pub async fn remove(&self, id: &Uuid) -> Option<LiveSession> {
        self.inner.write().await.remove(id)
    }

    pub async fn get(&self, id: &Uuid) -> Option<LiveSession> {
        self.inner.read().await.get(id).cloned()
    }

    /// All live sessions, oldest first.
    pub async fn list(&self) -> Vec<(Uuid, LiveSession)> {
        let mut sessions: Vec<_> = self
            .inner
            .read()
            .await
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect();
        sessions.sort_by_key(|(_, session)| session.started_at);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.len().await, 0);
        assert!(registry.list().await.is_empty());
        assert!(registry.get(&Uuid::new_v4()).await.is_none());
        assert!(registry.remove(&Uuid::new_v4()).await.is_none());
    }
}
