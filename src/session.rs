use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable home of chat sessions, partitioned by project and profile.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Allocates a fresh id and persists an empty session.
    async fn create(&self, scope: &SessionScope, title: &str) -> Result<Session>;

    /// Persists messages; usage totals are recomputed from them.
    async fn save(&self, scope: &SessionScope, session: &Session) -> Result<()>;

    /// Newest first.
    async fn list(&self, scope: &SessionScope) -> Result<Vec<SessionHeader>>;

    async fn load(&self, scope: &SessionScope, id: &str) -> Result<Session>;

    /// Deleting an unknown id is not an error.
    async fn delete(&self, scope: &SessionScope, id: &str) -> Result<()>;

    async fn rename(&self, scope: &SessionScope, id: &str, title: &str) -> Result<()>;

    async fn delete_all(&self, scope: &SessionScope) -> Result<()>;
}

/// Process-local store for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionScope, HashMap<String, Session>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, scope: &SessionScope, title: &str) -> Result<Session> {
        let session = Session::new(title);
        self.sessions
            .write()
            .await
            .entry(scope.clone())
            .or_default()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn save(&self, scope: &SessionScope, session: &Session) -> Result<()> {
        let mut stored = session.clone();
        stored.recompute_totals();
        self.sessions
            .write()
            .await
            .entry(scope.clone())
            .or_default()
            .insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn list(&self, scope: &SessionScope) -> Result<Vec<SessionHeader>> {
        let guard = self.sessions.read().await;
        let mut headers: Vec<SessionHeader> = guard
            .get(scope)
            .map(|m| m.values().map(Session::header).collect())
            .unwrap_or_default();
        headers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(headers)
    }

    async fn load(&self, scope: &SessionScope, id: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(scope)
            .and_then(|m| m.get(id))
            .cloned()
            .ok_or_else(|| ColloquyError::SessionNotFound(id.to_string()).into())
    }

    async fn delete(&self, scope: &SessionScope, id: &str) -> Result<()> {
        if let Some(m) = self.sessions.write().await.get_mut(scope) {
            m.remove(id);
        }
        Ok(())
    }

    async fn rename(&self, scope: &SessionScope, id: &str, title: &str) -> Result<()> {
        let mut guard = self.sessions.write().await;
        match guard.get_mut(scope).and_then(|m| m.get_mut(id)) {
            Some(session) => {
                session.title = title.to_string();
                Ok(())
            }
            None => Err(ColloquyError::SessionNotFound(id.to_string()).into()),
        }
    }

    async fn delete_all(&self, scope: &SessionScope) -> Result<()> {
        self.sessions.write().await.remove(scope);
        Ok(())
    }
}
