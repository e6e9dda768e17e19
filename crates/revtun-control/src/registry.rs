//! Sessions by agent ID
//!
//! The registry is the in-memory view; every change is written through to
//! [`SessionPersistence`] first. Obsolete sessions are hidden from reads
//! and removed by [`SessionRegistry::delete_obsolete`].

use crate::persistence::{PersistenceError, SessionPersistence};
use crate::session::Session;
use revtun_tunnel::SharedClock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    persistence: Arc<dyn SessionPersistence>,
    retention: Option<Duration>,
    clock: SharedClock,
}

impl SessionRegistry {
    /// `retention` is how long disconnected sessions are kept; `None` keeps
    /// them forever, zero deletes them on disconnect.
    pub fn new(
        persistence: Arc<dyn SessionPersistence>,
        retention: Option<Duration>,
        clock: SharedClock,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence,
            retention,
            clock,
        }
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Load every stored session as disconnected. Returns how many were loaded.
    pub async fn restore(&self) -> Result<usize, PersistenceError> {
        let now = self.clock.now();
        let records = self.persistence.list_all().await?;
        let mut sessions = self.sessions.write().await;

        for record in records {
            let was_connected = record.disconnected_at.is_none();
            let session = Arc::new(Session::restore(record, now));
            if was_connected {
                self.persistence.save(&session.record().await).await?;
            }
            sessions.insert(session.agent_id().to_string(), session);
        }

        info!(sessions = sessions.len(), "Sessions restored");
        Ok(sessions.len())
    }

    async fn visible(&self, session: &Session) -> bool {
        !session.is_obsolete(self.retention, self.clock.now()).await
    }

    /// Non-obsolete session of `agent_id`
    pub async fn get(&self, agent_id: &str) -> Option<Arc<Session>> {
        let session = self.get_any(agent_id).await?;
        match self.visible(&session).await {
            true => Some(session),
            false => None,
        }
    }

    /// Session of `agent_id` even if obsolete
    pub async fn get_any(&self, agent_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.sessions.read().await.contains_key(agent_id)
    }

    /// Non-obsolete sessions ordered by agent ID
    pub async fn list(&self) -> Vec<Arc<Session>> {
        let all: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut visible = Vec::with_capacity(all.len());
        for session in all {
            if self.visible(&session).await {
                visible.push(session);
            }
        }
        visible.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        visible
    }

    pub async fn count(&self) -> usize {
        self.list().await.len()
    }

    pub async fn count_connected(&self) -> usize {
        let mut connected = 0;
        for session in self.list().await {
            if session.is_connected().await {
                connected += 1;
            }
        }
        connected
    }

    /// Whether another agent holds `auth_id`
    pub async fn is_auth_id_in_use(&self, auth_id: &str, agent_id: &str) -> bool {
        for session in self.list().await {
            if session.agent_id() != agent_id && session.auth_id().await == auth_id {
                return true;
            }
        }
        false
    }

    /// Persist, then publish
    pub async fn save(&self, session: &Arc<Session>) -> Result<(), PersistenceError> {
        let record = session.record().await;
        self.persistence.save(&record).await?;
        self.sessions
            .write()
            .await
            .insert(session.agent_id().to_string(), session.clone());
        debug!(
            agent_id = %session.agent_id(),
            connected = record.disconnected_at.is_none(),
            tunnels = record.tunnels.len(),
            "Session saved"
        );
        Ok(())
    }

    pub async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError> {
        self.persistence.delete(agent_id).await?;
        if self.sessions.write().await.remove(agent_id).is_some() {
            debug!(agent_id = %agent_id, "Session deleted");
        }
        Ok(())
    }

    /// Remove every obsolete session and return them
    pub async fn delete_obsolete(&self) -> Result<Vec<Arc<Session>>, PersistenceError> {
        let now = self.clock.now();
        let all: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let mut deleted = Vec::new();
        for session in all {
            if !session.is_obsolete(self.retention, now).await {
                continue;
            }
            self.persistence.delete(session.agent_id()).await?;
            self.sessions.write().await.remove(session.agent_id());
            debug!(agent_id = %session.agent_id(), "Obsolete session deleted");
            deleted.push(session);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use chrono::{TimeZone, Utc};
    use revtun_tunnel::{Clock, ManualClock};

    fn setup(retention: Option<Duration>) -> (SessionRegistry, Arc<ManualClock>, Arc<MemoryPersistence>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap(),
        ));
        let persistence = Arc::new(MemoryPersistence::new());
        let registry = SessionRegistry::new(persistence.clone(), retention, clock.clone());
        (registry, clock, persistence)
    }

    #[tokio::test]
    async fn test_obsolete_sessions_are_hidden_then_deleted() {
        let (registry, clock, persistence) = setup(Some(Duration::from_secs(60)));
        let session = Arc::new(Session::new("agent-1", "auth-1", clock.now()));
        registry.save(&session).await.unwrap();

        clock.advance(chrono::Duration::seconds(60));
        assert!(registry.get("agent-1").await.is_some());
        assert_eq!(registry.count().await, 1);
        assert!(registry.delete_obsolete().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(1));
        assert!(registry.get("agent-1").await.is_none());
        assert!(registry.get_any("agent-1").await.is_some());
        assert_eq!(registry.count().await, 0);

        let deleted = registry.delete_obsolete().await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(!registry.contains("agent-1").await);
        assert!(persistence.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_id_in_use_by_other_agents_only() {
        let (registry, clock, _) = setup(None);
        let session = Arc::new(Session::new("agent-1", "shared", clock.now()));
        registry.save(&session).await.unwrap();

        assert!(registry.is_auth_id_in_use("shared", "agent-2").await);
        assert!(!registry.is_auth_id_in_use("shared", "agent-1").await);
        assert!(!registry.is_auth_id_in_use("other", "agent-2").await);
    }

    #[tokio::test]
    async fn test_restore_loads_stored_sessions() {
        let (registry, clock, persistence) = setup(None);
        let mut record = Session::new("agent-1", "auth-1", clock.now()).record().await;
        record.disconnected_at = None;
        persistence.save(&record).await.unwrap();

        clock.advance(chrono::Duration::minutes(3));
        assert_eq!(registry.restore().await.unwrap(), 1);

        let session = registry.get("agent-1").await.unwrap();
        assert!(!session.is_connected().await);
        assert_eq!(session.disconnected_at().await, Some(clock.now()));
        let stored = persistence.list_all().await.unwrap();
        assert_eq!(stored[0].disconnected_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (registry, clock, _) = setup(None);
        for id in ["c", "a", "b"] {
            let session = Arc::new(Session::new(id, id, clock.now()));
            registry.save(&session).await.unwrap();
        }
        let ids: Vec<String> = registry
            .list()
            .await
            .iter()
            .map(|s| s.agent_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(registry.count_connected().await, 0);
    }
}
