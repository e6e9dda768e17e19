//! Where sessions survive restarts
//!
//! [`SessionPersistence`] is the only interface the registry talks to.
//! Three backends implement it:
//!
//! - [`MemoryPersistence`] keeps records in a map (tests, ephemeral servers)
//! - [`JsonFilePersistence`] rewrites one JSON file atomically
//! - [`SqlPersistence`] stores rows through `revtun-store`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use revtun_proto::ForwardingSpec;
use revtun_store::entities::session;
use revtun_store::SessionStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

/// A tunnel as remembered between connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: String,
    pub spec: ForwardingSpec,
}

/// Persisted form of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub agent_id: String,
    pub session_id: String,
    pub auth_id: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub allowed_user_groups: Vec<String>,
    #[serde(default)]
    pub tunnels: Vec<TunnelRecord>,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionPersistence: Send + Sync + Debug {
    /// Insert or replace the record of `record.agent_id`
    async fn save(&self, record: &SessionRecord) -> Result<(), PersistenceError>;

    /// Missing records are not an error
    async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError>;

    async fn list_all(&self) -> Result<Vec<SessionRecord>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<BTreeMap<String, SessionRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionPersistence for MemoryPersistence {
    async fn save(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        self.records
            .lock()
            .await
            .insert(record.agent_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError> {
        self.records.lock().await.remove(agent_id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, PersistenceError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

/// All sessions in one JSON document, replaced through a temp file + rename
#[derive(Debug)]
pub struct JsonFilePersistence {
    path: PathBuf,
    // serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<BTreeMap<String, SessionRecord>, PersistenceError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }

        let records: Vec<SessionRecord> = serde_json::from_slice(&data)?;
        Ok(records
            .into_iter()
            .map(|record| (record.agent_id.clone(), record))
            .collect())
    }

    async fn write(&self, records: &BTreeMap<String, SessionRecord>) -> Result<(), PersistenceError> {
        let list: Vec<&SessionRecord> = records.values().collect();
        let data = serde_json::to_vec_pretty(&list)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), sessions = list.len(), "Session file written");
        Ok(())
    }
}

#[async_trait]
impl SessionPersistence for JsonFilePersistence {
    async fn save(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        records.insert(record.agent_id.clone(), record.clone());
        self.write(&records).await
    }

    async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read().await?;
        if records.remove(agent_id).is_some() {
            self.write(&records).await?;
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, PersistenceError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.into_values().collect())
    }
}

/// Sessions table managed by `revtun-store`
#[derive(Debug, Clone)]
pub struct SqlPersistence {
    store: SessionStore,
}

impl SqlPersistence {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Connect, run migrations and wrap the store
    pub async fn open(database_url: &str) -> Result<Self, PersistenceError> {
        Ok(Self::new(SessionStore::open(database_url).await?))
    }
}

impl TryFrom<&SessionRecord> for session::Model {
    type Error = PersistenceError;

    fn try_from(record: &SessionRecord) -> Result<Self, Self::Error> {
        Ok(session::Model {
            agent_id: record.agent_id.clone(),
            session_id: record.session_id.clone(),
            auth_id: record.auth_id.clone(),
            name: record.name.clone(),
            version: record.version.clone(),
            address: record.address.clone(),
            tunnels: serde_json::to_string(&record.tunnels)?,
            allowed_user_groups: serde_json::to_string(&record.allowed_user_groups)?,
            connected_at: record.connected_at,
            disconnected_at: record.disconnected_at,
            updated_at: record.updated_at,
        })
    }
}

impl TryFrom<session::Model> for SessionRecord {
    type Error = PersistenceError;

    fn try_from(row: session::Model) -> Result<Self, Self::Error> {
        Ok(SessionRecord {
            tunnels: serde_json::from_str(&row.tunnels)?,
            allowed_user_groups: serde_json::from_str(&row.allowed_user_groups)?,
            agent_id: row.agent_id,
            session_id: row.session_id,
            auth_id: row.auth_id,
            name: row.name,
            version: row.version,
            address: row.address,
            connected_at: row.connected_at,
            disconnected_at: row.disconnected_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl SessionPersistence for SqlPersistence {
    async fn save(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        self.store.save(session::Model::try_from(record)?).await?;
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError> {
        self.store.delete(agent_id).await?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, PersistenceError> {
        self.store
            .list_all()
            .await?
            .into_iter()
            .map(SessionRecord::try_from)
            .collect()
    }
}
