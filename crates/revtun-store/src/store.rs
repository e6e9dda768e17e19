use crate::entities::session;
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, QueryOrder, Set};
use tracing::debug;

/// Row level access to the sessions table
#[derive(Debug, Clone)]
pub struct SessionStore {
    db: DatabaseConnection,
}

impl SessionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect and migrate in one go
    pub async fn open(database_url: &str) -> Result<Self, DbErr> {
        let db = crate::connect(database_url).await?;
        crate::migrate(&db).await?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Insert or replace the row of `row.agent_id`
    pub async fn save(&self, row: session::Model) -> Result<(), DbErr> {
        let exists = session::Entity::find_by_id(row.agent_id.clone())
            .one(&self.db)
            .await?
            .is_some();

        let agent_id = row.agent_id.clone();
        let model = session::ActiveModel {
            agent_id: Set(row.agent_id),
            session_id: Set(row.session_id),
            auth_id: Set(row.auth_id),
            name: Set(row.name),
            version: Set(row.version),
            address: Set(row.address),
            tunnels: Set(row.tunnels),
            allowed_user_groups: Set(row.allowed_user_groups),
            connected_at: Set(row.connected_at),
            disconnected_at: Set(row.disconnected_at),
            updated_at: Set(row.updated_at),
        };

        if exists {
            model.update(&self.db).await?;
        } else {
            model.insert(&self.db).await?;
        }
        debug!(agent_id = %agent_id, "Session row saved");
        Ok(())
    }

    /// Remove a row; missing rows are not an error
    pub async fn delete(&self, agent_id: &str) -> Result<(), DbErr> {
        let result = session::Entity::delete_by_id(agent_id.to_string())
            .exec(&self.db)
            .await?;
        debug!(agent_id = %agent_id, rows = result.rows_affected, "Session row deleted");
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<session::Model>, DbErr> {
        session::Entity::find()
            .order_by_asc(session::Column::AgentId)
            .all(&self.db)
            .await
    }
}
