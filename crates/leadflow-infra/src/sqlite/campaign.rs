//! SQLite campaign and agent configuration repository.

use leadflow_core::repository::campaign::CampaignConfigRepository;
use leadflow_types::agent::{AgentConfig, AgentName};
use leadflow_types::error::RepositoryError;
use leadflow_types::id::{AgentConfigId, CampaignId, UserId};
use leadflow_types::lead::Campaign;
use sqlx::Row;

use super::codec::{format_datetime, parse_datetime, parse_id, parse_json, to_json};
use super::pool::DatabasePool;

/// SQLite-backed implementation of `CampaignConfigRepository`.
pub struct SqliteCampaignRepository {
    pool: DatabasePool,
}

impl SqliteCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct CampaignRow {
    id: String,
    user_id: String,
    name: String,
    shared_settings: String,
    created_at: String,
    updated_at: String,
}

impl CampaignRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            shared_settings: row.try_get("shared_settings")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_campaign(self) -> Result<Campaign, RepositoryError> {
        Ok(Campaign {
            id: parse_id::<CampaignId>(&self.id)?,
            user_id: parse_id::<UserId>(&self.user_id)?,
            name: self.name,
            shared_settings: parse_json(&self.shared_settings, "shared_settings")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct AgentConfigRow {
    id: String,
    campaign_id: String,
    agent: String,
    enabled: bool,
    settings: String,
    created_at: String,
    updated_at: String,
}

impl AgentConfigRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            campaign_id: row.try_get("campaign_id")?,
            agent: row.try_get("agent")?,
            enabled: row.try_get("enabled")?,
            settings: row.try_get("settings")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_config(self) -> Result<AgentConfig, RepositoryError> {
        let agent = self
            .agent
            .parse::<AgentName>()
            .map_err(|e| RepositoryError::Query(format!("invalid agent: {e}")))?;
        Ok(AgentConfig {
            id: parse_id::<AgentConfigId>(&self.id)?,
            campaign_id: parse_id::<CampaignId>(&self.campaign_id)?,
            agent,
            enabled: self.enabled,
            settings: parse_json(&self.settings, "settings")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

impl CampaignConfigRepository for SqliteCampaignRepository {
    async fn save_campaign(&self, campaign: &Campaign) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO campaigns (id, user_id, name, shared_settings, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 shared_settings = excluded.shared_settings,
                 updated_at = excluded.updated_at"#,
        )
        .bind(campaign.id.to_string())
        .bind(campaign.user_id.to_string())
        .bind(&campaign.name)
        .bind(to_json(&campaign.shared_settings)?)
        .bind(format_datetime(&campaign.created_at))
        .bind(format_datetime(&campaign.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CampaignRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_campaign()?))
            }
            None => Ok(None),
        }
    }

    async fn save_agent_config(&self, config: &AgentConfig) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO agent_configs (id, campaign_id, agent, enabled, settings, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(campaign_id, agent) DO UPDATE SET
                 enabled = excluded.enabled,
                 settings = excluded.settings,
                 updated_at = excluded.updated_at"#,
        )
        .bind(config.id.to_string())
        .bind(config.campaign_id.to_string())
        .bind(config.agent.as_str())
        .bind(config.enabled)
        .bind(to_json(&config.settings)?)
        .bind(format_datetime(&config.created_at))
        .bind(format_datetime(&config.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("FOREIGN KEY") => {
                Err(RepositoryError::NotFound)
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_agent_config(
        &self,
        campaign_id: &CampaignId,
        agent: AgentName,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM agent_configs WHERE campaign_id = ? AND agent = ?")
            .bind(campaign_id.to_string())
            .bind(agent.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = AgentConfigRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_config()?))
            }
            None => Ok(None),
        }
    }

    async fn list_agent_configs(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Vec<AgentConfig>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM agent_configs WHERE campaign_id = ? ORDER BY agent ASC")
            .bind(campaign_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = AgentConfigRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            configs.push(r.into_config()?);
        }
        Ok(configs)
    }
}
