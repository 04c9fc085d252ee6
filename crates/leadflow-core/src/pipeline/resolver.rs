//! Live agent configuration lookup.

use std::sync::Arc;

use leadflow_types::agent::{AgentName, ResolvedAgentConfig};
use leadflow_types::error::RepositoryError;
use leadflow_types::id::CampaignId;
use leadflow_types::lead::Campaign;

use crate::pipeline::settings::merged_settings;
use crate::repository::campaign::CampaignConfigRepository;

/// Resolves whether an agent is enabled for a campaign and its merged settings.
///
/// A missing SENDER row means disabled (sending is strictly opt-in); a
/// missing row for any other agent means enabled with default settings.
pub struct ConfigResolver<C> {
    repo: Arc<C>,
}

impl<C> Clone for ConfigResolver<C> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<C: CampaignConfigRepository> ConfigResolver<C> {
    pub fn new(repo: Arc<C>) -> Self {
        Self { repo }
    }

    pub async fn campaign(&self, id: &CampaignId) -> Result<Campaign, RepositoryError> {
        self.repo
            .get_campaign(id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    /// Resolve one agent against a loaded campaign.
    pub async fn resolve(
        &self,
        campaign: &Campaign,
        agent: AgentName,
    ) -> Result<ResolvedAgentConfig, RepositoryError> {
        let config = self.repo.get_agent_config(&campaign.id, agent).await?;

        let enabled = match (&config, agent) {
            (Some(cfg), _) => cfg.enabled,
            (None, AgentName::Sender) => false,
            (None, _) => true,
        };

        let agent_settings = config
            .as_ref()
            .map(|cfg| cfg.settings.clone())
            .unwrap_or(serde_json::Value::Null);

        Ok(ResolvedAgentConfig {
            enabled,
            settings_snapshot: merged_settings(agent, &campaign.shared_settings, &agent_settings),
            config_id: config.as_ref().map(|cfg| cfg.id),
            config_updated_at: config.as_ref().map(|cfg| cfg.updated_at),
        })
    }

    pub async fn resolve_for(
        &self,
        campaign_id: &CampaignId,
        agent: AgentName,
    ) -> Result<ResolvedAgentConfig, RepositoryError> {
        let campaign = self.campaign(campaign_id).await?;
        self.resolve(&campaign, agent).await
    }

    /// Whether a config row exists for the agent (distinguishes "missing"
    /// from "disabled" in send-only validation).
    pub async fn has_config(
        &self,
        campaign_id: &CampaignId,
        agent: AgentName,
    ) -> Result<bool, RepositoryError> {
        Ok(self.repo.get_agent_config(campaign_id, agent).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use leadflow_types::agent::AgentConfig;
    use leadflow_types::id::{AgentConfigId, UserId};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // --- Mock repository for testing ---

    #[derive(Default)]
    struct MockConfigRepo {
        campaigns: Mutex<HashMap<CampaignId, Campaign>>,
        configs: Mutex<HashMap<(CampaignId, AgentName), AgentConfig>>,
    }

    impl CampaignConfigRepository for MockConfigRepo {
        async fn save_campaign(&self, campaign: &Campaign) -> Result<(), RepositoryError> {
            self.campaigns
                .lock()
                .unwrap()
                .insert(campaign.id, campaign.clone());
            Ok(())
        }

        async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>, RepositoryError> {
            Ok(self.campaigns.lock().unwrap().get(id).cloned())
        }

        async fn save_agent_config(&self, config: &AgentConfig) -> Result<(), RepositoryError> {
            self.configs
                .lock()
                .unwrap()
                .insert((config.campaign_id, config.agent), config.clone());
            Ok(())
        }

        async fn get_agent_config(
            &self,
            campaign_id: &CampaignId,
            agent: AgentName,
        ) -> Result<Option<AgentConfig>, RepositoryError> {
            Ok(self.configs.lock().unwrap().get(&(*campaign_id, agent)).cloned())
        }

        async fn list_agent_configs(
            &self,
            campaign_id: &CampaignId,
        ) -> Result<Vec<AgentConfig>, RepositoryError> {
            Ok(self
                .configs
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.campaign_id == *campaign_id)
                .cloned()
                .collect())
        }
    }

    fn campaign(shared: serde_json::Value) -> Campaign {
        Campaign {
            id: CampaignId::new(),
            user_id: UserId::new(),
            name: "Spring outreach".to_string(),
            shared_settings: shared,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn config(campaign_id: CampaignId, agent: AgentName, enabled: bool, settings: serde_json::Value) -> AgentConfig {
        AgentConfig {
            id: AgentConfigId::new(),
            campaign_id,
            agent,
            enabled,
            settings,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_sender_config_is_disabled() {
        let repo = Arc::new(MockConfigRepo::default());
        let resolver = ConfigResolver::new(repo);
        let campaign = campaign(json!({}));

        let sender = resolver.resolve(&campaign, AgentName::Sender).await.unwrap();
        assert!(!sender.enabled);
        assert!(sender.config_id.is_none());

        let search = resolver.resolve(&campaign, AgentName::Search).await.unwrap();
        assert!(search.enabled);
    }

    #[tokio::test]
    async fn resolve_merges_defaults_shared_and_agent_settings() {
        let repo = Arc::new(MockConfigRepo::default());
        let campaign = campaign(json!({"min_score_for_send": 8, "tone": "warm"}));
        let cfg = config(campaign.id, AgentName::Critique, true, json!({"strictness": "high"}));
        repo.save_agent_config(&cfg).await.unwrap();

        let resolver = ConfigResolver::new(repo);
        let resolved = resolver.resolve(&campaign, AgentName::Critique).await.unwrap();

        assert!(resolved.enabled);
        assert_eq!(resolved.config_id, Some(cfg.id));
        assert_eq!(resolved.settings_snapshot["min_score_for_send"], 8);
        assert_eq!(resolved.settings_snapshot["strictness"], "high");
        assert_eq!(resolved.settings_snapshot["tone"], "warm");
        assert_eq!(resolved.settings_snapshot["max_rewrites"], 2);
    }

    #[tokio::test]
    async fn disabled_row_wins_over_default() {
        let repo = Arc::new(MockConfigRepo::default());
        let campaign = campaign(json!({}));
        repo.save_campaign(&campaign).await.unwrap();
        repo.save_agent_config(&config(campaign.id, AgentName::Design, false, json!({})))
            .await
            .unwrap();

        let resolver = ConfigResolver::new(repo);
        let design = resolver.resolve_for(&campaign.id, AgentName::Design).await.unwrap();
        assert!(!design.enabled);
        assert!(resolver.has_config(&campaign.id, AgentName::Design).await.unwrap());
        assert!(!resolver.has_config(&campaign.id, AgentName::Sender).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let resolver = ConfigResolver::new(Arc::new(MockConfigRepo::default()));
        let err = resolver.campaign(&CampaignId::new()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
