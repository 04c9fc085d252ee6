//! Campaign and agent configuration repository trait.

use leadflow_types::agent::{AgentConfig, AgentName};
use leadflow_types::error::RepositoryError;
use leadflow_types::id::CampaignId;
use leadflow_types::lead::Campaign;

/// Storage interface for campaigns and their per-agent configuration.
pub trait CampaignConfigRepository: Send + Sync {
    /// Insert or update a campaign.
    fn save_campaign(
        &self,
        campaign: &Campaign,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_campaign(
        &self,
        id: &CampaignId,
    ) -> impl std::future::Future<Output = Result<Option<Campaign>, RepositoryError>> + Send;

    /// Insert or update the configuration for one agent of a campaign
    /// (unique per campaign and agent).
    fn save_agent_config(
        &self,
        config: &AgentConfig,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_agent_config(
        &self,
        campaign_id: &CampaignId,
        agent: AgentName,
    ) -> impl std::future::Future<Output = Result<Option<AgentConfig>, RepositoryError>> + Send;

    fn list_agent_configs(
        &self,
        campaign_id: &CampaignId,
    ) -> impl std::future::Future<Output = Result<Vec<AgentConfig>, RepositoryError>> + Send;
}
