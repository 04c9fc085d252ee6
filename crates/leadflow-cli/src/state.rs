//! Application state wiring the repositories and pipeline services.
//!
//! The pipeline services are generic over repository traits; AppState pins
//! them to the SQLite implementations from leadflow-infra.

use std::path::PathBuf;
use std::sync::Arc;

use leadflow_core::pipeline::reconciler::Reconciler;
use leadflow_core::pipeline::resolver::ConfigResolver;
use leadflow_infra::config::{load_engine_config, resolve_data_dir};
use leadflow_infra::sqlite::campaign::SqliteCampaignRepository;
use leadflow_infra::sqlite::pool::{database_url, DatabasePool};
use leadflow_infra::sqlite::run::SqliteRunRepository;
use leadflow_types::config::EngineConfig;

pub type ConcreteReconciler = Reconciler<SqliteRunRepository, SqliteCampaignRepository>;

/// Shared state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<SqliteRunRepository>,
    pub reconciler: ConcreteReconciler,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Connect to the database (running migrations) and wire services.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let config = load_engine_config(&data_dir).await;
        tracing::debug!(data_dir = %data_dir.display(), paused = config.paused, "engine state initialized");

        let runs = Arc::new(SqliteRunRepository::new(db_pool.clone()));
        let campaigns = Arc::new(SqliteCampaignRepository::new(db_pool.clone()));
        let resolver = ConfigResolver::new(campaigns);
        let reconciler = Reconciler::new(Arc::clone(&runs), resolver, &config);

        Ok(Self {
            runs,
            reconciler,
            config,
            data_dir,
            db_pool,
        })
    }
}
