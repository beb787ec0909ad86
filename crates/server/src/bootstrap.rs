use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use reservo_agent::generation::GenerationEngine;
use reservo_agent::llm::{LlmError, OpenAiChatModel};
use reservo_agent::tools::{HttpSchedulingClient, SchedulingError, ToolExecutor};
use reservo_core::config::{AppConfig, ConfigError, LoadOptions};
use reservo_core::message::PlatformId;
use reservo_core::policy::{PolicyEngine, PolicyLoadError};
use reservo_core::telemetry::TracingTelemetrySink;
use reservo_platform::adapter::{AdapterRegistry, DeliveryError, PlatformAdapter};
use reservo_platform::whatsapp::WhatsappAdapter;
use reservo_store::{migrate, open_session_pool, DbPool, SqliteSessionStore};

use crate::orchestrator::Orchestrator;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::Error),
    #[error("failed to read policy rules from {path}: {source}")]
    PolicyRules { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    PolicyLoad(#[from] PolicyLoadError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        open_session_pool(&config.session).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrate(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let policy_engine = load_policy_engine(&config)?;

    let model = OpenAiChatModel::from_config(&config.llm)?;
    let scheduling = HttpSchedulingClient::from_config(&config.scheduling)?;
    let executor = ToolExecutor::new(
        Arc::new(scheduling),
        Duration::from_secs(config.scheduling.timeout_secs),
    );
    let engine = GenerationEngine::new(
        Arc::new(model),
        Arc::new(policy_engine),
        executor,
        config.llm.max_tool_rounds,
        Duration::from_millis(config.policy.timeout_ms),
    );

    // One WhatsApp Business API adapter serves every Meta-backed channel;
    // `web` stays unregistered until a delivery path for it exists.
    let whatsapp: Arc<dyn PlatformAdapter> =
        Arc::new(WhatsappAdapter::from_config(&config.whatsapp)?);
    let mut registry = AdapterRegistry::new();
    registry.register(PlatformId::Whatsapp, whatsapp.clone());
    registry.register(PlatformId::WhatsappBusiness, whatsapp.clone());
    registry.register(PlatformId::Messenger, whatsapp);

    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        Arc::new(SqliteSessionStore::new(db_pool.clone())),
        engine,
        Arc::new(TracingTelemetrySink),
    ));

    Ok(Application { config, db_pool, orchestrator })
}

fn load_policy_engine(config: &AppConfig) -> Result<PolicyEngine, BootstrapError> {
    match &config.policy.rules_path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|source| BootstrapError::PolicyRules { path: path.clone(), source })?;
            let engine = PolicyEngine::from_json(&raw)?;
            info!(
                event_name = "system.bootstrap.policies_loaded",
                path = %path.display(),
                "policy rules loaded"
            );
            Ok(engine)
        }
        None => {
            info!(
                event_name = "system.bootstrap.policies_default",
                "no policy rules configured; every action is allowed"
            );
            Ok(PolicyEngine::default())
        }
    }
}
