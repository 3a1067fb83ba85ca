//! Shared setup: configuration, provider, state store and turn service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use routeqa_agent::{AgentLoop, TurnService};
use routeqa_config::{AppConfig, EmbeddingConfig, StateBackend};
use routeqa_core::event::EventBus;
use routeqa_core::{Embedder, Provider, SearchMode, StateStore};
use routeqa_providers::{build_from_config, router::model_for};
use routeqa_store::{FileStateStore, InMemoryStateStore, ProviderEmbedder, RetryPolicy, SqliteStateStore};
use tracing::info;

pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// The config file in effect: `--config`, else `~/.routeqa/config.toml`.
pub fn config_file(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> CliResult<AppConfig> {
    AppConfig::load_with_overrides(&config_file(path))
        .map_err(|e| format!("Failed to load config: {e}").into())
}

/// The default provider and the model it should use.
pub fn default_provider(config: &AppConfig) -> CliResult<(Arc<dyn Provider>, String)> {
    let router = build_from_config(config);
    let provider = router
        .default_provider()
        .ok_or("No default provider configured")?;
    Ok((provider, model_for(config, &config.default_provider)))
}

pub fn retry_policy(embedding: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy::from_millis(
        embedding.max_attempts,
        embedding.initial_backoff_ms,
        embedding.max_backoff_ms,
        embedding.pacing_ms,
    )
}

/// Embedder for offline index builds, paced and retried per `[embedding]`.
pub fn index_embedder(config: &AppConfig, provider: Arc<dyn Provider>) -> Arc<dyn Embedder> {
    Arc::new(ProviderEmbedder::new(provider, &config.embedding.model).with_policy(retry_policy(&config.embedding)))
}

/// Embedder for query vectors during a turn: one attempt, no pacing.
pub fn query_embedder(config: &AppConfig, provider: Arc<dyn Provider>) -> Option<Arc<dyn Embedder>> {
    let hybrid = config.documents.product.search_mode == SearchMode::Hybrid
        || config.documents.feedback.search_mode == SearchMode::Hybrid;
    hybrid.then(|| {
        Arc::new(ProviderEmbedder::new(provider, &config.embedding.model).with_policy(RetryPolicy::once()))
            as Arc<dyn Embedder>
    })
}

pub async fn state_store(config: &AppConfig) -> CliResult<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Memory => Arc::new(InMemoryStateStore::new()),
        StateBackend::File => Arc::new(FileStateStore::new(&config.state.path)),
        StateBackend::Sqlite => {
            let file = if config.state.path.extension().is_some() {
                config.state.path.clone()
            } else {
                config.state.path.join("threads.db")
            };
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(SqliteStateStore::new(&file.to_string_lossy()).await?)
        }
    };
    info!(backend = store.name(), "State store ready");
    Ok(store)
}

/// Build the registry and the turn service. Fails when no tool source loads.
pub async fn turn_service(config: &AppConfig) -> CliResult<Arc<TurnService>> {
    let (provider, model) = default_provider(config)?;
    let embedder = query_embedder(config, provider.clone());
    let registry = routeqa_tools::build_registry(config, provider.clone(), &model, embedder).await?;
    info!(tools = ?registry.names(), "Tool registry built");

    let event_bus = Arc::new(EventBus::default());
    let agent = AgentLoop::from_config(config, provider, model, Arc::new(registry), event_bus.clone());
    let service = TurnService::new(agent, state_store(config).await?, event_bus)
        .with_iteration_policy(config.agent.iteration_policy);
    Ok(Arc::new(service))
}
