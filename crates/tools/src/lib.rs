//! Tool implementations for routeqa.
//!
//! Three tool sources feed the registry:
//! - the SQL toolkit over the sales database
//! - `product_details_search` over the product corpus
//! - `customer_feedback_search` over the feedback corpus
//!
//! A source that fails to initialize is skipped with a warning. Startup only
//! fails when no source contributes anything.

pub mod document_search;
pub mod sql;

use std::sync::Arc;

use routeqa_config::{AppConfig, CorpusConfig};
use routeqa_core::error::{RegistryError, ToolError};
use routeqa_core::tool::{Tool, ToolRegistry};
use routeqa_core::{DocumentStore, Embedder, Provider, SearchMode};
use routeqa_store::JsonlCorpus;
use tracing::{info, warn};

pub use document_search::{DocumentSearchTool, SearchKind};
pub use sql::{SqlDatabase, SqlOptions, SqlxDatabase, sql_tools};

/// Collects tool sources, tolerating individual failures.
#[derive(Default)]
pub struct RegistryBuilder {
    registry: ToolRegistry,
    failures: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the tools of one source, or record why it is unavailable.
    pub fn add_source(&mut self, source: &str, outcome: Result<Vec<Arc<dyn Tool>>, ToolError>) {
        match outcome {
            Ok(tools) => {
                info!(source, tools = tools.len(), "Tool source registered");
                for tool in tools {
                    self.registry.register(tool);
                }
            }
            Err(e) => {
                warn!(source, error = %e, "Tool source unavailable, continuing without it");
                self.failures.push(format!("{source}: {e}"));
            }
        }
    }

    /// Sources that failed so far, as `source: reason`.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// The registry, or [`RegistryError::Empty`] if nothing was registered.
    pub fn finish(self) -> Result<ToolRegistry, RegistryError> {
        if self.registry.is_empty() {
            return Err(RegistryError::Empty {
                failures: self.failures,
            });
        }
        Ok(self.registry)
    }
}

fn unavailable(source: &str, reason: impl std::fmt::Display) -> ToolError {
    ToolError::Unavailable {
        source_name: source.into(),
        reason: reason.to_string(),
    }
}

/// Connect to the configured database and build the SQL toolkit.
pub async fn sql_source(config: &AppConfig) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
    if !config.database.enabled {
        return Err(unavailable("sql", "disabled in configuration"));
    }
    let in_container = AppConfig::in_container();
    info!(url = %config.database.display_url(in_container), "Connecting to sales database");
    let db = SqlxDatabase::connect(
        &config.database.connection_url(in_container),
        SqlOptions {
            include_tables: config.database.include_tables.clone(),
            sample_rows: config.database.sample_rows,
            max_result_rows: config.database.max_result_rows,
        },
    )
    .await
    .map_err(|e| unavailable("sql", e))?;
    Ok(sql_tools(Arc::new(db)))
}

/// Load a corpus and wrap it in a document-search tool.
pub fn document_source(
    kind: SearchKind,
    corpus: &CorpusConfig,
    config: &AppConfig,
    provider: Arc<dyn Provider>,
    model: &str,
    embedder: Option<Arc<dyn Embedder>>,
) -> Result<Vec<Arc<dyn Tool>>, ToolError> {
    let label = match kind {
        SearchKind::Product => "product",
        SearchKind::Feedback => "feedback",
    };
    let mut store = JsonlCorpus::load(label, &corpus.path)
        .map_err(|e| unavailable(label, e))?
        .with_mode(corpus.search_mode);
    if corpus.search_mode == SearchMode::Hybrid {
        match embedder {
            Some(embedder) => store = store.with_embedder(embedder),
            None => warn!(corpus = label, "Hybrid search requested without an embedder, using keyword ranking"),
        }
    }
    if store.is_empty() {
        return Err(unavailable(label, format!("corpus {} is empty", corpus.path.display())));
    }

    let tool = DocumentSearchTool::new(
        kind,
        Arc::new(store),
        provider,
        model,
        &config.agent.product_name,
    )
    .with_top_k(corpus.top_k)
    .with_temperature(config.default_temperature);
    Ok(vec![Arc::new(tool)])
}

/// Build the full registry from configuration.
pub async fn build_registry(
    config: &AppConfig,
    provider: Arc<dyn Provider>,
    model: &str,
    embedder: Option<Arc<dyn Embedder>>,
) -> Result<ToolRegistry, RegistryError> {
    let mut builder = RegistryBuilder::new();
    builder.add_source("sql", sql_source(config).await);
    builder.add_source(
        "product",
        document_source(
            SearchKind::Product,
            &config.documents.product,
            config,
            provider.clone(),
            model,
            embedder.clone(),
        ),
    );
    builder.add_source(
        "feedback",
        document_source(
            SearchKind::Feedback,
            &config.documents.feedback,
            config,
            provider,
            model,
            embedder,
        ),
    );
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use routeqa_core::error::ProviderError;
    use routeqa_core::provider::{ProviderRequest, ProviderResponse};
    use routeqa_core::{Message, Passage};

    struct Silent;

    #[async_trait::async_trait]
    impl Provider for Silent {
        fn name(&self) -> &str {
            "silent"
        }
        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                message: Message::assistant("ok"),
                usage: None,
                model: request.model,
            })
        }
    }

    fn offline_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.enabled = false;
        config.documents.product.path = dir.join("product.jsonl");
        config.documents.feedback.path = dir.join("feedback.jsonl");
        config
    }

    #[test]
    fn empty_builder_reports_every_failure() {
        let mut builder = RegistryBuilder::new();
        builder.add_source("sql", Err(unavailable("sql", "connection refused")));
        builder.add_source("product", Err(unavailable("product", "missing corpus")));
        let err = builder.finish().err().unwrap();
        let RegistryError::Empty { failures } = &err;
        assert_eq!(failures.len(), 2);
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn registry_degrades_to_available_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());
        routeqa_store::write_corpus(
            &config.documents.feedback.path,
            &[Passage::new("f1", "Sky lounge roof is stunning")],
            false,
        )
        .unwrap();

        let registry = build_registry(&config, Arc::new(Silent), "m", None).await.unwrap();
        assert_eq!(registry.names(), vec!["customer_feedback_search"]);
    }

    #[tokio::test]
    async fn registry_fails_when_nothing_loads() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());
        let err = build_registry(&config, Arc::new(Silent), "m", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::Empty { ref failures } if failures.len() == 3));
    }

    #[tokio::test]
    async fn sqlite_database_contributes_three_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = offline_config(dir.path());
        config.database.enabled = true;
        config.database.url = Some("sqlite::memory:".into());

        let registry = build_registry(&config, Arc::new(Silent), "m", None).await.unwrap();
        assert_eq!(
            registry.names(),
            vec!["sql_db_list_tables", "sql_db_schema", "sql_db_query"]
        );
    }
}
