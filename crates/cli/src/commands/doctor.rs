//! `routeqa doctor`: Diagnose configuration and backends.

use std::path::Path;

use routeqa_config::AppConfig;
use routeqa_core::DocumentStore;
use routeqa_store::JsonlCorpus;
use routeqa_tools::{SqlDatabase, SqlOptions, SqlxDatabase};

use super::runtime::{CliResult, config_file, default_provider, load_config, state_store};

pub async fn run(config_path: Option<&Path>) -> CliResult<()> {
    println!("🩺 routeqa doctor");
    println!("=================\n");

    let mut issues = 0;

    let path = config_file(config_path);
    if path.exists() {
        println!("  ✅ Config file: {}", path.display());
    } else {
        println!("  ⚠️  No config file at {} (defaults in use; run `routeqa config init`)", path.display());
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("  ❌ {e}");
            return Err("configuration is invalid".into());
        }
    };

    // Language model
    if config.has_api_key() {
        println!("  ✅ API key configured");
    } else {
        println!("  ❌ No API key (set GOOGLE_API_KEY or api_key in the config)");
        issues += 1;
    }
    let (provider, model) = default_provider(&config)?;
    match provider.health_check().await {
        Ok(true) => println!("  ✅ Provider {} reachable (model {model})", provider.name()),
        Ok(false) => {
            println!("  ⚠️  Provider {} answered but is not healthy", provider.name());
            issues += 1;
        }
        Err(e) => {
            println!("  ❌ Provider {}: {e}", provider.name());
            issues += 1;
        }
    }

    // Sales database
    issues += check_database(&config).await;

    // Document corpora
    for (label, corpus) in [
        ("Product corpus", &config.documents.product),
        ("Feedback corpus", &config.documents.feedback),
    ] {
        match JsonlCorpus::load(label, &corpus.path) {
            Ok(store) if !store.is_empty() => {
                println!(
                    "  ✅ {label}: {} passage(s), {} embedded ({})",
                    store.len(),
                    store.embedded_count(),
                    corpus.path.display()
                );
            }
            Ok(_) => {
                println!("  ⚠️  {label} is empty: {}", corpus.path.display());
                issues += 1;
            }
            Err(e) => {
                println!("  ❌ {label}: {e}");
                issues += 1;
            }
        }
    }

    // Conversation state
    match state_store(&config).await {
        Ok(store) => println!("  ✅ State store: {} ({})", store.name(), config.state.path.display()),
        Err(e) => {
            println!("  ❌ State store: {e}");
            issues += 1;
        }
    }

    // Summary
    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}

async fn check_database(config: &AppConfig) -> usize {
    if !config.database.enabled {
        println!("  ⚠️  Database disabled in configuration");
        return 0;
    }
    let in_container = AppConfig::in_container();
    let shown = config.database.display_url(in_container);
    let options = SqlOptions {
        include_tables: config.database.include_tables.clone(),
        sample_rows: config.database.sample_rows,
        max_result_rows: config.database.max_result_rows,
    };
    let db = match SqlxDatabase::connect(&config.database.connection_url(in_container), options).await {
        Ok(db) => db,
        Err(e) => {
            println!("  ❌ Database {shown}: {e}");
            return 1;
        }
    };
    match db.list_tables().await {
        Ok(tables) => {
            println!("  ✅ Database {shown} ({})", db.dialect());
            println!("     Tables: {}", tables.join(", "));
            0
        }
        Err(e) => {
            println!("  ❌ Database {shown}: {e}");
            1
        }
    }
}
