//! `routeqa index`: build a JSONL corpus for a document tool.

use std::path::{Path, PathBuf};

use routeqa_store::index::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use routeqa_store::{IndexBuilder, load_sources, write_corpus};
use tracing::info;

use super::runtime::{CliResult, default_provider, index_embedder, load_config};
use crate::CorpusKind;

pub async fn run(
    config_path: Option<&Path>,
    kind: CorpusKind,
    input: PathBuf,
    output: Option<PathBuf>,
    force: bool,
    no_embed: bool,
) -> CliResult<()> {
    let config = load_config(config_path)?;
    let corpus = match kind {
        CorpusKind::Product => &config.documents.product,
        CorpusKind::Feedback => &config.documents.feedback,
    };
    let output = output.unwrap_or_else(|| corpus.path.clone());

    if output.exists() && !force {
        println!("  Corpus already exists: {}", output.display());
        println!("  Use --force to rebuild it.");
        return Ok(());
    }

    let mut passages = load_sources(&input, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)?;
    if passages.is_empty() {
        return Err(format!("No .txt, .md or .jsonl sources found in {}", input.display()).into());
    }
    println!("  Loaded {} passage(s) from {}", passages.len(), input.display());

    let mut builder = IndexBuilder::new();
    if !no_embed {
        let (provider, _) = default_provider(&config)?;
        builder = builder.with_embedder(index_embedder(&config, provider));
        println!("  Embedding with {} (this can take a while)...", config.embedding.model);
    }
    let report = builder.embed_all(&mut passages).await;
    info!(
        passages = report.passages,
        embedded = report.embedded,
        failed_batches = report.failed_batches,
        "Index build finished"
    );

    write_corpus(&output, &passages, force)?;
    println!(
        "  ✅ Wrote {} passage(s), {} embedded, to {}",
        report.passages,
        report.embedded,
        output.display()
    );
    if report.failed_batches > 0 {
        println!(
            "  ⚠️  {} batch(es) could not be embedded; those passages use keyword search only",
            report.failed_batches
        );
    }
    Ok(())
}
