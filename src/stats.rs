//! Index statistics for `vsearch stats`.
//!
//! Prints document and chunk counts, vector coverage, dimensionality, the
//! distance metric, and how many documents the hash state store tracks.

use anyhow::Result;

use crate::config::Config;
use crate::state::{SqliteStateStore, StateStore};
use crate::store::{IndexStats, SqliteIndex, VectorIndex};

pub async fn run_stats(config: &Config) -> Result<()> {
    let index = SqliteIndex::open(&config.db.path, config.retrieval.metric).await?;
    let state = SqliteStateStore::open(&config.db.state_path()).await?;

    let stats = index.stats().await?;
    let tracked = state.all().await?.len();
    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("vault-search index stats");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Metric:      {}", index.metric());
    println!();
    print_counts(&stats);
    println!("  Tracked:     {} documents in state store", tracked);
    println!();

    index.close().await;
    state.close().await;
    Ok(())
}

fn print_counts(stats: &IndexStats) {
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.count);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.vectors,
        stats.count,
        coverage_percent(stats)
    );
    match (&stats.model_version, stats.dimensions) {
        (Some(model), Some(dims)) => println!("  Model:       {} ({} dims)", model, dims),
        _ => println!("  Model:       none"),
    }
}

fn coverage_percent(stats: &IndexStats) -> usize {
    if stats.count > 0 {
        (stats.vectors * 100) / stats.count
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
