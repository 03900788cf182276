//! CLI command runners for `vsearch index`, `search`, and `query`.
//!
//! Results go to stdout as plain lines so scripts can parse them; logs go
//! to stderr through `tracing`.

use anyhow::Result;

use crate::answer::AnswerOutcome;
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{IndexSummary, SearchMode, SearchResult};
use crate::service::{RetrievalService, ServiceError};

pub async fn run_index(config: &Config, force: bool) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    let outcome = service.run_index(force).await;
    service.close().await;

    match outcome {
        Ok(summary) => {
            print_summary(&summary);
            println!("ok");
            Ok(())
        }
        Err(ServiceError::Pipeline(PipelineError::CycleAborted { reason, summary })) => {
            print_summary(&summary);
            anyhow::bail!("indexing aborted: {}", reason)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_summary(summary: &IndexSummary) {
    println!("index");
    println!("  total: {}", summary.total);
    println!("  processed: {}", summary.processed);
    println!("  skipped: {}", summary.skipped);
    println!("  failed: {}", summary.failed);
    println!("  deleted: {}", summary.deleted);
    println!("  embedded: {}", summary.embedded);
    if summary.chunks_failed > 0 {
        println!("  chunks failed: {}", summary.chunks_failed);
    }
    if summary.cancelled {
        println!("  cancelled: true");
    }
    for f in &summary.failures {
        println!("  ! {} ({:?}): {}", f.path, f.kind, f.message);
    }
}

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    limit: Option<usize>,
    explain: bool,
) -> Result<()> {
    let mode: SearchMode = mode.parse()?;
    let service = RetrievalService::open(config).await?;
    let results = service.search(query, limit, mode, explain).await;
    service.close().await;
    let results = results?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result);
    }
    Ok(())
}

fn print_result(rank: usize, result: &SearchResult) {
    let title = if result.title.is_empty() {
        "(untitled)"
    } else {
        result.title.as_str()
    };
    let via: Vec<String> = result
        .matched_via
        .iter()
        .map(|m| format!("{:?}", m).to_lowercase())
        .collect();

    println!("{}. [{:.2}] {} / {}", rank, result.score, result.source_path, title);
    println!("    updated: {}", result.last_modified.format("%Y-%m-%d"));
    if !result.heading_path.is_empty() {
        println!("    section: {}", result.heading_path.join(" > "));
    }
    println!("    matched: {}", via.join(", "));
    if let Some(ex) = &result.explain {
        println!(
            "    explain: semantic={:.3} keyword={:.3} tag={:.3}",
            ex.semantic, ex.keyword, ex.tag
        );
    }
    println!("    excerpt: \"{}\"", result.snippet);
    println!("    id: {}", result.chunk_id);
    println!();
}

pub async fn run_query(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    let service = RetrievalService::open(config).await?;
    let outcome = service.query(query, limit).await;
    service.close().await;

    match outcome? {
        AnswerOutcome::Answered(answer) => {
            println!("{}", answer.answer);
            println!();
            println!("Sources:");
            for (i, s) in answer.sources.iter().enumerate() {
                println!("  [{}] {} ({:.2})", i + 1, s.path, s.score);
            }
        }
        AnswerOutcome::NoRelevantContent => {
            println!("No relevant content found in the vault.");
        }
    }
    Ok(())
}
