//! Context assembly and question answering.
//!
//! [`assemble_context`] packs ranked passages into a token budget, each
//! prefixed with a numbered source header for citation. [`query_llm`] sends
//! the packed context to the answering model. The model is never called
//! with an empty context: "nothing relevant" is reported as
//! [`AnswerOutcome::NoRelevantContent`] instead, distinct from
//! [`PipelineError::LlmUnavailable`].

use serde::Serialize;
use tracing::{debug, warn};

use crate::chunk::CHARS_PER_TOKEN;
use crate::error::PipelineError;
use crate::llm::LlmClient;
use crate::models::SearchResult;

/// Passages packed for one question.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    /// Sources in the order they appear in `text`.
    pub sources: Vec<AnswerSource>,
    pub estimated_tokens: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerSource {
    pub path: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<AnswerSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    Answered(Answer),
    NoRelevantContent,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Greedily pack passages by descending score until `max_tokens` is spent.
///
/// A passage that does not fit is skipped and smaller ones further down
/// may still be packed.
pub fn assemble_context(results: &[SearchResult], max_tokens: usize) -> AssembledContext {
    let mut ranked: Vec<&SearchResult> = results.iter().collect();
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ctx = AssembledContext::default();
    for r in ranked {
        let body = if r.text.trim().is_empty() {
            r.snippet.as_str()
        } else {
            r.text.as_str()
        };
        let block = format!(
            "[{}] source: {}\n{}\n\n",
            ctx.sources.len() + 1,
            r.source_path,
            body.trim()
        );
        let cost = estimate_tokens(&block);
        if ctx.estimated_tokens + cost > max_tokens {
            debug!(path = %r.source_path, cost, "passage over context budget, skipped");
            continue;
        }
        ctx.text.push_str(&block);
        ctx.estimated_tokens += cost;
        ctx.sources.push(AnswerSource {
            path: r.source_path.clone(),
            score: r.score,
        });
    }
    ctx
}

fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "Vault passages:\n\n{}Question: {}\n\nAnswer citing the passage numbers you used.",
        context,
        query.trim()
    )
}

/// Ask the answering model. Only packed passages are ever sent.
pub async fn query_llm(
    llm: &dyn LlmClient,
    query: &str,
    context: &AssembledContext,
) -> Result<AnswerOutcome, PipelineError> {
    if context.is_empty() {
        return Ok(AnswerOutcome::NoRelevantContent);
    }

    let prompt = build_prompt(query, &context.text);
    match llm.complete(&prompt).await {
        Ok(answer) => Ok(AnswerOutcome::Answered(Answer {
            answer,
            sources: context.sources.clone(),
        })),
        Err(e) => {
            warn!(model = llm.name(), error = %e, "answering model call failed");
            Err(PipelineError::LlmUnavailable(format!("{:#}", e)))
        }
    }
}
