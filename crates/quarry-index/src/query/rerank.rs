//! LLM relevance scoring for the top search candidates.

use std::time::Duration;

use futures::StreamExt;
use quarry_llm::LlmProvider;
use quarry_llm::provider::Message;
use serde::Deserialize;

use crate::config::RerankConfig;
use crate::error::{IndexError, Result};
use crate::points::ChunkRef;

const MAX_SNIPPET_CHARS: usize = 1500;

/// Score in `[0, 1]` plus the model's reason, if it gave one.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub score: f32,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
struct RawJudgment {
    score: f32,
    #[serde(default)]
    reason: Option<String>,
}

/// Score every candidate against the original query.
///
/// All-or-nothing: `None` if any call fails, any reply is unparseable, or
/// the whole batch exceeds the timeout.
pub async fn judge_candidates<L: LlmProvider>(
    llm: &L,
    query: &str,
    candidates: &[&ChunkRef],
    config: &RerankConfig,
) -> Option<Vec<Judgment>> {
    if candidates.is_empty() {
        return Some(Vec::new());
    }
    let scoring = futures::stream::iter(candidates.iter().map(|c| judge_one(llm, query, c)))
        .buffered(config.concurrency.max(1))
        .collect::<Vec<_>>();

    match tokio::time::timeout(Duration::from_secs(config.timeout_secs), scoring).await {
        Ok(results) => match results.into_iter().collect::<Result<Vec<_>>>() {
            Ok(judgments) => Some(judgments),
            Err(e) => {
                tracing::warn!("re-ranking skipped: {e}");
                None
            }
        },
        Err(_) => {
            tracing::warn!(timeout_secs = config.timeout_secs, "re-ranking timed out");
            None
        }
    }
}

async fn judge_one<L: LlmProvider>(llm: &L, query: &str, chunk: &ChunkRef) -> Result<Judgment> {
    let messages = [
        Message::system(
            "You judge how relevant a code snippet is to a search query. Reply with ONLY a \
             JSON object {\"score\": number between 0 and 1, \"reason\": short string}.",
        ),
        Message::user(format!(
            "Query: {query}\n\nFile: {}\n```\n{}\n```",
            chunk.file_path,
            truncate_chars(&chunk.content, MAX_SNIPPET_CHARS)
        )),
    ];
    let reply = llm.chat(&messages).await?;
    parse_judgment(&reply)
}

pub(crate) fn parse_judgment(reply: &str) -> Result<Judgment> {
    let json = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&reply[start..=end]),
        _ => None,
    };
    let judgment = if let Some(raw) = json.and_then(|j| serde_json::from_str::<RawJudgment>(j).ok()) {
        Judgment {
            score: raw.score,
            reason: raw.reason.filter(|r| !r.trim().is_empty()),
        }
    } else {
        // Only in-range numbers count, and a decimal beats a bare 0 or 1, so
        // file names and list markers in the prose are skipped.
        let scores: Vec<(&str, f32)> = reply
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .filter_map(|tok| Some((tok, tok.parse::<f32>().ok()?)))
            .filter(|(_, s)| (0.0..=1.0).contains(s))
            .collect();
        let score = scores
            .iter()
            .find(|(tok, _)| tok.trim_end_matches('.').contains('.'))
            .or_else(|| scores.first())
            .map(|(_, s)| *s)
            .ok_or_else(|| IndexError::Parse(format!("no relevance score in reply: {reply:.80}")))?;
        Judgment {
            score,
            reason: None,
        }
    };
    if !judgment.score.is_finite() || !(0.0..=1.0).contains(&judgment.score) {
        return Err(IndexError::Parse(format!(
            "relevance score {} outside [0, 1]",
            judgment.score
        )));
    }
    Ok(judgment)
}

fn truncate_chars(text: &str, max: usize) -> &str {
    text.char_indices().nth(max).map_or(text, |(i, _)| &text[..i])
}
