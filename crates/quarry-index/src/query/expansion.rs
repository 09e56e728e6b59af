//! LLM query expansion.

use std::time::Duration;

use quarry_llm::LlmProvider;
use quarry_llm::provider::Message;
use serde::Deserialize;

use crate::config::ExpansionConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedQuery {
    /// Accepted expansion terms, most confident first.
    pub terms: Vec<String>,
    /// Text that is embedded: the original repeated, then the terms.
    pub combined: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTerm {
    Scored { term: String, confidence: f32 },
    Plain(String),
}

/// Ask `llm` for related terms. `None` on any failure or when nothing
/// passes the confidence threshold; the caller searches with the original.
pub async fn expand_query<L: LlmProvider>(
    llm: &L,
    query: &str,
    config: &ExpansionConfig,
) -> Option<ExpandedQuery> {
    let messages = [
        Message::system(
            "You expand code search queries. Reply with ONLY a JSON array of objects \
             {\"term\": string, \"confidence\": number between 0 and 1}. No explanation.",
        ),
        Message::user(format!(
            "Give up to {} related search terms, synonyms or identifiers for: \"{query}\"",
            config.max_terms
        )),
    ];
    let response = match tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        llm.chat(&messages),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::warn!("query expansion failed: {e}");
            return None;
        }
        Err(_) => {
            tracing::warn!(timeout_secs = config.timeout_secs, "query expansion timed out");
            return None;
        }
    };

    let terms = select_terms(parse_terms(&response), query, config);
    if terms.is_empty() {
        return None;
    }
    let combined = combine(query, &terms, config.original_weight);
    tracing::debug!(?terms, "query expanded");
    Some(ExpandedQuery { terms, combined })
}

/// Extract `(term, confidence)` pairs from a reply that may wrap the JSON
/// array in prose or code fences. Bare strings count as fully confident.
pub(crate) fn parse_terms(response: &str) -> Vec<(String, f32)> {
    let json = match (response.find('['), response.rfind(']')) {
        (Some(start), Some(end)) if start < end => &response[start..=end],
        _ => response,
    };
    match serde_json::from_str::<Vec<RawTerm>>(json) {
        Ok(raw) => raw
            .into_iter()
            .map(|t| match t {
                RawTerm::Scored { term, confidence } => (term, confidence),
                RawTerm::Plain(term) => (term, 1.0),
            })
            .collect(),
        Err(e) => {
            tracing::debug!("unparseable expansion reply: {e}");
            Vec::new()
        }
    }
}

pub(crate) fn select_terms(
    mut terms: Vec<(String, f32)>,
    query: &str,
    config: &ExpansionConfig,
) -> Vec<String> {
    terms.retain(|(_, c)| c.is_finite() && *c >= config.min_confidence);
    terms.sort_by(|a, b| b.1.total_cmp(&a.1));

    let original = query.trim().to_lowercase();
    let mut seen = vec![original];
    let mut selected = Vec::new();
    for (term, _) in terms {
        let term = term.trim();
        let key = term.to_lowercase();
        if term.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        selected.push(term.to_string());
        if selected.len() == config.max_terms {
            break;
        }
    }
    selected
}

pub(crate) fn combine(query: &str, terms: &[String], original_weight: usize) -> String {
    let query = query.trim();
    let mut parts: Vec<&str> = std::iter::repeat_n(query, original_weight.max(1)).collect();
    parts.extend(terms.iter().map(String::as_str));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_llm::mock::MockProvider;

    #[test]
    fn parses_scored_terms_inside_prose() {
        let reply = "Sure:\n```json\n[{\"term\": \"load settings\", \"confidence\": 0.9}, \"toml\"]\n```";
        assert_eq!(
            parse_terms(reply),
            vec![("load settings".to_string(), 0.9), ("toml".to_string(), 1.0)]
        );
    }

    #[test]
    fn garbage_reply_yields_nothing() {
        assert!(parse_terms("I cannot help with that").is_empty());
    }

    #[test]
    fn selection_applies_threshold_limit_and_dedup() {
        let config = ExpansionConfig {
            max_terms: 2,
            ..ExpansionConfig::default()
        };
        let terms = vec![
            ("settings".to_string(), 0.7),
            ("Parse Config".to_string(), 0.99),
            ("low".to_string(), 0.2),
            ("loader".to_string(), 0.95),
            ("SETTINGS".to_string(), 0.65),
        ];
        assert_eq!(
            select_terms(terms, "parse config", &config),
            vec!["loader", "settings"]
        );
    }

    #[test]
    fn original_is_weighted_by_repetition() {
        let combined = combine(" parse config ", &["loader".into()], 2);
        assert_eq!(combined, "parse config parse config loader");
        assert_eq!(combine("q", &[], 0), "q");
    }

    #[tokio::test]
    async fn expansion_end_to_end() {
        let llm = MockProvider::with_responses(vec![
            r#"[{"term": "read settings file", "confidence": 0.8}]"#.into(),
        ]);
        let expanded = expand_query(&llm, "parse config", &ExpansionConfig::default())
            .await
            .unwrap();
        assert_eq!(expanded.terms, vec!["read settings file"]);
        assert_eq!(expanded.combined, "parse config parse config read settings file");
    }

    #[tokio::test]
    async fn llm_failure_disables_expansion() {
        let llm = MockProvider::failing();
        assert!(
            expand_query(&llm, "parse config", &ExpansionConfig::default())
                .await
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_llm_times_out() {
        let llm = MockProvider::default().with_delay(60_000);
        let config = ExpansionConfig {
            timeout_secs: 1,
            ..ExpansionConfig::default()
        };
        assert!(expand_query(&llm, "q", &config).await.is_none());
    }
}
