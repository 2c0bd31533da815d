//! Phase 2 — research through search-capable providers.
//!
//! Search providers are tools here; they never choose the fix. Each query
//! walks the configured preference list and takes the first registered,
//! search-capable provider that answers. Individual query failures are
//! tolerated — the fix phase works from whatever citations were collected.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::GatewayContext;
use crate::reload::store::Citation;
use crate::scri::{ChatRequest, Message, Role};

use super::HealError;

/// System prompt for the research calls.
const RESEARCH_SYSTEM_PROMPT: &str = "\
You are a research assistant with web search. Search for the query and reply
with a JSON array of findings:
[{\"url\": \"...\", \"excerpt\": \"one or two relevant sentences\"}]
Output ONLY the JSON array, no other text.";

/// Run the research phase over the given queries.
///
/// # Errors
///
/// Returns [`HealError::ResearchFailed`] only when no search-capable
/// provider is registered at all; per-query failures degrade to an empty
/// contribution.
pub async fn research(
    ctx: &GatewayContext,
    preference: &[String],
    queries: &[String],
    max_queries: usize,
) -> Result<Vec<Citation>, HealError> {
    let capable: Vec<&String> = preference
        .iter()
        .filter(|name| provider_is_search_capable(ctx, name))
        .collect();
    if capable.is_empty() {
        return Err(HealError::ResearchFailed(
            "no search-capable provider registered".to_owned(),
        ));
    }

    let mut citations = Vec::new();

    for query in queries.iter().take(max_queries) {
        let mut answered = false;
        for provider in &capable {
            match run_query(ctx, provider, query).await {
                Ok(mut found) => {
                    debug!(provider = %provider, query = %query, hits = found.len(), "research query answered");
                    citations.append(&mut found);
                    answered = true;
                    break;
                }
                Err(error) => {
                    warn!(provider = %provider, query = %query, error = %error, "research query failed, trying next provider");
                }
            }
        }
        if !answered {
            warn!(query = %query, "no provider answered research query");
        }
    }

    Ok(citations)
}

fn provider_is_search_capable(ctx: &GatewayContext, provider: &str) -> bool {
    ctx.registry.binding(provider).is_some_and(|binding| {
        binding
            .adapter
            .list_models()
            .iter()
            .any(|caps| caps.supports_search)
    })
}

async fn run_query(
    ctx: &GatewayContext,
    provider: &str,
    query: &str,
) -> Result<Vec<Citation>, String> {
    let binding = ctx
        .registry
        .binding(provider)
        .ok_or_else(|| format!("provider '{provider}' has no live adapter"))?;

    let request = ChatRequest {
        model: String::new(),
        messages: vec![
            Message::text(Role::System, RESEARCH_SYSTEM_PROMPT),
            Message::text(Role::User, query),
        ],
        temperature: Some(0.0),
        max_tokens: Some(1024),
        top_p: None,
        tools: Vec::new(),
        tool_choice: None,
        thinking: None,
        metadata: std::collections::BTreeMap::new(),
    };

    let response = binding
        .adapter
        .chat(&request)
        .await
        .map_err(|e| e.to_string())?;

    Ok(parse_citations(&response.text()))
}

/// Parse a citation array out of model text, tolerating prose around the
/// brackets. Entries without a URL are dropped.
pub fn parse_citations(text: &str) -> Vec<Citation> {
    let trimmed = text.trim();
    let json_text = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Vec::new(),
    };

    let Ok(entries) = serde_json::from_str::<Vec<Value>>(json_text) else {
        return Vec::new();
    };

    let now = Utc::now();
    entries
        .into_iter()
        .filter_map(|entry| {
            let url = entry.get("url")?.as_str()?.to_owned();
            let excerpt = entry
                .get("excerpt")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            Some(Citation {
                url,
                excerpt,
                retrieved_at: now,
            })
        })
        .collect()
}
