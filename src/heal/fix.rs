//! Phase 3 — fix generation on the heal model.
//!
//! The model receives the diagnosis, the citation bundle, and the current
//! adapter source, and returns a full replacement source with a confidence
//! score. The reload manager decides what happens to it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::reload::store::Citation;
use crate::router::Router;
use crate::scri::{ChatRequest, Message, Role};

use super::diagnose::Diagnosis;
use super::HealError;

/// A proposed replacement adapter source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixProposal {
    /// Full new adapter source text.
    pub source: String,
    /// Model confidence in [0, 1]; clamped on parse.
    pub confidence: f64,
    /// Why the model believes the fix is correct.
    pub rationale: String,
}

/// System prompt for the fixer.
const FIX_SYSTEM_PROMPT: &str = "\
You are repairing the wire mapping of an LLM gateway adapter. Using the
diagnosis and the research citations, produce a corrected full replacement of
the adapter mapping source.

Respond with a JSON object:
{
  \"source\": \"the complete corrected mapping source\",
  \"confidence\": 0.0 to 1.0,
  \"rationale\": \"why this fix is correct\"
}

Output ONLY the JSON object, no other text.";

/// Run the fix phase.
///
/// # Errors
///
/// Returns [`HealError::FixFailed`] when the heal model is unreachable or
/// its reply cannot be parsed.
pub async fn propose_fix(
    router: &Router,
    heal_model: &str,
    provider: &str,
    diagnosis: &Diagnosis,
    citations: &[Citation],
    adapter_source: &str,
) -> Result<FixProposal, HealError> {
    let mut prompt = String::new();
    prompt.push_str(&format!("## Provider\n{provider}\n"));
    prompt.push_str(&format!(
        "\n## Diagnosis\n{}\nLikely cause: {}\n",
        diagnosis.summary, diagnosis.likely_cause
    ));

    prompt.push_str("\n## Citations\n");
    if citations.is_empty() {
        prompt.push_str("none collected\n");
    }
    for citation in citations {
        prompt.push_str(&format!("- {}: {}\n", citation.url, citation.excerpt));
    }

    prompt.push_str("\n## Current Adapter Mapping\n");
    prompt.push_str(adapter_source);

    let request = ChatRequest {
        model: heal_model.to_owned(),
        messages: vec![
            Message::text(Role::System, FIX_SYSTEM_PROMPT),
            Message::text(Role::User, prompt),
        ],
        temperature: Some(0.0),
        max_tokens: Some(4096),
        top_p: None,
        tools: Vec::new(),
        tool_choice: None,
        thinking: None,
        metadata: std::collections::BTreeMap::new(),
    };

    let response = router
        .chat(&request)
        .await
        .map_err(|e| HealError::FixFailed(format!("heal model call failed: {e}")))?;

    let text = response.text();
    let proposal = parse_proposal(&text)
        .ok_or_else(|| HealError::FixFailed("undecodable fix reply".to_owned()))?;

    if proposal.source.trim().is_empty() {
        return Err(HealError::FixFailed("fix reply has empty source".to_owned()));
    }

    debug!(provider, confidence = proposal.confidence, "fix proposed");
    Ok(proposal)
}

/// Parse a fix proposal out of model text, clamping confidence to [0, 1].
pub fn parse_proposal(text: &str) -> Option<FixProposal> {
    let trimmed = text.trim();
    let json_text = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };

    match serde_json::from_str::<FixProposal>(json_text) {
        Ok(mut proposal) => {
            proposal.confidence = proposal.confidence.clamp(0.0, 1.0);
            Some(proposal)
        }
        Err(e) => {
            warn!(
                error = %e,
                preview = &text[..text.len().min(200)],
                "failed to parse fix proposal JSON"
            );
            None
        }
    }
}
