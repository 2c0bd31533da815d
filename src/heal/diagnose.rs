//! Phase 1 — diagnosis on the heal model.
//!
//! The heal model is cheap and local by default. Raw error payloads are
//! scrubbed before they reach the prompt, and the reply is parsed with
//! find-the-JSON-object tolerance since small models decorate their output.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::health::RecordedError;
use crate::providers::registry::mapping_notes;
use crate::router::Router;
use crate::scri::{ChatRequest, Message, Role};

use super::{HealError, Scrubber};

/// Maximum search queries accepted from a diagnosis.
const MAX_SEARCH_QUERIES: usize = 5;

/// Maximum characters of adapter source included in the prompt.
const MAX_SOURCE_CHARS: usize = 6000;

/// Maximum characters of the assembled evidence section.
const MAX_EVIDENCE_CHARS: usize = 8000;

/// Structured diagnosis from the heal model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Root cause in one or two sentences.
    pub summary: String,
    /// What most likely changed on the provider side.
    pub likely_cause: String,
    /// Whether the errors reflect real wire-format drift.
    pub is_structural: bool,
    /// Web search queries that would confirm the cause.
    #[serde(default)]
    pub search_queries: Vec<String>,
}

/// System prompt for the diagnostician.
const DIAGNOSIS_SYSTEM_PROMPT: &str = "\
You are a wire-format diagnostician for an LLM gateway. A provider adapter is
producing classified errors. Decide whether the provider's wire format has
actually drifted or the errors are noise.

Respond with a JSON object:
{
  \"summary\": \"one or two sentences\",
  \"likely_cause\": \"what changed on the provider side\",
  \"is_structural\": true | false,
  \"search_queries\": [\"query\", ...]
}

Output ONLY the JSON object, no other text.";

/// Run the diagnosis phase.
///
/// # Errors
///
/// Returns [`HealError::DiagnosisFailed`] when the heal model is unreachable
/// or its reply cannot be parsed.
pub async fn diagnose(
    router: &Router,
    heal_model: &str,
    provider: &str,
    errors: &[RecordedError],
    adapter_source: &str,
    scrubber: &Scrubber,
) -> Result<Diagnosis, HealError> {
    let evidence = build_evidence(provider, errors, adapter_source, scrubber);

    let request = ChatRequest {
        model: heal_model.to_owned(),
        messages: vec![
            Message::text(Role::System, DIAGNOSIS_SYSTEM_PROMPT),
            Message::text(Role::User, evidence),
        ],
        temperature: Some(0.0),
        max_tokens: Some(1024),
        top_p: None,
        tools: Vec::new(),
        tool_choice: None,
        thinking: None,
        metadata: std::collections::BTreeMap::new(),
    };

    let response = router
        .chat(&request)
        .await
        .map_err(|e| HealError::DiagnosisFailed(format!("heal model call failed: {e}")))?;

    let text = response.text();
    if text.is_empty() {
        return Err(HealError::DiagnosisFailed("empty diagnosis reply".to_owned()));
    }

    let mut diagnosis = parse_diagnosis(&text)
        .ok_or_else(|| HealError::DiagnosisFailed("undecodable diagnosis reply".to_owned()))?;
    diagnosis.search_queries.truncate(MAX_SEARCH_QUERIES);

    debug!(
        provider,
        is_structural = diagnosis.is_structural,
        queries = diagnosis.search_queries.len(),
        "diagnosis complete"
    );
    Ok(diagnosis)
}

/// Parse a diagnosis JSON object out of model text, tolerating prose around
/// the braces.
pub fn parse_diagnosis(text: &str) -> Option<Diagnosis> {
    let trimmed = text.trim();
    let json_text = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };

    match serde_json::from_str::<Diagnosis>(json_text) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(
                error = %e,
                preview = &text[..text.len().min(200)],
                "failed to parse diagnosis JSON"
            );
            None
        }
    }
}

/// Assemble the evidence section: classified errors, scrubbed payloads, the
/// current adapter source, and the provider's mapping notes.
fn build_evidence(
    provider: &str,
    errors: &[RecordedError],
    adapter_source: &str,
    scrubber: &Scrubber,
) -> String {
    let mut evidence = String::with_capacity(MAX_EVIDENCE_CHARS);

    evidence.push_str(&format!("## Provider\n{provider}\n"));

    evidence.push_str("\n## Classified Errors\n");
    for error in errors {
        evidence.push_str(&format!(
            "[{}] kind={} {}\n",
            error.at.to_rfc3339(),
            error.kind,
            scrubber.scrub(&error.message),
        ));
        if let Some(details) = &error.details {
            evidence.push_str(&format!("  payload: {}\n", scrubber.scrub(details)));
        }
        if evidence.len() > MAX_EVIDENCE_CHARS {
            evidence.push_str("...[truncated]\n");
            break;
        }
    }

    evidence.push_str("\n## Current Adapter Mapping\n");
    let source = if adapter_source.len() > MAX_SOURCE_CHARS {
        &adapter_source[..MAX_SOURCE_CHARS]
    } else {
        adapter_source
    };
    evidence.push_str(source);

    evidence.push_str("\n## Expected Wire Format\n");
    evidence.push_str(&mapping_notes(provider));

    if evidence.len() > MAX_EVIDENCE_CHARS {
        evidence.truncate(MAX_EVIDENCE_CHARS);
        evidence.push_str("\n...[truncated]");
    }

    evidence
}
