use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{ModelError, ParseError};
use crate::llm::{ModelRequest, ReasoningModel};
use crate::prompt;
use crate::types::{ActionHistory, ActionProposal, DecisionBundle, ElementDescriptor, ELEMENT_TEXT_MAX_CHARS};

static THINKING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<thinking>(.*?)</thinking>").expect("valid regex"));
static PAGE_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<page_summary>(.*?)</page_summary>").expect("valid regex"));
static JSON_RESPONSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<json_response>(.*?)</json_response>").expect("valid regex"));

/// Read-only snapshot of everything one decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub objective: &'a str,
    pub elements: &'a [ElementDescriptor],
    pub history: &'a ActionHistory,
    pub user_response: Option<&'a str>,
    pub screenshot_base64: Option<&'a str>,
    pub knowledge: Option<&'a str>,
    pub page_changed: bool,
}

/// Shape of the `<json_response>` block.
#[derive(Debug, Deserialize)]
struct ResponsePayload {
    #[serde(default)]
    actions: Vec<ActionProposal>,
    #[serde(default, alias = "rationale")]
    overall_explanation_of_bundle: String,
    #[serde(default)]
    page_summary: Option<String>,
}

/// Asks the reasoning model for the next bundle. Never fails: every problem
/// on the way becomes a bundle whose first action is FAIL.
pub struct DecisionEngine {
    model: Arc<dyn ReasoningModel>,
    system_prompt: String,
    timeout: Duration,
    max_element_text: usize,
}

impl DecisionEngine {
    pub fn new(model: Arc<dyn ReasoningModel>) -> Self {
        Self {
            model,
            system_prompt: prompt::SYSTEM_PROMPT.to_string(),
            timeout: Duration::from_secs(60),
            max_element_text: ELEMENT_TEXT_MAX_CHARS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_element_text(mut self, chars: usize) -> Self {
        self.max_element_text = chars;
        self
    }

    pub async fn decide(&self, ctx: &DecisionContext<'_>, error_feedback: Option<&str>) -> DecisionBundle {
        let request = ModelRequest {
            system_prompt: self.system_prompt.clone(),
            user_prompt: prompt::compose(ctx, error_feedback, self.max_element_text),
            image_base64: ctx.screenshot_base64.map(String::from),
        };

        info!(
            elements = ctx.elements.len(),
            history = ctx.history.len(),
            page_changed = ctx.page_changed,
            retry = error_feedback.is_some(),
            "asking reasoning model for next actions"
        );

        let raw = match tokio::time::timeout(self.timeout, self.model.propose(&request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, "reasoning model call failed");
                return DecisionBundle::failed(e.to_string());
            }
            Err(_) => {
                let e = ModelError::Timeout(self.timeout);
                warn!(error = %e, "reasoning model call timed out");
                return DecisionBundle::failed(e.to_string());
            }
        };
        debug!(raw = %raw, "model answered");

        match parse_response(&raw) {
            Ok(mut bundle) => {
                if !ctx.page_changed {
                    bundle.page_summary = None;
                }
                bundle
            }
            Err(e) => {
                warn!(error = %e, "model answer did not match the expected format");
                let mut bundle = DecisionBundle::failed(e.to_string());
                bundle.thought_process = section(&THINKING, &raw);
                bundle
            }
        }
    }
}

fn section(re: &Regex, raw: &str) -> Option<String> {
    re.captures(raw)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Strip a Markdown code fence the model may wrap around the JSON.
fn strip_fence(block: &str) -> &str {
    let trimmed = block.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Parse a tagged model answer into a bundle.
pub fn parse_response(raw: &str) -> Result<DecisionBundle, ParseError> {
    let json_block = section(&JSON_RESPONSE, raw).ok_or(ParseError::MissingJsonBlock)?;
    let payload: ResponsePayload = serde_json::from_str(strip_fence(&json_block))
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if payload.actions.is_empty() {
        return Err(ParseError::NoActions);
    }

    Ok(DecisionBundle {
        actions: payload.actions,
        rationale: payload.overall_explanation_of_bundle,
        thought_process: section(&THINKING, raw),
        page_summary: section(&PAGE_SUMMARY, raw)
            .or(payload.page_summary.filter(|s| !s.trim().is_empty())),
    })
}
