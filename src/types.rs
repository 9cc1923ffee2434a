use serde::{Deserialize, Serialize};
use std::fmt;

/// One interactive element as seen this turn. `index` is its position in the
/// turn's list and means nothing once the turn is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub index: usize,
    pub selector: String,
    pub tag: String,
    pub text: String,
}

impl ElementDescriptor {
    /// Coarse identity used to compare views across turns.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.tag, self.text.trim())
    }
}

/// The action vocabulary the model may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Click,
    Type,
    AskUser,
    Finish,
    Fail,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "CLICK",
            ActionKind::Type => "TYPE",
            ActionKind::AskUser => "ASK_USER",
            ActionKind::Finish => "FINISH",
            ActionKind::Fail => "FAIL",
        }
    }

    /// CLICK and TYPE act on an element; the rest steer the turn loop.
    pub fn targets_element(self) -> bool {
        matches!(self, ActionKind::Click | ActionKind::Type)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single action proposed by the model.
///
/// The index is signed on purpose: models do emit `-1`, and that has to reach
/// the validator as an out-of-range index rather than a deserialization error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_element_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub explanation: String,
}

impl ActionProposal {
    pub fn click(index: i64, explanation: impl Into<String>) -> Self {
        Self {
            target_element_index: Some(index),
            ..Self::bare(ActionKind::Click, explanation)
        }
    }

    pub fn type_into(index: i64, value: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            target_element_index: Some(index),
            type_value: Some(value.into()),
            ..Self::bare(ActionKind::Type, explanation)
        }
    }

    pub fn ask_user(question: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            user_question: Some(question.into()),
            ..Self::bare(ActionKind::AskUser, explanation)
        }
    }

    pub fn finish(status: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            status_message: Some(status.into()),
            ..Self::bare(ActionKind::Finish, explanation)
        }
    }

    pub fn fail(status: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            status_message: Some(status.into()),
            ..Self::bare(ActionKind::Fail, explanation)
        }
    }

    fn bare(kind: ActionKind, explanation: impl Into<String>) -> Self {
        Self {
            kind,
            target_element_index: None,
            type_value: None,
            user_question: None,
            status_message: None,
            explanation: explanation.into(),
        }
    }
}

/// Everything the Decision Engine produced for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionBundle {
    pub actions: Vec<ActionProposal>,
    /// The model's explanation of the bundle as a whole.
    pub rationale: String,
    /// Free-form reasoning from the `<thinking>` section, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_summary: Option<String>,
}

impl DecisionBundle {
    /// The action whose kind governs turn-level control.
    pub fn first(&self) -> Option<&ActionProposal> {
        self.actions.first()
    }

    /// A bundle with a single FAIL action. Used for every degraded path.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            actions: vec![ActionProposal::fail(
                "The reasoning engine could not produce a valid action.",
                reason.clone(),
            )],
            rationale: format!("An internal error occurred: {reason}"),
            thought_process: None,
            page_summary: None,
        }
    }

    /// The override that ends a turn after too many invalid proposals.
    pub fn ask_for_help(question: impl Into<String>) -> Self {
        Self {
            actions: vec![ActionProposal::ask_user(
                question,
                "Repeated attempts to choose a valid element failed.",
            )],
            rationale: "Asking the operator for help after repeated invalid proposals.".into(),
            thought_process: None,
            page_summary: None,
        }
    }
}

/// A human-readable record of one attempted (or reported) action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub action_type: String,
    pub description: String,
}

impl TurnOutcome {
    pub fn new(action_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            description: description.into(),
        }
    }

    pub fn succeeded(action: &ActionProposal) -> Self {
        Self::new(
            action.kind.as_str(),
            format!("Successfully executed: {}", action.explanation),
        )
    }

    pub fn failed(action: &ActionProposal, reason: impl fmt::Display) -> Self {
        let index = action
            .target_element_index
            .map(|i| i.to_string())
            .unwrap_or_else(|| "none".to_string());
        Self::new(
            ActionKind::Fail.as_str(),
            format!(
                "Attempted '{}' on index '{}' but it FAILED. Reason: {}",
                action.kind, index, reason
            ),
        )
    }

    pub fn is_failure(&self) -> bool {
        self.action_type == ActionKind::Fail.as_str()
    }
}

/// Append-only record of what happened so far in a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionHistory(Vec<TurnOutcome>);

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome: TurnOutcome) {
        self.0.push(outcome);
    }

    pub fn extend(&mut self, outcomes: impl IntoIterator<Item = TurnOutcome>) {
        self.0.extend(outcomes);
    }

    pub fn entries(&self) -> &[TurnOutcome] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&TurnOutcome> {
        self.0.last()
    }
}

/// Per-turn bookkeeping for the validation loop. Starts at zero every turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub retry_count: u32,
    pub error_feedback: Option<String>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CHANGE_THRESHOLD: f64 = 0.8;
pub const DEFAULT_MAX_TURNS: usize = 15;
pub const ELEMENT_TEXT_MAX_CHARS: usize = 80;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_parses_model_json() {
        let raw = r#"{"type":"TYPE","target_element_index":2,"type_value":"hello","explanation":"fill name"}"#;
        let action: ActionProposal = serde_json::from_str(raw).unwrap();
        assert_eq!(action.kind, ActionKind::Type);
        assert_eq!(action.target_element_index, Some(2));
        assert_eq!(action.type_value.as_deref(), Some("hello"));
    }

    #[test]
    fn negative_index_survives_parsing() {
        let raw = r#"{"type":"CLICK","target_element_index":-1,"explanation":"oops"}"#;
        let action: ActionProposal = serde_json::from_str(raw).unwrap();
        assert_eq!(action.target_element_index, Some(-1));
    }

    #[test]
    fn failure_outcome_embeds_reason() {
        let action = ActionProposal::click(3, "open menu");
        let outcome = TurnOutcome::failed(&action, "element not found");
        assert!(outcome.is_failure());
        assert_eq!(
            outcome.description,
            "Attempted 'CLICK' on index '3' but it FAILED. Reason: element not found"
        );
    }

    #[test]
    fn fingerprint_trims_text() {
        let el = ElementDescriptor {
            index: 0,
            selector: "#go".into(),
            tag: "button".into(),
            text: "  Go  ".into(),
        };
        assert_eq!(el.fingerprint(), "button:Go");
    }
}
