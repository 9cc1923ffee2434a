//! Grounds a proposed bundle against the current element list.
//!
//! One turn moves through `Drafting -> Validating -> {Valid, Invalid}`.
//! `Invalid` goes back to `Drafting` with feedback until the retry ceiling is
//! hit, at which point the bundle is replaced by a single ASK_USER action that
//! counts as valid. Every turn therefore ends in `Valid`.

use thiserror::Error;
use tracing::{info, warn};

use crate::brain::{DecisionContext, DecisionEngine};
use crate::types::{ActionKind, DecisionBundle, ElementDescriptor, RetryState, DEFAULT_MAX_RETRIES};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroundingError {
    #[error(
        "Action {position} ({kind}) targets element index {index}, which does not exist. {}",
        valid_range(.element_count)
    )]
    OutOfRange {
        position: usize,
        kind: ActionKind,
        index: i64,
        element_count: usize,
    },

    #[error(
        "Action {position} ({kind}) has no target_element_index. {}",
        valid_range(.element_count)
    )]
    MissingIndex {
        position: usize,
        kind: ActionKind,
        element_count: usize,
    },
}

fn valid_range(element_count: &usize) -> String {
    match *element_count {
        0 => "There are no interactive elements in the current view, so CLICK and TYPE cannot be used.".to_string(),
        n => format!("Valid indices are 0..{} ({n} elements).", n - 1),
    }
}

/// Fail-fast check: the first bad action rejects the whole bundle.
pub fn validate_bundle(
    bundle: &DecisionBundle,
    elements: &[ElementDescriptor],
) -> Result<(), GroundingError> {
    let element_count = elements.len();
    for (i, action) in bundle.actions.iter().enumerate() {
        let position = i + 1;
        match action.target_element_index {
            Some(index) if index < 0 || index as u64 >= element_count as u64 => {
                return Err(GroundingError::OutOfRange {
                    position,
                    kind: action.kind,
                    index,
                    element_count,
                });
            }
            Some(_) => {}
            None if action.kind.targets_element() => {
                return Err(GroundingError::MissingIndex {
                    position,
                    kind: action.kind,
                    element_count,
                });
            }
            None => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionState {
    Drafting(RetryState),
    Validating {
        bundle: DecisionBundle,
        retry: RetryState,
    },
    Invalid {
        error: GroundingError,
        retry: RetryState,
    },
    Valid {
        bundle: DecisionBundle,
        retry: RetryState,
        /// `true` when the bundle is the ASK_USER override.
        forced: bool,
    },
}

impl DecisionState {
    pub fn start() -> Self {
        DecisionState::Drafting(RetryState::default())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DecisionState::Valid { .. })
    }

    /// `Drafting` + a fresh bundle -> `Validating`.
    pub fn drafted(self, bundle: DecisionBundle) -> Self {
        match self {
            DecisionState::Drafting(retry) => DecisionState::Validating { bundle, retry },
            other => other,
        }
    }

    /// `Validating` -> `Valid` or `Invalid`.
    pub fn validate(self, elements: &[ElementDescriptor]) -> Self {
        match self {
            DecisionState::Validating { bundle, retry } => match validate_bundle(&bundle, elements) {
                Ok(()) => DecisionState::Valid {
                    bundle,
                    retry,
                    forced: false,
                },
                Err(error) => DecisionState::Invalid { error, retry },
            },
            other => other,
        }
    }

    /// `Invalid` -> `Drafting` with feedback, or the forced ASK_USER `Valid`
    /// once `max_retries` re-decisions have been spent.
    pub fn resolve_invalid(self, max_retries: u32) -> Self {
        match self {
            DecisionState::Invalid { error, retry } if retry.retry_count >= max_retries => {
                let feedback = error.to_string();
                warn!(retries = retry.retry_count, %feedback, "retry ceiling reached, asking the operator");
                DecisionState::Valid {
                    bundle: DecisionBundle::ask_for_help(format!(
                        "I could not pick a valid element on this page after several attempts ({feedback}). How should I continue?"
                    )),
                    retry: RetryState {
                        retry_count: retry.retry_count,
                        error_feedback: Some(feedback),
                    },
                    forced: true,
                }
            }
            DecisionState::Invalid { error, retry } => {
                let feedback = error.to_string();
                info!(retry = retry.retry_count + 1, %feedback, "proposal rejected, deciding again");
                DecisionState::Drafting(RetryState {
                    retry_count: retry.retry_count + 1,
                    error_feedback: Some(feedback),
                })
            }
            other => other,
        }
    }
}

/// A validated bundle plus how it was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTurn {
    pub bundle: DecisionBundle,
    /// Number of re-decisions spent this turn.
    pub retries: u32,
    pub forced_fallback: bool,
}

/// Runs the decide/validate loop for one turn.
pub struct Planner {
    engine: DecisionEngine,
    max_retries: u32,
}

impl Planner {
    pub fn new(engine: DecisionEngine) -> Self {
        Self {
            engine,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub async fn plan(&self, ctx: &DecisionContext<'_>) -> PlannedTurn {
        let mut state = DecisionState::start();
        loop {
            state = match state {
                DecisionState::Drafting(retry) => {
                    let bundle = self
                        .engine
                        .decide(ctx, retry.error_feedback.as_deref())
                        .await;
                    DecisionState::Drafting(retry).drafted(bundle)
                }
                DecisionState::Validating { .. } => state.validate(ctx.elements),
                DecisionState::Invalid { .. } => state.resolve_invalid(self.max_retries),
                DecisionState::Valid {
                    bundle,
                    retry,
                    forced,
                } => {
                    return PlannedTurn {
                        bundle,
                        retries: retry.retry_count,
                        forced_fallback: forced,
                    };
                }
            };
        }
    }
}
