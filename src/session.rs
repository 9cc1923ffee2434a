//! Session state for deployments where a separate frontend executes the
//! actions and reports back on the next call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{ActionHistory, ActionKind, ActionProposal, DecisionBundle, ElementDescriptor, TurnOutcome};

/// A frontend's report for one action of the previously proposed bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// `SUCCESS` or `FAIL`, case-insensitive.
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ExecutionReport {
    pub fn success() -> Self {
        Self {
            status: "SUCCESS".into(),
            error_message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: "FAIL".into(),
            error_message: Some(message.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status.eq_ignore_ascii_case("SUCCESS")
    }

    fn to_outcome(&self, action: &ActionProposal) -> TurnOutcome {
        if self.succeeded() {
            TurnOutcome::new(action.kind.as_str(), action.explanation.clone())
        } else {
            TurnOutcome::new(
                ActionKind::Fail.as_str(),
                format!(
                    "Action '{}' failed with error: {}",
                    action.kind,
                    self.error_message.as_deref().unwrap_or("unknown error")
                ),
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub objective: String,
    pub history: ActionHistory,
    /// Proposed but not yet confirmed by an execution report.
    pub last_proposed: Option<Vec<ActionProposal>>,
    /// The element list the last bundle was grounded on.
    pub last_elements: Option<Vec<ElementDescriptor>>,
    /// Turns decided so far.
    pub turns: usize,
}

impl Session {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            history: ActionHistory::new(),
            last_proposed: None,
            last_elements: None,
            turns: 0,
        }
    }

    /// Fold execution reports for the last proposed bundle into the history.
    /// Reports are matched to actions by position; extra reports are ignored.
    /// Returns the number of outcomes recorded.
    pub fn reconcile(&mut self, reports: &[ExecutionReport]) -> usize {
        if reports.is_empty() {
            return 0;
        }
        let Some(proposed) = self.last_proposed.take() else {
            debug!(reports = reports.len(), "reports received without a pending bundle");
            return 0;
        };
        let outcomes: Vec<TurnOutcome> = proposed
            .iter()
            .zip(reports)
            .map(|(action, report)| report.to_outcome(action))
            .collect();
        let recorded = outcomes.len();
        self.history.extend(outcomes);
        recorded
    }

    pub fn record_turn(&mut self, bundle: &DecisionBundle, elements: Vec<ElementDescriptor>) {
        self.last_proposed = Some(bundle.actions.clone());
        self.last_elements = Some(elements);
        self.turns += 1;
    }
}

/// In-memory sessions keyed by id. Each session has its own lock, held for a
/// whole turn, so turns on one session run one after another.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, objective: impl Into<String>) -> String {
        let id = format!("session-{}", Uuid::new_v4());
        self.sessions
            .lock()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(Session::new(objective))));
        info!(session = %id, "session created");
        id
    }

    /// Exclusive access to one session until the guard is dropped. A second
    /// checkout of the same session waits for the first.
    pub async fn checkout(&self, id: &str) -> Option<OwnedMutexGuard<Session>> {
        let session = self.sessions.lock().await.get(id).cloned()?;
        Some(session.lock_owned().await)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        let session = self.sessions.lock().await.get(id).cloned()?;
        let snapshot = session.lock().await.clone();
        Some(snapshot)
    }
}
