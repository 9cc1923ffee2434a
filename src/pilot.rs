//! Turn loop: extract, analyze, decide, validate, dispatch, execute.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::analyzer;
use crate::brain::{DecisionContext, DecisionEngine};
use crate::change;
use crate::config::{AgentConfig, TurnConfig};
use crate::hands::{ActionExecutor, BrowserPage};
use crate::knowledge::{FileKnowledge, KnowledgeSource};
use crate::llm::ReasoningModel;
use crate::types::{
    ActionHistory, ActionKind, ActionProposal, DecisionBundle, ElementDescriptor, TurnOutcome, DEFAULT_CHANGE_THRESHOLD,
};
use crate::validator::{PlannedTurn, Planner};

/// Answers ASK_USER questions on behalf of the human operator.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn answer(&self, question: &str) -> anyhow::Result<String>;

    /// A message the operator typed between turns, if any.
    async fn interjection(&self) -> Option<String> {
        None
    }
}

/// Everything observed at the start of a turn.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub objective: &'a str,
    pub fragments: &'a [String],
    pub history: &'a ActionHistory,
    pub previous_elements: Option<&'a [ElementDescriptor]>,
    pub user_response: Option<&'a str>,
    pub screenshot_base64: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnDecision {
    /// The element list the bundle is grounded on.
    pub elements: Vec<ElementDescriptor>,
    pub page_changed: bool,
    pub planned: PlannedTurn,
}

/// Analyzer, change detection, retrieval and the planner, shared by the
/// in-process loop and the HTTP session API.
pub struct Navigator {
    planner: Planner,
    knowledge: Option<Arc<dyn KnowledgeSource>>,
    change_threshold: f64,
}

impl Navigator {
    pub fn new(planner: Planner) -> Self {
        Self {
            planner,
            knowledge: None,
            change_threshold: DEFAULT_CHANGE_THRESHOLD,
        }
    }

    pub fn from_config(model: Arc<dyn ReasoningModel>, config: &AgentConfig) -> Self {
        let engine = DecisionEngine::new(model)
            .with_timeout(config.model.timeout())
            .with_max_element_text(config.turn.max_element_text);
        let mut navigator = Self::new(Planner::new(engine).with_max_retries(config.turn.max_retries))
            .with_change_threshold(config.turn.change_threshold);

        if config.features.knowledge_enabled {
            match &config.features.knowledge_path {
                Some(path) => navigator = navigator.with_knowledge(Arc::new(FileKnowledge::new(path))),
                None => warn!("knowledge retrieval enabled but no knowledge_path configured"),
            }
        }
        navigator
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_change_threshold(mut self, threshold: f64) -> Self {
        self.change_threshold = threshold;
        self
    }

    async fn retrieve(&self, objective: &str) -> Option<String> {
        let source = self.knowledge.as_ref()?;
        match source.retrieve(objective).await {
            Ok(context) if context.trim().is_empty() => None,
            Ok(context) => Some(context),
            Err(e) => {
                warn!(error = %e, "knowledge retrieval failed, continuing without context");
                None
            }
        }
    }

    pub async fn decide(&self, obs: Observation<'_>) -> TurnDecision {
        let elements = analyzer::analyze(obs.fragments);
        let page_changed = change::changed(obs.previous_elements, &elements, self.change_threshold);
        let knowledge = self.retrieve(obs.objective).await;

        let ctx = DecisionContext {
            objective: obs.objective,
            elements: &elements,
            history: obs.history,
            user_response: obs.user_response,
            screenshot_base64: obs.screenshot_base64,
            knowledge: knowledge.as_deref(),
            page_changed,
        };
        let planned = self.planner.plan(&ctx).await;
        TurnDecision {
            elements,
            page_changed,
            planned,
        }
    }
}

/// Progress notifications for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    TurnStarted {
        turn: usize,
    },
    Decided {
        turn: usize,
        rationale: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought_process: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        page_summary: Option<String>,
        actions: Vec<ActionProposal>,
        retries: u32,
        forced_fallback: bool,
    },
    Outcome {
        turn: usize,
        outcome: TurnOutcome,
    },
    AskedUser {
        turn: usize,
        question: String,
    },
    Finished {
        status: String,
    },
    Failed {
        status: String,
    },
    TurnLimit {
        max_turns: usize,
    },
}

impl TurnEvent {
    pub fn decided(turn: usize, planned: &PlannedTurn) -> Self {
        TurnEvent::Decided {
            turn,
            rationale: planned.bundle.rationale.clone(),
            thought_process: planned.bundle.thought_process.clone(),
            page_summary: planned.bundle.page_summary.clone(),
            actions: planned.bundle.actions.clone(),
            retries: planned.retries,
            forced_fallback: planned.forced_fallback,
        }
    }
}

/// What a single turn did.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnReport {
    Executed(Vec<TurnOutcome>),
    Asked { question: String, answer: Option<String> },
    Finished(String),
    Failed(String),
    /// The engine proposed nothing.
    Empty,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Finished(String),
    Failed(String),
    TurnLimit(usize),
    NoAction,
}

/// In-process turn loop over a real (or fake) page.
pub struct Pilot<P> {
    objective: String,
    history: ActionHistory,
    last_elements: Option<Vec<ElementDescriptor>>,
    pending_response: Option<String>,
    navigator: Navigator,
    executor: ActionExecutor<P>,
    operator: Arc<dyn Operator>,
    turn: TurnConfig,
    vision: bool,
    events: Option<broadcast::Sender<TurnEvent>>,
}

impl<P: BrowserPage> Pilot<P> {
    pub fn new(
        objective: impl Into<String>,
        navigator: Navigator,
        executor: ActionExecutor<P>,
        operator: Arc<dyn Operator>,
        turn: TurnConfig,
    ) -> Self {
        Self {
            objective: objective.into(),
            history: ActionHistory::new(),
            last_elements: None,
            pending_response: None,
            navigator,
            executor,
            operator,
            turn,
            vision: false,
            events: None,
        }
    }

    pub fn with_vision(mut self, enabled: bool) -> Self {
        self.vision = enabled;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<TurnEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    pub fn last_elements(&self) -> Option<&[ElementDescriptor]> {
        self.last_elements.as_deref()
    }

    pub fn page(&self) -> &P {
        self.executor.page()
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }

    async fn screenshot(&self) -> Option<String> {
        if !self.vision {
            return None;
        }
        match self.executor.page().screenshot_png().await {
            Ok(png) => Some(STANDARD.encode(png)),
            Err(e) => {
                warn!(error = %e, "screenshot failed, deciding without one");
                None
            }
        }
    }

    /// Run turns until FINISH, FAIL, an empty proposal or the turn limit.
    pub async fn run(&mut self) -> RunResult {
        let max_turns = self.turn.max_turns;
        for number in 1..=max_turns {
            match self.turn(number).await {
                TurnReport::Finished(status) => return RunResult::Finished(status),
                TurnReport::Failed(status) => return RunResult::Failed(status),
                TurnReport::Empty => return RunResult::NoAction,
                TurnReport::Asked { answer: None, question } => {
                    return RunResult::Failed(format!("no answer from the operator to: {question}"));
                }
                TurnReport::Executed(_) | TurnReport::Asked { .. } => {}
            }
        }
        warn!(max_turns, "turn limit reached");
        self.emit(TurnEvent::TurnLimit { max_turns });
        RunResult::TurnLimit(max_turns)
    }

    /// One full turn. Never fails; problems surface as FAIL outcomes.
    pub async fn turn(&mut self, number: usize) -> TurnReport {
        info!(turn = number, objective = %self.objective, "starting turn");
        self.emit(TurnEvent::TurnStarted { turn: number });
        tokio::time::sleep(Duration::from_millis(self.turn.settle_delay_ms)).await;

        let fragments = match self.executor.page().list_interactive_fragments().await {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!(turn = number, error = %e, "element extraction failed, deciding on an empty view");
                Vec::new()
            }
        };
        let screenshot = self.screenshot().await;

        if self.pending_response.is_none() {
            self.pending_response = self.operator.interjection().await;
        }
        let user_response = self.pending_response.take();

        let decision = self
            .navigator
            .decide(Observation {
                objective: &self.objective,
                fragments: &fragments,
                history: &self.history,
                previous_elements: self.last_elements.as_deref(),
                user_response: user_response.as_deref(),
                screenshot_base64: screenshot.as_deref(),
            })
            .await;

        let TurnDecision {
            elements,
            page_changed,
            planned,
        } = decision;
        info!(
            turn = number,
            elements = elements.len(),
            page_changed,
            actions = planned.bundle.actions.len(),
            retries = planned.retries,
            rationale = %planned.bundle.rationale,
            "decision ready"
        );
        if let Some(summary) = &planned.bundle.page_summary {
            info!(turn = number, %summary, "page summary");
        }
        self.emit(TurnEvent::decided(number, &planned));

        let report = self.dispatch(number, &planned.bundle, &elements).await;
        self.last_elements = Some(elements);
        report
    }

    async fn dispatch(&mut self, number: usize, bundle: &DecisionBundle, elements: &[ElementDescriptor]) -> TurnReport {
        let Some(first) = bundle.first() else {
            warn!(turn = number, "no actions proposed");
            return TurnReport::Empty;
        };

        match first.kind {
            ActionKind::Finish => {
                let status = status_of(first, bundle);
                info!(turn = number, %status, "objective finished");
                self.history.push(TurnOutcome::new(ActionKind::Finish.as_str(), first.explanation.clone()));
                self.emit(TurnEvent::Finished { status: status.clone() });
                TurnReport::Finished(status)
            }
            ActionKind::Fail => {
                let status = status_of(first, bundle);
                warn!(turn = number, %status, reason = %first.explanation, "agent gave up");
                self.history.push(TurnOutcome::new(ActionKind::Fail.as_str(), first.explanation.clone()));
                self.emit(TurnEvent::Failed { status: status.clone() });
                TurnReport::Failed(status)
            }
            ActionKind::AskUser => {
                let question = first
                    .user_question
                    .clone()
                    .or_else(|| first.status_message.clone())
                    .unwrap_or_else(|| "How should I continue?".to_string());
                self.history.push(TurnOutcome::new(
                    ActionKind::AskUser.as_str(),
                    format!("Asked the user: {question}"),
                ));
                self.emit(TurnEvent::AskedUser {
                    turn: number,
                    question: question.clone(),
                });

                let answer = match self.operator.answer(&question).await {
                    Ok(answer) => Some(answer),
                    Err(e) => {
                        warn!(turn = number, error = %e, "operator did not answer");
                        None
                    }
                };
                self.pending_response = answer.clone();
                TurnReport::Asked { question, answer }
            }
            ActionKind::Click | ActionKind::Type => {
                let outcomes = self.executor.execute(bundle, elements).await;
                for outcome in &outcomes {
                    self.emit(TurnEvent::Outcome {
                        turn: number,
                        outcome: outcome.clone(),
                    });
                }
                self.history.extend(outcomes.clone());
                tokio::time::sleep(Duration::from_millis(self.turn.post_action_delay_ms)).await;
                TurnReport::Executed(outcomes)
            }
        }
    }
}

fn status_of(action: &ActionProposal, bundle: &DecisionBundle) -> String {
    action
        .status_message
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| bundle.rationale.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::llm::ModelRequest;
    use std::sync::Mutex;

    struct Recording {
        answer: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReasoningModel for Recording {
        async fn propose(&self, request: &ModelRequest) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(request.user_prompt.clone());
            Ok(self.answer.clone())
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl KnowledgeSource for Fixed {
        async fn retrieve(&self, _objective: &str) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Broken;

    #[async_trait]
    impl KnowledgeSource for Broken {
        async fn retrieve(&self, _objective: &str) -> anyhow::Result<String> {
            anyhow::bail!("index offline")
        }
    }

    const FINISH: &str = r#"<thinking>done</thinking><json_response>{"actions":[{"type":"FINISH","status_message":"ok","explanation":"done"}],"overall_explanation_of_bundle":"done"}</json_response>"#;

    fn navigator(model: Arc<Recording>) -> Navigator {
        Navigator::new(Planner::new(DecisionEngine::new(model)))
    }

    fn recording() -> Arc<Recording> {
        Arc::new(Recording {
            answer: FINISH.into(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn fragments() -> Vec<String> {
        vec![r#"<button id="go">Go</button>"#.to_string()]
    }

    fn observation<'a>(
        fragments: &'a [String],
        history: &'a ActionHistory,
        previous: Option<&'a [ElementDescriptor]>,
    ) -> Observation<'a> {
        Observation {
            objective: "press go",
            fragments,
            history,
            previous_elements: previous,
            user_response: None,
            screenshot_base64: None,
        }
    }

    #[tokio::test]
    async fn decide_analyzes_and_detects_change() {
        let model = recording();
        let nav = navigator(model.clone());
        let history = ActionHistory::new();
        let frags = fragments();

        let first = nav.decide(observation(&frags, &history, None)).await;
        assert!(first.page_changed);
        assert_eq!(first.elements.len(), 1);
        assert_eq!(first.elements[0].selector, "#go");
        assert_eq!(first.planned.bundle.actions[0].kind, ActionKind::Finish);

        let second = nav
            .decide(observation(&frags, &history, Some(&first.elements)))
            .await;
        assert!(!second.page_changed);
    }

    #[tokio::test]
    async fn knowledge_is_embedded_when_configured() {
        let model = recording();
        let nav = navigator(model.clone()).with_knowledge(Arc::new(Fixed("Go buttons submit forms.")));
        let history = ActionHistory::new();
        let frags = fragments();
        nav.decide(observation(&frags, &history, None)).await;
        assert!(model.prompts.lock().unwrap()[0].contains("Go buttons submit forms."));
    }

    #[tokio::test]
    async fn knowledge_failure_degrades_to_no_context() {
        let model = recording();
        let nav = navigator(model.clone()).with_knowledge(Arc::new(Broken));
        let history = ActionHistory::new();
        let frags = fragments();
        let decision = nav.decide(observation(&frags, &history, None)).await;
        assert_eq!(decision.planned.bundle.actions[0].kind, ActionKind::Finish);
        assert!(!model.prompts.lock().unwrap()[0].contains("index offline"));
    }

    #[test]
    fn knowledge_flag_controls_retrieval() {
        let mut config = AgentConfig::default();
        assert!(Navigator::from_config(recording(), &config).knowledge.is_none());

        config.features.knowledge_enabled = true;
        assert!(Navigator::from_config(recording(), &config).knowledge.is_none());

        config.features.knowledge_path = Some("docs/help.md".into());
        assert!(Navigator::from_config(recording(), &config).knowledge.is_some());
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(TurnEvent::Finished { status: "ok".into() }).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["status"], "ok");
    }

    #[test]
    fn status_falls_back_to_rationale() {
        let bundle = DecisionBundle {
            actions: vec![ActionProposal::finish("", "done")],
            rationale: "All set.".into(),
            ..DecisionBundle::default()
        };
        assert_eq!(status_of(&bundle.actions[0], &bundle), "All set.");
    }
}
