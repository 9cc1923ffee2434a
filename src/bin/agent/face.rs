use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use webpilot::pilot::{Navigator, Observation, TurnEvent};
use webpilot::session::{ExecutionReport, SessionStore};
use webpilot::types::{ActionKind, ActionProposal, DecisionBundle};

const PORT_ATTEMPTS: u16 = 10;

/// A turn event tagged with the session it belongs to.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub event: TurnEvent,
}

impl ServerEvent {
    fn to_sse_event(&self) -> Event {
        let name = match &self.event {
            TurnEvent::TurnStarted { .. } => "turn_started",
            TurnEvent::Decided { .. } => "decided",
            TurnEvent::Outcome { .. } => "outcome",
            TurnEvent::AskedUser { .. } => "asked_user",
            TurnEvent::Finished { .. } => "finished",
            TurnEvent::Failed { .. } => "failed",
            TurnEvent::TurnLimit { .. } => "turn_limit",
        };
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(name).data(data)
    }
}

pub struct AppState {
    pub navigator: Navigator,
    pub sessions: SessionStore,
    pub events: broadcast::Sender<ServerEvent>,
    /// Screenshots from the frontend are dropped unless vision is on.
    pub vision: bool,
}

impl AppState {
    pub fn new(navigator: Navigator, vision: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            navigator,
            sessions: SessionStore::new(),
            events,
            vision,
        })
    }

    fn emit(&self, session_id: &str, event: TurnEvent) {
        let _ = self.events.send(ServerEvent {
            session_id: session_id.to_string(),
            event,
        });
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest {
    objective: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnRequest {
    session_id: String,
    #[serde(default)]
    visible_elements_html: Vec<String>,
    #[serde(default)]
    user_response: Option<String>,
    #[serde(default)]
    screenshot_base64: Option<String>,
    #[serde(default)]
    last_turn_outcome: Vec<ExecutionReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionDto {
    #[serde(rename = "type")]
    kind: ActionKind,
    target_element_index: Option<i64>,
    type_value: Option<String>,
    user_question: Option<String>,
    status_message: Option<String>,
    explanation: String,
}

impl From<ActionProposal> for ActionDto {
    fn from(action: ActionProposal) -> Self {
        Self {
            kind: action.kind,
            target_element_index: action.target_element_index,
            type_value: action.type_value,
            user_question: action.user_question,
            status_message: action.status_message,
            explanation: action.explanation,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnResponse {
    session_id: String,
    actions: Vec<ActionDto>,
    overall_explanation_of_bundle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    full_thought_process: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_summary: Option<String>,
}

impl TurnResponse {
    fn new(session_id: String, bundle: DecisionBundle) -> Self {
        Self {
            session_id,
            actions: bundle.actions.into_iter().map(ActionDto::from).collect(),
            overall_explanation_of_bundle: bundle.rationale,
            full_thought_process: bundle.thought_process,
            page_summary: bundle.page_summary,
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn session_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Session not found.")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "message": self.message,
            "code": format!("HTTP_{}_ERROR", self.status.as_u16()),
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/agent/init", post(init_handler))
        .route("/agent/next_action", post(next_action_handler))
        .route("/events", get(sse_handler))
        .with_state(state)
}

/// Bind `bind`, trying the next few ports if it is taken, and serve.
pub async fn serve(bind: &str, state: Arc<AppState>) -> Result<()> {
    let listener = bind_listener(bind).await?;
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("session API running at http://{addr}");
    axum::serve(listener, router(state))
        .await
        .context("HTTP server stopped")
}

async fn bind_listener(bind: &str) -> Result<TcpListener> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;
    let last = addr.port().saturating_add(PORT_ATTEMPTS - 1);
    for port in addr.port()..=last {
        match TcpListener::bind(SocketAddr::new(addr.ip(), port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => warn!(port, error = %e, "port unavailable"),
        }
    }
    anyhow::bail!(
        "could not bind to any port {}-{} on {}. Stop the old agent first.",
        addr.port(),
        last,
        addr.ip()
    )
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") }))
}

async fn init_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InitRequest>,
) -> Result<Json<InitResponse>, ApiError> {
    if payload.objective.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Objective must not be empty."));
    }
    let session_id = state.sessions.create(payload.objective).await;
    Ok(Json(InitResponse { session_id }))
}

async fn next_action_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    info!(
        session = %request.session_id,
        elements = request.visible_elements_html.len(),
        reports = request.last_turn_outcome.len(),
        "processing next_action"
    );
    let mut session = state
        .sessions
        .checkout(&request.session_id)
        .await
        .ok_or_else(ApiError::session_not_found)?;
    session.reconcile(&request.last_turn_outcome);
    let turn = session.turns + 1;
    state.emit(&request.session_id, TurnEvent::TurnStarted { turn });

    let screenshot = request.screenshot_base64.as_deref().filter(|_| state.vision);
    let decision = state
        .navigator
        .decide(Observation {
            objective: &session.objective,
            fragments: &request.visible_elements_html,
            history: &session.history,
            previous_elements: session.last_elements.as_deref(),
            user_response: request.user_response.as_deref(),
            screenshot_base64: screenshot,
        })
        .await;
    state.emit(&request.session_id, TurnEvent::decided(turn, &decision.planned));

    let bundle = decision.planned.bundle;
    session.record_turn(&bundle, decision.elements);
    drop(session);

    info!(
        session = %request.session_id,
        actions = bundle.actions.len(),
        "sending bundle"
    );
    Ok(Json(TurnResponse::new(request.session_id, bundle)))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result: Result<ServerEvent, _>| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
