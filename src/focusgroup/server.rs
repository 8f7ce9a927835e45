//! HTTP and server-sent-events surface over a [`DiscussionOrchestrator`].
//!
//! Only available with the `server` feature. [`router`] builds the axum application; [`serve`]
//! wires an orchestrator from a [`FocusGroupConfig`] and listens on its port.
//!
//! Discussion events are fanned out through a [`BroadcastEvents`] handler and streamed per
//! session from `GET /api/sessions/{id}/events`. Summaries stream as relay events from
//! `POST /api/sessions/{id}/summary`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use uuid::Uuid;

use crate::focusgroup::agent_store::{AgentUpdate, NewAgent, StoreError};
use crate::focusgroup::config::FocusGroupConfig;
use crate::focusgroup::event::{DiscussionEvent, EventHandler};
use crate::focusgroup::knowledge::{KnowledgeError, LearnRequest};
use crate::focusgroup::model::{Agent, Source};
use crate::focusgroup::orchestrator::{DiscussionOrchestrator, DiscussionSetup, OrchestratorError};
use crate::focusgroup::relay::RelayEvent;
use crate::focusgroup::scheduler::TurnResolution;
use crate::focusgroup::search::MockSearch;
use crate::focusgroup::search::SearchCapability;
use crate::focusgroup::summary::SummaryError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Re-publishes every discussion event on a broadcast channel.
#[derive(Clone)]
pub struct BroadcastEvents {
    tx: broadcast::Sender<DiscussionEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscussionEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[async_trait::async_trait]
impl EventHandler for BroadcastEvents {
    async fn on_discussion_event(&self, event: &DiscussionEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Clone)]
struct AppState {
    orchestrator: DiscussionOrchestrator,
    events: BroadcastEvents,
}

/// An error rendered as `{"error": "..."}` with a status code.
#[derive(Debug)]
pub struct ApiError {
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

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("focusgroup::server: {}", self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::SessionNotFound(_) | OrchestratorError::RetryNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::AlreadyRunning | OrchestratorError::NotRunning => {
                StatusCode::CONFLICT
            }
            OrchestratorError::Store(store) => return ApiError::from(store.clone()),
            OrchestratorError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<SummaryError> for ApiError {
    fn from(err: SummaryError) -> Self {
        let status = match err {
            SummaryError::AlreadyGenerated => StatusCode::CONFLICT,
            SummaryError::Busy => StatusCode::TOO_MANY_REQUESTS,
            SummaryError::SessionNotFound => StatusCode::NOT_FOUND,
            SummaryError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<KnowledgeError> for ApiError {
    fn from(err: KnowledgeError) -> Self {
        match err {
            KnowledgeError::AgentNotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            KnowledgeError::Store(store) => ApiError::from(store),
            KnowledgeError::Generation(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

type ApiResult = Result<Response, ApiError>;

/// Build the application router.
///
/// `events` must be the same handler registered on `orchestrator`, otherwise the event
/// stream endpoint stays silent.
pub fn router(orchestrator: DiscussionOrchestrator, events: BroadcastEvents) -> Router {
    let state = AppState {
        orchestrator,
        events,
    };
    Router::new()
        .route("/api/discuss", post(discuss))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/prepare", post(prepare))
        .route("/api/sessions/{id}/start", post(start))
        .route("/api/sessions/{id}/pause", post(pause))
        .route("/api/sessions/{id}/resume", post(resume))
        .route("/api/sessions/{id}/interject", post(interject))
        .route("/api/sessions/{id}/stop", post(stop))
        .route("/api/sessions/{id}/retry/{ticket}", post(retry))
        .route("/api/sessions/{id}/summary", post(summary))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/search", post(search))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/save-from-session", post(save_from_session))
        .route(
            "/api/agents/{id}",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/api/agents/{id}/learn", post(learn))
        .route("/api/config", get(config))
        .with_state(state)
}

/// Build an orchestrator from `config`, start the session sweeper and serve until the
/// listener fails.
pub async fn serve(config: FocusGroupConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let events = BroadcastEvents::default();
    let port = config.port;
    let sweep_interval = config.sweep_interval;
    let orchestrator =
        DiscussionOrchestrator::from_config(config)?.with_event_handler(Arc::new(events.clone()));
    let _sweeper = orchestrator.registry().spawn_sweeper(sweep_interval);

    let app = router(orchestrator, events);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("focusgroup::server: listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn discuss(State(state): State<AppState>, Json(setup): Json<DiscussionSetup>) -> ApiResult {
    let session = state.orchestrator.setup_discussion(setup).await?;
    Ok(Json(json!({
        "sessionId": session.id,
        "agents": session.agents,
    }))
    .into_response())
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    Ok(Json(state.orchestrator.get_session(id)?).into_response())
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    state.orchestrator.delete_session(id)?;
    Ok(Json(json!({ "deleted": true })).into_response())
}

async fn prepare(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let prepared = state.orchestrator.prepare_agents(id).await?;
    Ok(Json(json!({ "prepared": prepared })).into_response())
}

async fn start(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    // The run outlives the request; progress is observed through the event stream.
    let _run = state.orchestrator.start(id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "started": true }))).into_response())
}

async fn pause(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    state.orchestrator.pause(id).await?;
    Ok(Json(json!({ "paused": true })).into_response())
}

async fn resume(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    state.orchestrator.resume(id).await?;
    Ok(Json(json!({ "resumed": true })).into_response())
}

#[derive(Deserialize)]
struct InterjectBody {
    content: String,
}

async fn interject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<InterjectBody>,
) -> ApiResult {
    let outcome = state.orchestrator.interject(id, &body.content).await?;
    Ok(Json(outcome).into_response())
}

async fn stop(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    state.orchestrator.stop(id)?;
    Ok(Json(json!({ "stopped": true })).into_response())
}

async fn retry(
    State(state): State<AppState>,
    Path((id, ticket)): Path<(Uuid, Uuid)>,
) -> ApiResult {
    let body = match state.orchestrator.retry_turn(id, ticket).await? {
        TurnResolution::Appended(output) => json!({
            "status": "appended",
            "message": output.message,
        }),
        TurnResolution::Failed(ticket) => json!({
            "status": "failed",
            "ticket": ticket,
        }),
        TurnResolution::Dropped => json!({ "status": "dropped" }),
    };
    Ok(Json(body).into_response())
}

async fn summary(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    state.orchestrator.check_summary(id)?;

    let (tx, rx) = mpsc::unbounded_channel::<RelayEvent>();
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.request_summary(id, &tx).await {
            Ok(_) | Err(SummaryError::Generation(_)) => {}
            // Lost the admission race after the pre-check; the stream still needs a terminal event.
            Err(err) => {
                let _ = tx.send(RelayEvent::Error {
                    error: err.to_string(),
                });
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(|relay| Event::default().json_data(&relay));
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn session_events(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    state.orchestrator.get_session(id)?;
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |item| {
        let frame = match item {
            Ok(event) if event.session_id() == id => Some(Event::default().json_data(&event)),
            Ok(_) => None,
            Err(err) => {
                log::warn!("focusgroup::server: event stream for {} lagged: {}", id, err);
                None
            }
        };
        futures_util::future::ready(frame)
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[derive(Deserialize)]
struct SearchBody {
    query: String,
}

async fn search(State(state): State<AppState>, Json(body): Json<SearchBody>) -> ApiResult {
    let query = body.query.trim();
    if query.is_empty() {
        return Err(ApiError::bad_request("query is required"));
    }
    let response = match state.orchestrator.search() {
        Some(search) => search.search(query).await,
        None => MockSearch.search(query).await,
    };
    Ok(Json(response).into_response())
}

async fn list_agents(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.orchestrator.store().list().await?).into_response())
}

async fn create_agent(State(state): State<AppState>, Json(new): Json<NewAgent>) -> ApiResult {
    let record = state.orchestrator.store().create(new).await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.orchestrator.store().get(&id).await? {
        Some(record) => Ok(Json(record).into_response()),
        None => Err(ApiError::from(StoreError::NotFound(id))),
    }
}

async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<AgentUpdate>,
) -> ApiResult {
    Ok(Json(state.orchestrator.store().update(&id, update).await?).into_response())
}

async fn delete_agent(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.orchestrator.store().delete(&id).await?;
    Ok(Json(json!({ "deleted": true })).into_response())
}

#[derive(Deserialize)]
struct SaveFromSessionBody {
    agents: Vec<Agent>,
}

async fn save_from_session(
    State(state): State<AppState>,
    Json(body): Json<SaveFromSessionBody>,
) -> ApiResult {
    let created = state
        .orchestrator
        .store()
        .save_from_session(&body.agents)
        .await?;
    Ok(Json(json!({ "created": created })).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LearnBody {
    topic: String,
    session_id: String,
    recent_contributions: String,
    #[serde(default)]
    sources: Vec<Source>,
}

async fn learn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LearnBody>,
) -> ApiResult {
    if body.recent_contributions.trim().is_empty() {
        return Err(ApiError::bad_request("recentContributions is required"));
    }
    let request = LearnRequest {
        topic: body.topic,
        session_id: body.session_id,
        contributions: body.recent_contributions,
        sources: body.sources,
    };
    let record = state.orchestrator.knowledge().learn(&id, request).await?;
    Ok(Json(record).into_response())
}

async fn config(State(state): State<AppState>) -> ApiResult {
    let config = state.orchestrator.config();
    Ok(Json(json!({
        "model": config.model,
        "searchConfigured": config.brave_api_key.is_some(),
        "minAgents": config.min_agents,
        "maxAgents": config.max_agents,
    }))
    .into_response())
}
