use std::convert::Infallible;
use std::pin::Pin;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use learnloop_core::approval::Approval;
use learnloop_core::dataset::Dataset;
use learnloop_core::error::ApiError;
use learnloop_core::experiment::{Arm, Experiment, ExperimentStatus, Sample};
use learnloop_core::metrics::MetricsSummary;
use learnloop_core::policy::{LearningPolicy, PolicyUpdate};
use learnloop_core::proposals::Proposal;
use learnloop_core::session::{LearningSession, SessionStatus, Trigger, TriggerType};
use learnloop_core::signals::Signal;

use crate::engine::events::SessionEvent;
use crate::engine::runner::SampleInput;
use crate::error::AppError;
use crate::extract::JsonBody;
use crate::state::AppState;
use crate::store::Agent;

const BASE: &str = "/api/agents/{agent_slug}/learning";

/// Dashboard surface: sessions, decisions, policy and metrics.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(BASE, get(list_sessions).post(start_session))
        .route(&format!("{BASE}/metrics"), get(get_metrics))
        .route(&format!("{BASE}/policy"), get(get_policy).post(update_policy))
        .route(&format!("{BASE}/pause"), post(set_paused))
        .route(&format!("{BASE}/experiments"), get(list_experiments))
        .route(
            &format!("{BASE}/{{session_id}}"),
            get(get_session).delete(cancel_session),
        )
        .route(&format!("{BASE}/{{session_id}}/approve"), post(approve_session))
        .route(&format!("{BASE}/{{session_id}}/reject"), post(reject_session))
        .route(&format!("{BASE}/{{session_id}}/events"), get(session_events))
}

/// Run routing and sample ingestion, called by the execution subsystem.
pub fn ingest_router() -> Router<AppState> {
    Router::new()
        .route(&format!("{BASE}/route"), post(route_run))
        .route(
            &format!("{BASE}/experiments/{{experiment_id}}/samples"),
            post(record_sample),
        )
}

// --- Response and request types ---

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: LearningSession,
    pub signal_count: i64,
    pub proposal_count: i64,
    pub experiment_count: i64,
    pub avg_score: Option<f64>,
}

#[derive(Serialize, ToSchema)]
pub struct ListSessionsResponse {
    pub success: bool,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Why the session is being started (1-500 characters)
    pub trigger_reason: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub success: bool,
    pub session_id: Uuid,
    pub status: SessionStatus,
}

#[derive(Serialize, ToSchema)]
pub struct SessionDetailResponse {
    pub success: bool,
    pub session: LearningSession,
    pub agent: Agent,
    pub dataset: Option<Dataset>,
    pub signals: Vec<Signal>,
    pub proposals: Vec<Proposal>,
    pub experiments: Vec<Experiment>,
    pub approval: Option<Approval>,
}

#[derive(Deserialize, ToSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CancelSessionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct CancelSessionResponse {
    pub success: bool,
    pub session: LearningSession,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub approved_by: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    pub rejected_by: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct DecisionResponse {
    pub success: bool,
    pub approval: Approval,
}

#[derive(Serialize, ToSchema)]
pub struct MetricsEnvelope {
    pub summary: MetricsSummary,
}

#[derive(Serialize, ToSchema)]
pub struct MetricsResponse {
    pub success: bool,
    pub metrics: MetricsEnvelope,
}

#[derive(Serialize, ToSchema)]
pub struct PolicyResponse {
    pub success: bool,
    pub policy: LearningPolicy,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PauseRequest {
    pub paused: bool,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Pause lapses at this instant; absent means until resumed
    #[serde(default)]
    pub paused_until: Option<DateTime<Utc>>,
}

#[derive(Serialize, ToSchema)]
pub struct PauseResponse {
    pub success: bool,
    pub paused: bool,
    pub message: String,
    pub policy: LearningPolicy,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ExperimentsQuery {
    /// `active` (pending or running), `all`, or an experiment status
    pub status: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveExperiment {
    #[serde(flatten)]
    pub experiment: Experiment,
    pub session_status: SessionStatus,
    pub proposal_title: Option<String>,
    pub proposal_type: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ExperimentsResponse {
    pub success: bool,
    pub experiments: Vec<ActiveExperiment>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub run_id: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub success: bool,
    /// Running experiment the run belongs to, if any
    pub experiment_id: Option<Uuid>,
    pub arm: Arm,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SampleRequest {
    pub run_id: String,
    /// Omit to let the experiment's traffic split decide
    #[serde(default)]
    pub arm: Option<Arm>,
    pub score: f64,
    pub success: bool,
    #[serde(default)]
    pub pair_key: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct SampleResponse {
    pub success: bool,
    pub sample: Sample,
}

// --- Helpers ---

enum StatusFilter {
    Active,
    All,
    Only(ExperimentStatus),
}

impl StatusFilter {
    fn parse(raw: &str) -> Result<Self, AppError> {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.as_str() {
            "active" => Ok(StatusFilter::Active),
            "all" => Ok(StatusFilter::All),
            other => ExperimentStatus::parse(other)
                .map(StatusFilter::Only)
                .ok_or_else(|| AppError::Validation {
                    message: format!("unknown experiment status filter '{other}'"),
                    field: Some("status".to_string()),
                    received: Some(serde_json::Value::String(other.to_string())),
                    docs_hint: Some(
                        "Use active, all, pending, running, completed or failed.".to_string(),
                    ),
                }),
        }
    }

    fn matches(&self, status: ExperimentStatus) -> bool {
        match self {
            StatusFilter::Active => status.is_active(),
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => status == *wanted,
        }
    }
}

async fn resolve_agent(state: &AppState, slug: &str) -> Result<Agent, AppError> {
    state
        .coordinator
        .versions()
        .find_agent(slug)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource: format!("agent {slug}"),
        })
}

/// The session, provided it belongs to `agent`.
async fn owned_session(
    state: &AppState,
    agent: &Agent,
    session_id: Uuid,
) -> Result<LearningSession, AppError> {
    state
        .coordinator
        .store()
        .get_session(session_id)
        .await?
        .filter(|session| session.agent_id == agent.id)
        .ok_or_else(|| AppError::NotFound {
            resource: format!("session {session_id}"),
        })
}

// --- Handlers ---

/// List the agent's learning sessions, newest first
#[utoipa::path(
    get,
    path = "/api/agents/{agent_slug}/learning",
    params(("agent_slug" = String, Path, description = "Agent slug")),
    responses(
        (status = 200, description = "Sessions with denormalized counts", body = ListSessionsResponse),
        (status = 404, description = "Unknown agent", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
) -> Result<Json<ListSessionsResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let store = state.coordinator.store();
    let sessions = store.list_sessions(agent.id).await?;
    let ids: Vec<Uuid> = sessions.iter().map(|s| s.id).collect();
    let counts = store.session_counts(&ids).await?;

    let mut summaries = Vec::with_capacity(sessions.len());
    for session in sessions {
        let count = counts.get(&session.id).copied().unwrap_or_default();
        let avg_score = store
            .get_dataset(session.id)
            .await?
            .and_then(|dataset| dataset.avg_score);
        summaries.push(SessionSummary {
            session,
            signal_count: count.signals,
            proposal_count: count.proposals,
            experiment_count: count.experiments,
            avg_score,
        });
    }

    Ok(Json(ListSessionsResponse {
        success: true,
        sessions: summaries,
    }))
}

/// Start a manual learning session
///
/// Returns as soon as the session exists; it advances in the background.
#[utoipa::path(
    post,
    path = "/api/agents/{agent_slug}/learning",
    params(("agent_slug" = String, Path, description = "Agent slug")),
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session created in COLLECTING", body = StartSessionResponse),
        (status = 400, description = "Invalid trigger reason", body = ApiError),
        (status = 404, description = "Unknown agent", body = ApiError),
        (status = 409, description = "Denied by policy or active session", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn start_session(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
    JsonBody(req): JsonBody<StartSessionRequest>,
) -> Result<(axum::http::StatusCode, Json<StartSessionResponse>), AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let trigger = Trigger::new(&req.trigger_reason, TriggerType::Manual)?;
    let session = state.coordinator.create_session(&agent, trigger).await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(StartSessionResponse {
            success: true,
            session_id: session.id,
            status: session.status,
        }),
    ))
}

/// Session with its dataset, signals, proposals, experiments and approval
#[utoipa::path(
    get,
    path = "/api/agents/{agent_slug}/learning/{session_id}",
    params(
        ("agent_slug" = String, Path, description = "Agent slug"),
        ("session_id" = Uuid, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Session detail", body = SessionDetailResponse),
        (status = 404, description = "Unknown agent or session", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path((agent_slug, session_id)): Path<(String, Uuid)>,
) -> Result<Json<SessionDetailResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let session = owned_session(&state, &agent, session_id).await?;
    let store = state.coordinator.store();

    let dataset = store.get_dataset(session_id).await?;
    let mut signals = store.list_signals(session_id).await?;
    learnloop_core::signals::sort_by_impact(&mut signals);
    let proposals = store.list_proposals(session_id).await?;
    let experiments = store.list_experiments(session_id).await?;
    let approval = store.get_approval(session_id).await?;

    Ok(Json(SessionDetailResponse {
        success: true,
        session,
        agent,
        dataset,
        signals,
        proposals,
        experiments,
        approval,
    }))
}

/// Cancel a session
///
/// Cancelling a session that already finished is a no-op.
#[utoipa::path(
    delete,
    path = "/api/agents/{agent_slug}/learning/{session_id}",
    params(
        ("agent_slug" = String, Path, description = "Agent slug"),
        ("session_id" = Uuid, Path, description = "Session id")
    ),
    request_body(content = CancelSessionRequest, description = "Optional body"),
    responses(
        (status = 200, description = "Session cancelled (or already terminal)", body = CancelSessionResponse),
        (status = 400, description = "Invalid body", body = ApiError),
        (status = 404, description = "Unknown agent or session", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn cancel_session(
    State(state): State<AppState>,
    Path((agent_slug, session_id)): Path<(String, Uuid)>,
    body: Bytes,
) -> Result<Json<CancelSessionResponse>, AppError> {
    // DELETE bodies are optional; clients commonly send none.
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        CancelSessionRequest::default()
    } else {
        serde_json::from_slice::<CancelSessionRequest>(&body).map_err(|e| AppError::Validation {
            message: format!("Invalid request body: {e}"),
            field: Some("body".to_string()),
            received: None,
            docs_hint: Some("Send {\"reason\": \"...\"} or no body.".to_string()),
        })?
    };

    let agent = resolve_agent(&state, &agent_slug).await?;
    owned_session(&state, &agent, session_id).await?;
    let session = state.coordinator.cancel(session_id, req.reason).await?;
    Ok(Json(CancelSessionResponse {
        success: true,
        session,
    }))
}

/// Approve a session awaiting approval and promote its candidate
#[utoipa::path(
    post,
    path = "/api/agents/{agent_slug}/learning/{session_id}/approve",
    params(
        ("agent_slug" = String, Path, description = "Agent slug"),
        ("session_id" = Uuid, Path, description = "Session id")
    ),
    request_body = ApproveRequest,
    responses(
        (status = 200, description = "Approved and promoted", body = DecisionResponse),
        (status = 400, description = "Invalid approver or rationale", body = ApiError),
        (status = 404, description = "Unknown agent or session", body = ApiError),
        (status = 409, description = "Not awaiting approval, or already decided", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn approve_session(
    State(state): State<AppState>,
    Path((agent_slug, session_id)): Path<(String, Uuid)>,
    JsonBody(req): JsonBody<ApproveRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    owned_session(&state, &agent, session_id).await?;
    let approval = state
        .coordinator
        .approve(session_id, &req.approved_by, req.rationale)
        .await?;
    Ok(Json(DecisionResponse {
        success: true,
        approval,
    }))
}

/// Reject a session awaiting approval
#[utoipa::path(
    post,
    path = "/api/agents/{agent_slug}/learning/{session_id}/reject",
    params(
        ("agent_slug" = String, Path, description = "Agent slug"),
        ("session_id" = Uuid, Path, description = "Session id")
    ),
    request_body = RejectRequest,
    responses(
        (status = 200, description = "Rejected", body = DecisionResponse),
        (status = 400, description = "Invalid reviewer or rationale", body = ApiError),
        (status = 404, description = "Unknown agent or session", body = ApiError),
        (status = 409, description = "Not awaiting approval, or already decided", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn reject_session(
    State(state): State<AppState>,
    Path((agent_slug, session_id)): Path<(String, Uuid)>,
    JsonBody(req): JsonBody<RejectRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    owned_session(&state, &agent, session_id).await?;
    let approval = state
        .coordinator
        .reject(session_id, &req.rejected_by, req.rationale)
        .await?;
    Ok(Json(DecisionResponse {
        success: true,
        approval,
    }))
}

/// Aggregate counters and rates over the agent's sessions
#[utoipa::path(
    get,
    path = "/api/agents/{agent_slug}/learning/metrics",
    params(("agent_slug" = String, Path, description = "Agent slug")),
    responses(
        (status = 200, description = "Metrics summary", body = MetricsResponse),
        (status = 404, description = "Unknown agent", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn get_metrics(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
) -> Result<Json<MetricsResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let summary = state.coordinator.metrics(agent.id).await?;
    Ok(Json(MetricsResponse {
        success: true,
        metrics: MetricsEnvelope { summary },
    }))
}

/// The agent's learning policy (defaults when never configured)
#[utoipa::path(
    get,
    path = "/api/agents/{agent_slug}/learning/policy",
    params(("agent_slug" = String, Path, description = "Agent slug")),
    responses(
        (status = 200, description = "Current policy", body = PolicyResponse),
        (status = 404, description = "Unknown agent", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn get_policy(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
) -> Result<Json<PolicyResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let policy = state.coordinator.policies().load(agent.id).await?;
    Ok(Json(PolicyResponse {
        success: true,
        policy,
    }))
}

/// Update policy fields; absent fields stay unchanged
#[utoipa::path(
    post,
    path = "/api/agents/{agent_slug}/learning/policy",
    params(("agent_slug" = String, Path, description = "Agent slug")),
    request_body = PolicyUpdate,
    responses(
        (status = 200, description = "Updated policy", body = PolicyResponse),
        (status = 400, description = "Invalid field value", body = ApiError),
        (status = 404, description = "Unknown agent", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn update_policy(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
    JsonBody(update): JsonBody<PolicyUpdate>,
) -> Result<Json<PolicyResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let policy = state.coordinator.policies().update(agent.id, &update).await?;
    Ok(Json(PolicyResponse {
        success: true,
        policy,
    }))
}

/// Pause or resume learning for the agent
#[utoipa::path(
    post,
    path = "/api/agents/{agent_slug}/learning/pause",
    params(("agent_slug" = String, Path, description = "Agent slug")),
    request_body = PauseRequest,
    responses(
        (status = 200, description = "Pause state changed", body = PauseResponse),
        (status = 400, description = "pausedUntil in the past", body = ApiError),
        (status = 404, description = "Unknown agent", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn set_paused(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
    JsonBody(req): JsonBody<PauseRequest>,
) -> Result<Json<PauseResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let policy = state
        .coordinator
        .policies()
        .set_paused(agent.id, req.paused, req.actor_id, req.reason, req.paused_until)
        .await?;
    let message = match (policy.paused, policy.paused_until) {
        (true, Some(until)) => format!("Learning paused for {} until {}", agent.slug, until.to_rfc3339()),
        (true, None) => format!("Learning paused for {}", agent.slug),
        (false, _) => format!("Learning resumed for {}", agent.slug),
    };
    Ok(Json(PauseResponse {
        success: true,
        paused: policy.paused,
        message,
        policy,
    }))
}

/// Experiments of the agent, filtered by status (default `active`)
#[utoipa::path(
    get,
    path = "/api/agents/{agent_slug}/learning/experiments",
    params(("agent_slug" = String, Path, description = "Agent slug"), ExperimentsQuery),
    responses(
        (status = 200, description = "Experiments, newest first", body = ExperimentsResponse),
        (status = 400, description = "Unknown status filter", body = ApiError),
        (status = 404, description = "Unknown agent", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn list_experiments(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
    Query(query): Query<ExperimentsQuery>,
) -> Result<Json<ExperimentsResponse>, AppError> {
    let filter = StatusFilter::parse(query.status.as_deref().unwrap_or("active"))?;

    let agent = resolve_agent(&state, &agent_slug).await?;
    let store = state.coordinator.store();
    let mut experiments = Vec::new();
    for experiment in store.list_agent_experiments(agent.id).await? {
        if !filter.matches(experiment.status) {
            continue;
        }
        let Some(session) = store.get_session(experiment.session_id).await? else {
            continue;
        };
        let proposal = store
            .list_proposals(session.id)
            .await?
            .into_iter()
            .find(|p| p.id == experiment.proposal_id);
        experiments.push(ActiveExperiment {
            session_status: session.status,
            proposal_title: proposal.as_ref().map(|p| p.title.clone()),
            proposal_type: proposal.map(|p| p.proposal_type),
            experiment,
        });
    }

    Ok(Json(ExperimentsResponse {
        success: true,
        experiments,
    }))
}

/// Arm a new run must be dispatched to
///
/// Stateless: the same run id always gets the same arm. Runs go to the
/// baseline when the agent has no running experiment.
#[utoipa::path(
    post,
    path = "/api/agents/{agent_slug}/learning/route",
    params(("agent_slug" = String, Path, description = "Agent slug")),
    request_body = RouteRequest,
    responses(
        (status = 200, description = "Routing decision", body = RouteResponse),
        (status = 400, description = "Missing run id", body = ApiError),
        (status = 404, description = "Unknown agent", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn route_run(
    State(state): State<AppState>,
    Path(agent_slug): Path<String>,
    JsonBody(req): JsonBody<RouteRequest>,
) -> Result<Json<RouteResponse>, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let (experiment_id, arm) = state
        .coordinator
        .runner()
        .route_for_agent(agent.id, &req.run_id)
        .await?;
    Ok(Json(RouteResponse {
        success: true,
        experiment_id,
        arm,
    }))
}

/// Record one experiment sample
#[utoipa::path(
    post,
    path = "/api/agents/{agent_slug}/learning/experiments/{experiment_id}/samples",
    params(
        ("agent_slug" = String, Path, description = "Agent slug"),
        ("experiment_id" = Uuid, Path, description = "Experiment id")
    ),
    request_body = SampleRequest,
    responses(
        (status = 201, description = "Sample recorded", body = SampleResponse),
        (status = 400, description = "Invalid sample or experiment not running", body = ApiError),
        (status = 404, description = "Unknown agent or experiment", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn record_sample(
    State(state): State<AppState>,
    Path((agent_slug, experiment_id)): Path<(String, Uuid)>,
    JsonBody(req): JsonBody<SampleRequest>,
) -> Result<(axum::http::StatusCode, Json<SampleResponse>), AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    let store = state.coordinator.store();
    let not_found = || AppError::NotFound {
        resource: format!("experiment {experiment_id}"),
    };
    let experiment = store.get_experiment(experiment_id).await?.ok_or_else(not_found)?;
    owned_session(&state, &agent, experiment.session_id)
        .await
        .map_err(|_| not_found())?;

    let sample = state
        .coordinator
        .runner()
        .ingest(
            experiment_id,
            SampleInput {
                run_id: req.run_id,
                arm: req.arm,
                score: req.score,
                success: req.success,
                pair_key: req.pair_key,
            },
        )
        .await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(SampleResponse {
            success: true,
            sample,
        }),
    ))
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn sse_event(name: &'static str, payload: &impl Serialize) -> Event {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| String::from("{}"));
    Event::default().event(name).data(json)
}

/// Stream the session's transitions as Server-Sent Events
///
/// The first event (`session`) is the current state; `transition` events
/// follow until the session reaches a terminal status.
#[utoipa::path(
    get,
    path = "/api/agents/{agent_slug}/learning/{session_id}/events",
    params(
        ("agent_slug" = String, Path, description = "Agent slug"),
        ("session_id" = Uuid, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "text/event-stream of transitions", content_type = "text/event-stream", body = SessionEvent),
        (status = 404, description = "Unknown agent or session", body = ApiError)
    ),
    tag = "learning"
)]
pub async fn session_events(
    State(state): State<AppState>,
    Path((agent_slug, session_id)): Path<(String, Uuid)>,
) -> Result<Response, AppError> {
    let agent = resolve_agent(&state, &agent_slug).await?;
    // Subscribe before reading the session so no transition falls in between.
    let rx = state.coordinator.events().subscribe();
    let session = owned_session(&state, &agent, session_id).await?;

    let snapshot = tokio_stream::once(Ok(sse_event("session", &session)));
    if session.status.is_terminal() {
        let stream: EventStream = Box::pin(snapshot);
        return Ok(Sse::new(stream).into_response());
    }

    let mut finished = false;
    let updates = BroadcastStream::new(rx)
        .filter_map(move |msg| match msg {
            Ok(event) if event.session_id == session_id => Some(event),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "event subscriber lagged");
                None
            }
        })
        .take_while(move |event| {
            if finished {
                return false;
            }
            finished = event.to.is_terminal();
            true
        })
        .map(|event| Ok(sse_event("transition", &event)));

    let stream: EventStream = Box::pin(snapshot.chain(updates));
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::engine::testing::{
        Harness, fast_config, harness, seed_healthy_runs, seed_low_quality_runs, wait_for,
    };

    fn app(h: &Harness) -> Router {
        router()
            .merge(ingest_router())
            .with_state(AppState::new(h.coordinator.clone()))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("request should succeed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("body should be json")
        };
        (status, value)
    }

    #[tokio::test]
    async fn start_session_returns_id_and_lists_it() {
        let h = harness(fast_config()).await;
        let app = app(&h);

        let (status, body) = send(
            &app,
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "quality dipped"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "COLLECTING");
        let session_id = body["sessionId"].as_str().expect("sessionId").to_string();

        let (status, list) = send(&app, "GET", "/api/agents/a1/learning", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["success"], true);
        let sessions = list["sessions"].as_array().expect("sessions array");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], session_id.as_str());
        assert_eq!(sessions[0]["signalCount"], 0);
        assert_eq!(sessions[0]["metadata"]["triggerReason"], "quality dipped");
    }

    #[tokio::test]
    async fn second_start_reports_already_active_session() {
        let h = harness(fast_config()).await;
        let app = app(&h);
        let body = json!({"triggerReason": "manual"});

        let (first, second) = tokio::join!(
            send(&app, "POST", "/api/agents/a1/learning", Some(body.clone())),
            send(&app, "POST", "/api/agents/a1/learning", Some(body.clone()))
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|(_, b)| b["success"] == true).count(), 1);
        let (status, denied) = outcomes
            .iter()
            .find(|(_, b)| b["success"] == false)
            .expect("one start is denied");
        assert_eq!(*status, StatusCode::CONFLICT);
        assert_eq!(denied["error"], "AlreadyActiveSession");
    }

    #[tokio::test]
    async fn empty_trigger_reason_is_a_validation_error() {
        let h = harness(fast_config()).await;
        let (status, body) = send(
            &app(&h),
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "ValidationError");
        assert_eq!(body["field"], "triggerReason");
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let h = harness(fast_config()).await;
        let (status, body) = send(&app(&h), "GET", "/api/agents/nobody/learning", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn paused_policy_blocks_start_until_resumed() {
        let h = harness(fast_config()).await;
        let app = app(&h);

        let (status, body) = send(
            &app,
            "POST",
            "/api/agents/a1/learning/pause",
            Some(json!({"paused": true, "actorId": "ops@example.com", "reason": "incident"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paused"], true);
        assert_eq!(body["policy"]["pausedBy"], "ops@example.com");
        assert!(body["message"].as_str().expect("message").contains("paused"));

        let (status, body) = send(
            &app,
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "manual"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "PolicyPaused");

        let (_, body) = send(
            &app,
            "POST",
            "/api/agents/a1/learning/pause",
            Some(json!({"paused": false})),
        )
        .await;
        assert_eq!(body["paused"], false);
        let (status, _) = send(
            &app,
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "manual"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn policy_update_validates_ranges() {
        let h = harness(fast_config()).await;
        let app = app(&h);

        let (status, body) = send(
            &app,
            "POST",
            "/api/agents/a1/learning/policy",
            Some(json!({"trafficSplitCandidate": 1.5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "trafficSplitCandidate");

        let (status, body) = send(
            &app,
            "POST",
            "/api/agents/a1/learning/policy",
            Some(json!({"trafficSplitCandidate": 0.25, "autoPromotionEnabled": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["policy"]["trafficSplitCandidate"], 0.25);

        let (_, body) = send(&app, "GET", "/api/agents/a1/learning/policy", None).await;
        assert_eq!(body["policy"]["autoPromotionEnabled"], true);
    }

    #[tokio::test]
    async fn route_defaults_to_baseline_without_experiment() {
        let h = harness(fast_config()).await;
        let (status, body) = send(
            &app(&h),
            "POST",
            "/api/agents/a1/learning/route",
            Some(json!({"runId": "run-42"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["arm"], "baseline");
        assert!(body["experimentId"].is_null());
    }

    #[tokio::test]
    async fn cancel_without_body_is_idempotent() {
        let h = harness(fast_config()).await;
        let app = app(&h);
        let (_, started) = send(
            &app,
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "manual"})),
        )
        .await;
        let uri = format!(
            "/api/agents/a1/learning/{}",
            started["sessionId"].as_str().expect("sessionId")
        );

        let (status, body) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["status"], "CANCELLED");

        let (status, body) = send(&app, "DELETE", &uri, Some(json!({"reason": "again"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["session"]["metadata"]["cancelReason"], "cancelled");
    }

    #[tokio::test]
    async fn approving_a_failed_session_is_an_invalid_transition() {
        let h = harness(fast_config()).await;
        seed_healthy_runs(&h).await;
        let app = app(&h);
        let (_, started) = send(
            &app,
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "manual"})),
        )
        .await;
        let id: Uuid = started["sessionId"]
            .as_str()
            .expect("sessionId")
            .parse()
            .expect("uuid");
        wait_for(&h, id, |s| s.is_terminal()).await;

        let (status, detail) = send(&app, "GET", &format!("/api/agents/a1/learning/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["session"]["status"], "FAILED");
        assert_eq!(detail["session"]["metadata"]["failureReason"], "no signals");
        assert_eq!(detail["dataset"]["runCount"], 50);
        assert_eq!(detail["agent"]["slug"], "a1");

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/agents/a1/learning/{id}/approve"),
            Some(json!({"approvedBy": "alice@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "InvalidTransition");

        let (_, metrics) = send(&app, "GET", "/api/agents/a1/learning/metrics", None).await;
        assert_eq!(metrics["metrics"]["summary"]["failed"], 1);
    }

    #[tokio::test]
    async fn unknown_experiment_filter_is_rejected() {
        let h = harness(fast_config()).await;
        let app = app(&h);
        let (status, body) = send(
            &app,
            "GET",
            "/api/agents/a1/learning/experiments?status=sideways",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "status");

        let (status, body) = send(&app, "GET", "/api/agents/a1/learning/experiments", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["experiments"], json!([]));
    }

    #[tokio::test]
    async fn events_of_a_finished_session_end_after_the_snapshot() {
        let h = harness(fast_config()).await;
        let app = app(&h);
        let (_, started) = send(
            &app,
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "manual"})),
        )
        .await;
        let id = started["sessionId"].as_str().expect("sessionId").to_string();
        send(&app, "DELETE", &format!("/api/agents/a1/learning/{id}"), None).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/agents/a1/learning/{id}/events"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .expect("content type"),
            "text/event-stream"
        );
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("finite stream");
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert!(text.starts_with("event: session"));
        assert!(text.contains("CANCELLED"));
    }

    #[tokio::test]
    async fn samples_are_recorded_once_per_run_and_arm() {
        let h = harness(fast_config()).await;
        seed_low_quality_runs(&h).await;
        let app = app(&h);
        let (_, started) = send(
            &app,
            "POST",
            "/api/agents/a1/learning",
            Some(json!({"triggerReason": "manual"})),
        )
        .await;
        let id: Uuid = started["sessionId"]
            .as_str()
            .expect("sessionId")
            .parse()
            .expect("uuid");
        wait_for(&h, id, |s| s == SessionStatus::Testing || s.is_terminal()).await;

        let (_, listed) = send(&app, "GET", "/api/agents/a1/learning/experiments", None).await;
        let experiments = listed["experiments"].as_array().expect("experiments");
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0]["status"], "RUNNING");
        assert_eq!(experiments[0]["sessionStatus"], "TESTING");
        let experiment_id = experiments[0]["id"].as_str().expect("id").to_string();
        let uri = format!("/api/agents/a1/learning/experiments/{experiment_id}/samples");
        let sample = json!({"runId": "live-1", "arm": "candidate", "score": 0.8, "success": true});

        let (status, body) = send(&app, "POST", &uri, Some(sample.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["sample"]["arm"], "candidate");

        let (status, body) = send(&app, "POST", &uri, Some(sample)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "runId");

        let (_, routed) = send(
            &app,
            "POST",
            "/api/agents/a1/learning/route",
            Some(json!({"runId": "live-2"})),
        )
        .await;
        assert_eq!(routed["experimentId"], experiment_id.as_str());
    }
}
