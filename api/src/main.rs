use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod engine;
mod error;
mod extract;
mod middleware;
mod routes;
mod state;
mod store;

use engine::proposer::{HeuristicModel, HttpProposalModel, ProposalModel};
use engine::runner::{HttpReplayer, Replayer};
use engine::scheduler::{Scheduler, spawn_scheduler};
use engine::{Coordinator, EngineDeps};
use store::memory::MemoryStore;
use store::postgres::PgStore;
use store::{LearningStore, RunSource, VersionRegistry};

/// Request timeout for the proposal model and replay endpoints.
const EXTERNAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(OpenApi)]
#[openapi(
    info(
        title = "LearnLoop API",
        version = "0.1.0",
        description = "Closed-loop learning for deployed agents: collect runs, detect signals, propose changes, test them against the baseline, promote the winners."
    ),
    paths(
        routes::health::health_check,
        routes::learning::list_sessions,
        routes::learning::start_session,
        routes::learning::get_session,
        routes::learning::cancel_session,
        routes::learning::approve_session,
        routes::learning::reject_session,
        routes::learning::get_metrics,
        routes::learning::get_policy,
        routes::learning::update_policy,
        routes::learning::set_paused,
        routes::learning::list_experiments,
        routes::learning::route_run,
        routes::learning::record_sample,
        routes::learning::session_events,
    ),
    components(schemas(
        routes::health::HealthResponse,
        learnloop_core::error::ApiError,
        learnloop_core::session::LearningSession,
        learnloop_core::session::SessionStatus,
        learnloop_core::session::SessionMetadata,
        learnloop_core::dataset::Dataset,
        learnloop_core::dataset::SelectionCriteria,
        learnloop_core::signals::Signal,
        learnloop_core::signals::Evidence,
        learnloop_core::proposals::Proposal,
        learnloop_core::experiment::Experiment,
        learnloop_core::experiment::ArmMetrics,
        learnloop_core::experiment::Sample,
        learnloop_core::experiment::Arm,
        learnloop_core::gating::ConfidenceInterval,
        learnloop_core::gating::GatingResult,
        learnloop_core::gating::RiskTier,
        learnloop_core::approval::Approval,
        learnloop_core::approval::ApprovalDecision,
        learnloop_core::policy::LearningPolicy,
        learnloop_core::policy::PolicyUpdate,
        learnloop_core::metrics::MetricsSummary,
        store::Agent,
        engine::events::SessionEvent,
        routes::learning::SessionSummary,
        routes::learning::ListSessionsResponse,
        routes::learning::StartSessionRequest,
        routes::learning::StartSessionResponse,
        routes::learning::SessionDetailResponse,
        routes::learning::CancelSessionRequest,
        routes::learning::CancelSessionResponse,
        routes::learning::ApproveRequest,
        routes::learning::RejectRequest,
        routes::learning::DecisionResponse,
        routes::learning::MetricsEnvelope,
        routes::learning::MetricsResponse,
        routes::learning::PolicyResponse,
        routes::learning::PauseRequest,
        routes::learning::PauseResponse,
        routes::learning::ActiveExperiment,
        routes::learning::ExperimentsResponse,
        routes::learning::RouteRequest,
        routes::learning::RouteResponse,
        routes::learning::SampleRequest,
        routes::learning::SampleResponse,
    ))
)]
struct ApiDoc;

type Stores = (
    Arc<dyn LearningStore>,
    Arc<dyn RunSource>,
    Arc<dyn VersionRegistry>,
);

async fn connect_stores() -> Stores {
    let backend = std::env::var("LEARNLOOP_STORE").unwrap_or_else(|_| "postgres".to_string());
    if backend.eq_ignore_ascii_case("memory") {
        let store = Arc::new(MemoryStore::new());
        // Local dev only: one agent so the dashboard has something to show.
        let (agent, version) = store
            .add_agent(
                "demo",
                "Demo agent",
                serde_json::json!({"instructions": "You are a helpful assistant."}),
            )
            .await;
        tracing::warn!(
            agent = %agent.slug,
            version_id = %version.id,
            "using in-memory store; state is lost on restart"
        );
        return (store.clone(), store.clone(), store);
    }

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let store = Arc::new(PgStore::new(pool));
    (store.clone(), store.clone(), store)
}

fn proposal_model() -> Arc<dyn ProposalModel> {
    match std::env::var("LEARNLOOP_PROPOSAL_MODEL_URL") {
        Ok(raw) if !raw.trim().is_empty() => {
            let url = url::Url::parse(raw.trim()).expect("LEARNLOOP_PROPOSAL_MODEL_URL must be a URL");
            let model = HttpProposalModel::new(url, EXTERNAL_TIMEOUT)
                .expect("Failed to build proposal model client");
            tracing::info!(model = model.name(), "using external proposal model");
            Arc::new(model)
        }
        _ => Arc::new(HeuristicModel),
    }
}

fn replayer() -> Option<Arc<dyn Replayer>> {
    let raw = std::env::var("LEARNLOOP_REPLAY_URL").ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    let url = url::Url::parse(raw.trim()).expect("LEARNLOOP_REPLAY_URL must be a URL");
    let replayer = HttpReplayer::new(url, EXTERNAL_TIMEOUT).expect("Failed to build replay client");
    tracing::info!("experiments run in replay mode");
    Some(Arc::new(replayer))
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "learnloop_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let engine_config = config::EngineConfig::from_env();
    let scheduler_tick = engine_config.scheduler_tick;
    tracing::info!(config = ?engine_config, "engine configuration");

    let (store, runs, versions) = connect_stores().await;
    let coordinator = Coordinator::new(EngineDeps {
        store,
        runs,
        versions,
        proposer: proposal_model(),
        replayer: replayer(),
        config: engine_config,
    });

    // First tick runs immediately and picks up sessions left active by a restart.
    spawn_scheduler(Arc::new(Scheduler::new(coordinator.clone())), scheduler_tick);

    let app_state = state::AppState::new(coordinator);

    // CORS
    let cors_layer = middleware::cors::build_cors_layer();

    // Router with per-surface rate limiting
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::learning::router().layer(middleware::rate_limit::learning_layer()))
        .merge(routes::learning::ingest_router().layer(middleware::rate_limit::ingest_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::security_headers::apply))
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("LearnLoop API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}
