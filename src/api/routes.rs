//! HTTP route handlers and server assembly.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::budget::{
    pricing, BudgetLedger, BudgetPeriod, CsvLedgerStore, LedgerStore, SharedBudgetLedger,
    SqliteLedgerStore,
};
use crate::catalog::{SharedTierCatalog, TierCatalog};
use crate::config::{BudgetBackend, Config};
use crate::llm::{LlmClient, OpenRouterClient};
use crate::metrics::{RouterMetrics, SharedMetrics};
use crate::registry::{AgentRegistry, SharedAgentRegistry};
use crate::router::{ConversationStatus, Router as MessageRouter};

use super::conversations;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub router: MessageRouter,
    pub catalog: SharedTierCatalog,
    pub registry: SharedAgentRegistry,
    pub ledger: SharedBudgetLedger,
    pub metrics: SharedMetrics,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let catalog: SharedTierCatalog = Arc::new(TierCatalog::load(&config.tiers_path)?);
    let registry: SharedAgentRegistry = Arc::new(AgentRegistry::load(&config.agents_path)?);

    let store: Option<Box<dyn LedgerStore>> = match config.budget.backend {
        BudgetBackend::Sqlite => Some(Box::new(SqliteLedgerStore::open(&config.budget.store_path)?)),
        BudgetBackend::Csv => Some(Box::new(CsvLedgerStore::open(&config.budget.store_path)?)),
        BudgetBackend::Memory => {
            tracing::warn!("Budget ledger has no durable store; spend resets on restart");
            None
        }
    };
    let ledger: SharedBudgetLedger = Arc::new(BudgetLedger::new(
        config.budget.to_budget_config(),
        store,
    ));
    let metrics: SharedMetrics = Arc::new(RouterMetrics::new());

    let api_key = config.openrouter_api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("OPENROUTER_API_KEY is not set; model calls will fail");
    }
    let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(api_key));

    let router = MessageRouter::new(
        Arc::clone(&registry),
        Arc::clone(&catalog),
        Arc::clone(&ledger),
        llm,
        Arc::clone(&metrics),
        config.router.clone(),
    );
    router.spawn_sweeper();

    let state = Arc::new(AppState {
        config: config.clone(),
        router,
        catalog,
        registry,
        ledger,
        metrics,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/catalog/reload", post(reload_catalog))
        .route("/api/registry/reload", post(reload_registry))
        .route("/metrics", get(export_metrics))
        .nest("/api/conversations", conversations::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Server listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    ledger_degraded: bool,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger_degraded: state.ledger.is_degraded(),
    })
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    conversations_total: usize,
    conversations_active: usize,
    conversations_terminated: usize,
    conversations_escalated: usize,
    turns_total: u64,
    budget_limit: f64,
    budget_period: BudgetPeriod,
    currency: String,
    ledger_degraded: bool,
}

/// Get system statistics.
async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let summaries = state.router.list_conversations().await;
    let count = |status: ConversationStatus| {
        summaries.iter().filter(|s| s.status == status).count()
    };
    let budget = state.ledger.config();

    Json(StatsResponse {
        conversations_total: summaries.len(),
        conversations_active: count(ConversationStatus::Active),
        conversations_terminated: count(ConversationStatus::Terminated),
        conversations_escalated: count(ConversationStatus::Escalated),
        turns_total: summaries.iter().map(|s| s.turn_count as u64).sum(),
        budget_limit: pricing::to_major(budget.limit_micros),
        budget_period: budget.period,
        currency: budget.currency.clone(),
        ledger_degraded: state.ledger.is_degraded(),
    })
}

/// Reload the tier catalog from disk. In-flight turns keep the snapshot
/// they started with; a bad file leaves the current catalog in place.
async fn reload_catalog(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match state.catalog.reload().await {
        Ok(()) => {
            let snapshot = state.catalog.snapshot().await;
            Ok(Json(serde_json::json!({
                "success": true,
                "tiers": snapshot.tier_count(),
            })))
        }
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            format!("Catalog reload failed: {}", e),
        )),
    }
}

/// Reload the agent roster from disk.
async fn reload_registry(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match state.registry.reload().await {
        Ok(()) => {
            let snapshot = state.registry.snapshot().await;
            Ok(Json(serde_json::json!({
                "success": true,
                "agents": snapshot.len(),
            })))
        }
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            format!("Registry reload failed: {}", e),
        )),
    }
}

/// Prometheus text-format metrics.
async fn export_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.set_ledger_degraded(state.ledger.is_degraded());
    state.metrics.export()
}
