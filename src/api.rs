//! HTTP surface — REST API for rules, extension chains, apply and
//! export/import
//!
//! Thin by design: handlers validate transport-level concerns and
//! delegate everything to the orchestrator. Runs on the configured listen
//! address (default 127.0.0.1:8722).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::core::error::Error;
use crate::core::model::{ChainHook, ExtensionChainDraft, Rule, RuleDraft, RulePatch, Table};
use crate::core::orchestrator::{ImportMode, ImportReport, Orchestrator};

type SharedState = Arc<Orchestrator>;

/// Starts the HTTP server, serving until the process exits.
pub async fn serve(state: SharedState, listen_addr: &str) -> std::io::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("rewall API listening on http://{listen_addr}");

    axum::serve(listener, app).await
}

/// Builds the router; separated from [`serve`] so tests can drive it
/// without a socket.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/firewall/rules", get(list_rules).post(create_rule))
        .route("/api/firewall/rules/order", put(bulk_reorder))
        .route(
            "/api/firewall/rules/:id",
            get(get_rule).patch(update_rule).delete(delete_rule),
        )
        .route("/api/firewall/rules/:id/reorder", patch(reorder_rule))
        .route("/api/firewall/apply", post(apply_rules))
        .route("/api/firewall/save", post(save_rules))
        .route(
            "/api/firewall/chains",
            get(list_chains).post(register_chain),
        )
        .route("/api/firewall/chains/order", put(update_chain_order))
        .route("/api/firewall/chains/:name", axum::routing::delete(unregister_chain))
        .route("/api/firewall/export", get(export_rules))
        .route("/api/firewall/import", post(import_rules))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- Error mapping ---

/// Wraps core errors for transport: validation and bad-input adapter
/// errors are the client's fault, everything else is ours.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Iptables { kind, .. } if kind.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// --- API types ---

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    table: Option<Table>,
    #[serde(default)]
    chain: Option<ChainHook>,
}

#[derive(Deserialize)]
struct RuleOrderUpdate {
    id: Uuid,
    order: i64,
}

#[derive(Deserialize)]
struct SingleRuleReorder {
    new_order: i64,
}

#[derive(Deserialize)]
struct ChainPriorityUpdate {
    id: Uuid,
    priority: i64,
}

#[derive(Deserialize)]
struct ImportQuery {
    #[serde(default = "default_import_mode")]
    mode: String,
}

fn default_import_mode() -> String {
    "append".to_string()
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    message: String,
}

impl StatusResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "ok",
            message: message.into(),
        })
    }
}

// --- Rule handlers ---

async fn list_rules(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(state.list_rules(query.table, query.chain)?))
}

async fn get_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(state.get_rule(id)?))
}

async fn create_rule(
    State(state): State<SharedState>,
    Json(draft): Json<RuleDraft>,
) -> ApiResult<(StatusCode, Json<Rule>)> {
    let rule = state.create_rule(draft).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<RulePatch>,
) -> ApiResult<Json<Rule>> {
    Ok(Json(state.update_rule(id, patch).await?))
}

async fn delete_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.delete_rule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_reorder(
    State(state): State<SharedState>,
    Json(orders): Json<Vec<RuleOrderUpdate>>,
) -> ApiResult<Json<StatusResponse>> {
    let assignments: Vec<(Uuid, i64)> = orders.iter().map(|o| (o.id, o.order)).collect();
    let updated = state.set_rule_orders(&assignments).await?;
    Ok(StatusResponse::ok(format!("updated order for {updated} rules")))
}

async fn reorder_rule(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SingleRuleReorder>,
) -> ApiResult<Json<StatusResponse>> {
    state.reorder_rule(id, body.new_order).await?;
    Ok(StatusResponse::ok(format!("rule moved to position {}", body.new_order)))
}

// --- Apply / save ---

async fn apply_rules(State(state): State<SharedState>) -> ApiResult<Response> {
    let report = state.apply().await?;
    if report.is_success() {
        Ok(Json(report).into_response())
    } else {
        Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(report)).into_response())
    }
}

async fn save_rules(State(state): State<SharedState>) -> ApiResult<Json<StatusResponse>> {
    state.save().await?;
    Ok(StatusResponse::ok("rules saved to persistent storage"))
}

// --- Extension chain handlers ---

async fn list_chains(
    State(state): State<SharedState>,
) -> ApiResult<Json<Vec<crate::core::model::ExtensionChain>>> {
    Ok(Json(state.store().list_extension_chains()?))
}

async fn register_chain(
    State(state): State<SharedState>,
    Json(draft): Json<ExtensionChainDraft>,
) -> ApiResult<(StatusCode, Json<crate::core::model::ExtensionChain>)> {
    let chain = state.register_extension_chain(draft).await?;
    Ok((StatusCode::CREATED, Json(chain)))
}

async fn unregister_chain(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    if state.unregister_extension_chain(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("extension chain {name}")).into())
    }
}

async fn update_chain_order(
    State(state): State<SharedState>,
    Json(orders): Json<Vec<ChainPriorityUpdate>>,
) -> ApiResult<Json<StatusResponse>> {
    let updates: Vec<(Uuid, i64)> = orders.iter().map(|o| (o.id, o.priority)).collect();
    let updated = state.set_extension_priorities(&updates).await?;
    Ok(StatusResponse::ok(format!("updated priority for {updated} chains")))
}

// --- Export / import ---

async fn export_rules(State(state): State<SharedState>) -> ApiResult<Json<Vec<Rule>>> {
    Ok(Json(state.export_rules()?))
}

async fn import_rules(
    State(state): State<SharedState>,
    Query(query): Query<ImportQuery>,
    Json(records): Json<Vec<serde_json::Value>>,
) -> ApiResult<Json<ImportReport>> {
    let mode = match query.mode.as_str() {
        "append" => ImportMode::Append,
        "replace" => ImportMode::Replace,
        other => {
            return Err(Error::validation(
                "mode",
                format!("unknown import mode '{other}' (expected append or replace)"),
            )
            .into())
        }
    };
    Ok(Json(state.import_rules(records, mode).await?))
}
