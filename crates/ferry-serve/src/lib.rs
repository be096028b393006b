use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use ferry_core::config::FerryConfig;
use ferry_core::error::FerryError;
use ferry_core::types::{Decision, DeploymentStatus, StatusUpdate};
use ferry_ledger::{CommitPush, FerryPaths, Pipeline, SqliteStore};
use ferry_notify::{Collaborators, Dispatcher};

mod webhook;

use webhook::{DeploymentStatusPayload, PushPayload, WebhookVerdict};

const DRAIN_LIMIT: usize = 100;

// ── Config ──

pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

// ── App State ──

struct AppState {
    paths: FerryPaths,
    config: FerryConfig,
    collaborators: Collaborators,
    drain_lock: Mutex<()>,
}

impl AppState {
    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        Ok(SqliteStore::open(&self.paths.db_path)?)
    }

    fn pipeline<'a>(&'a self, store: &'a SqliteStore) -> Pipeline<'a> {
        Pipeline::new(store, store, &self.config)
            .with_summarizer(self.collaborators.summarizer())
            .with_source_control(self.collaborators.source())
    }

    /// Deliver whatever the last event enqueued. Failures stay in the outbox.
    fn drain(&self) {
        let _guard = match self.drain_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = self.open_store().and_then(|store| {
            let report = Dispatcher::new(&store, &store, &store, &self.config)
                .with_source_control(self.collaborators.source())
                .with_chat(self.collaborators.chat())
                .drain(DRAIN_LIMIT)?;
            Ok(report)
        });
        if let Err(e) = result {
            warn!(error = %e, "outbox drain failed");
        }
    }
}

/// Run `work` off the async runtime: store access and collaborator calls block.
async fn blocking<T, F>(state: &Arc<AppState>, work: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> anyhow::Result<T> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || work(&state))
        .await
        .map_err(|e| AppError(e.into()))?
        .map_err(AppError)
}

// ── Error Handling ──

struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<FerryError>() {
            Some(FerryError::InvalidEvent(_)) | Some(FerryError::StaleDecision { .. }) => {
                StatusCode::BAD_REQUEST
            }
            Some(FerryError::StorageUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self
            .0
            .downcast_ref::<FerryError>()
            .map_or("internal", FerryError::kind);
        if status == StatusCode::BAD_REQUEST {
            warn!(kind, error = %self.0, "request rejected");
        } else {
            warn!(kind, error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string(), "kind": kind });
        (status, Json(body)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

// ── Entrypoint ──

pub async fn serve(repo_root: &Path, config: ServeConfig) -> anyhow::Result<()> {
    let app = router(repo_root)?;
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "ferry HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router (for testing without binding to a port).
pub fn router(repo_root: &Path) -> anyhow::Result<Router> {
    let paths = FerryPaths::discover(repo_root);
    if !paths.is_initialized() {
        anyhow::bail!("not a ferry workspace (run `ferry init` first)");
    }
    let config = FerryConfig::load(&paths.config_json)?;
    let collaborators = Collaborators::from_config(&config);
    Ok(build_router(AppState {
        paths,
        config,
        collaborators,
        drain_lock: Mutex::new(()),
    }))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/deployments/{repo}/{env}", get(get_deployment))
        .route("/api/envs/{env}", get(get_env))
        .route("/webhooks/deployment-status", post(post_deployment_status))
        .route("/webhooks/push", post(post_push))
        .route("/actions/decision", post(post_decision))
        .route("/actions/diff", post(post_diff))
        .route("/chat/events", post(post_chat_event))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

// ── Health ──

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

// ── GET /api/deployments/{repo}/{env} ──

async fn get_deployment(
    State(state): State<Arc<AppState>>,
    UrlPath((repo, env)): UrlPath<(String, String)>,
) -> Result<Response, AppError> {
    let record = blocking(&state, move |state| {
        let store = state.open_store()?;
        let record = state.pipeline(&store).tracker().current(&repo, &env)?;
        Ok(record)
    })
    .await?;
    Ok(match record {
        Some(record) => Json(record.value).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no deployment recorded" })),
        )
            .into_response(),
    })
}

// ── GET /api/envs/{env} ──

async fn get_env(
    State(state): State<Arc<AppState>>,
    UrlPath(env): UrlPath<String>,
) -> Result<Json<ferry_core::types::EnvLatestPointer>, AppError> {
    let pointer = blocking(&state, move |state| {
        let store = state.open_store()?;
        let pointer = state.pipeline(&store).releases().env_pointer(&env)?;
        Ok(pointer)
    })
    .await?;
    Ok(Json(pointer))
}

// ── POST /webhooks/deployment-status ──

#[derive(Serialize)]
struct StatusResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    ignored: Option<String>,
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<DeploymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    approval: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    superseded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    release_sha: Option<String>,
}

async fn post_deployment_status(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DeploymentStatusPayload>,
) -> Result<Json<StatusResponse>, AppError> {
    let update: StatusUpdate = match payload.verdict(&state.config) {
        WebhookVerdict::Track(update) => update?,
        WebhookVerdict::Ignore(reason) => {
            info!(reason = %reason, "deployment status ignored");
            return Ok(Json(StatusResponse {
                ignored: Some(reason),
                accepted: false,
                status: None,
                approval: None,
                superseded: None,
                release_sha: None,
            }));
        }
    };

    let resp = blocking(&state, move |state| {
        let store = state.open_store()?;
        let outcome = state.pipeline(&store).handle_deployment_status(&update)?;
        drop(store);
        state.drain();
        Ok(StatusResponse {
            ignored: None,
            accepted: outcome.applied.accepted,
            status: outcome.applied.current.as_ref().map(|r| r.status),
            approval: outcome.applied.current.as_ref().map(|r| r.approval.label()),
            superseded: outcome.applied.superseded_prior.map(|r| r.deployment_id),
            release_sha: outcome.release.map(|r| r.sha),
        })
    })
    .await?;
    Ok(Json(resp))
}

// ── POST /webhooks/push ──

#[derive(Serialize)]
struct PushResponse {
    recorded: usize,
}

async fn post_push(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PushPayload>,
) -> Result<Json<PushResponse>, AppError> {
    let push: CommitPush = payload.into_push()?;
    let recorded = blocking(&state, move |state| {
        let store = state.open_store()?;
        let recorded = state.pipeline(&store).handle_commit_push(&push)?;
        Ok(recorded.len())
    })
    .await?;
    Ok(Json(PushResponse { recorded }))
}

// ── POST /actions/decision ──

#[derive(Deserialize)]
struct DecisionBody {
    repo: String,
    env: String,
    deployment_id: String,
    decision: String,
    actor: String,
}

#[derive(Serialize)]
struct DecisionResponse {
    accepted: bool,
    approval: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    promote_to: Option<String>,
}

async fn post_decision(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<DecisionResponse>, AppError> {
    let decision: Decision = body.decision.parse()?;
    let resp = blocking(&state, move |state| {
        let store = state.open_store()?;
        let outcome = state.pipeline(&store).handle_decision(
            &body.repo,
            &body.env,
            &body.deployment_id,
            decision,
            &body.actor,
        )?;
        drop(store);
        state.drain();
        Ok(DecisionResponse {
            accepted: outcome.accepted,
            approval: outcome.record.approval.label(),
            promote_to: outcome.promotion.map(|p| p.next_env),
        })
    })
    .await?;
    Ok(Json(resp))
}

// ── POST /actions/diff ──

#[derive(Deserialize)]
struct DiffBody {
    envs: Vec<String>,
    #[serde(default)]
    excluded: Vec<String>,
}

async fn post_diff(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DiffBody>,
) -> Result<Json<ferry_ledger::EnvDiff>, AppError> {
    let [a, b] = <[String; 2]>::try_from(body.envs)
        .map_err(|_| FerryError::invalid("diff needs exactly two environments"))?;
    let diff = blocking(&state, move |state| {
        let store = state.open_store()?;
        let diff = state
            .pipeline(&store)
            .handle_diff_request(&a, &b, &body.excluded)?;
        drop(store);
        state.drain();
        Ok(diff)
    })
    .await?;
    Ok(Json(diff))
}

// ── POST /chat/events ──

#[derive(Deserialize)]
struct ChatEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    challenge: Option<String>,
}

async fn post_chat_event(Json(event): Json<ChatEvent>) -> Json<serde_json::Value> {
    match (event.kind.as_str(), event.challenge) {
        ("url_verification", Some(challenge)) => Json(serde_json::json!({ "challenge": challenge })),
        _ => Json(serde_json::json!({ "ok": true })),
    }
}

// ── Tests ──
