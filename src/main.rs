mod budget;
mod config;
mod credentials;
mod dispatch;
mod http;
mod images;
mod llm;
mod metrics;
mod models;
mod normalize;
mod pipeline;
mod prompt;
mod prompt_store;
mod retry;
mod supabase;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use credentials::{CredentialProvider, SecretSource};
use eyre::WrapErr;
use llm::OpenAiClient;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, InvocationEvent, InvocationResponse};
use pipeline::{Pipeline, PipelineSettings};
use prompt_store::{PromptStore, YamlPromptStore};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use supabase::SupabaseClient;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "listing.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::from_env();
    init_tracing(config.json_logs);

    let supabase = SupabaseClient::from_env();
    let prompts = prompt_store(&config, supabase.as_ref())?;
    let secrets = supabase
        .clone()
        .map(|client| Arc::new(client) as Arc<dyn SecretSource>);
    if secrets.is_none() && config.credentials.fallback_key.is_none() {
        warn!(
            target = "listing.api",
            "no secret store or OPENAI_API_KEY configured; invocations will fail at the credentials stage"
        );
    }
    let credentials = Arc::new(CredentialProvider::new(secrets, config.credentials.clone()));
    let model = Arc::new(OpenAiClient::new(config.model.clone()));
    let pipeline = Pipeline::new(PipelineSettings::from(&config), model, prompts, credentials);

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let openapi: Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}));

    let state = AppState {
        pipeline,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };
    let app = router(state, config.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(
        target = "listing.api",
        batching = config.batch.enabled,
        batch_size = config.batch.size,
        tokens_per_minute = config.tokens_per_minute,
        model = %config.model.model,
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("server error")?;
    Ok(())
}

fn prompt_store(
    config: &AppConfig,
    supabase: Option<&SupabaseClient>,
) -> eyre::Result<Arc<dyn PromptStore>> {
    if let Some(client) = supabase {
        info!(target = "listing.api", "prompts served from supabase");
        return Ok(Arc::new(client.clone()));
    }
    if let Some(path) = &config.prompts_file {
        let store = YamlPromptStore::from_file(path)
            .wrap_err_with(|| format!("failed to load prompts from {}", path.display()))?;
        if store.is_empty() {
            warn!(target = "listing.api", path = %path.display(), "prompts file has no entries");
        } else {
            info!(target = "listing.api", prompts = store.len(), "prompts loaded from file");
        }
        return Ok(Arc::new(store));
    }
    warn!(
        target = "listing.api",
        "no prompt source configured; every lookup will return 404"
    );
    Ok(Arc::new(YamlPromptStore::default()))
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    openapi: Arc<Value>,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/invoke", post(invoke))
        .route("/listings", post(create_listings))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-writer",
    }))
}

/// Run one invocation and return the envelope as-is.
///
/// - Method: `POST`
/// - Path: `/invoke`
/// - Body: invocation event (`category`, `subCategory`, `SelectedCategoryOptions`, `Base64Key`)
/// - Response: always HTTP 200 with `{statusCode, body}`
async fn invoke(State(state): State<AppState>, Json(payload): Json<Value>) -> Json<InvocationResponse> {
    crate::metrics::inc_requests("/invoke");
    Json(handle_event(&state.pipeline, payload).await)
}

/// Run one invocation with the envelope status as the HTTP status.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Response: the envelope body (a JSON list of listing records on success)
async fn create_listings(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    crate::metrics::inc_requests("/listings");
    let envelope = handle_event(&state.pipeline, payload).await;
    let status =
        StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        envelope.body,
    )
        .into_response()
}

async fn handle_event(pipeline: &Pipeline, payload: Value) -> InvocationResponse {
    match serde_json::from_value::<InvocationEvent>(payload) {
        Ok(event) => pipeline.run(event).await,
        Err(err) => {
            warn!(target = "listing.api", error = %err, "invalid_invocation_payload");
            let body = ApiError {
                error: "Invalid invocation payload".into(),
                detail: Some(err.to_string()),
            };
            InvocationResponse::error(
                400,
                &serde_json::to_value(&body).unwrap_or_else(|_| json!({"error": body.error})),
            )
        }
    }
}

async fn openapi_json(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    Json((*state.openapi).clone()).into_response()
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let builder = fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.try_init()
    };
}
