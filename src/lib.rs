pub mod config;
pub mod encoder;
pub mod error;
pub mod fanout;
pub mod live_stream;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod tuner;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::stream;
use tracing::info;

use error::CoreError;
use model::{ChannelId, Quality};
use registry::Registry;

struct AppState {
    registry: Arc<Registry>,
}

/// Builds the ambient HTTP surface around the core (spec.md §6 ADDED): the
/// reuse/arbitration policy itself lives entirely in `Registry`, this layer
/// only translates `CoreError` into status codes and turns a `ClientReader`
/// into a streaming response body, the same split `fritztv::create_app`
/// draws between `StreamManager` and its Axum handlers.
pub fn create_app(registry: Arc<Registry>) -> Router {
    let state = Arc::new(AppState { registry });

    Router::new()
        .route("/streams/{channel}/{quality}", get(stream_handler))
        .route("/api/streams", get(list_streams_handler))
        .route("/api/streams/{channel}/{quality}", get(status_handler))
        .route("/api/streams/{channel}/viewers", get(viewers_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn core_error_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::NoTunerAvailable => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::BackendUnreachable(_) => StatusCode::BAD_GATEWAY,
        CoreError::EncoderUnsupported(_, _) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::EncoderStartFailed(_) | CoreError::EncoderFatalLog(_) | CoreError::EncoderFroze => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        CoreError::ClientStalled | CoreError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_quality(raw: &str) -> Result<Quality, Response> {
    Quality::ALL
        .iter()
        .find(|q| q.as_str() == raw)
        .copied()
        .ok_or_else(|| {
            (StatusCode::BAD_REQUEST, format!("unknown quality: {raw}")).into_response()
        })
}

async fn stream_handler(
    Path((channel, quality)): Path<(ChannelId, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let quality = match parse_quality(&quality) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!(channel = %channel, %quality, UA = user_agent, "stream request");

    let reader = match state.registry.connect(channel, quality, "mpegts").await {
        Ok(r) => r,
        Err(e) => {
            return (core_error_status(&e), e.to_string()).into_response();
        }
    };

    let body_stream = stream::unfold(reader, |mut reader| async move {
        reader.read().await.map(|chunk| (Ok::<_, std::io::Error>(chunk), reader))
    });

    Response::builder()
        .header("Content-Type", "video/mp2t")
        .header("Cache-Control", "no-store")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

async fn list_streams_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list_streams().await)
}

async fn status_handler(
    Path((channel, quality)): Path<(ChannelId, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let quality = match parse_quality(&quality) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let id = model::LiveStreamId::new(channel, quality);
    match state.registry.get_status(&id).await {
        Some(status) => Json(status).into_response(),
        None => (StatusCode::NOT_FOUND, "no such live stream").into_response(),
    }
}

async fn viewers_handler(
    Path(channel): Path<ChannelId>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.registry.get_viewer_count(&channel))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}
