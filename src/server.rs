use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::coordinator::{Coordinator, Readiness};
use crate::error::RagError;
use crate::rag::{validate_query, PipelineSettings, RagPipeline};
use crate::stream::TokenStream;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub settings: PipelineSettings,
}

impl AppState {
    async fn pipeline(&self) -> Result<RagPipeline, RagError> {
        let components = self.coordinator.ensure_ready().await?;
        Ok(RagPipeline::new(components, self.settings))
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Serialize, Debug)]
pub struct AnswerResponse {
    pub answer: String,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub readiness: Readiness,
}

/// Payload of one server-sent event
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Chunk { content: String },
    Done { message: String },
    Error { message: String },
}

impl StreamEvent {
    fn done() -> Self {
        StreamEvent::Done {
            message: "Stream completed".to_string(),
        }
    }

    fn error(err: &RagError) -> Self {
        StreamEvent::Error {
            message: err.to_string(),
        }
    }
}

/// Relay tokens as `chunk` events, then exactly one `done` or `error` event
pub fn event_stream(tokens: TokenStream) -> impl Stream<Item = StreamEvent> + Send {
    stream::unfold(Some(tokens), |state| async move {
        let mut tokens = state?;
        match tokens.next().await {
            Some(Ok(content)) => Some((StreamEvent::Chunk { content }, Some(tokens))),
            Some(Err(err)) => {
                warn!("Streaming answer failed: {}", err);
                Some((StreamEvent::error(&err), None))
            }
            None => Some((StreamEvent::done(), None)),
        }
    })
}

/// API-layer error type
#[derive(Debug)]
pub struct ApiError(RagError);

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            RagError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            RagError::Initialization(_) => (StatusCode::SERVICE_UNAVAILABLE, "initialization_failed"),
            RagError::Persistence(_) => (StatusCode::SERVICE_UNAVAILABLE, "persistence_failed"),
            RagError::Retrieval(_) => (StatusCode::INTERNAL_SERVER_ERROR, "retrieval_failed"),
            RagError::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "generation_failed"),
        };

        let body = ErrorBody {
            error,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/initialize", post(initialize))
        .route("/api/query", post(query))
        .route("/api/query/stream", post(query_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `router(state)` on `addr` until the process is stopped
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        readiness: state.coordinator.readiness(),
    })
}

/// POST /api/initialize - warm up outside the request path
async fn initialize(State(state): State<AppState>) -> Result<Json<Readiness>, ApiError> {
    state.coordinator.ensure_ready().await?;
    Ok(Json(state.coordinator.readiness()))
}

/// POST /api/query - whole answer as JSON
async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let query = validate_query(&req.query)?;
    state.settings.resolve_top_k(req.top_k)?;

    let answer = state.pipeline().await?.answer(query, req.top_k).await?;
    Ok(Json(AnswerResponse { answer }))
}

/// POST /api/query/stream - answer as server-sent events
async fn query_stream(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<BoxStream<'static, Result<Event, axum::Error>>>, ApiError> {
    let query = validate_query(&req.query)?;
    state.settings.resolve_top_k(req.top_k)?;

    let events = match open_stream(&state, query, req.top_k).await {
        Ok(tokens) => event_stream(tokens).boxed(),
        Err(err) => {
            warn!("Could not start streaming answer: {}", err);
            stream::once(async move { StreamEvent::error(&err) }).boxed()
        }
    };

    let events = events
        .map(|event| Event::default().json_data(event))
        .boxed();
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn open_stream(
    state: &AppState,
    query: &str,
    top_k: Option<usize>,
) -> Result<TokenStream, RagError> {
    state.pipeline().await?.answer_stream(query, top_k).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payloads() {
        let chunk = StreamEvent::Chunk {
            content: "Paris".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&chunk).unwrap(),
            r#"{"type":"chunk","content":"Paris"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::done()).unwrap(),
            r#"{"type":"done","message":"Stream completed"}"#
        );
        assert_eq!(
            serde_json::to_string(&StreamEvent::error(&RagError::Generation("boom".into()))).unwrap(),
            r#"{"type":"error","message":"generation failed: boom"}"#
        );
    }

    #[tokio::test]
    async fn test_event_stream_ends_with_single_terminal_event() {
        let (sink, tokens) = TokenStream::pair();
        sink.push("a".to_string());
        sink.push("b".to_string());
        sink.fail(RagError::Generation("boom".into()));

        let events: Vec<StreamEvent> = event_stream(tokens).collect().await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk { content: "a".into() },
                StreamEvent::Chunk { content: "b".into() },
                StreamEvent::Error {
                    message: "generation failed: boom".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_event_stream_completes_with_done() {
        let (sink, tokens) = TokenStream::pair();
        sink.push("Paris".to_string());
        sink.complete();

        let events: Vec<StreamEvent> = event_stream(tokens).collect().await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk {
                    content: "Paris".into()
                },
                StreamEvent::done(),
            ]
        );
    }
}
