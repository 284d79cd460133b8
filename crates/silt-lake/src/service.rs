//! HTTP service exposing a [`Lake`] to remote clients.
//!
//! Control requests and replies are JSON. Bodies that carry values (loads,
//! key ranges and query results) are bincode frames, so every value crosses
//! the wire exactly as it is stored. Commit messages for those requests
//! travel in the query string.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use silt_meta::{BranchConfig, PoolConfig};
use silt_storage::{decode_frames, encode_frame, ErrorKind, Id, Layout, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::Lake;
use crate::branch::CommitMessage;
use crate::error::{LakeError, LakeResult};
use crate::filter::KeyRange;
use crate::puller::{Batch, Progress, Puller, VecPuller};
use crate::scanner::DEFAULT_BATCH_SIZE;

type SharedLake = Arc<dyn Lake>;

/// Content type of a frame-encoded body.
pub(crate) const FRAMES_CONTENT_TYPE: &str = "application/x-silt-frames";

const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CreatePoolRequest {
    pub name: String,
    pub layout: String,
    #[serde(default)]
    pub seek_stride: u64,
    #[serde(default)]
    pub threshold: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CreateBranchRequest {
    pub name: String,
    #[serde(default)]
    pub at: Id,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MergeRequest {
    pub parent: String,
    #[serde(flatten)]
    pub msg: CommitMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IdsRequest {
    pub ids: Vec<Id>,
    #[serde(default)]
    pub write_vectors: bool,
    #[serde(flatten)]
    pub msg: CommitMessage,
}

/// Key range of a delete-where, sent as a single frame.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RangeRequest {
    pub lo: Value,
    pub hi: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RevertRequest {
    pub commit: Id,
    #[serde(flatten)]
    pub msg: CommitMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VacuumRequest {
    #[serde(default)]
    pub dryrun: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct QueryRequest {
    #[serde(default)]
    pub head: String,
    pub query: String,
}

/// One frame of a streamed query result. A stream ends with exactly one
/// `Done` or `Error` frame.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum QueryFrame {
    Batch(Batch),
    Done(Progress),
    Error(ErrorBody),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CommitResponse {
    pub commit: Id,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IdsResponse {
    pub ids: Vec<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorBody {
    pub kind: ErrorKind,
    pub error: String,
}

impl From<&LakeError> for ErrorBody {
    fn from(err: &LakeError) -> Self {
        Self {
            kind: err.kind(),
            error: err.to_string(),
        }
    }
}

impl From<ErrorBody> for LakeError {
    fn from(body: ErrorBody) -> Self {
        LakeError::Remote {
            kind: body.kind,
            message: body.error,
        }
    }
}

/// HTTP status for an error kind.
pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Exists | ErrorKind::Conflict | ErrorKind::Constraint => StatusCode::CONFLICT,
        ErrorKind::EmptyTransaction | ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
        ErrorKind::BadCommitObject | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A lake error on its way to the client.
pub struct ApiError(LakeError);

impl From<LakeError> for ApiError {
    fn from(err: LakeError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_of(kind);
        if status.is_server_error() {
            warn!(kind = kind.as_str(), error = %self.0, "request failed");
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Router serving `lake`.
pub fn router(lake: SharedLake) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/pool", get(list_pools_handler).post(create_pool_handler))
        .route(
            "/pool/:pool",
            get(pool_handler)
                .put(rename_pool_handler)
                .delete(remove_pool_handler),
        )
        .route("/pool/:pool/branch", post(create_branch_handler))
        .route(
            "/pool/:pool/branch/:branch",
            get(tip_handler).delete(remove_branch_handler),
        )
        .route("/pool/:pool/branch/:branch/merge", post(merge_handler))
        .route("/pool/:pool/branch/:branch/load", post(load_handler))
        .route("/pool/:pool/branch/:branch/delete", post(delete_handler))
        .route("/pool/:pool/branch/:branch/delete-where", post(delete_where_handler))
        .route("/pool/:pool/branch/:branch/revert", post(revert_handler))
        .route("/pool/:pool/branch/:branch/compact", post(compact_handler))
        .route("/pool/:pool/branch/:branch/vectors", post(add_vectors_handler))
        .route(
            "/pool/:pool/branch/:branch/vectors/delete",
            post(delete_vectors_handler),
        )
        .route("/pool/:pool/branch/:branch/vacuum", post(vacuum_handler))
        .route("/query", post(query_handler))
        .route("/events", get(events_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(lake)
}

/// Serve `lake` on `listener` until `shutdown` fires.
pub async fn serve(lake: SharedLake, listener: TcpListener, shutdown: CancellationToken) -> LakeResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "lake service listening");
    }
    axum::serve(listener, router(lake).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| LakeError::Transport(format!("lake service: {}", e)))
}

/// Token cancelled when the request handler is dropped, which is what
/// happens when the client goes away.
fn request_token() -> (CancellationToken, tokio_util::sync::DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> LakeResult<Vec<T>> {
    decode_frames(body).map_err(|e| LakeError::Invalid(format!("request body: {}", e)))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_pools_handler(State(lake): State<SharedLake>) -> ApiResult<Vec<PoolConfig>> {
    Ok(Json(lake.list_pools().await?))
}

async fn create_pool_handler(
    State(lake): State<SharedLake>,
    Json(req): Json<CreatePoolRequest>,
) -> ApiResult<PoolConfig> {
    let layout: Layout = req.layout.parse().map_err(LakeError::from)?;
    Ok(Json(
        lake.create_pool(&req.name, layout, req.seek_stride, req.threshold)
            .await?,
    ))
}

async fn pool_handler(
    State(lake): State<SharedLake>,
    Path(pool): Path<String>,
) -> ApiResult<PoolConfig> {
    let id = lake.id_of(&pool).await?;
    Ok(Json(lake.pool_config(id).await?))
}

async fn rename_pool_handler(
    State(lake): State<SharedLake>,
    Path(pool): Path<Id>,
    Json(req): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    lake.rename_pool(pool, &req.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_pool_handler(
    State(lake): State<SharedLake>,
    Path(pool): Path<Id>,
) -> Result<StatusCode, ApiError> {
    lake.remove_pool(pool).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_branch_handler(
    State(lake): State<SharedLake>,
    Path(pool): Path<Id>,
    Json(req): Json<CreateBranchRequest>,
) -> ApiResult<BranchConfig> {
    Ok(Json(lake.create_branch(pool, &req.name, req.at).await?))
}

async fn tip_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
) -> ApiResult<CommitResponse> {
    let commit = lake.tip(pool, &branch).await?;
    Ok(Json(CommitResponse { commit }))
}

async fn remove_branch_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
) -> Result<StatusCode, ApiError> {
    lake.remove_branch(pool, &branch).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn merge_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Json(req): Json<MergeRequest>,
) -> ApiResult<CommitResponse> {
    let commit = lake.merge_branch(pool, &branch, &req.parent, &req.msg).await?;
    Ok(Json(CommitResponse { commit }))
}

async fn load_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Query(msg): Query<CommitMessage>,
    body: Bytes,
) -> ApiResult<CommitResponse> {
    let (cancel, _guard) = request_token();
    let values: Vec<Value> = decode_body::<Batch>(&body)?.into_iter().flatten().collect();
    let mut input = VecPuller::new(values, DEFAULT_BATCH_SIZE);
    let commit = lake.load(pool, &branch, &mut input, &msg, &cancel).await?;
    Ok(Json(CommitResponse { commit }))
}

async fn delete_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<CommitResponse> {
    let commit = lake.delete(pool, &branch, &req.ids, &req.msg).await?;
    Ok(Json(CommitResponse { commit }))
}

async fn delete_where_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Query(msg): Query<CommitMessage>,
    body: Bytes,
) -> ApiResult<CommitResponse> {
    let (cancel, _guard) = request_token();
    let req = decode_body::<RangeRequest>(&body)?
        .into_iter()
        .next()
        .ok_or_else(|| LakeError::Invalid("missing key range".into()))?;
    let range = KeyRange::new(req.lo, req.hi);
    let commit = lake
        .delete_where(pool, &branch, &range, &msg, &cancel)
        .await?;
    Ok(Json(CommitResponse { commit }))
}

async fn revert_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Json(req): Json<RevertRequest>,
) -> ApiResult<CommitResponse> {
    let commit = lake.revert(pool, &branch, req.commit, &req.msg).await?;
    Ok(Json(CommitResponse { commit }))
}

async fn compact_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<CommitResponse> {
    let (cancel, _guard) = request_token();
    let commit = lake
        .compact(pool, &branch, &req.ids, req.write_vectors, &req.msg, &cancel)
        .await?;
    Ok(Json(CommitResponse { commit }))
}

async fn add_vectors_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<CommitResponse> {
    let (cancel, _guard) = request_token();
    let commit = lake
        .add_vectors(pool, &branch, &req.ids, &req.msg, &cancel)
        .await?;
    Ok(Json(CommitResponse { commit }))
}

async fn delete_vectors_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Json(req): Json<IdsRequest>,
) -> ApiResult<CommitResponse> {
    let commit = lake.delete_vectors(pool, &branch, &req.ids, &req.msg).await?;
    Ok(Json(CommitResponse { commit }))
}

async fn vacuum_handler(
    State(lake): State<SharedLake>,
    Path((pool, branch)): Path<(Id, String)>,
    Json(req): Json<VacuumRequest>,
) -> ApiResult<IdsResponse> {
    let (cancel, _guard) = request_token();
    let ids = lake.vacuum(pool, &branch, req.dryrun, &cancel).await?;
    Ok(Json(IdsResponse { ids }))
}

/// Scan feeding a response body. Dropping it, which happens when the client
/// goes away, cancels the scan.
struct QueryBody {
    scanner: Box<dyn Puller>,
    _guard: tokio_util::sync::DropGuard,
}

impl QueryBody {
    async fn next_frame(&mut self) -> (QueryFrame, bool) {
        match self.scanner.pull(false).await {
            Ok(Some(batch)) => (QueryFrame::Batch(batch), true),
            Ok(None) => (QueryFrame::Done(self.scanner.progress()), false),
            Err(e) => {
                warn!(kind = e.kind().as_str(), error = %e, "query failed mid-stream");
                (QueryFrame::Error(ErrorBody::from(&e)), false)
            }
        }
    }
}

async fn query_handler(
    State(lake): State<SharedLake>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let (cancel, guard) = request_token();
    let scanner = lake.query(&req.head, &req.query, &cancel).await?;
    let body = QueryBody {
        scanner,
        _guard: guard,
    };
    let frames = futures::stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        let (frame, more) = body.next_frame().await;
        let mut buf = Vec::new();
        let item = encode_frame(&mut buf, &frame)
            .map(|_| buf)
            .map_err(LakeError::from);
        Some((item, more.then_some(body)))
    });
    Ok((
        [(header::CONTENT_TYPE, FRAMES_CONTENT_TYPE)],
        Body::from_stream(frames),
    )
        .into_response())
}

async fn events_handler(
    State(lake): State<SharedLake>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, ApiError> {
    let events = lake.subscribe_events().await?;
    let stream = events.filter_map(|item| async move {
        match item {
            Ok(event) => Some(SseEvent::default().event(event.kind.as_str()).json_data(&event)),
            Err(e) => {
                warn!(error = %e, "dropping event");
                None
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
