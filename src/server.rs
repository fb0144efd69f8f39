//! Axum router for the gateway RPC protocol.
//!
//! Every RPC runs the same pipeline: read the channel from the
//! `x-channel` header, resolve it in the channel map, build a fresh
//! client through the [`ClientFactory`], run the one operation, and map
//! the result (or the [`StorageError`]) to a response.  The client is
//! dropped when the handler returns.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, RawQuery, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::errors::{StorageError, StorageResult};
use crate::metrics::{metrics_handler, metrics_middleware, record_operation};
use crate::storage::backend::{ByteStream, ChannelStorage};
use crate::wire::{
    self, op, DownloadUrlResponse, Empty, ExistResponse, IsPublicResponse, KeyRequest,
    ListRequest, ListResponse, SaveFileResponse, SignedUrlRequest, SignedUrlResponse,
    AccessTokenBody, CHANNEL_HEADER, TIMEOUT_HEADER,
};
use crate::AppState;

/// Build the axum [`Router`] with every RPC route.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(&wire::rpc_path(op::SAVE_FILE), post(handle_save_file))
        .route(&wire::rpc_path(op::GET_FILE), post(handle_get_file))
        .route(&wire::rpc_path(op::DELETE), post(handle_delete))
        .route(&wire::rpc_path(op::EXIST), post(handle_exist))
        .route(&wire::rpc_path(op::LIST), post(handle_list))
        .route(&wire::rpc_path(op::IS_PUBLIC), post(handle_is_public))
        .route(
            &wire::rpc_path(op::GET_DOWNLOAD_URL),
            post(handle_get_download_url),
        )
        .route(&wire::rpc_path(op::GET_SIGNED_URL), post(handle_get_signed_url))
        .route(
            &wire::rpc_path(op::GET_ACCESS_TOKEN),
            post(handle_get_access_token),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        // Objects can be large; SaveFile streams its body.
        .layer(DefaultBodyLimit::disable())
}

/// `GET /health`
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Request plumbing ----------------------------------------------------------

/// Channel named by the request, or `InvalidArgument` when absent.
fn channel_from(headers: &HeaderMap) -> StorageResult<String> {
    let value = headers
        .get(CHANNEL_HEADER)
        .ok_or_else(|| StorageError::invalid(format!("missing {CHANNEL_HEADER} header")))?;
    let channel = value
        .to_str()
        .map_err(|_| StorageError::invalid(format!("{CHANNEL_HEADER} header is not ASCII")))?
        .trim();
    if channel.is_empty() {
        return Err(StorageError::invalid(format!("{CHANNEL_HEADER} header is empty")));
    }
    Ok(channel.to_string())
}

/// Caller-supplied deadline from `x-timeout-ms`, if any.
fn deadline_from(headers: &HeaderMap) -> StorageResult<Option<Duration>> {
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };
    let millis: u64 = value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|ms| *ms > 0)
        .ok_or_else(|| StorageError::invalid(format!("invalid {TIMEOUT_HEADER} header")))?;
    Ok(Some(Duration::from_millis(millis)))
}

/// Decode a JSON body.  An empty body decodes as `{}`.
fn decode<T: DeserializeOwned>(body: &[u8]) -> StorageResult<T> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|e| StorageError::invalid(format!("malformed request body: {e}")))
}

fn require_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::invalid("key must not be empty"));
    }
    Ok(())
}

/// Parse a raw query string into a map.  `+` decodes to a space.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            let decode = |s: &str| {
                percent_encoding::percent_decode_str(&s.replace('+', " "))
                    .decode_utf8_lossy()
                    .into_owned()
            };
            map.insert(decode(k), decode(v));
        }
    }
    map
}

impl AppState {
    /// Resolve `channel` and build its client.
    async fn client_for(&self, channel: &str) -> StorageResult<Box<dyn ChannelStorage>> {
        let config = self.channels.resolve(channel)?;
        self.factory.build(config).await
    }
}

/// Run one RPC under the caller's deadline, then log and count the outcome.
async fn dispatch<T, F>(
    operation: &'static str,
    channel: &str,
    deadline: Option<Duration>,
    call: F,
) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::BackendUnavailable(format!(
                "deadline of {} ms exceeded",
                limit.as_millis()
            ))),
        },
        None => call.await,
    };

    match &result {
        Ok(_) => {
            debug!("{} ok: channel={}", operation, channel);
            record_operation(operation, "OK");
        }
        Err(e) => {
            warn!("{} failed: channel={} code={} error={}", operation, channel, e.code(), e);
            record_operation(operation, e.code());
        }
    }
    result
}

// -- Handlers -----------------------------------------------------------------

/// `POST /rpc/SaveFile?key=K`, raw object body.
async fn handle_save_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    body: Body,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let key = parse_query(raw_query)
        .remove("key")
        .ok_or_else(|| StorageError::invalid("missing key query parameter"))?;
    require_key(&key)?;

    let stream: ByteStream = body
        .into_data_stream()
        .inspect_ok(|chunk| {
            metrics::counter!(crate::metrics::BYTES_RECEIVED_TOTAL).increment(chunk.len() as u64)
        })
        .map_err(std::io::Error::other)
        .boxed();

    let url = dispatch(op::SAVE_FILE, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.save_by_stream(&key, stream).await
    })
    .await?;

    Ok(Json(SaveFileResponse { url }).into_response())
}

/// `POST /rpc/GetFile {"key"}`, raw object body in the response.
async fn handle_get_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let req: KeyRequest = decode(&body)?;
    require_key(&req.key)?;

    let data = dispatch(op::GET_FILE, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.get(&req.key).await
    })
    .await?;

    metrics::counter!(crate::metrics::BYTES_SENT_TOTAL).increment(data.len() as u64);
    Ok((
        StatusCode::OK,
        [("content-type", "application/octet-stream")],
        data,
    )
        .into_response())
}

/// `POST /rpc/Delete {"key"}`
async fn handle_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let req: KeyRequest = decode(&body)?;
    require_key(&req.key)?;

    dispatch(op::DELETE, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.delete(&req.key).await
    })
    .await?;

    Ok(Json(Empty {}).into_response())
}

/// `POST /rpc/Exist {"key"}`
async fn handle_exist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let req: KeyRequest = decode(&body)?;
    require_key(&req.key)?;

    let exist = dispatch(op::EXIST, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.exists(&req.key).await
    })
    .await?;

    Ok(Json(ExistResponse { exist }).into_response())
}

/// `POST /rpc/List {"path"}`
async fn handle_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let req: ListRequest = decode(&body)?;

    let files = dispatch(op::LIST, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.list(&req.path).await
    })
    .await?;

    Ok(Json(ListResponse { files }).into_response())
}

/// `POST /rpc/IsPublic {}`
async fn handle_is_public(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let _: Empty = decode(&body)?;

    let is_public = dispatch(op::IS_PUBLIC, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.is_public().await
    })
    .await?;

    Ok(Json(IsPublicResponse { is_public }).into_response())
}

/// `POST /rpc/GetDownloadUrl {"key"}`
async fn handle_get_download_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let req: KeyRequest = decode(&body)?;
    require_key(&req.key)?;

    let download = dispatch(op::GET_DOWNLOAD_URL, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.download_url(&req.key).await
    })
    .await?;

    Ok(Json(DownloadUrlResponse::from(download)).into_response())
}

/// `POST /rpc/GetSignedUrl {"key","content_type","expire_secs"}`
async fn handle_get_signed_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let req: SignedUrlRequest = decode(&body)?;
    require_key(&req.key)?;

    let url = dispatch(op::GET_SIGNED_URL, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client
            .signed_url(
                &req.key,
                &req.content_type,
                Duration::from_secs(req.expire_secs),
            )
            .await
    })
    .await?;

    Ok(Json(SignedUrlResponse { url }).into_response())
}

/// `POST /rpc/GetAccessToken {}`
async fn handle_get_access_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StorageError> {
    let channel = channel_from(&headers)?;
    let deadline = deadline_from(&headers)?;
    let _: Empty = decode(&body)?;

    let token = dispatch(op::GET_ACCESS_TOKEN, &channel, deadline, async {
        let client = state.client_for(&channel).await?;
        client.access_token().await
    })
    .await?;

    Ok(Json(AccessTokenBody::from(token)).into_response())
}

// -- Tests --------------------------------------------------------------------
