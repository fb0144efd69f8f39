//! Shared test harness: an in-process fake of the Cloud Storage JSON API
//! and OAuth token endpoint, plus helpers to run the gateway against it.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storegate::auth::SigningScheme;
use storegate::channel::ChannelConfigMap;
use storegate::credentials::CredentialCache;
use storegate::factory::GcsClientFactory;
use storegate::storage::gcp::GcsEndpoints;
use storegate::AppState;

pub const KEY_JSON: &str = include_str!("../fixtures/service_account.json");
pub const PUBLIC_KEY_PEM: &str = include_str!("../fixtures/test_public_key.pem");

/// Token handed out for full-control assertions; API calls must carry it.
pub const FULL_CONTROL_TOKEN: &str = "fake-full_control";
/// Token handed out for read-only assertions.
pub const READ_ONLY_TOKEN: &str = "fake-read_only";

/// Objects per list page, small so pagination is exercised.
const PAGE_SIZE: usize = 2;

/// Bucket whose every call answers 503.
pub const DOWN_BUCKET: &str = "down-bucket";

/// Bucket that does not exist; every call answers 404.
pub const MISSING_BUCKET: &str = "missing-bucket";

#[derive(Default)]
pub struct FakeState {
    pub base: String,
    pub objects: Mutex<BTreeMap<(String, String), Bytes>>,
    pub public_buckets: Mutex<HashSet<String>>,
    pub token_requests: AtomicUsize,
    pub key_downloads: AtomicUsize,
}

impl FakeState {
    pub fn object(&self, bucket: &str, name: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
    }

    pub fn put(&self, bucket: &str, name: &str, data: &'static [u8]) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), name.to_string()),
            Bytes::from_static(data),
        );
    }

    pub fn make_public(&self, bucket: &str) {
        self.public_buckets.lock().unwrap().insert(bucket.to_string());
    }
}

pub struct FakeGcs {
    pub base: String,
    pub state: Arc<FakeState>,
}

impl FakeGcs {
    pub fn endpoints(&self) -> GcsEndpoints {
        GcsEndpoints::with_base(&self.base)
    }

    pub fn token_uri(&self) -> String {
        format!("{}/token", self.base)
    }

    /// URL serving a valid key whose `token_uri` points back here.
    pub fn key_url(&self) -> String {
        format!("{}/keys/service_account.json", self.base)
    }
}

fn gcs_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"code": status.as_u16(), "message": message}})),
    )
        .into_response()
}

fn check(headers: &HeaderMap, bucket: &str) -> Result<(), Response> {
    let expected = format!("Bearer {FULL_CONTROL_TOKEN}");
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if !authorized {
        return Err(gcs_error(StatusCode::UNAUTHORIZED, "Invalid Credentials"));
    }
    if bucket == DOWN_BUCKET {
        return Err(gcs_error(StatusCode::SERVICE_UNAVAILABLE, "Backend Error"));
    }
    if bucket == MISSING_BUCKET {
        return Err(gcs_error(
            StatusCode::NOT_FOUND,
            "The specified bucket does not exist.",
        ));
    }
    Ok(())
}

/// Key JSON with `token_uri` pointing at `token_uri`.
pub fn key_json(token_uri: &str) -> String {
    let mut key: serde_json::Value = serde_json::from_str(KEY_JSON).unwrap();
    key["token_uri"] = json!(token_uri);
    key.to_string()
}

/// Write a key file for `token_uri` into `dir`.
pub fn write_key(dir: &FsPath, name: &str, token_uri: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, key_json(token_uri)).unwrap();
    path
}

// -- Fake endpoints -------------------------------------------------------------

#[derive(Deserialize)]
struct TokenForm {
    grant_type: String,
    assertion: String,
}

#[derive(Deserialize)]
struct AssertionClaims {
    scope: String,
}

async fn token(State(state): State<Arc<FakeState>>, Form(form): Form<TokenForm>) -> Response {
    state.token_requests.fetch_add(1, Ordering::SeqCst);
    if form.grant_type != "urn:ietf:params:oauth:grant-type:jwt-bearer" {
        return (StatusCode::BAD_REQUEST, "unsupported_grant_type").into_response();
    }

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[format!("{}/token", state.base)]);
    let key = DecodingKey::from_rsa_pem(PUBLIC_KEY_PEM.as_bytes()).unwrap();
    let claims = match jsonwebtoken::decode::<AssertionClaims>(&form.assertion, &key, &validation) {
        Ok(data) => data.claims,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid_grant: {e}")).into_response(),
    };

    let token = if claims.scope.ends_with("devstorage.full_control") {
        FULL_CONTROL_TOKEN
    } else {
        READ_ONLY_TOKEN
    };
    Json(json!({"access_token": token, "token_type": "Bearer", "expires_in": 3599})).into_response()
}

/// Token endpoint reporting a lifetime no clock can represent.
async fn endless_token() -> Response {
    Json(json!({
        "access_token": READ_ONLY_TOKEN,
        "token_type": "Bearer",
        "expires_in": 1_000_000_000_000_000_000_i64
    }))
    .into_response()
}

async fn reject_token() -> Response {
    (StatusCode::BAD_REQUEST, r#"{"error":"invalid_grant"}"#).into_response()
}

async fn serve_key(State(state): State<Arc<FakeState>>) -> String {
    state.key_downloads.fetch_add(1, Ordering::SeqCst);
    key_json(&format!("{}/token", state.base))
}

async fn upload(
    State(state): State<Arc<FakeState>>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check(&headers, &bucket) {
        return resp;
    }
    let Some(name) = query.get("name").cloned() else {
        return gcs_error(StatusCode::BAD_REQUEST, "Required parameter: name");
    };
    state
        .objects
        .lock()
        .unwrap()
        .insert((bucket.clone(), name.clone()), body);
    Json(json!({"name": name, "bucket": bucket})).into_response()
}

async fn get_object(
    State(state): State<Arc<FakeState>>,
    Path((bucket, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check(&headers, &bucket) {
        return resp;
    }
    let Some(data) = state.object(&bucket, &name) else {
        return gcs_error(StatusCode::NOT_FOUND, &format!("No such object: {bucket}/{name}"));
    };
    if query.get("alt").map(String::as_str) == Some("media") {
        return (StatusCode::OK, data).into_response();
    }
    Json(json!({
        "name": name,
        "bucket": bucket,
        "size": data.len().to_string(),
        "contentType": "application/octet-stream",
    }))
    .into_response()
}

async fn delete_object(
    State(state): State<Arc<FakeState>>,
    Path((bucket, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check(&headers, &bucket) {
        return resp;
    }
    match state.objects.lock().unwrap().remove(&(bucket.clone(), name.clone())) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => gcs_error(StatusCode::NOT_FOUND, &format!("No such object: {bucket}/{name}")),
    }
}

async fn list_objects(
    State(state): State<Arc<FakeState>>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check(&headers, &bucket) {
        return resp;
    }
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let start: usize = query
        .get("pageToken")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);

    let names: Vec<String> = state
        .objects
        .lock()
        .unwrap()
        .keys()
        .filter(|(b, n)| *b == bucket && n.starts_with(&prefix))
        .map(|(_, n)| n.clone())
        .collect();

    let page: Vec<_> = names
        .iter()
        .skip(start)
        .take(PAGE_SIZE)
        .map(|n| json!({"name": n}))
        .collect();
    let mut body = json!({"kind": "storage#objects"});
    if !page.is_empty() {
        body["items"] = json!(page);
    }
    if start + PAGE_SIZE < names.len() {
        body["nextPageToken"] = json!((start + PAGE_SIZE).to_string());
    }
    Json(body).into_response()
}

async fn iam_policy(
    State(state): State<Arc<FakeState>>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = check(&headers, &bucket) {
        return resp;
    }
    let mut bindings = vec![json!({
        "role": "roles/storage.legacyBucketOwner",
        "members": ["projectOwner:storegate-test"]
    })];
    if state.public_buckets.lock().unwrap().contains(&bucket) {
        bindings.push(json!({
            "role": "roles/storage.legacyObjectReader",
            "members": ["allUsers"]
        }));
    }
    Json(json!({"kind": "storage#policy", "bindings": bindings})).into_response()
}

/// Start the fake on an ephemeral port.
pub async fn start_fake_gcs() -> FakeGcs {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let state = Arc::new(FakeState {
        base: base.clone(),
        ..FakeState::default()
    });

    let app = Router::new()
        .route("/token", post(token))
        .route("/token-reject", post(reject_token))
        .route("/token-endless", post(endless_token))
        .route("/keys/service_account.json", get(serve_key))
        .route("/upload/storage/v1/b/:bucket/o", post(upload))
        .route("/storage/v1/b/:bucket/o", get(list_objects))
        .route(
            "/storage/v1/b/:bucket/o/:object",
            get(get_object).delete(delete_object),
        )
        .route("/storage/v1/b/:bucket/iam", get(iam_policy))
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeGcs { base, state }
}

// -- Gateway harness --------------------------------------------------------------

pub fn factory(gcs: &FakeGcs, cache_dir: &FsPath, scheme: SigningScheme) -> GcsClientFactory {
    let cache = Arc::new(CredentialCache::new(cache_dir, reqwest::Client::new()));
    GcsClientFactory::new(cache, gcs.endpoints(), Duration::from_secs(10), scheme)
}

/// Serve the gateway over `channels` on an ephemeral port; returns its
/// base URL.
pub async fn start_gateway(channels: ChannelConfigMap, factory: GcsClientFactory) -> String {
    let state = Arc::new(AppState {
        channels: Arc::new(channels),
        factory: Arc::new(factory),
    });
    let app = storegate::server::app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}
