// In-process mock of the catalog API
//
// Counts hits per "METHOD /path", issues rotating token pairs and can be told
// to reject, fail or delay upcoming requests.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use propstore_client::{ApiClient, ClientOptions, MemoryTokenStorage, TokenStorage};

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "secret";

/// Shared backend state
#[derive(Default)]
pub struct BackendState {
    hits: DashMap<String, usize>,
    /// Token generation; pair n is ("A{n}", "R{n}")
    generation: AtomicUsize,
    valid_access: Mutex<Option<String>>,
    valid_refresh: Mutex<Option<String>>,
    refreshes: AtomicUsize,
    refresh_fails: AtomicBool,
    reject_next: AtomicUsize,
    fail_next: AtomicUsize,
    delay_ms: AtomicU64,
    records: DashMap<String, Vec<Value>>,
}

impl BackendState {
    fn hit(&self, method: &str, path: &str) {
        *self.hits.entry(format!("{} {}", method, path)).or_insert(0) += 1;
    }

    fn issue_pair(&self) -> Value {
        let n = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("A{}", n);
        let refresh = format!("R{}", n);

        if let Ok(mut slot) = self.valid_access.lock() {
            *slot = Some(access.clone());
        }
        if let Ok(mut slot) = self.valid_refresh.lock() {
            *slot = Some(refresh.clone());
        }

        json!({
            "access_token": access,
            "refresh_token": refresh,
            "token_type": "bearer"
        })
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        if take_one(&self.reject_next) {
            return Err(detail(StatusCode::UNAUTHORIZED, "Token expired"));
        }

        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);
        let valid = self.valid_access.lock().ok().and_then(|v| v.clone());

        match (presented, valid) {
            (Some(p), Some(v)) if p == v => Ok(()),
            _ => Err(detail(
                StatusCode::UNAUTHORIZED,
                "Could not validate credentials",
            )),
        }
    }

    async fn gate(&self, headers: &HeaderMap) -> Result<(), Response> {
        self.authorize(headers)?;

        if take_one(&self.fail_next) {
            return Err(detail(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable"));
        }

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

/// Mock catalog server
pub struct MockBackend {
    state: Arc<BackendState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

impl MockBackend {
    /// Start the server on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(BackendState::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let app = Router::new()
            .route("/v1/auth/login", post(handle_login))
            .route("/v1/auth/refresh", post(handle_refresh))
            .route("/v1/:family/", get(handle_list).post(handle_create))
            .route(
                "/v1/:family/:id",
                get(handle_get).patch(handle_update).delete(handle_delete),
            )
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            state,
            shutdown_tx: Some(shutdown_tx),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Hits for a "METHOD /path" route
    pub fn hits(&self, route: &str) -> usize {
        self.state.hits.get(route).map(|n| *n).unwrap_or(0)
    }

    pub fn refreshes(&self) -> usize {
        self.state.refreshes.load(Ordering::SeqCst)
    }

    /// Answer the next `n` resource requests with 401
    pub fn reject_next(&self, n: usize) {
        self.state.reject_next.store(n, Ordering::SeqCst);
    }

    /// Answer the next `n` authorized resource requests with 503
    pub fn fail_next(&self, n: usize) {
        self.state.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_refresh_fails(&self, fails: bool) {
        self.state.refresh_fails.store(fails, Ordering::SeqCst);
    }

    /// Invalidate the current access token, keeping the refresh token valid
    pub fn expire_access(&self) {
        if let Ok(mut slot) = self.state.valid_access.lock() {
            *slot = None;
        }
    }

    pub fn seed(&self, family: &str, rows: Vec<Value>) {
        self.state.records.insert(family.to_string(), rows);
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn handle_login(
    State(state): State<Arc<BackendState>>,
    Form(form): Form<LoginForm>,
) -> Response {
    state.hit("POST", "/v1/auth/login");

    if form.username != USERNAME || form.password != PASSWORD {
        return detail(StatusCode::UNAUTHORIZED, "Incorrect username or password");
    }
    Json(state.issue_pair()).into_response()
}

#[derive(Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

async fn handle_refresh(
    State(state): State<Arc<BackendState>>,
    Json(body): Json<RefreshBody>,
) -> Response {
    state.hit("POST", "/v1/auth/refresh");
    state.refreshes.fetch_add(1, Ordering::SeqCst);

    let valid = state.valid_refresh.lock().ok().and_then(|v| v.clone());
    if state.refresh_fails.load(Ordering::SeqCst) || valid.as_deref() != Some(&body.refresh_token)
    {
        return detail(StatusCode::UNAUTHORIZED, "Invalid refresh token");
    }
    Json(state.issue_pair()).into_response()
}

async fn handle_list(
    State(state): State<Arc<BackendState>>,
    Path(family): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.hit("GET", &format!("/v1/{}/", family));
    if let Err(rejection) = state.gate(&headers).await {
        return rejection;
    }

    let rows = state
        .records
        .get(&family)
        .map(|r| r.value().clone())
        .unwrap_or_default();
    Json(json!({ "rows": rows, "total": rows.len(), "offset": 0 })).into_response()
}

async fn handle_get(
    State(state): State<Arc<BackendState>>,
    Path((family, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state.hit("GET", &format!("/v1/{}/{}", family, id));
    if let Err(rejection) = state.gate(&headers).await {
        return rejection;
    }

    let record = state.records.get(&family).and_then(|rows| {
        rows.iter()
            .find(|row| row["id"].to_string() == id || row["id"].as_str() == Some(id.as_str()))
            .cloned()
    });
    match record {
        Some(record) => Json(record).into_response(),
        None => detail(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn handle_create(
    State(state): State<Arc<BackendState>>,
    Path(family): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.hit("POST", &format!("/v1/{}/", family));
    if let Err(rejection) = state.gate(&headers).await {
        return rejection;
    }

    if family == "uploads" {
        let multipart = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("multipart/form-data"));
        let text = String::from_utf8_lossy(&body);
        let file_name = text
            .split("filename=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .map(str::to_string);

        return match (multipart && text.contains("name=\"file\""), file_name) {
            (true, Some(name)) => {
                (StatusCode::CREATED, Json(json!({ "filename": name }))).into_response()
            }
            _ => detail(StatusCode::UNPROCESSABLE_ENTITY, "file is required"),
        };
    }

    let mut record: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return detail(StatusCode::UNPROCESSABLE_ENTITY, "body must be an object"),
    };

    let mut rows = state.records.entry(family).or_default();
    record["id"] = json!(rows.len() + 1);
    rows.push(record.clone());

    (StatusCode::CREATED, Json(record)).into_response()
}

async fn handle_update(
    State(state): State<Arc<BackendState>>,
    Path((family, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(patch): Json<Value>,
) -> Response {
    state.hit("PATCH", &format!("/v1/{}/{}", family, id));
    if let Err(rejection) = state.gate(&headers).await {
        return rejection;
    }

    let Some(mut rows) = state.records.get_mut(&family) else {
        return detail(StatusCode::NOT_FOUND, "Not found");
    };
    let Some(row) = rows.iter_mut().find(|row| row["id"].to_string() == id) else {
        return detail(StatusCode::NOT_FOUND, "Not found");
    };

    if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
    Json(row.clone()).into_response()
}

async fn handle_delete(
    State(state): State<Arc<BackendState>>,
    Path((family, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    state.hit("DELETE", &format!("/v1/{}/{}", family, id));
    if let Err(rejection) = state.gate(&headers).await {
        return rejection;
    }

    if let Some(mut rows) = state.records.get_mut(&family) {
        rows.retain(|row| row["id"].to_string() != id);
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Client options pointing at `url` with fast retries
pub fn options(url: &str) -> ClientOptions {
    ClientOptions {
        base_url: url.to_string(),
        retry_base_delay: Duration::from_millis(10),
        ..ClientOptions::default()
    }
}

/// Client with an empty in-memory session
pub fn client(url: &str) -> ApiClient {
    client_with(options(url), Arc::new(MemoryTokenStorage::new()))
}

pub fn client_with(options: ClientOptions, storage: Arc<dyn TokenStorage>) -> ApiClient {
    ApiClient::new(&options, storage).unwrap()
}

/// Client already logged in against `backend`
pub async fn logged_in_client(backend: &MockBackend) -> ApiClient {
    let client = client(&backend.url());
    client
        .credentials()
        .login(USERNAME, PASSWORD)
        .await
        .unwrap();
    client
}

/// URL of a port nothing listens on
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}
