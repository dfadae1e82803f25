//! A stand-in for the remote knowledge-base service.
//!
//! Speaks the real envelope protocol: every request body is opened with the
//! key derived from its `date` header and every response is sealed with the
//! same key.

#![allow(dead_code)]

use axum::{
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use kb_sync::config::Config;
use kb_sync::envelope;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ACCESS_KEY: &str = "ak-test";
pub const SECRET: &str = "sk-test";
pub const TOKEN: &str = "tok-issued";
pub const FALLBACK_TOKEN: &str = "tok-fallback";

#[derive(Debug, Clone)]
pub struct SeenCreate {
    pub params: Value,
    pub authorization: String,
}

#[derive(Debug, Clone)]
pub struct SeenUpload {
    pub params: Value,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub authorization: String,
}

#[derive(Default)]
pub struct MockState {
    pub token_calls: AtomicUsize,
    pub token_params: Mutex<Vec<Value>>,
    pub creates: Mutex<Vec<SeenCreate>>,
    pub uploads: Mutex<Vec<SeenUpload>>,
    /// `getToken` answers HTTP 500.
    pub fail_token: AtomicBool,
    /// `knowledgeAdd` answers a business error.
    pub fail_create: AtomicBool,
    /// Uploads of files with this remote name answer HTTP 500.
    pub fail_upload_name: Mutex<Option<String>>,
}

impl MockState {
    pub fn creates(&self) -> Vec<SeenCreate> {
        self.creates.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<SeenUpload> {
        self.uploads.lock().unwrap().clone()
    }
}

pub struct MockRemote {
    pub base_url: String,
    pub state: Arc<MockState>,
}

/// Starts the mock on an ephemeral port.
pub async fn start_mock() -> MockRemote {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/api/appKey/getToken", post(handle_token))
        .route("/api/knowledge/knowledgeAdd", post(handle_create))
        .route("/api/knowledge/uploadFileCreateUnit", post(handle_upload))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockRemote {
        base_url: format!("http://{}/api", addr),
        state,
    }
}

type Reply = (StatusCode, Json<Value>);

fn request_key(headers: &HeaderMap) -> Result<envelope::Key, Reply> {
    let app_id = headers.get("App-Id").and_then(|v| v.to_str().ok());
    if app_id != Some(ACCESS_KEY) {
        return Err((StatusCode::UNAUTHORIZED, Json(json!({ "code": "noAuth" }))));
    }
    let date = headers
        .get("date")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    envelope::derive_key_from_http_date(SECRET, date).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": "badDate", "message": e.to_string() })),
        )
    })
}

fn bearer(headers: &HeaderMap) -> Result<String, Reply> {
    let auth = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if auth == format!("bearer {}", TOKEN) || auth == format!("bearer {}", FALLBACK_TOKEN) {
        Ok(auth)
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(json!({ "code": "noAuth" }))))
    }
}

fn open_params(key: &envelope::Key, data: &str) -> Result<Value, Reply> {
    let plain = envelope::open_with_key(key, data).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": "badData", "message": e.to_string() })),
        )
    })?;
    serde_json::from_str(&plain).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": "badJson", "message": e.to_string() })),
        )
    })
}

fn success(key: &envelope::Key, payload: Value) -> Reply {
    let data = envelope::seal_with_key(key, &payload.to_string()).unwrap();
    (
        StatusCode::OK,
        Json(json!({ "code": "bizSuccess", "message": "ok", "data": data })),
    )
}

async fn handle_token(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    if state.fail_token.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "code": "down" })));
    }
    let key = match request_key(&headers) {
        Ok(k) => k,
        Err(reply) => return reply,
    };
    let params = match open_params(&key, body["data"].as_str().unwrap_or_default()) {
        Ok(p) => p,
        Err(reply) => return reply,
    };
    state.token_params.lock().unwrap().push(params.clone());
    if params["appkey"] != ACCESS_KEY || params["secret"] != SECRET {
        return (
            StatusCode::OK,
            Json(json!({ "code": "bizError", "message": "bad credentials" })),
        );
    }
    success(&key, json!({ "token": TOKEN }))
}

async fn handle_create(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    let key = match request_key(&headers) {
        Ok(k) => k,
        Err(reply) => return reply,
    };
    let authorization = match bearer(&headers) {
        Ok(a) => a,
        Err(reply) => return reply,
    };
    if state.fail_create.load(Ordering::SeqCst) {
        return (
            StatusCode::OK,
            Json(json!({ "code": "bizError", "message": "quota exceeded" })),
        );
    }
    let params = match open_params(&key, body["data"].as_str().unwrap_or_default()) {
        Ok(p) => p,
        Err(reply) => return reply,
    };
    let id = {
        let mut creates = state.creates.lock().unwrap();
        creates.push(SeenCreate {
            params,
            authorization,
        });
        format!("kb-{}", creates.len())
    };
    success(&key, json!({ "id": id }))
}

async fn handle_upload(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Reply {
    let key = match request_key(&headers) {
        Ok(k) => k,
        Err(reply) => return reply,
    };
    let authorization = match bearer(&headers) {
        Ok(a) => a,
        Err(reply) => return reply,
    };

    let mut file_name = String::new();
    let mut bytes = Vec::new();
    let mut data = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file_name = field.file_name().unwrap_or_default().to_string();
                bytes = field.bytes().await.unwrap().to_vec();
            }
            "data" => data = field.text().await.unwrap(),
            _ => {}
        }
    }
    if state.fail_upload_name.lock().unwrap().as_deref() == Some(file_name.as_str()) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "code": "boom" })));
    }
    let params = match open_params(&key, &data) {
        Ok(p) => p,
        Err(reply) => return reply,
    };
    state.uploads.lock().unwrap().push(SeenUpload {
        params,
        file_name,
        bytes,
        authorization,
    });
    success(&key, json!({ "unitId": "unit-1" }))
}

/// Config text pointing at `base_url` with all directories under `root`.
pub fn config_toml(root: &Path, base_url: &str, max_files_per_kb: usize) -> String {
    format!(
        r#"[db]
path = "{root}/data/kbsync.sqlite"

[remote]
base_url = "{base_url}"
access_key = "{ACCESS_KEY}"
secret = "{SECRET}"
tenant_id = "tenant-1"
user_id = "user-1"
workspace_id = "ws-1"
timeout_secs = 5

[scan]
dir = "{root}/inbox"
backup_dir = "{root}/backup"
cache_dir = "{root}/cache"
output_dir = "{root}/merged"
supported_extensions = ["docx", "doc", "txt"]
max_files_per_kb = {max_files_per_kb}
interval_secs = 3600

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display(),
    )
}

pub fn test_config(root: &Path, base_url: &str, max_files_per_kb: usize) -> Config {
    toml::from_str(&config_toml(root, base_url, max_files_per_kb)).unwrap()
}

/// Writes `<root>/inbox/<year>/<month>/<name>` files and returns the folder.
pub fn write_folder(root: &Path, year: &str, month: &str, files: &[&str]) -> PathBuf {
    let dir = root.join("inbox").join(year).join(month);
    std::fs::create_dir_all(&dir).unwrap();
    for f in files {
        std::fs::write(dir.join(f), format!("body of {}", f)).unwrap();
    }
    dir
}
