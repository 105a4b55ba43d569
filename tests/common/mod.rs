#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use branchchat::config::{Config, ModelEntry, ProviderConfig};
use branchchat::db::Database;
use branchchat::llm::ProviderKind;
use branchchat::storage::LocalObjectStore;
use branchchat::{router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const BOUNDARY: &str = "branchchat-test-boundary";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub storage_dir: TempDir,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.signing_secret = "test-signing-secret-0123456789".to_string();
    config.server.public_url = "http://localhost:3000".to_string();
    config.uploads.max_bytes = 1024;
    config
}

/// Adds an OpenAI-compatible provider named `mock` pointing at `base_url`.
pub fn with_mock_provider(mut config: Config, base_url: &str) -> Config {
    config.providers.push(ProviderConfig {
        name: "mock".to_string(),
        kind: ProviderKind::Openai,
        base_url: base_url.to_string(),
        requires_key: true,
        models: vec![ModelEntry {
            id: "gpt-test".to_string(),
            name: "GPT Test".to_string(),
        }],
    });
    config
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_database(config, Database::open_in_memory().unwrap())
    }

    pub fn with_database(config: Config, db: Database) -> Self {
        let storage_dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(storage_dir.path()).unwrap();
        let state = Arc::new(AppState::new(config, db, Arc::new(store)));
        Self {
            app: router(state.clone()),
            state,
            storage_dir,
        }
    }

    /// Creates a user and returns a bearer token for it.
    pub fn login(&self, user_id: &str) -> String {
        self.state.db.ensure_user(user_id, None).unwrap();
        self.state.db.create_session(user_id).unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn get(&self, uri: &str, token: &str) -> TestResponse {
        self.request(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> TestResponse {
        self.request(Method::POST, uri, Some(token), Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> TestResponse {
        self.request(Method::DELETE, uri, Some(token), None).await
    }

    pub async fn upload(
        &self,
        token: &str,
        file_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> TestResponse {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                BOUNDARY, file_name, content_type
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/attachments")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }

    /// Number of files currently held by the object store.
    pub fn stored_files(&self) -> usize {
        fn count(dir: &std::path::Path) -> usize {
            std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| {
                            let path = e.path();
                            if path.is_dir() {
                                count(&path)
                            } else {
                                1
                            }
                        })
                        .sum()
                })
                .unwrap_or(0)
        }
        count(self.storage_dir.path())
    }
}
