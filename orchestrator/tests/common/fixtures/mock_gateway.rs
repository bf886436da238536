//! Mock control-plane gateway for `HttpSession` tests

use serde_json::{json, Value};
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use orchestrator::config::PoolConnectionConfig;

pub const API_KEY: &str = "test-api-key";

/// Mock gateway that answers the session API
pub struct MockGateway {
    pub server: MockServer,
    pub base_url: String,
}

impl MockGateway {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self { server, base_url }
    }

    pub fn connection_config(&self) -> PoolConnectionConfig {
        PoolConnectionConfig {
            url: self.base_url.clone(),
            api_key: API_KEY.to_string(),
            request_timeout_seconds: 5,
        }
    }

    /// Async call accepted, returning `task`
    pub async fn mock_async_call(&self, remote_method: &str, task: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/api/async/{}", remote_method)))
            .and(header("Authorization", format!("Bearer {}", API_KEY).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "task": task })))
            .mount(&self.server)
            .await;
    }

    /// Async call refused by the control plane
    pub async fn mock_async_rejected(&self, remote_method: &str, status: u16, error: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/api/async/{}", remote_method)))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "error": error })))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_task_record(&self, task: &str, record: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/tasks/{}", task)))
            .respond_with(ResponseTemplate::new(200).set_body_json(record))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_task_missing(&self, task: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/api/tasks/{}", task)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_task_housekeeping(&self, task: &str) {
        Mock::given(method("DELETE"))
            .and(path(format!("/api/tasks/{}", task)))
            .respond_with(ResponseTemplate::new(204))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/tasks/{}/cancel", task)))
            .respond_with(ResponseTemplate::new(204))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/tasks/{}/tags", task)))
            .respond_with(ResponseTemplate::new(204))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_tagged_tasks(&self, key: &str, value: &str, tasks: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .and(query_param("tag", key))
            .and(query_param("value", value))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(tasks)))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_permissions(&self, methods: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/api/session/permissions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(methods)))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_snapshot(&self, snapshot: Value) {
        Mock::given(method("GET"))
            .and(path("/api/snapshot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(snapshot))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_sync_call(&self, remote_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(path(format!("/api/call/{}", remote_method)))
            .respond_with(ResponseTemplate::new(200).set_body_json(result))
            .mount(&self.server)
            .await;
    }
}
