// File: orchestrator/src/session/http.rs
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{PermissionSet, RemoteSession, TaskRecord, TaskRef};
use crate::config::PoolConnectionConfig;
use crate::errors::SessionError;
use crate::snapshot::{SnapshotSource, StaticSnapshot};

/// Session against a control-plane JSON gateway
pub struct HttpSession {
    base_url: String,
    api_key: String,
    client: Client,
}

impl HttpSession {
    pub fn new(config: &PoolConnectionConfig) -> Result<Self, SessionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SessionError::ConnectionFailed {
                endpoint: config.url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Response, SessionError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| SessionError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    /// Turn a non-success status into an error, keeping the body as the message
    async fn check(
        endpoint: &str,
        method: &str,
        response: Response,
    ) -> Result<Response, SessionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND && endpoint.contains("/api/tasks/") {
            return Err(SessionError::UnknownTask {
                task: endpoint.rsplit('/').next().unwrap_or_default().to_string(),
            });
        }

        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);

        warn!("Gateway call {} failed with status {}: {}", endpoint, status, message);
        Err(SessionError::Rejected {
            method: method.to_string(),
            message: format!("{} ({})", message, status),
        })
    }

    async fn parse<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T, SessionError> {
        response
            .json::<T>()
            .await
            .map_err(|e| SessionError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }

    /// Methods the session's role may call
    pub async fn fetch_permissions(&self) -> Result<PermissionSet, SessionError> {
        let endpoint = self.url("/api/session/permissions");
        let response = self.send(&endpoint, self.client.get(&endpoint)).await?;
        let response = Self::check(&endpoint, "session.get_permissions", response).await?;
        let methods: Vec<String> = Self::parse(&endpoint, response).await?;
        info!("Session at {} may call {} methods", self.base_url, methods.len());
        Ok(PermissionSet::new(methods))
    }
}

#[async_trait]
impl RemoteSession for HttpSession {
    async fn call_async(&self, method: &str, args: Value) -> Result<TaskRef, SessionError> {
        let endpoint = self.url(&format!("/api/async/{}", method));
        debug!("Issuing async call {}", method);

        let response = self
            .send(&endpoint, self.client.post(&endpoint).json(&args))
            .await?;
        let response = Self::check(&endpoint, method, response).await?;
        let body: Value = Self::parse(&endpoint, response).await?;

        body.get("task")
            .and_then(|v| v.as_str())
            .map(|task| TaskRef(task.to_string()))
            .ok_or_else(|| SessionError::InvalidResponse {
                endpoint,
                reason: format!("no task handle in {}", body),
            })
    }

    async fn task_record(&self, task: &TaskRef) -> Result<TaskRecord, SessionError> {
        let endpoint = self.url(&format!("/api/tasks/{}", task));
        let response = self.send(&endpoint, self.client.get(&endpoint)).await?;
        let response = Self::check(&endpoint, "task.get_record", response).await?;
        Self::parse(&endpoint, response).await
    }

    async fn cancel_task(&self, task: &TaskRef) -> Result<(), SessionError> {
        let endpoint = self.url(&format!("/api/tasks/{}/cancel", task));
        let response = self.send(&endpoint, self.client.post(&endpoint)).await?;
        Self::check(&endpoint, "task.cancel", response).await?;
        Ok(())
    }

    async fn destroy_task(&self, task: &TaskRef) -> Result<(), SessionError> {
        let endpoint = self.url(&format!("/api/tasks/{}", task));
        let response = self.send(&endpoint, self.client.delete(&endpoint)).await?;
        Self::check(&endpoint, "task.destroy", response).await?;
        Ok(())
    }

    async fn add_task_tag(
        &self,
        task: &TaskRef,
        key: &str,
        value: &str,
    ) -> Result<(), SessionError> {
        let endpoint = self.url(&format!("/api/tasks/{}/tags", task));
        let request = self
            .client
            .post(&endpoint)
            .json(&json!({"key": key, "value": value}));
        let response = self.send(&endpoint, request).await?;
        Self::check(&endpoint, "task.add_to_other_config", response).await?;
        Ok(())
    }

    async fn find_tagged_task(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<TaskRef>, SessionError> {
        let endpoint = self.url("/api/tasks");
        let request = self
            .client
            .get(&endpoint)
            .query(&[("tag", key), ("value", value)]);
        let response = self.send(&endpoint, request).await?;
        let response = Self::check(&endpoint, "task.get_all_records", response).await?;
        let tasks: Vec<TaskRef> = Self::parse(&endpoint, response).await?;
        Ok(tasks.into_iter().next())
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, SessionError> {
        let endpoint = self.url(&format!("/api/call/{}", method));
        let response = self
            .send(&endpoint, self.client.post(&endpoint).json(&args))
            .await?;
        let response = Self::check(&endpoint, method, response).await?;
        Self::parse(&endpoint, response).await
    }
}

#[async_trait]
impl SnapshotSource for HttpSession {
    async fn fetch_snapshot(&self) -> Result<StaticSnapshot, SessionError> {
        let endpoint = self.url("/api/snapshot");
        let response = self.send(&endpoint, self.client.get(&endpoint)).await?;
        let response = Self::check(&endpoint, "pool.get_snapshot", response).await?;
        Self::parse(&endpoint, response).await
    }
}
