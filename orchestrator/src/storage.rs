//! Storage attachment operations
//!
//! `DetachHostStorage` is the first stage of removing a host: it unplugs
//! every attached storage repository and then waits, within a bound, for
//! them all to report detached. Running out of time is not a
//! failure; the operation completes with a `detach-timeout` result so the
//! caller can stop the larger removal gracefully.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{methods, storage};
use crate::errors::OperationError;
use crate::operation::{Operation, OperationBody, OperationContext, PollSettings};
use crate::scan_queue::{ScanQueue, ScanRequest};
use crate::session::Connection;
use crate::snapshot::{PoolSnapshot, SnapshotSource};

pub struct DetachHostStorage {
    host: String,
    snapshot: Arc<dyn PoolSnapshot>,
    refresh: Option<Arc<dyn SnapshotSource>>,
    wait: Duration,
}

impl DetachHostStorage {
    pub fn new(host: impl Into<String>, snapshot: Arc<dyn PoolSnapshot>) -> Self {
        Self {
            host: host.into(),
            snapshot,
            refresh: None,
            wait: storage::DETACH_WAIT,
        }
    }

    /// Re-fetch attachment state from `source` while waiting instead of
    /// re-reading the injected snapshot
    pub fn with_refresh(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.refresh = Some(source);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn into_operation(self, connection: Connection) -> Operation {
        let name = self
            .snapshot
            .host(&self.host)
            .map(|h| h.name)
            .unwrap_or_else(|| self.host.clone());
        let host = self.host.clone();
        Operation::new(
            Some(connection),
            format!("Detaching storage from {}", name),
            "Detaching storage",
            self,
        )
        .applies_to(vec![host])
    }

    /// Attachment state comes from the refresh source when there is one,
    /// then from reading each attachment's property, then from the snapshot
    /// the operation was built with.
    async fn still_attached(&self, connection: &Connection, pbds: &[String]) -> Vec<String> {
        if let Some(source) = &self.refresh {
            match source.fetch_snapshot().await {
                Ok(fresh) => return attached_among(&fresh, pbds),
                Err(e) => warn!("Failed to refresh snapshot for {}: {}", self.host, e),
            }
        }
        match read_attached(connection, pbds).await {
            Some(attached) => attached,
            None => attached_among(self.snapshot.as_ref(), pbds),
        }
    }
}

async fn read_attached(connection: &Connection, pbds: &[String]) -> Option<Vec<String>> {
    let mut attached = Vec::new();
    for pbd in pbds {
        let reply = connection
            .session()
            .call(methods::PBD_GET_CURRENTLY_ATTACHED, json!({ "pbd": pbd }))
            .await;
        match reply {
            Ok(Value::Bool(true)) => attached.push(pbd.clone()),
            Ok(Value::Bool(false)) => {}
            Ok(other) => {
                debug!("Unexpected attachment state for {}: {}", pbd, other);
                return None;
            }
            Err(e) => {
                debug!("Could not read attachment state of {}: {}", pbd, e);
                return None;
            }
        }
    }
    Some(attached)
}

fn attached_among(snapshot: &dyn PoolSnapshot, pbds: &[String]) -> Vec<String> {
    pbds.iter()
        .filter(|r| snapshot.pbd(r).is_some_and(|p| p.currently_attached))
        .cloned()
        .collect()
}

#[async_trait]
impl OperationBody for DetachHostStorage {
    async fn run(&self, ctx: &OperationContext<'_>) -> Result<(), OperationError> {
        if self.snapshot.host(&self.host).is_none() {
            return Err(OperationError::precondition(format!(
                "unknown host {}",
                self.host
            )));
        }

        let attached: Vec<String> = self
            .snapshot
            .pbds_on_host(&self.host)
            .into_iter()
            .filter(|p| p.currently_attached)
            .map(|p| p.reference)
            .collect();

        let total = attached.len().max(1);
        for (index, pbd) in attached.iter().enumerate() {
            ctx.check_cancelled()?;
            let start = (index * 90 / total) as u8;
            let finish = ((index + 1) * 90 / total) as u8;
            ctx.run_task(methods::PBD_UNPLUG, json!({ "pbd": pbd }), start, finish)
                .await?;
        }

        ctx.set_description("Waiting for storage to detach");
        let deadline = Instant::now() + self.wait;
        loop {
            let remaining = self.still_attached(ctx.connection()?, &attached).await;
            if remaining.is_empty() {
                info!("All storage detached from {}", self.host);
                ctx.set_result(storage::DETACHED_RESULT);
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} attachments on {} still attached after {}s",
                    remaining.len(),
                    self.host,
                    self.wait.as_secs()
                );
                ctx.set_result(storage::DETACH_TIMEOUT_RESULT);
                return Ok(());
            }
            ctx.check_cancelled()?;
            ctx.wait(ctx.settings().interval).await;
        }
    }

    fn required_permissions(&self) -> Vec<String> {
        vec![methods::PBD_UNPLUG.to_string()]
    }
}

/// Rescan of one storage repository
pub struct SrScan {
    sr: String,
}

impl SrScan {
    pub fn new(sr: impl Into<String>) -> Self {
        Self { sr: sr.into() }
    }

    pub fn into_operation(self, connection: Connection) -> Operation {
        let sr = self.sr.clone();
        Operation::new(
            Some(connection),
            format!("Scanning {}", sr),
            "Scanning storage",
            self,
        )
        .applies_to(vec![sr])
        .suppress_history(true)
    }
}

#[async_trait]
impl OperationBody for SrScan {
    async fn run(&self, ctx: &OperationContext<'_>) -> Result<(), OperationError> {
        ctx.run_task(methods::SR_SCAN, json!({ "sr": self.sr }), 0, 100)
            .await?;
        Ok(())
    }

    fn required_permissions(&self) -> Vec<String> {
        vec![methods::SR_SCAN.to_string()]
    }
}

/// Queue a rescan of `sr`, dropping the request if one is already pending
pub async fn request_scan(
    queue: &ScanQueue<String>,
    connection: &Connection,
    sr: &str,
    settings: PollSettings,
) -> ScanRequest {
    let key = format!("{}/{}", connection.name(), sr);
    queue
        .request(key, connection, || {
            SrScan::new(sr)
                .into_operation(connection.clone())
                .with_poll_settings(settings)
        })
        .await
}
