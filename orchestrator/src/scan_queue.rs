//! Bounded launcher for keyed, deduplicated work
//!
//! Generalizes storage rescans: a request is keyed by its target, and a key
//! that is already queued or running is dropped rather than enqueued again.
//! Each connection runs at most `bound` entries at once; the rest wait in a
//! per-connection FIFO and start as running entries finish.
//!
//! # Usage
//!
//! ```ignore
//! let queue = ScanQueue::new(3);
//! match queue.request(sr_ref.clone(), &connection, || sr_scan(&connection, &sr_ref)).await {
//!     ScanRequest::Started(op) | ScanRequest::Queued(op) => history.register(op).await,
//!     ScanRequest::Duplicate => {}
//! }
//! ```

use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::operation::Operation;
use crate::session::Connection;

pub enum ScanRequest {
    /// Below the bound; the operation is already running
    Started(Arc<Operation>),
    /// Waiting for a free slot on its connection
    Queued(Arc<Operation>),
    /// The key is already queued or running; nothing was created
    Duplicate,
}

impl ScanRequest {
    pub fn operation(&self) -> Option<&Arc<Operation>> {
        match self {
            ScanRequest::Started(op) | ScanRequest::Queued(op) => Some(op),
            ScanRequest::Duplicate => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ScanRequest::Duplicate)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanQueueStatus {
    pub active_keys: Vec<String>,
    pub in_flight: HashMap<String, usize>,
    pub queued: usize,
}

struct QueueState<K> {
    /// Keys queued or running
    active: HashSet<K>,
    in_flight: HashMap<String, usize>,
    waiting: HashMap<String, VecDeque<(K, Arc<Operation>)>>,
}

pub struct ScanQueue<K> {
    bound: usize,
    inner: Arc<Mutex<QueueState<K>>>,
}

impl<K> Clone for ScanQueue<K> {
    fn clone(&self) -> Self {
        Self {
            bound: self.bound,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> ScanQueue<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    pub fn new(bound: usize) -> Self {
        Self {
            bound: bound.max(1),
            inner: Arc::new(Mutex::new(QueueState {
                active: HashSet::new(),
                in_flight: HashMap::new(),
                waiting: HashMap::new(),
            })),
        }
    }

    /// Queue work for `key` on `connection`. `make` is only called when the
    /// key is not already queued or running.
    #[instrument(skip(self, key, connection, make), fields(key = %key, connection = %connection.name()))]
    pub async fn request<F>(&self, key: K, connection: &Connection, make: F) -> ScanRequest
    where
        F: FnOnce() -> Operation,
    {
        let mut state = self.inner.lock().await;

        if state.active.contains(&key) {
            debug!("Request for {} dropped, already queued or running", key);
            return ScanRequest::Duplicate;
        }

        let operation = Arc::new(make());
        state.active.insert(key.clone());

        let name = connection.name().to_string();
        let running = state.in_flight.entry(name.clone()).or_insert(0);
        if *running < self.bound {
            *running += 1;
            info!("Starting {} on {} ({}/{})", key, name, running, self.bound);
            self.start(key, name, Arc::clone(&operation));
            ScanRequest::Started(operation)
        } else {
            info!("Queueing {} on {}, {} already running", key, name, running);
            state
                .waiting
                .entry(name)
                .or_default()
                .push_back((key, Arc::clone(&operation)));
            ScanRequest::Queued(operation)
        }
    }

    fn start(&self, key: K, connection: String, operation: Arc<Operation>) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = operation.run_inline().await {
                debug!("{} finished unsuccessfully: {}", key, e);
            }
            queue.on_finished(key, connection).await;
        });
    }

    async fn on_finished(&self, key: K, connection: String) {
        let mut state = self.inner.lock().await;
        state.active.remove(&key);

        let next = state
            .waiting
            .get_mut(&connection)
            .and_then(|waiting| waiting.pop_front());

        match next {
            Some((next_key, operation)) => {
                debug!("{} done, starting queued {} on {}", key, next_key, connection);
                self.start(next_key, connection, operation);
            }
            None => {
                if let Some(running) = state.in_flight.get_mut(&connection) {
                    *running = running.saturating_sub(1);
                }
                debug!("{} done on {}", key, connection);
            }
        }
    }

    /// Whether `key` is queued or running
    pub async fn is_active(&self, key: &K) -> bool {
        self.inner.lock().await.active.contains(key)
    }

    pub async fn in_flight(&self, connection: &str) -> usize {
        self.inner
            .lock()
            .await
            .in_flight
            .get(connection)
            .copied()
            .unwrap_or(0)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn status(&self) -> ScanQueueStatus {
        let state = self.inner.lock().await;
        let mut active_keys: Vec<String> = state.active.iter().map(|k| k.to_string()).collect();
        active_keys.sort();
        ScanQueueStatus {
            active_keys,
            in_flight: state.in_flight.clone(),
            queued: state.waiting.values().map(VecDeque::len).sum(),
        }
    }
}
