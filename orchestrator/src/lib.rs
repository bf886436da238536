pub mod config;
pub mod constants;
pub mod errors;
pub mod history;
pub mod launcher;
pub mod network;
pub mod operation;
pub mod scan_queue;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod web;

// Re-export commonly used types
pub use config::{Config, ConfigManager};
pub use errors::{OperationError, SessionError};
pub use history::OperationHistory;
pub use launcher::OperationLauncher;
pub use network::{NetworkChangeRequest, NetworkReconfiguration};
pub use operation::{Operation, OperationEvent, OperationState};
pub use scan_queue::{ScanQueue, ScanRequest};
pub use session::{Connection, RemoteSession, RoleCheck};
pub use snapshot::{PoolSnapshot, SnapshotSource, StaticSnapshot};
pub use storage::DetachHostStorage;
