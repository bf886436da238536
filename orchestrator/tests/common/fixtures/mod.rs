//! Shared test utilities:
//! - Pool snapshot builders
//! - In-memory control plane and scripted connections over it
//! - Mock control-plane gateway (wiremock)
//! - Test configuration builder

// Allow unused code in test fixtures - not every test binary uses every helper
#![allow(dead_code)]
#![allow(unused_imports)]

pub mod memory_session;
pub mod mock_gateway;
pub mod pools;
pub mod sessions;
pub mod test_config;

// Session types the in-memory control plane implements
use orchestrator::session::{RemoteSession, TaskRecord, TaskRef, TaskStatus};
use orchestrator::SessionError;

// Re-export commonly used items
pub use memory_session::{InMemorySession, RecordedCall, TaskScript};
pub use mock_gateway::MockGateway;
pub use pools::*;
pub use sessions::*;
pub use test_config::TestConfigBuilder;
