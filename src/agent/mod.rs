//! Agent module — the event loop, logic version sync and heartbeat.

pub mod agent_loop;
pub mod heartbeat;
pub mod version_sync;

pub use agent_loop::Agent;
pub use heartbeat::spawn_heartbeat;
pub use version_sync::{SyncState, VersionSync};
