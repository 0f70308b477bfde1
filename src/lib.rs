pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod membership;
pub mod replication;
pub mod store;

// Re-export common types
pub use config::{LoggingConfig, RosterConfig};
pub use error::{Result, RosterError};
pub use membership::{ChangeOutcome, MembershipStatus, Position, RosterManager, SiteAddr, SiteStatus};
pub use replication::{AckPolicy, LoopbackReplication, ReplicationLayer, RosterEvent};
pub use store::{MemoryStore, MembershipStore};
