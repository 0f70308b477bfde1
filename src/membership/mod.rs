//! Group Membership Management
//!
//! This module tracks which sites belong to the replication group and
//! mediates every change to that roster:
//! - Site registry with a cross-process shared mirror
//! - Persistent membership table and wire codec
//! - Two-phase membership changes with limbo recovery
//! - Master-role serialization of mutations
//! - Message dispatch and reconnect scheduling

pub mod codec;
pub mod dispatch;
pub mod limbo;
pub mod master;
pub mod registry;
pub mod scheduler;
pub mod shared;
pub mod state;
pub mod table;
pub mod types;

mod change;
mod manager;

pub use dispatch::{Dispatcher, RejectReason, Reply, Responder, RosterMessage};
pub use limbo::{LimboOutcome, LimboRecord};
pub use manager::RosterManager;
pub use shared::{SharedRoster, SharedSnapshot};
pub use state::{ListOutcome, StatusEffect};
pub use types::{
    ChangeOutcome, ConnectionState, MembershipList, MembershipStatus, Position, SiteAddr, SiteEntry,
    SiteIndex, SiteStatus,
};
