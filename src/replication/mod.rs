//! Replication Layer Interface
//!
//! What the membership manager needs from the surrounding replication system:
//! - Who the master is, and whether this process is it
//! - Message delivery to one site or to everyone
//! - Durable-position tracking for acknowledgment waits
//! - Event reporting to the application

mod loopback;

pub use loopback::{LoopbackReplication, SentMessage};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::membership::{Position, SiteAddr};

/// Message kinds the membership manager sends to other sites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    JoinRequest,
    JoinSuccess,
    JoinFailure,
    RemoveRequest,
    RemoveSuccess,
    RemoveFailure,
    Rejoin,
    MembershipList,
}

/// Notifications surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEvent {
    SiteAdded(SiteAddr),
    SiteRemoved(SiteAddr),
    ConnectionBroken(SiteAddr),
    JoinFailure(SiteAddr),
    LocalSiteRemoved,
}

/// How many remote acknowledgments make a write durable enough
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    All,
    #[default]
    Quorum,
    One,
    None,
}

impl AckPolicy {
    /// Remote acknowledgments needed in a group of `n_sites` (self included)
    pub fn required_acks(self, n_sites: usize) -> usize {
        let peers = n_sites.saturating_sub(1);
        match self {
            AckPolicy::All => peers,
            AckPolicy::Quorum => n_sites / 2,
            AckPolicy::One => peers.min(1),
            AckPolicy::None => 0,
        }
    }
}

pub trait ReplicationLayer: Send + Sync {
    fn send_to_site(&self, site: &SiteAddr, kind: MessageType, payload: Bytes) -> Result<()>;

    fn broadcast(&self, kind: MessageType, payload: Bytes) -> Result<()>;

    fn current_master(&self) -> Option<SiteAddr>;

    fn is_master(&self) -> bool;

    /// True while this process is giving up the master role
    fn is_stepping_down(&self) -> bool;

    /// Must not block; called with the registry lock held
    fn report_event(&self, event: RosterEvent);

    fn durable_position(&self) -> Position;

    /// Wait until `position` is durable under the ack policy for a group of
    /// `n_sites`. Returns false on timeout.
    fn await_durable(&self, position: Position, n_sites: usize, timeout: Duration) -> bool;
}

/// Durable-position tracker.
///
/// Acknowledgments are pushed with `advance`; waiters are woken and re-check
/// the position, so a wake-up never substitutes for the comparison itself.
#[derive(Debug, Default)]
pub struct AckTracker {
    durable: Mutex<Position>,
    advanced: Condvar,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Position {
        *self.durable.lock()
    }

    pub fn advance(&self, position: Position) {
        let mut durable = self.durable.lock();
        if position > *durable {
            *durable = position;
            self.advanced.notify_all();
        }
    }

    pub fn wait_for(&self, position: Position, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut durable = self.durable.lock();
        while *durable < position {
            if self.advanced.wait_until(&mut durable, deadline).timed_out() {
                return *durable >= position;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_required_acks() {
        assert_eq!(AckPolicy::Quorum.required_acks(1), 0);
        assert_eq!(AckPolicy::Quorum.required_acks(2), 1);
        assert_eq!(AckPolicy::Quorum.required_acks(3), 1);
        assert_eq!(AckPolicy::Quorum.required_acks(4), 2);
        assert_eq!(AckPolicy::All.required_acks(4), 3);
        assert_eq!(AckPolicy::One.required_acks(1), 0);
        assert_eq!(AckPolicy::One.required_acks(5), 1);
        assert_eq!(AckPolicy::None.required_acks(5), 0);
    }

    #[test]
    fn test_tracker_wakes_waiter() {
        let tracker = Arc::new(AckTracker::new());
        let waiter = {
            let tracker = tracker.clone();
            thread::spawn(move || tracker.wait_for(Position(5), Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        tracker.advance(Position(3));
        tracker.advance(Position(5));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_tracker_times_out() {
        let tracker = AckTracker::new();
        tracker.advance(Position(2));
        assert!(tracker.wait_for(Position(2), Duration::from_millis(1)));
        assert!(!tracker.wait_for(Position(3), Duration::from_millis(10)));
        tracker.advance(Position(1));
        assert_eq!(tracker.current(), Position(2));
    }
}
