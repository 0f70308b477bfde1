use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{AckPolicy, AckTracker, MessageType, ReplicationLayer, RosterEvent};
use crate::error::Result;
use crate::membership::{Position, SiteAddr};

/// A message handed to the loopback transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// `None` for broadcasts
    pub to: Option<SiteAddr>,
    pub kind: MessageType,
    pub payload: Bytes,
}

/// Single-process replication layer.
///
/// Outgoing messages are recorded instead of sent. The number of peers that
/// currently acknowledge writes is set by the caller; a write is durable at
/// once when enough peers respond under the ack policy, otherwise it waits for
/// an explicit `acknowledge` push until the timeout.
#[derive(Debug)]
pub struct LoopbackReplication {
    local: SiteAddr,
    master: RwLock<Option<SiteAddr>>,
    stepping_down: AtomicBool,
    policy: AckPolicy,
    responsive_peers: AtomicUsize,
    tracker: AckTracker,
    events: Mutex<Vec<RosterEvent>>,
    sent: Mutex<Vec<SentMessage>>,
}

impl LoopbackReplication {
    pub fn new(local: SiteAddr, policy: AckPolicy) -> Self {
        Self {
            local,
            master: RwLock::new(None),
            stepping_down: AtomicBool::new(false),
            policy,
            responsive_peers: AtomicUsize::new(0),
            tracker: AckTracker::new(),
            events: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Loopback layer in which the local site is master
    pub fn as_master(local: SiteAddr, policy: AckPolicy) -> Self {
        let repl = Self::new(local.clone(), policy);
        *repl.master.write() = Some(local);
        repl
    }

    pub fn set_master(&self, master: Option<SiteAddr>) {
        *self.master.write() = master;
    }

    pub fn set_stepping_down(&self, stepping_down: bool) {
        self.stepping_down.store(stepping_down, Ordering::SeqCst);
    }

    pub fn set_responsive_peers(&self, peers: usize) {
        self.responsive_peers.store(peers, Ordering::SeqCst);
    }

    /// Late acknowledgment of everything up to `position`
    pub fn acknowledge(&self, position: Position) {
        self.tracker.advance(position);
    }

    pub fn events(&self) -> Vec<RosterEvent> {
        self.events.lock().clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }
}

impl ReplicationLayer for LoopbackReplication {
    fn send_to_site(&self, site: &SiteAddr, kind: MessageType, payload: Bytes) -> Result<()> {
        debug!("Loopback send {:?} to {}", kind, site);
        self.sent.lock().push(SentMessage {
            to: Some(site.clone()),
            kind,
            payload,
        });
        Ok(())
    }

    fn broadcast(&self, kind: MessageType, payload: Bytes) -> Result<()> {
        debug!("Loopback broadcast {:?}", kind);
        self.sent.lock().push(SentMessage {
            to: None,
            kind,
            payload,
        });
        Ok(())
    }

    fn current_master(&self) -> Option<SiteAddr> {
        self.master.read().clone()
    }

    fn is_master(&self) -> bool {
        self.master.read().as_ref() == Some(&self.local)
    }

    fn is_stepping_down(&self) -> bool {
        self.stepping_down.load(Ordering::SeqCst)
    }

    fn report_event(&self, event: RosterEvent) {
        self.events.lock().push(event);
    }

    fn durable_position(&self) -> Position {
        self.tracker.current()
    }

    fn await_durable(&self, position: Position, n_sites: usize, timeout: Duration) -> bool {
        if self.tracker.current() >= position {
            return true;
        }
        let needed = self.policy.required_acks(n_sites);
        if self.responsive_peers.load(Ordering::SeqCst) >= needed {
            self.tracker.advance(position);
            return true;
        }
        self.tracker.wait_for(position, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_detection() {
        let local = SiteAddr::new("a", 1);
        let repl = LoopbackReplication::new(local.clone(), AckPolicy::Quorum);
        assert!(!repl.is_master());
        repl.set_master(Some(SiteAddr::new("b", 2)));
        assert!(!repl.is_master());
        repl.set_master(Some(local));
        assert!(repl.is_master());
    }

    #[test]
    fn test_ack_depends_on_responsive_peers() {
        let repl = LoopbackReplication::as_master(SiteAddr::new("a", 1), AckPolicy::Quorum);
        assert!(repl.await_durable(Position(1), 1, Duration::from_millis(1)));
        assert!(!repl.await_durable(Position(2), 3, Duration::from_millis(5)));
        repl.set_responsive_peers(1);
        assert!(repl.await_durable(Position(2), 3, Duration::from_millis(5)));
        assert_eq!(repl.durable_position(), Position(2));
    }
}
