use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::{ChangeOutcome, SiteAddr};
use crate::replication::ReplicationLayer;

/// The master role could not be held
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleUnavailable {
    /// Known master to redirect to, if any
    pub master: Option<SiteAddr>,
}

impl RoleUnavailable {
    fn from_layer(repl: &dyn ReplicationLayer) -> Self {
        let master = if repl.is_master() {
            None
        } else {
            repl.current_master()
        };
        Self { master }
    }

    pub fn outcome(&self) -> ChangeOutcome {
        match &self.master {
            Some(master) => ChangeOutcome::Forward(master.clone()),
            None => ChangeOutcome::Unavailable,
        }
    }
}

/// Single-writer lease over membership mutations.
///
/// Only the replication master may hold it, and only one mutation at a time.
#[derive(Debug)]
pub struct MasterRoleLock {
    busy: Mutex<bool>,
    released: Condvar,
    timeout: Duration,
}

/// Held master role; released on drop
#[derive(Debug)]
pub struct MasterRole<'a> {
    lock: &'a MasterRoleLock,
}

impl MasterRoleLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            busy: Mutex::new(false),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Wait (bounded) for any running mutation to finish, then claim the role
    /// if this process is master and not stepping down.
    pub fn hold(&self, repl: &dyn ReplicationLayer) -> Result<MasterRole<'_>, RoleUnavailable> {
        let deadline = Instant::now() + self.timeout;
        let mut busy = self.busy.lock();
        while *busy {
            if self.released.wait_until(&mut busy, deadline).timed_out() && *busy {
                debug!("Timed out waiting for running membership change");
                return Err(RoleUnavailable::from_layer(repl));
            }
        }
        if !repl.is_master() || repl.is_stepping_down() {
            return Err(RoleUnavailable::from_layer(repl));
        }
        *busy = true;
        Ok(MasterRole { lock: self })
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    fn release(&self) {
        let mut busy = self.busy.lock();
        *busy = false;
        self.released.notify_one();
    }
}

impl Drop for MasterRole<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{AckPolicy, LoopbackReplication};
    use std::sync::Arc;
    use std::thread;

    fn master() -> LoopbackReplication {
        LoopbackReplication::as_master(SiteAddr::new("m", 1), AckPolicy::Quorum)
    }

    #[test]
    fn test_hold_and_release() {
        let repl = master();
        let lock = MasterRoleLock::new(Duration::from_millis(10));
        {
            let _role = lock.hold(&repl).unwrap();
            assert!(lock.is_busy());
            assert_eq!(lock.hold(&repl).unwrap_err(), RoleUnavailable { master: None });
        }
        assert!(!lock.is_busy());
        assert!(lock.hold(&repl).is_ok());
    }

    #[test]
    fn test_not_master_redirects() {
        let repl = LoopbackReplication::new(SiteAddr::new("c", 1), AckPolicy::Quorum);
        let lock = MasterRoleLock::new(Duration::from_millis(10));
        assert_eq!(lock.hold(&repl).unwrap_err().outcome(), ChangeOutcome::Unavailable);

        repl.set_master(Some(SiteAddr::new("m", 1)));
        let err = lock.hold(&repl).unwrap_err();
        assert_eq!(err.outcome(), ChangeOutcome::Forward(SiteAddr::new("m", 1)));
        assert!(!lock.is_busy());
    }

    #[test]
    fn test_stepping_down_is_unavailable() {
        let repl = master();
        repl.set_stepping_down(true);
        let lock = MasterRoleLock::new(Duration::from_millis(10));
        assert!(lock.hold(&repl).is_err());
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let repl = Arc::new(master());
        let lock = Arc::new(MasterRoleLock::new(Duration::from_secs(5)));
        let role = lock.hold(repl.as_ref()).unwrap();

        let waiter = {
            let lock = lock.clone();
            let repl = repl.clone();
            thread::spawn(move || lock.hold(repl.as_ref()).map(|_| ()).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        drop(role);
        assert!(waiter.join().unwrap());
    }
}
