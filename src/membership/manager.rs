//! The membership manager.
//!
//! `RosterManager` is the handle the rest of the replication system holds. It
//! owns the registry state, the membership table and the dispatch loop, and
//! exposes both a blocking API (for callers already on a worker thread) and an
//! async API that routes requests through the dispatch queue.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::codec;
use super::dispatch::{Dispatcher, Reply, RosterMessage};
use super::limbo::{LimboOutcome, LimboRecord};
use super::master::MasterRoleLock;
use super::shared::SharedRoster;
use super::state::{ListOutcome, RosterState, StatusEffect};
use super::table::MembershipTable;
use super::types::{
    ChangeOutcome, ConnectionState, MembershipList, MembershipStatus, Position, SiteAddr, SiteStatus,
};
use crate::config::RosterConfig;
use crate::error::{Result, RosterError};
use crate::replication::{MessageType, ReplicationLayer, RosterEvent};
use crate::store::MembershipStore;

/// State shared by the manager handle, the dispatch loop and its workers
pub(crate) struct Core {
    pub(crate) config: RosterConfig,
    pub(crate) local: SiteAddr,
    pub(crate) state: Mutex<RosterState>,
    pub(crate) shared: Arc<SharedRoster>,
    pub(crate) master_lock: MasterRoleLock,
    pub(crate) table: MembershipTable,
    pub(crate) repl: Arc<dyn ReplicationLayer>,
}

impl Core {
    fn new(
        config: RosterConfig,
        store: Arc<dyn MembershipStore>,
        repl: Arc<dyn ReplicationLayer>,
        shared: Arc<SharedRoster>,
    ) -> Self {
        let local = config.local_site.clone();
        let state = RosterState::new(local.clone(), config.retry_wait(), config.retry_jitter());
        Self {
            master_lock: MasterRoleLock::new(config.master_lock_timeout()),
            table: MembershipTable::new(store, config.table_name.clone()),
            state: Mutex::new(state),
            local,
            shared,
            repl,
            config,
        }
    }

    /// The local site lost its membership. Called with the registry lock held.
    pub(crate) fn on_self_evicted(&self, state: &mut RosterState) {
        if state.shutting_down {
            return;
        }
        warn!("Local site {} was removed from the group", self.local);
        state.shutting_down = true;
        state.scheduler.clear();
        self.repl.report_event(RosterEvent::LocalSiteRemoved);
    }

    pub(crate) fn marshal_membership(&self) -> Result<Bytes> {
        let list = self.state.lock().membership_list();
        Ok(codec::encode_list(&list)?)
    }

    /// Broadcast the current list after a completed change
    pub(crate) fn share_membership(&self) {
        if !self.repl.is_master() {
            return;
        }
        match self.marshal_membership() {
            Ok(payload) => {
                if let Err(e) = self.repl.broadcast(MessageType::MembershipList, payload) {
                    warn!("Failed to share membership list: {}", e);
                }
            }
            Err(e) => error!("Failed to marshal membership list: {}", e),
        }
    }

    pub(crate) fn apply_membership_list(&self, payload: &[u8]) -> Result<ListOutcome> {
        let list = codec::decode_list(payload)?;
        if self.repl.is_master() {
            debug!("Master ignores membership list generation {}", list.generation);
            return Ok(ListOutcome::Stale);
        }

        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(RosterError::ShuttingDown);
        }
        let outcome = state.apply_list(&list, &self.shared, self.repl.as_ref());
        if outcome == ListOutcome::Applied(StatusEffect::SelfEvicted) {
            self.on_self_evicted(&mut state);
            return Err(RosterError::SelfEvicted);
        }
        Ok(outcome)
    }

    /// Load the persisted table into the registry
    fn recover(&self) -> Result<()> {
        let loaded = self.table.load()?;
        let last_commit = self.table.store().last_commit_position();

        {
            let mut state = self.state.lock();
            for (addr, status) in &loaded.sites {
                if state.set_status(addr, *status, self.repl.as_ref()) == StatusEffect::SelfEvicted {
                    self.on_self_evicted(&mut state);
                }
                self.shared.publish(addr, *status);
            }

            let provisional = loaded.sites.iter().filter(|(_, s)| s.is_provisional()).count();
            if let Some(addr) = self.adopt_provisional(&mut state) {
                warn!(
                    "Recovered {} provisional sites, {} left in limbo at {}",
                    provisional,
                    addr,
                    last_commit.0.max(1)
                );
            }

            for site in &self.config.bootstrap_sites {
                state.registry.add_or_get(site);
            }
            let local = state.local;
            if let Some(entry) = state.registry.get_mut(local) {
                entry.electable = self.config.electable;
            }

            state.change_counter = loaded.change_counter;
            state.generation = state.generation.max(loaded.change_counter);
            self.shared.publish_version(state.generation, state.change_counter);
        }

        info!(
            "Recovered {} membership records (change {})",
            loaded.sites.len(),
            loaded.change_counter
        );

        if loaded.sites.is_empty() && self.repl.is_master() {
            self.bootstrap()?;
        }
        Ok(())
    }

    /// Make the local site the first member of an empty group. A group of one
    /// needs no acknowledgment, so both phases collapse into one transaction.
    fn bootstrap(&self) -> Result<()> {
        let _role = match self.master_lock.hold(self.repl.as_ref()) {
            Ok(role) => role,
            Err(_) => return Ok(()),
        };

        let table = self.table.open()?;
        let store = self.table.store();
        let txn = store.begin_txn()?;
        let counter = match self
            .table
            .write_status(&table, txn, &self.local, MembershipStatus::Present)
            .and_then(|_| self.table.bump_counter(&table, txn))
        {
            Ok(counter) => counter,
            Err(e) => {
                let _ = store.abort(txn);
                return Err(e.into());
            }
        };
        let prior = self.apply_status(&self.local, MembershipStatus::Present);
        if let Err(e) = store.commit(txn) {
            self.compensate(&prior);
            return Err(e.into());
        }

        let mut state = self.state.lock();
        state.change_counter = counter;
        state.generation = state.generation.wrapping_add(1).max(counter);
        self.shared.publish_version(state.generation, counter);
        info!("Bootstrapped group with {} as its first member", self.local);
        Ok(())
    }
}

/// Handle on the membership manager; cheap to clone
#[derive(Clone)]
pub struct RosterManager {
    core: Arc<Core>,
    dispatcher: Arc<Mutex<Option<Arc<Dispatcher>>>>,
}

impl RosterManager {
    pub fn new(
        config: RosterConfig,
        store: Arc<dyn MembershipStore>,
        repl: Arc<dyn ReplicationLayer>,
    ) -> Result<Self> {
        Self::with_shared(config, store, repl, Arc::new(SharedRoster::new()))
    }

    /// Build a manager over an existing shared mirror, as a second process
    /// attached to the same environment would
    pub fn with_shared(
        config: RosterConfig,
        store: Arc<dyn MembershipStore>,
        repl: Arc<dyn ReplicationLayer>,
        shared: Arc<SharedRoster>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(Core::new(config, store, repl, shared)),
            dispatcher: Arc::new(Mutex::new(None)),
        })
    }

    /// Load persisted membership without starting the dispatch loop
    pub fn recover(&self) -> Result<()> {
        self.core.recover()
    }

    /// Recover persisted membership and start the dispatch loop
    pub async fn start(&self) -> Result<()> {
        if self.dispatcher.lock().is_some() {
            return Ok(());
        }
        self.core.recover()?;

        let dispatcher = Arc::new(Dispatcher::spawn(self.core.clone()));
        if self.core.state.lock().limbo.victim().is_some() {
            dispatcher.enqueue_resolve_limbo();
        }
        *self.dispatcher.lock() = Some(dispatcher);
        info!("Membership manager started for {}", self.core.local);
        Ok(())
    }

    /// Stop the dispatch loop, drop pending retries and close the table.
    /// Queued requests are answered with `ShuttingDown`.
    pub async fn shutdown(&self) {
        {
            let mut state = self.core.state.lock();
            state.shutting_down = true;
            state.scheduler.clear();
        }
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown().await;
        }
        self.core.table.close();
        info!("Membership manager for {} shut down", self.core.local);
    }

    /// Add a site to the group. Blocks on the master role, the store and the
    /// acknowledgment wait.
    pub fn request_join(&self, addr: &SiteAddr) -> Result<ChangeOutcome> {
        self.core.request_change(addr, MembershipStatus::Present)
    }

    /// Remove a site from the group. Blocks like `request_join`.
    pub fn request_removal(&self, addr: &SiteAddr) -> Result<ChangeOutcome> {
        self.core.request_change(addr, MembershipStatus::Absent)
    }

    pub fn resolve_limbo(&self) -> Result<LimboOutcome> {
        self.core.resolve_limbo()
    }

    /// Acknowledgment or heartbeat reported `position` durable. Queues a limbo
    /// resolution when a change is waiting; returns whether one was queued.
    pub fn notify_durable(&self, position: Position) -> bool {
        let pending = {
            let mut state = self.core.state.lock();
            state.limbo.mark_durable(position);
            state.limbo.victim().is_some()
        };
        if !pending {
            return false;
        }
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.enqueue_resolve_limbo(),
            None => false,
        }
    }

    /// The replication layer changed this process's role
    pub fn on_role_change(&self) {
        let pending = {
            let mut state = self.core.state.lock();
            let effect = state.merge_from_shared(&self.core.shared, self.core.repl.as_ref());
            if effect == StatusEffect::SelfEvicted {
                self.core.on_self_evicted(&mut state);
            }
            state.limbo.victim().is_some()
        };

        if self.core.repl.is_master() {
            info!("{} is now master", self.core.local);
            if pending {
                if let Some(dispatcher) = self.dispatcher() {
                    dispatcher.enqueue_resolve_limbo();
                }
            }
        } else {
            debug!("{} is not master", self.core.local);
        }
    }

    pub fn current_membership_snapshot(&self) -> Vec<SiteStatus> {
        self.core.state.lock().registry.snapshot()
    }

    pub fn membership_list(&self) -> MembershipList {
        self.core.state.lock().membership_list()
    }

    pub fn marshal_membership(&self) -> Result<Bytes> {
        self.core.marshal_membership()
    }

    /// Adopt a list received from the master. Returns `SelfEvicted` when the
    /// list no longer includes this site.
    pub fn apply_membership_list(&self, payload: &[u8]) -> Result<ListOutcome> {
        self.core.apply_membership_list(payload)
    }

    pub fn n_sites_for_quorum(&self) -> usize {
        self.core.state.lock().registry.n_sites_for_quorum()
    }

    pub fn status_of(&self, addr: &SiteAddr) -> MembershipStatus {
        self.core.state.lock().registry.status(addr)
    }

    pub fn limbo(&self) -> Option<LimboRecord> {
        self.core.state.lock().limbo.record()
    }

    pub fn change_counter(&self) -> u32 {
        self.core.state.lock().change_counter
    }

    pub fn generation(&self) -> u32 {
        self.core.state.lock().generation
    }

    pub fn local_addr(&self) -> &SiteAddr {
        &self.core.local
    }

    pub fn shared(&self) -> Arc<SharedRoster> {
        self.core.shared.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.state.lock().shutting_down
    }

    pub fn mark_connected(&self, addr: &SiteAddr) {
        let mut state = self.core.state.lock();
        state.set_connection(addr, ConnectionState::Connected);
        if let Some(index) = state.registry.find(addr) {
            state.scheduler.cancel(index);
        }
        debug!("Connected to {}", addr);
    }

    /// A connection dropped; members get a delayed reconnect
    pub fn mark_disconnected(&self, addr: &SiteAddr) {
        let mut state = self.core.state.lock();
        state.set_connection(addr, ConnectionState::Idle);
        self.core
            .repl
            .report_event(RosterEvent::ConnectionBroken(addr.clone()));
        if state.shutting_down {
            return;
        }
        if state.registry.status(addr) == MembershipStatus::Present {
            if let Some(index) = state.registry.find(addr) {
                state.scheduler.schedule(index, addr, false, Instant::now());
                debug!("Scheduled reconnect to {}", addr);
            }
        }
    }

    pub fn record_ack(&self, addr: &SiteAddr, position: Position) {
        self.core.state.lock().record_ack(addr, position);
    }

    /// Sites whose reconnect time has arrived, now marked `Connecting`
    pub fn due_reconnects(&self, now: Instant) -> Vec<SiteAddr> {
        self.core.state.lock().due_reconnects(now)
    }

    /// Time of the next scheduled reconnect
    pub fn next_reconnect(&self) -> Option<Instant> {
        self.core.state.lock().scheduler.next_due()
    }

    /// Queue a message on the dispatch loop
    pub async fn submit(&self, msg: RosterMessage) -> Result<()> {
        match self.dispatcher() {
            Some(dispatcher) => dispatcher.submit(msg).await,
            None => Err(RosterError::ShuttingDown),
        }
    }

    pub async fn join_via_dispatch(&self, addr: &SiteAddr) -> Result<Reply> {
        let (msg, reply) = RosterMessage::local_join(addr)?;
        self.submit(msg).await?;
        reply.await.map_err(|_| RosterError::ShuttingDown)
    }

    pub async fn remove_via_dispatch(&self, addr: &SiteAddr) -> Result<Reply> {
        let (msg, reply) = RosterMessage::local_remove(addr)?;
        self.submit(msg).await?;
        reply.await.map_err(|_| RosterError::ShuttingDown)
    }

    fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{AckPolicy, LoopbackReplication};
    use crate::store::MemoryStore;

    fn config(port: u16) -> RosterConfig {
        let mut config = RosterConfig::default();
        config.local_site = SiteAddr::new("local", port);
        config.ack_timeout_ms = 20;
        config.master_lock_timeout_ms = 50;
        config
    }

    #[test]
    fn test_recover_bootstraps_master() {
        let store = Arc::new(MemoryStore::new());
        let repl = Arc::new(LoopbackReplication::as_master(SiteAddr::new("local", 6000), AckPolicy::Quorum));
        let manager = RosterManager::new(config(6000), store.clone(), repl).unwrap();
        manager.recover().unwrap();

        assert_eq!(manager.status_of(manager.local_addr()), MembershipStatus::Present);
        assert_eq!(manager.change_counter(), 1);
        assert_eq!(manager.n_sites_for_quorum(), 1);

        // second recover finds the record and does not bootstrap again
        let commits = store.commits();
        manager.recover().unwrap();
        assert_eq!(store.commits(), commits);
    }

    #[test]
    fn test_recover_puts_provisional_record_in_limbo() {
        let store = Arc::new(MemoryStore::new());
        let local = SiteAddr::new("local", 6000);
        let peer = SiteAddr::new("peer", 6001);
        {
            let table = MembershipTable::new(store.clone(), "__db.membership");
            let handle = table.open().unwrap();
            let txn = store.begin_txn().unwrap();
            table.write_status(&handle, txn, &local, MembershipStatus::Present).unwrap();
            table.write_status(&handle, txn, &peer, MembershipStatus::Adding).unwrap();
            store.commit(txn).unwrap();
        }

        let repl = Arc::new(LoopbackReplication::as_master(local, AckPolicy::Quorum));
        let manager = RosterManager::new(config(6000), store, repl).unwrap();
        manager.recover().unwrap();

        let record = manager.limbo().unwrap();
        assert!(!record.failure_position.is_zero());
        assert_eq!(manager.status_of(&peer), MembershipStatus::Adding);
    }

    #[test]
    fn test_disconnect_schedules_retry() {
        let store = Arc::new(MemoryStore::new());
        let repl = Arc::new(LoopbackReplication::as_master(SiteAddr::new("local", 6000), AckPolicy::None));
        let manager = RosterManager::new(config(6000), store, repl.clone()).unwrap();
        manager.recover().unwrap();

        let peer = SiteAddr::new("peer", 6001);
        assert_eq!(manager.request_join(&peer).unwrap(), ChangeOutcome::Applied);
        assert_eq!(manager.due_reconnects(Instant::now()), vec![peer.clone()]);
        manager.mark_connected(&peer);
        assert!(manager.next_reconnect().is_none());

        manager.mark_disconnected(&peer);
        assert!(manager.next_reconnect().is_some());
        assert!(repl.events().contains(&RosterEvent::ConnectionBroken(peer.clone())));

        manager.record_ack(&peer, Position(9));
        let state = manager.core.state.lock();
        let entry = state.registry.get(state.registry.find(&peer).unwrap()).unwrap();
        assert_eq!(entry.last_acked, Position(9));
    }
}
