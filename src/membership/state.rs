use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::codec::FORMAT_VERSION;
use super::limbo::LimboState;
use super::registry::SiteRegistry;
use super::scheduler::RetryScheduler;
use super::shared::SharedRoster;
use super::types::{
    ConnectionState, MembershipList, MembershipStatus, Position, SiteAddr, SiteIndex,
};
use crate::replication::{ReplicationLayer, RosterEvent};

/// Result of a registry status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEffect {
    Unchanged,
    Applied,
    /// The local site lost its membership
    SelfEvicted,
}

impl StatusEffect {
    fn merge(self, other: StatusEffect) -> StatusEffect {
        match (self, other) {
            (StatusEffect::SelfEvicted, _) | (_, StatusEffect::SelfEvicted) => StatusEffect::SelfEvicted,
            (StatusEffect::Applied, _) | (_, StatusEffect::Applied) => StatusEffect::Applied,
            _ => StatusEffect::Unchanged,
        }
    }
}

/// Result of applying an incoming membership list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOutcome {
    /// Not newer than the local list
    Stale,
    Applied(StatusEffect),
}

/// Everything guarded by the registry lock
#[derive(Debug)]
pub struct RosterState {
    pub registry: SiteRegistry,
    pub limbo: LimboState,
    pub scheduler: RetryScheduler,
    pub local: SiteIndex,
    pub generation: u32,
    pub change_counter: u32,
    pub shutting_down: bool,
}

impl RosterState {
    pub fn new(local: SiteAddr, retry_wait: Duration, max_jitter: Duration) -> Self {
        let mut registry = SiteRegistry::new();
        let local_index = registry.add_or_get(&local);
        Self {
            registry,
            limbo: LimboState::new(),
            scheduler: RetryScheduler::new(local, retry_wait, max_jitter),
            local: local_index,
            generation: 0,
            change_counter: 0,
            shutting_down: false,
        }
    }

    pub fn local_addr(&self) -> SiteAddr {
        self.registry
            .get(self.local)
            .map(|e| e.addr.clone())
            .unwrap_or_else(|| SiteAddr::new("", 0))
    }

    pub fn addr_of(&self, index: SiteIndex) -> Option<SiteAddr> {
        self.registry.get(index).map(|e| e.addr.clone())
    }

    /// Set a site's status in the private registry and run the side effects
    /// of the transition. The shared mirror is left alone.
    pub fn set_status(
        &mut self,
        addr: &SiteAddr,
        status: MembershipStatus,
        repl: &dyn ReplicationLayer,
    ) -> StatusEffect {
        let index = self.registry.add_or_get(addr);
        let prior = match self.registry.update_status(index, status) {
            Some(prior) => prior,
            None => return StatusEffect::Unchanged,
        };
        if prior == status {
            return StatusEffect::Unchanged;
        }
        debug!("Site {} {} -> {}", addr, prior, status);

        if index == self.local {
            if status != MembershipStatus::Present && prior != MembershipStatus::Absent {
                warn!("Local site {} is now {}", addr, status);
                return StatusEffect::SelfEvicted;
            }
            return StatusEffect::Applied;
        }

        if status == MembershipStatus::Present {
            repl.report_event(RosterEvent::SiteAdded(addr.clone()));
            let connecting = self
                .registry
                .get(index)
                .map(|e| matches!(e.connection, ConnectionState::Connecting | ConnectionState::Connected))
                .unwrap_or(false);
            if !connecting {
                self.scheduler.schedule(index, addr, true, Instant::now());
            }
        } else if status == MembershipStatus::Absent {
            info!("Site {} left the group", addr);
            repl.report_event(RosterEvent::SiteRemoved(addr.clone()));
            self.scheduler.cancel(index);
        }
        StatusEffect::Applied
    }

    /// Pull shared-mirror slots into the private registry. New slots are
    /// appended; every known site's status is refreshed from the mirror.
    pub fn merge_from_shared(&mut self, shared: &SharedRoster, repl: &dyn ReplicationLayer) -> StatusEffect {
        let snapshot = shared.copy_out();
        let mut effect = StatusEffect::Unchanged;
        for (addr, status) in &snapshot.sites {
            effect = effect.merge(self.set_status(addr, *status, repl));
        }
        if snapshot.generation > self.generation {
            self.generation = snapshot.generation;
            self.change_counter = snapshot.change_counter;
        }
        effect
    }

    /// The current membership list
    pub fn membership_list(&self) -> MembershipList {
        MembershipList {
            format_version: FORMAT_VERSION,
            generation: self.generation,
            change_counter: self.change_counter,
            sites: self.registry.snapshot(),
        }
    }

    /// Adopt a membership list received from the master. Sites missing from
    /// the list are demoted to `Absent`.
    pub fn apply_list(
        &mut self,
        list: &MembershipList,
        shared: &SharedRoster,
        repl: &dyn ReplicationLayer,
    ) -> ListOutcome {
        if self.generation > 0 && list.generation <= self.generation {
            debug!(
                "Ignoring membership list generation {} (have {})",
                list.generation, self.generation
            );
            return ListOutcome::Stale;
        }

        let mut touched = HashSet::new();
        let mut effect = StatusEffect::Unchanged;
        for site in &list.sites {
            let addr = site.addr();
            touched.insert(self.registry.add_or_get(&addr));
            effect = effect.merge(self.set_status(&addr, site.status, repl));
            shared.publish(&addr, site.status);
        }

        let untouched: Vec<SiteAddr> = self
            .registry
            .iter()
            .filter(|e| !touched.contains(&e.index) && e.status != MembershipStatus::Absent)
            .map(|e| e.addr.clone())
            .collect();
        for addr in untouched {
            effect = effect.merge(self.set_status(&addr, MembershipStatus::Absent, repl));
            shared.publish(&addr, MembershipStatus::Absent);
        }

        self.generation = list.generation;
        self.change_counter = list.change_counter;
        shared.publish_version(list.generation, list.change_counter);
        info!(
            "Adopted membership list generation {} with {} sites",
            list.generation,
            list.sites.len()
        );
        ListOutcome::Applied(effect)
    }

    /// Record a remote site's acknowledgment position
    pub fn record_ack(&mut self, addr: &SiteAddr, position: Position) {
        if let Some(entry) = self.registry.find(addr).and_then(|i| self.registry.get_mut(i)) {
            if position > entry.last_acked {
                entry.last_acked = position;
            }
        }
    }

    pub fn set_connection(&mut self, addr: &SiteAddr, state: ConnectionState) {
        let index = self.registry.add_or_get(addr);
        if let Some(entry) = self.registry.get_mut(index) {
            entry.connection = state;
        }
    }

    /// Drain due retry entries for sites that are still members, moving them
    /// to `Connecting`
    pub fn due_reconnects(&mut self, now: Instant) -> Vec<SiteAddr> {
        let mut ready = Vec::new();
        for index in self.scheduler.due(now) {
            if index == self.local {
                continue;
            }
            if let Some(entry) = self.registry.get_mut(index) {
                if entry.status == MembershipStatus::Absent {
                    continue;
                }
                entry.connection = ConnectionState::Connecting;
                ready.push(entry.addr.clone());
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::SiteStatus;
    use crate::replication::{AckPolicy, LoopbackReplication};

    fn state() -> (RosterState, LoopbackReplication, SharedRoster) {
        let local = SiteAddr::new("local", 6000);
        let repl = LoopbackReplication::as_master(local.clone(), AckPolicy::Quorum);
        let state = RosterState::new(local, Duration::from_secs(1), Duration::from_millis(100));
        (state, repl, SharedRoster::new())
    }

    fn list(generation: u32, sites: &[(&str, u16, MembershipStatus)]) -> MembershipList {
        MembershipList {
            format_version: FORMAT_VERSION,
            generation,
            change_counter: generation,
            sites: sites
                .iter()
                .map(|(h, p, s)| SiteStatus {
                    host: h.to_string(),
                    port: *p,
                    status: *s,
                })
                .collect(),
        }
    }

    #[test]
    fn test_present_schedules_connection() {
        let (mut state, repl, _) = state();
        let peer = SiteAddr::new("peer", 6001);
        assert_eq!(
            state.set_status(&peer, MembershipStatus::Present, &repl),
            StatusEffect::Applied
        );
        assert_eq!(state.scheduler.len(), 1);
        assert_eq!(repl.events(), vec![RosterEvent::SiteAdded(peer.clone())]);

        assert_eq!(state.due_reconnects(Instant::now()), vec![peer.clone()]);
        assert_eq!(
            state.registry.get(state.registry.find(&peer).unwrap()).unwrap().connection,
            ConnectionState::Connecting
        );

        assert_eq!(
            state.set_status(&peer, MembershipStatus::Present, &repl),
            StatusEffect::Unchanged
        );
    }

    #[test]
    fn test_absent_reports_removal() {
        let (mut state, repl, _) = state();
        let peer = SiteAddr::new("peer", 6001);
        state.set_status(&peer, MembershipStatus::Present, &repl);
        state.set_status(&peer, MembershipStatus::Absent, &repl);
        assert!(state.scheduler.is_empty());
        assert_eq!(repl.events().last(), Some(&RosterEvent::SiteRemoved(peer)));
    }

    #[test]
    fn test_self_eviction() {
        let (mut state, repl, _) = state();
        let local = state.local_addr();
        assert_eq!(
            state.set_status(&local, MembershipStatus::Present, &repl),
            StatusEffect::Applied
        );
        assert_eq!(
            state.set_status(&local, MembershipStatus::Deleting, &repl),
            StatusEffect::SelfEvicted
        );
    }

    #[test]
    fn test_joining_self_is_not_evicted() {
        let (mut state, repl, _) = state();
        let local = state.local_addr();
        assert_eq!(
            state.set_status(&local, MembershipStatus::Adding, &repl),
            StatusEffect::Applied
        );
    }

    #[test]
    fn test_merge_from_shared() {
        let (mut state, repl, shared) = state();
        let peer = SiteAddr::new("peer", 6001);
        state.set_status(&peer, MembershipStatus::Adding, &repl);

        shared.publish(&peer, MembershipStatus::Present);
        shared.publish(&SiteAddr::new("new", 6002), MembershipStatus::Present);
        shared.publish_version(4, 2);

        assert_eq!(state.merge_from_shared(&shared, &repl), StatusEffect::Applied);
        assert_eq!(state.registry.len(), 3);
        assert_eq!(state.registry.status(&peer), MembershipStatus::Present);
        assert_eq!(state.generation, 4);
    }

    #[test]
    fn test_apply_list_demotes_untouched() {
        let (mut state, repl, shared) = state();
        let local = state.local_addr();
        state.set_status(&local, MembershipStatus::Present, &repl);
        state.set_status(&SiteAddr::new("gone", 1), MembershipStatus::Present, &repl);

        let incoming = list(
            3,
            &[
                ("local", 6000, MembershipStatus::Present),
                ("fresh", 2, MembershipStatus::Present),
            ],
        );
        assert_eq!(
            state.apply_list(&incoming, &shared, &repl),
            ListOutcome::Applied(StatusEffect::Applied)
        );
        assert_eq!(state.registry.status(&SiteAddr::new("gone", 1)), MembershipStatus::Absent);
        assert_eq!(state.registry.snapshot(), incoming.sites);

        // same generation again is stale
        assert_eq!(state.apply_list(&incoming, &shared, &repl), ListOutcome::Stale);
    }

    #[test]
    fn test_apply_list_without_self_evicts() {
        let (mut state, repl, shared) = state();
        let local = state.local_addr();
        state.set_status(&local, MembershipStatus::Present, &repl);
        let incoming = list(2, &[("other", 1, MembershipStatus::Present)]);
        assert_eq!(
            state.apply_list(&incoming, &shared, &repl),
            ListOutcome::Applied(StatusEffect::SelfEvicted)
        );
    }
}
