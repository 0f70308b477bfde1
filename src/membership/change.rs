//! Two-phase membership changes.
//!
//! A change first writes the provisional status (`Adding`/`Deleting`) and
//! commits. Once that write is acknowledged under the ack policy, the
//! finishing write records the ultimate status (`Present`, or deletes the
//! record for `Absent`) and bumps the change counter. When acknowledgment
//! falls short the site is left in limbo and the caller sees `Unavailable`;
//! limbo is resolved later by `resolve_limbo`.
//!
//! The registry is not transactional. Every write updates it optimistically
//! before commit and restores the prior value if the transaction aborts.

use tracing::{debug, error, info, warn};

use super::limbo::LimboOutcome;
use super::manager::Core;
use super::state::RosterState;
use super::table::TableError;
use super::types::{ChangeOutcome, MembershipStatus, Position, SiteAddr, SiteIndex};
use crate::error::{Result, RosterError, StoreError};

/// Why a change attempt stopped early
#[derive(Debug)]
pub(crate) enum Abort {
    Table(TableError),
    /// Mastership was lost before commit
    RoleLost,
}

impl From<TableError> for Abort {
    fn from(e: TableError) -> Self {
        Abort::Table(e)
    }
}

impl From<StoreError> for Abort {
    fn from(e: StoreError) -> Self {
        Abort::Table(e.into())
    }
}

/// Registry value before an attempt, restored by `compensate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PriorState {
    pub index: SiteIndex,
    pub addr: SiteAddr,
    pub status: MembershipStatus,
}

/// A committed write awaiting acknowledgment
#[derive(Debug)]
pub(crate) struct Attempt {
    pub prior: PriorState,
    pub position: Position,
}

impl Core {
    /// Drive `addr` to the ultimate status `target`, retrying from the top
    /// on store deadlocks.
    pub(crate) fn request_change(&self, addr: &SiteAddr, target: MembershipStatus) -> Result<ChangeOutcome> {
        let target = target.ultimate();
        if self.state.lock().shutting_down {
            return Err(RosterError::ShuttingDown);
        }
        if *addr == self.local && target == MembershipStatus::Absent {
            return Err(RosterError::protocol("the master cannot remove itself from the group"));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.change_once(addr, target) {
                Ok(outcome) => return Ok(outcome),
                Err(Abort::RoleLost) => {
                    warn!("Lost master role while changing {} to {}", addr, target);
                    return Ok(self.role_outcome());
                }
                Err(Abort::Table(e)) if e.is_deadlock() => {
                    if attempts > self.config.deadlock_retries {
                        error!("Giving up on {} after {} deadlocks", addr, attempts);
                        return Err(RosterError::Deadlock(attempts));
                    }
                    debug!("Deadlock changing {}, retrying (attempt {})", addr, attempts);
                }
                Err(Abort::Table(e)) => {
                    error!("Failed to change {} to {}: {}", addr, target, e);
                    return Err(e.into());
                }
            }
        }
    }

    fn change_once(&self, addr: &SiteAddr, target: MembershipStatus) -> std::result::Result<ChangeOutcome, Abort> {
        let _role = match self.master_lock.hold(self.repl.as_ref()) {
            Ok(role) => role,
            Err(unavailable) => {
                debug!("Cannot change {}: not holding master role", addr);
                return Ok(unavailable.outcome());
            }
        };

        let pending = self.state.lock().limbo.victim().is_some();
        if pending && self.resolve_limbo_held()? == LimboOutcome::StillUnavailable {
            warn!("Refusing change of {}: earlier change still unresolved", addr);
            return Ok(ChangeOutcome::Unavailable);
        }

        let current = self.state.lock().registry.status(addr);
        if current == target {
            debug!("Site {} is already {}", addr, target);
            return Ok(ChangeOutcome::Applied);
        }

        let provisional = MembershipStatus::provisional_for(target);
        let attempt = self.attempt(addr, provisional)?;
        if !self.await_ack(attempt.position) {
            self.enter_limbo(&attempt);
            warn!(
                "Change of {} to {} not acknowledged at {}, left {}",
                addr, target, attempt.position, provisional
            );
            return Ok(ChangeOutcome::Unavailable);
        }

        // The provisional record is committed; a failed finish leaves it for resolve_limbo
        if let Err(abort) = self.finish(addr, target) {
            self.enter_limbo(&attempt);
            warn!("Finishing {} as {} failed, left {}", addr, target, provisional);
            return Err(abort);
        }
        Ok(ChangeOutcome::Applied)
    }

    fn enter_limbo(&self, attempt: &Attempt) {
        let mut state = self.state.lock();
        if !state.limbo.enter(attempt.prior.index, attempt.position) {
            warn!(
                "Cannot put {} in limbo, site {:?} is already there",
                attempt.prior.addr,
                state.limbo.victim()
            );
        }
    }

    /// Put the first orphaned provisional site in limbo when limbo is empty.
    /// Its provisional write is no later than the last commit.
    pub(crate) fn adopt_provisional(&self, state: &mut RosterState) -> Option<SiteAddr> {
        if state.limbo.victim().is_some() {
            return None;
        }
        let (index, addr) = state
            .registry
            .iter()
            .find(|e| e.status.is_provisional())
            .map(|e| (e.index, e.addr.clone()))?;
        let position = Position(self.table.store().last_commit_position().0.max(1));
        state.limbo.enter(index, position).then_some(addr)
    }

    /// Finish a change left in limbo, holding the master role
    pub(crate) fn resolve_limbo(&self) -> Result<LimboOutcome> {
        if self.state.lock().limbo.victim().is_none() {
            return Ok(LimboOutcome::NothingToDo);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let _role = match self.master_lock.hold(self.repl.as_ref()) {
                Ok(role) => role,
                Err(_) => return Ok(LimboOutcome::NotMaster),
            };
            match self.resolve_limbo_held() {
                Ok(outcome) => return Ok(outcome),
                Err(Abort::RoleLost) => return Ok(LimboOutcome::NotMaster),
                Err(Abort::Table(e)) if e.is_deadlock() && attempts <= self.config.deadlock_retries => {
                    debug!("Deadlock resolving limbo, retrying (attempt {})", attempts);
                }
                Err(Abort::Table(e)) if e.is_deadlock() => return Err(RosterError::Deadlock(attempts)),
                Err(Abort::Table(e)) => {
                    error!("Failed to resolve limbo: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Resolve the victim, then any other provisional site, one at a time
    pub(crate) fn resolve_limbo_held(&self) -> std::result::Result<LimboOutcome, Abort> {
        loop {
            let outcome = self.resolve_victim()?;
            if outcome != LimboOutcome::Resolved {
                return Ok(outcome);
            }
            let next = self.adopt_provisional(&mut self.state.lock());
            match next {
                Some(addr) => info!("Site {} is still provisional, resolving it next", addr),
                None => return Ok(LimboOutcome::Resolved),
            }
        }
    }

    fn resolve_victim(&self) -> std::result::Result<LimboOutcome, Abort> {
        let durable = self.repl.durable_position();
        let (record, addr, status, known_durable) = {
            let mut state = self.state.lock();
            state.limbo.mark_durable(durable);
            let record = match state.limbo.record() {
                Some(record) => record,
                None => return Ok(LimboOutcome::NothingToDo),
            };
            let victim = state
                .registry
                .get(record.victim)
                .map(|e| (e.addr.clone(), e.status));
            let (addr, status) = match victim {
                Some(victim) => victim,
                None => {
                    state.limbo.clear(record.victim);
                    return Ok(LimboOutcome::NothingToDo);
                }
            };
            (record, addr, status, state.limbo.is_durable())
        };

        if !status.is_provisional() {
            warn!("Limbo victim {} is {}, dropping stale limbo", addr, status);
            self.state.lock().limbo.clear(record.victim);
            return Ok(LimboOutcome::Resolved);
        }

        if !known_durable {
            // Rewrite the same provisional record to provoke a fresh ack round
            let attempt = self.attempt(&addr, status)?;
            if !self.await_ack(attempt.position) {
                debug!("Limbo for {} still unacknowledged", addr);
                return Ok(LimboOutcome::StillUnavailable);
            }
        }

        self.finish(&addr, status.ultimate())?;
        info!("Resolved limbo for {}", addr);
        Ok(LimboOutcome::Resolved)
    }

    /// Phase one: write and commit the provisional status
    fn attempt(&self, addr: &SiteAddr, provisional: MembershipStatus) -> std::result::Result<Attempt, Abort> {
        let table = self.table.open()?;
        let store = self.table.store();
        let txn = store.begin_txn()?;
        if let Err(e) = self.table.write_status(&table, txn, addr, provisional) {
            let _ = store.abort(txn);
            return Err(e.into());
        }

        let prior = self.apply_status(addr, provisional);
        if !self.still_master() {
            let _ = store.abort(txn);
            self.compensate(&prior);
            return Err(Abort::RoleLost);
        }
        match store.commit(txn) {
            Ok(position) => {
                debug!("Provisional {} for {} committed at {}", provisional, addr, position);
                Ok(Attempt { prior, position })
            }
            Err(e) => {
                self.compensate(&prior);
                Err(e.into())
            }
        }
    }

    /// Phase two: record the ultimate status and bump the change counter
    fn finish(&self, addr: &SiteAddr, target: MembershipStatus) -> std::result::Result<(), Abort> {
        let table = self.table.open()?;
        let store = self.table.store();
        let txn = store.begin_txn()?;
        let written = match target {
            MembershipStatus::Absent => self.table.remove_site(&table, txn, addr),
            _ => self
                .table
                .write_status(&table, txn, addr, MembershipStatus::Present),
        }
        .and_then(|_| self.table.bump_counter(&table, txn));
        let counter = match written {
            Ok(counter) => counter,
            Err(e) => {
                let _ = store.abort(txn);
                return Err(e.into());
            }
        };

        let prior = self.apply_status(addr, target);
        if !self.still_master() {
            let _ = store.abort(txn);
            self.compensate(&prior);
            return Err(Abort::RoleLost);
        }
        if let Err(e) = store.commit(txn) {
            self.compensate(&prior);
            return Err(e.into());
        }

        {
            let mut state = self.state.lock();
            state.change_counter = counter;
            state.generation = state.generation.wrapping_add(1).max(counter);
            state.limbo.clear(prior.index);
            self.shared.publish_version(state.generation, counter);
        }
        info!("Site {} is now {} (change {})", addr, target, counter);
        self.share_membership();
        Ok(())
    }

    /// Write a status into the private registry and the shared mirror,
    /// returning what it replaced
    pub(crate) fn apply_status(&self, addr: &SiteAddr, status: MembershipStatus) -> PriorState {
        let mut state = self.state.lock();
        let index = state.registry.add_or_get(addr);
        let prior = state.registry.status(addr);
        let effect = state.set_status(addr, status, self.repl.as_ref());
        self.shared.publish(addr, status);
        if effect == super::state::StatusEffect::SelfEvicted {
            self.on_self_evicted(&mut state);
        }
        PriorState {
            index,
            addr: addr.clone(),
            status: prior,
        }
    }

    /// Undo an optimistic registry write after an abort
    pub(crate) fn compensate(&self, prior: &PriorState) {
        debug!("Restoring {} to {}", prior.addr, prior.status);
        self.apply_status(&prior.addr, prior.status);
    }

    fn await_ack(&self, position: Position) -> bool {
        let n_sites = self.state.lock().registry.n_sites_for_ack();
        let acked = self
            .repl
            .await_durable(position, n_sites, self.config.ack_timeout());
        let durable = self.repl.durable_position();
        self.state.lock().limbo.mark_durable(durable);
        acked || durable >= position
    }

    fn still_master(&self) -> bool {
        self.repl.is_master() && !self.repl.is_stepping_down()
    }

    fn role_outcome(&self) -> ChangeOutcome {
        match self.repl.current_master() {
            Some(master) if master != self.local => ChangeOutcome::Forward(master),
            _ => ChangeOutcome::Unavailable,
        }
    }
}
