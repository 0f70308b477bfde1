//! Reconnect scheduling.
//!
//! Keeps one time-ordered retry entry per remote site. When two sites keep
//! connecting to each other at the same moment, each side would tear down the
//! other's connection forever. `backs_off` breaks that tie the same way on
//! both ends: only the site with the greater address adds jitter.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use super::types::{SiteAddr, SiteIndex};

/// True when `local` must add jitter before retrying `remote`.
///
/// Addresses compare lexicographically by host, then by port, so both ends
/// of a pair reach opposite answers.
pub fn backs_off(local: &SiteAddr, remote: &SiteAddr) -> bool {
    local > remote
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub site: SiteIndex,
    pub due: Instant,
}

#[derive(Debug)]
pub struct RetryScheduler {
    entries: VecDeque<RetryEntry>,
    local: SiteAddr,
    retry_wait: Duration,
    max_jitter: Duration,
    rng: SmallRng,
}

impl RetryScheduler {
    pub fn new(local: SiteAddr, retry_wait: Duration, max_jitter: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            local,
            retry_wait,
            max_jitter,
            rng: SmallRng::from_os_rng(),
        }
    }

    /// Scheduler with a fixed jitter seed
    pub fn with_seed(local: SiteAddr, retry_wait: Duration, max_jitter: Duration, seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            ..Self::new(local, retry_wait, max_jitter)
        }
    }

    fn jitter(&mut self, remote: &SiteAddr) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 || !backs_off(&self.local, remote) {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.random_range(1..=max_ms))
    }

    /// Schedule a reconnect to `site`, replacing any pending entry for it.
    /// Immediate entries go to the head of the queue with zero delay.
    pub fn schedule(&mut self, site: SiteIndex, remote: &SiteAddr, immediate: bool, now: Instant) {
        self.cancel(site);
        if immediate {
            debug!("Scheduling immediate reconnect to {} ({})", remote, site);
            self.entries.push_front(RetryEntry { site, due: now });
            return;
        }

        let due = now + self.retry_wait + self.jitter(remote);
        debug!("Scheduling reconnect to {} ({}) in {:?}", remote, site, due - now);
        let pos = self
            .entries
            .iter()
            .position(|e| e.due > due)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, RetryEntry { site, due });
    }

    /// Remove and return every entry due at or before `now`, in due order
    pub fn due(&mut self, now: Instant) -> Vec<SiteIndex> {
        let mut ready = Vec::new();
        while let Some(entry) = self.entries.front() {
            if entry.due > now {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                ready.push(entry.site);
            }
        }
        ready
    }

    pub fn cancel(&mut self, site: SiteIndex) {
        self.entries.retain(|e| e.site != site);
    }

    /// Drop every pending entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.due)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
