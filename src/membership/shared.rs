//! Cross-process mirror of the site registry.
//!
//! Every process attached to the same environment sees one `SharedRoster`.
//! Slots are append-only. Nothing outside this module touches the table
//! directly: writers publish single statuses and readers take a copied
//! snapshot that they merge into their private registry.

use parking_lot::Mutex;

use super::types::{MembershipStatus, SiteAddr};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedSnapshot {
    pub sites: Vec<(SiteAddr, MembershipStatus)>,
    pub generation: u32,
    pub change_counter: u32,
}

#[derive(Debug, Default)]
pub struct SharedRoster {
    table: Mutex<SharedSnapshot>,
}

impl SharedRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a site's status, appending a slot on first sight
    pub fn publish(&self, addr: &SiteAddr, status: MembershipStatus) {
        let mut table = self.table.lock();
        match table.sites.iter_mut().find(|(a, _)| a == addr) {
            Some(slot) => slot.1 = status,
            None => table.sites.push((addr.clone(), status)),
        }
    }

    /// Record the list version after a completed change
    pub fn publish_version(&self, generation: u32, change_counter: u32) {
        let mut table = self.table.lock();
        if generation > table.generation {
            table.generation = generation;
            table.change_counter = change_counter;
        }
    }

    pub fn copy_out(&self) -> SharedSnapshot {
        self.table.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.table.lock().sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
