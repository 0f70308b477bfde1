use std::collections::HashMap;

use super::types::{MembershipStatus, SiteAddr, SiteEntry, SiteIndex, SiteStatus};

/// In-process table of every site this process has heard of.
///
/// Entries are never removed: a site that leaves the group keeps its slot with
/// status `Absent`, so indexes handed out to other components stay valid.
#[derive(Debug, Default)]
pub struct SiteRegistry {
    sites: Vec<SiteEntry>,
    by_addr: HashMap<SiteAddr, SiteIndex>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, addr: &SiteAddr) -> Option<SiteIndex> {
        self.by_addr.get(addr).copied()
    }

    /// Look up a site, appending a new `Absent` entry on first sight
    pub fn add_or_get(&mut self, addr: &SiteAddr) -> SiteIndex {
        if let Some(index) = self.find(addr) {
            return index;
        }
        let index = SiteIndex(self.sites.len());
        self.sites.push(SiteEntry::new(index, addr.clone()));
        self.by_addr.insert(addr.clone(), index);
        index
    }

    pub fn get(&self, index: SiteIndex) -> Option<&SiteEntry> {
        self.sites.get(index.0)
    }

    pub fn get_mut(&mut self, index: SiteIndex) -> Option<&mut SiteEntry> {
        self.sites.get_mut(index.0)
    }

    pub fn status(&self, addr: &SiteAddr) -> MembershipStatus {
        self.find(addr)
            .and_then(|i| self.get(i))
            .map(|e| e.status)
            .unwrap_or(MembershipStatus::Absent)
    }

    /// Overwrite a site's status, returning the previous one
    pub fn update_status(&mut self, index: SiteIndex, status: MembershipStatus) -> Option<MembershipStatus> {
        let entry = self.sites.get_mut(index.0)?;
        Some(std::mem::replace(&mut entry.status, status))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SiteEntry> {
        self.sites.iter()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Number of `Present` sites, the base for quorum and ack-policy math
    pub fn n_sites_for_quorum(&self) -> usize {
        self.sites
            .iter()
            .filter(|e| e.status == MembershipStatus::Present)
            .count()
    }

    /// Number of sites taking part in acknowledgment, including sites with a
    /// change in flight
    pub fn n_sites_for_ack(&self) -> usize {
        self.sites
            .iter()
            .filter(|e| e.status != MembershipStatus::Absent)
            .count()
    }

    /// Every non-absent site in index order
    pub fn snapshot(&self) -> Vec<SiteStatus> {
        self.sites
            .iter()
            .filter(|e| e.status != MembershipStatus::Absent)
            .map(|e| SiteStatus {
                host: e.addr.host.clone(),
                port: e.addr.port,
                status: e.status,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_or_get_is_stable() {
        let mut registry = SiteRegistry::new();
        let a = registry.add_or_get(&SiteAddr::new("a", 1));
        let b = registry.add_or_get(&SiteAddr::new("b", 2));
        assert_eq!(a, SiteIndex(0));
        assert_eq!(b, SiteIndex(1));
        assert_eq!(registry.add_or_get(&SiteAddr::new("a", 1)), a);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find(&SiteAddr::new("c", 3)), None);
    }

    #[test]
    fn test_counts_and_snapshot() {
        let mut registry = SiteRegistry::new();
        let a = registry.add_or_get(&SiteAddr::new("a", 1));
        let b = registry.add_or_get(&SiteAddr::new("b", 2));
        let c = registry.add_or_get(&SiteAddr::new("c", 3));
        registry.update_status(a, MembershipStatus::Present);
        registry.update_status(b, MembershipStatus::Adding);
        registry.update_status(c, MembershipStatus::Present);
        registry.update_status(c, MembershipStatus::Absent);

        assert_eq!(registry.n_sites_for_quorum(), 1);
        assert_eq!(registry.n_sites_for_ack(), 2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].status, MembershipStatus::Adding);
        // removed sites keep their slot
        assert_eq!(registry.get(c).unwrap().addr, SiteAddr::new("c", 3));
    }
}
