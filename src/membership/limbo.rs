//! Unresolved membership change tracking.
//!
//! At most one change may be in limbo at a time. Limbo is entered when a
//! provisional write could not be confirmed as durable and left once the
//! finishing write for the same site commits.

use super::types::{Position, SiteIndex};

/// The one outstanding unresolved change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimboRecord {
    pub victim: SiteIndex,
    /// Commit position of the provisional write; never zero
    pub failure_position: Position,
}

/// What a limbo resolution attempt achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimboOutcome {
    /// No change was pending
    NothingToDo,
    /// The pending change reached its ultimate status
    Resolved,
    /// Acknowledgment is still missing; limbo is unchanged
    StillUnavailable,
    /// This process is not master and cannot finish the change
    NotMaster,
}

#[derive(Debug, Default)]
pub struct LimboState {
    record: Option<LimboRecord>,
    durable: Position,
}

impl LimboState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> Option<LimboRecord> {
        self.record
    }

    pub fn victim(&self) -> Option<SiteIndex> {
        self.record.map(|r| r.victim)
    }

    /// Highest position known durable cluster-wide
    pub fn durable_position(&self) -> Position {
        self.durable
    }

    /// Put `victim` in limbo. Re-entering for the same victim keeps the
    /// original failure position. Returns false when a different site is
    /// already in limbo.
    pub fn enter(&mut self, victim: SiteIndex, failure_position: Position) -> bool {
        debug_assert!(!failure_position.is_zero());
        match self.record {
            Some(existing) if existing.victim != victim => false,
            Some(_) => true,
            None => {
                self.record = Some(LimboRecord {
                    victim,
                    failure_position,
                });
                true
            }
        }
    }

    /// Advance the durable position. Positions only move forward.
    pub fn mark_durable(&mut self, position: Position) {
        if position > self.durable {
            self.durable = position;
        }
    }

    /// True when the provisional write of the current victim is known durable
    pub fn is_durable(&self) -> bool {
        self.record
            .map(|r| self.durable >= r.failure_position)
            .unwrap_or(false)
    }

    /// Leave limbo if `victim` is the current victim
    pub fn clear(&mut self, victim: SiteIndex) -> bool {
        if self.victim() == Some(victim) {
            self.record = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_victim() {
        let mut limbo = LimboState::new();
        assert!(limbo.enter(SiteIndex(1), Position(10)));
        assert!(!limbo.enter(SiteIndex(2), Position(11)));
        assert!(limbo.enter(SiteIndex(1), Position(12)));
        assert_eq!(
            limbo.record(),
            Some(LimboRecord {
                victim: SiteIndex(1),
                failure_position: Position(10)
            })
        );
    }

    #[test]
    fn test_durability_check() {
        let mut limbo = LimboState::new();
        assert!(!limbo.is_durable());
        limbo.enter(SiteIndex(3), Position(20));
        limbo.mark_durable(Position(19));
        assert!(!limbo.is_durable());
        limbo.mark_durable(Position(5));
        assert_eq!(limbo.durable_position(), Position(19));
        limbo.mark_durable(Position(20));
        assert!(limbo.is_durable());
    }

    #[test]
    fn test_clear_only_current_victim() {
        let mut limbo = LimboState::new();
        limbo.enter(SiteIndex(4), Position(1));
        assert!(!limbo.clear(SiteIndex(5)));
        assert!(limbo.clear(SiteIndex(4)));
        assert_eq!(limbo.victim(), None);
    }
}
