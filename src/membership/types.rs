//! Membership Types
//!
//! Core types shared by the registry, the persistence table and the wire codec:
//! - Site addressing and stable local indexes
//! - Membership and connection status
//! - Replication positions and change outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RosterError;

/// Network address of a site. Ordering is lexicographic on host, then port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteAddr {
    pub host: String,
    pub port: u16,
}

impl SiteAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SiteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for SiteAddr {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RosterError::config(format!("expected host:port, got '{}'", s)))?;
        if host.is_empty() {
            return Err(RosterError::config(format!("missing host in '{}'", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| RosterError::config(format!("invalid port in '{}': {}", s, e)))?;
        Ok(SiteAddr::new(host, port))
    }
}

/// Stable handle of a site inside the local registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteIndex(pub usize);

impl fmt::Display for SiteIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Group membership status of a site.
///
/// `Adding` and `Deleting` are provisional and always resolve to one of the
/// ultimate values `Present` or `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MembershipStatus {
    #[default]
    Absent,
    Adding,
    Present,
    Deleting,
}

impl MembershipStatus {
    /// Flag value used on the wire and in persisted records
    pub fn flags(self) -> u32 {
        match self {
            MembershipStatus::Absent => 0,
            MembershipStatus::Adding => 0x01,
            MembershipStatus::Deleting => 0x02,
            MembershipStatus::Present => 0x04,
        }
    }

    pub fn from_flags(flags: u32) -> Option<Self> {
        match flags {
            0 => Some(MembershipStatus::Absent),
            0x01 => Some(MembershipStatus::Adding),
            0x02 => Some(MembershipStatus::Deleting),
            0x04 => Some(MembershipStatus::Present),
            _ => None,
        }
    }

    pub fn is_provisional(self) -> bool {
        matches!(self, MembershipStatus::Adding | MembershipStatus::Deleting)
    }

    /// Provisional status written on the way to an ultimate `target`
    pub fn provisional_for(target: MembershipStatus) -> MembershipStatus {
        match target {
            MembershipStatus::Present | MembershipStatus::Adding => MembershipStatus::Adding,
            MembershipStatus::Absent | MembershipStatus::Deleting => MembershipStatus::Deleting,
        }
    }

    /// Ultimate status a provisional status resolves to
    pub fn ultimate(self) -> MembershipStatus {
        match self {
            MembershipStatus::Adding | MembershipStatus::Present => MembershipStatus::Present,
            MembershipStatus::Deleting | MembershipStatus::Absent => MembershipStatus::Absent,
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MembershipStatus::Absent => "absent",
            MembershipStatus::Adding => "adding",
            MembershipStatus::Present => "present",
            MembershipStatus::Deleting => "deleting",
        };
        f.write_str(name)
    }
}

/// State of the outgoing connection to a remote site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Waiting out a retry delay before reconnecting
    Pausing,
    Connecting,
    Connected,
}

/// Position in the replication stream. Monotonically increasing; zero means
/// "nothing written".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position(pub u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// One known site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEntry {
    pub index: SiteIndex,
    pub addr: SiteAddr,
    pub status: MembershipStatus,
    /// Highest replication position this site has acknowledged
    pub last_acked: Position,
    pub connection: ConnectionState,
    pub electable: bool,
}

impl SiteEntry {
    pub fn new(index: SiteIndex, addr: SiteAddr) -> Self {
        Self {
            index,
            addr,
            status: MembershipStatus::Absent,
            last_acked: Position::ZERO,
            connection: ConnectionState::Idle,
            electable: true,
        }
    }
}

/// Row of a membership snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStatus {
    pub host: String,
    pub port: u16,
    pub status: MembershipStatus,
}

impl SiteStatus {
    pub fn addr(&self) -> SiteAddr {
        SiteAddr::new(self.host.clone(), self.port)
    }
}

/// Versioned membership list as persisted and exchanged between sites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipList {
    pub format_version: u32,
    pub generation: u32,
    pub change_counter: u32,
    pub sites: Vec<SiteStatus>,
}

/// Result of a membership change request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The change reached its ultimate status (or already had it)
    Applied,
    /// This process is not master; the request belongs at the given site
    Forward(SiteAddr),
    /// Temporarily unable to complete; retry later
    Unavailable,
}
