//! Agent identities
//!
//! An agent is identified by a small positive integer derived from the
//! numeric suffix of its network identity (the last octet of its IPv4
//! address, or the trailing digits of its hostname). The coordinator orders
//! every broadcast and every collection by this id.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{SyncError, SyncResult};

/// Agent identity, 1..=N, stable for a session
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(u32);

impl AgentId {
    /// Create an agent id. Zero is reserved and rejected.
    #[inline]
    pub fn new(id: u32) -> Option<Self> {
        (id != 0).then_some(AgentId(id))
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Derive the id from the connecting peer's address.
    ///
    /// IPv4: last octet. IPv6: last segment, unless the address is an
    /// IPv4-mapped one, in which case the embedded IPv4 rule applies.
    pub fn from_peer_addr(addr: &SocketAddr) -> SyncResult<Self> {
        let suffix = match addr.ip() {
            IpAddr::V4(v4) => u32::from(v4.octets()[3]),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => u32::from(v4.octets()[3]),
                None => u32::from(v6.segments()[7]),
            },
        };
        AgentId::new(suffix).ok_or(SyncError::UnidentifiablePeer(*addr))
    }

    /// Derive the id from the trailing digits of a hostname (`cam07` -> 7).
    pub fn from_hostname(hostname: &str) -> Option<Self> {
        let trimmed = hostname.trim();
        let digits_start = trimmed
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i)?;
        trimmed[digits_start..].parse().ok().and_then(AgentId::new)
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Agent({})", self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s
            .trim()
            .parse()
            .map_err(|e| format!("invalid agent id {:?}: {}", s, e))?;
        AgentId::new(raw).ok_or_else(|| "agent id 0 is reserved".to_string())
    }
}

/// Verify that `ids` is a bijection onto `1..=expected`.
///
/// Rejects duplicates, ids outside the range and missing ids, naming the
/// first offender so the operator can find the misaddressed host.
pub fn verify_roster(ids: &[AgentId], expected: usize) -> SyncResult<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if id.0 as usize > expected {
            return Err(SyncError::IdentityConflict {
                expected,
                detail: format!("agent {} is outside the roster", id),
            });
        }
        if !seen.insert(*id) {
            return Err(SyncError::IdentityConflict {
                expected,
                detail: format!("agent {} connected twice", id),
            });
        }
    }

    if seen.len() != expected {
        let missing: Vec<String> = (1..=expected as u32)
            .filter_map(AgentId::new)
            .filter(|id| !seen.contains(id))
            .map(|id| id.to_string())
            .collect();
        return Err(SyncError::IdentityConflict {
            expected,
            detail: format!("missing agents {}", missing.join(",")),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u32) -> AgentId {
        AgentId::new(n).unwrap()
    }

    #[test]
    fn test_zero_is_rejected() {
        assert!(AgentId::new(0).is_none());
        assert!("0".parse::<AgentId>().is_err());
        assert_eq!("12".parse::<AgentId>().unwrap(), id(12));
    }

    #[test]
    fn test_from_ipv4_peer() {
        let addr: SocketAddr = "192.168.1.7:53122".parse().unwrap();
        assert_eq!(AgentId::from_peer_addr(&addr).unwrap(), id(7));

        let network: SocketAddr = "192.168.1.0:5000".parse().unwrap();
        assert!(matches!(
            AgentId::from_peer_addr(&network),
            Err(SyncError::UnidentifiablePeer(_))
        ));
    }

    #[test]
    fn test_from_mapped_ipv6_peer() {
        let addr: SocketAddr = "[::ffff:10.0.0.4]:6000".parse().unwrap();
        assert_eq!(AgentId::from_peer_addr(&addr).unwrap(), id(4));

        let plain: SocketAddr = "[fd00::12]:6000".parse().unwrap();
        assert_eq!(AgentId::from_peer_addr(&plain).unwrap(), id(0x12));
    }

    #[test]
    fn test_from_hostname() {
        assert_eq!(AgentId::from_hostname("raspberrypi12"), Some(id(12)));
        assert_eq!(AgentId::from_hostname("cam07\n"), Some(id(7)));
        assert_eq!(AgentId::from_hostname("coordinator"), None);
        assert_eq!(AgentId::from_hostname("cam0"), None);
    }

    #[test]
    fn test_roster_rejects_duplicates_and_gaps() {
        assert!(verify_roster(&[id(1), id(2), id(3)], 3).is_ok());
        assert!(verify_roster(&[id(1), id(1), id(3)], 3).is_err());
        assert!(verify_roster(&[id(1), id(2)], 3).is_err());
        assert!(verify_roster(&[id(1), id(2), id(4)], 3).is_err());
    }

    proptest! {
        #[test]
        fn prop_roster_bijection_ignores_arrival_order(
            order in Just((1..=12u32).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let mut ids: Vec<AgentId> = order.into_iter().map(id).collect();
            prop_assert!(verify_roster(&ids, 12).is_ok());

            ids.sort();
            let expected: Vec<AgentId> = (1..=12).map(id).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
