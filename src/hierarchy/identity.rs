//! Hierarchy identity codec.
//!
//! A worker's tree position is encoded into its folder name:
//! `agent-{ROLE}-{fanout}-{sibling}-{uid}`, e.g. `agent-VP3-2-1-00042`.
//! The name alone recovers the role, how many subordinates the worker
//! manages, its position among same-role siblings, and a unique id. Only the
//! root role needs outside context, because `CEO` exists at every depth.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::hierarchy::catalog;

/// Literal prefix of every encoded name.
pub const NAME_PREFIX: &str = "agent";

/// Maximum direct subordinates a worker may manage.
pub const MAX_FAN_OUT: u8 = 16;

/// Uids are 1..=99999, rendered as exactly five digits.
pub const MAX_UID: u32 = 99_999;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^agent-([A-Z][A-Z0-9]*)-([0-9]{1,2})-([0-9]{1,9})-([0-9]{5})$").unwrap()
});

/// A decoded worker position: role, fan-out, sibling index, uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Role code from the catalog.
    pub role: String,
    /// Count of direct subordinates (0 = leaf).
    pub fan_out: u8,
    /// Position among same-role siblings, starting at 1.
    pub sibling: u32,
    /// Unique id, 1..=99999.
    pub uid: u32,
}

impl AgentIdentity {
    /// Build a validated identity.
    pub fn new(
        role: impl Into<String>,
        fan_out: u8,
        sibling: u32,
        uid: u32,
    ) -> Result<Self, IdentityError> {
        let role = role.into();
        if !catalog::is_known_role(&role) {
            return Err(IdentityError::UnknownRole(role));
        }
        if fan_out > MAX_FAN_OUT {
            return Err(IdentityError::FanOutOutOfRange(fan_out as u32));
        }
        if sibling == 0 {
            return Err(IdentityError::SiblingOutOfRange(sibling));
        }
        if uid == 0 || uid > MAX_UID {
            return Err(IdentityError::UidOutOfRange(uid));
        }
        Ok(Self {
            role,
            fan_out,
            sibling,
            uid,
        })
    }

    /// Encode into the canonical folder name.
    pub fn encode(&self) -> String {
        format!(
            "{NAME_PREFIX}-{}-{}-{}-{:05}",
            self.role, self.fan_out, self.sibling, self.uid
        )
    }

    /// Decode a folder name, validating every field.
    pub fn decode(name: &str) -> Result<Self, IdentityError> {
        let caps = NAME_RE
            .captures(name)
            .ok_or_else(|| IdentityError::Malformed(name.to_string()))?;

        let role = caps[1].to_string();
        // The pattern caps these at 2/9/5 digits, so the parses cannot fail.
        let fan_out: u32 = caps[2].parse().unwrap_or(u32::MAX);
        let sibling: u32 = caps[3].parse().unwrap_or(0);
        let uid: u32 = caps[4].parse().unwrap_or(0);

        if !catalog::is_known_role(&role) {
            return Err(IdentityError::UnknownRole(role));
        }
        if fan_out > MAX_FAN_OUT as u32 {
            return Err(IdentityError::FanOutOutOfRange(fan_out));
        }
        if sibling == 0 {
            return Err(IdentityError::SiblingOutOfRange(sibling));
        }
        if uid == 0 {
            return Err(IdentityError::UidOutOfRange(uid));
        }

        Ok(Self {
            role,
            fan_out: fan_out as u8,
            sibling,
            uid,
        })
    }

    /// A leaf manages no subordinates.
    pub fn is_leaf(&self) -> bool {
        self.fan_out == 0
    }

    /// Whether this is the root role.
    pub fn is_ceo(&self) -> bool {
        self.role == catalog::ROOT_ROLE
    }

    /// The `(depth, layer)` this role sits at via catalog reverse lookup.
    ///
    /// `None` for the root role, which occurs at every depth and needs
    /// external context (a subordinate's role, or a known hierarchy size).
    pub fn depth_layer(&self) -> Option<(u8, u8)> {
        catalog::locate(&self.role)
    }

    /// Build a direct child's identity.
    ///
    /// The child role must be the catalog subordinate of this role; for a
    /// root parent any layer-1 role is accepted since the root's depth is
    /// not recoverable from its own name.
    pub fn child(
        &self,
        role: impl Into<String>,
        fan_out: u8,
        sibling: u32,
        uid: u32,
    ) -> Result<AgentIdentity, IdentityError> {
        let role = role.into();
        let consistent = if self.is_ceo() {
            catalog::locate(&role).map(|(_, layer)| layer) == Some(1)
        } else {
            catalog::subordinate_role(&self.role, None) == Some(role.as_str())
        };
        if !consistent {
            return Err(IdentityError::InvalidChildRole {
                parent: self.role.clone(),
                child: role,
            });
        }
        AgentIdentity::new(role, fan_out, sibling, uid)
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// All identities embedded in a path, in path order.
///
/// Segments that are not valid encoded names are skipped, so a path like
/// `/projects/acme/agent-CEO-2-1-00001/notes/agent-WKR2-0-1-00002` yields the
/// CEO then the worker.
pub fn scan_path(path: &str) -> Vec<AgentIdentity> {
    path.split(['/', '\\'])
        .filter_map(|segment| AgentIdentity::decode(segment).ok())
        .collect()
}

/// The deepest (last) identity embedded in a path, if any.
pub fn deepest_in_path(path: &str) -> Option<AgentIdentity> {
    scan_path(path).into_iter().last()
}

/// The root (CEO) identity embedded in a path, if any.
pub fn ceo_in_path(path: &str) -> Option<AgentIdentity> {
    scan_path(path).into_iter().find(AgentIdentity::is_ceo)
}
