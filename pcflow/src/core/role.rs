//! Party roles and id-matching protocols.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the computation this process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The publisher hosts the servers of joint stages.
    Publisher,
    /// The partner connects to the publisher's servers.
    Partner,
}

impl Role {
    /// All roles.
    pub const ALL: [Self; 2] = [Self::Publisher, Self::Partner];

    /// Token used in file names (`_{role}_sharded`, ...).
    #[must_use]
    pub fn file_token(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Partner => "partner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_token())
    }
}

/// The private id-matching protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Single-key union PID.
    UnionPid,
    /// Union PID over multiple identifier columns.
    UnionPidMultikey,
}

impl Protocol {
    /// All protocols.
    pub const ALL: [Self; 2] = [Self::UnionPid, Self::UnionPidMultikey];

    /// Returns true when identifiers span several columns.
    #[must_use]
    pub fn is_multikey(&self) -> bool {
        matches!(self, Self::UnionPidMultikey)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnionPid => write!(f, "union_pid"),
            Self::UnionPidMultikey => write!(f, "union_pid_multikey"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_file_token() {
        assert_eq!(Role::Publisher.file_token(), "publisher");
        assert_eq!(Role::Partner.to_string(), "partner");
    }

    #[test]
    fn test_protocol_serialize() {
        let json = serde_json::to_string(&Protocol::UnionPidMultikey).unwrap();
        assert_eq!(json, r#""union_pid_multikey""#);
        assert!(Protocol::UnionPidMultikey.is_multikey());
        assert!(!Protocol::UnionPid.is_multikey());
    }
}
