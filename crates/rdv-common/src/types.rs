//! Core identity types for the RDV protocol.

use serde::{Deserialize, Serialize};

/// Process-unique connection identifier.
///
/// Assigned at connect time from a monotonic counter starting at 1, never
/// reused and never mutated for the lifetime of the process.
pub type ConnectionId = u64;

/// Role assigned to a connection at connect time, immutable thereafter.
///
/// The first connection (or the first after the sole admin departed)
/// becomes [`Role::Admin`]; every other connection is a [`Role::User`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The single privileged counterparty for all users.
    Admin,
    /// An ordinary peer; exchanges envelopes with the admin only.
    User,
}

impl Role {
    /// Wire string for this role, as carried in the `role` field of the
    /// initial `STATUS` greeting.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
