//! Sandbox identity and addressing.
//!
//! A sandbox id is derived from an `(owner, topic)` pair by hashing, so the
//! same pair always lands in the same directory and no lookup table is
//! needed. Derived ids have a fixed shape:
//!
//! ```text
//! 3f2a9c10_9b1e44d07a3c52f1
//! └──────┘ └──────────────┘
//!  owner    owner + topic
//! ```
//!
//! The owner prefix is what eviction uses to find every sandbox belonging to
//! one owner.

use std::fmt;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::EnvironmentError;

/// Hex characters taken from the owner digest.
pub const OWNER_PREFIX_LEN: usize = 8;

/// Hex characters taken from the `(owner, topic)` digest.
pub const PAIR_HASH_LEN: usize = 16;

/// Total length of a derived id.
pub const DERIVED_ID_LEN: usize = OWNER_PREFIX_LEN + 1 + PAIR_HASH_LEN;

/// Well-known id of the shared template sandbox.
pub const SHARED_TEMPLATE_ID: &str = "shared_env";

/// Longest caller-supplied id accepted.
const MAX_ID_LEN: usize = 64;

/// Filesystem-safe sandbox identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SandboxId(String);

impl SandboxId {
    /// Validates a caller-supplied id.
    ///
    /// # Errors
    ///
    /// Returns `EnvironmentError::InvalidId` if the id is empty, too long, or
    /// contains anything other than ASCII alphanumerics, `_` and `-`.
    pub fn parse(id: impl Into<String>) -> Result<Self, EnvironmentError> {
        let id = id.into();
        let invalid = |reason: &str| EnvironmentError::InvalidId {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if id.is_empty() {
            return Err(invalid("id cannot be empty"));
        }
        if id.len() > MAX_ID_LEN {
            return Err(invalid("id is too long"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid("id contains unsupported characters"));
        }
        if is_quarantine_name(&id) {
            return Err(invalid("id collides with the quarantine naming scheme"));
        }

        Ok(Self(id))
    }

    /// Id of the shared, pre-seeded template.
    #[must_use]
    pub fn shared_template() -> Self {
        Self(SHARED_TEMPLATE_ID.to_string())
    }

    /// A throw-away id for sandboxes with no owner.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Maps an `(owner, topic)` pair to its sandbox id.
///
/// Pure and deterministic. The owner and topic are length-prefixed before
/// hashing so that `("ab", "c")` and `("a", "bc")` never collide.
#[must_use]
pub fn resolve_id(owner: &str, topic: &str) -> SandboxId {
    let owner_part = owner_prefix(owner);

    let mut hasher = Sha256::new();
    hasher.update((owner.len() as u64).to_le_bytes());
    hasher.update(owner.as_bytes());
    hasher.update((topic.len() as u64).to_le_bytes());
    hasher.update(topic.as_bytes());
    let pair = hex_prefix(&hasher.finalize(), PAIR_HASH_LEN);

    SandboxId(format!("{owner_part}_{pair}"))
}

/// Hash prefix shared by every derived id of `owner`.
#[must_use]
pub fn owner_prefix(owner: &str) -> String {
    let digest = Sha256::digest(owner.as_bytes());
    hex_prefix(&digest, OWNER_PREFIX_LEN)
}

/// Returns true if `name` looks like an id produced by [`resolve_id`] for `owner`.
#[must_use]
pub fn belongs_to_owner(name: &str, owner: &str) -> bool {
    name.len() == DERIVED_ID_LEN
        && name.as_bytes().get(OWNER_PREFIX_LEN) == Some(&b'_')
        && name.starts_with(&owner_prefix(owner))
}

/// Marker embedded in quarantined directory names.
pub(crate) const QUARANTINE_INFIX: &str = "_old_";

/// Returns true if `name` is a quarantined sandbox directory.
#[must_use]
pub fn is_quarantine_name(name: &str) -> bool {
    name.rsplit_once(QUARANTINE_INFIX)
        .is_some_and(|(_, stamp)| !stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()))
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in bytes {
        if out.len() >= len {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(len);
    out
}
