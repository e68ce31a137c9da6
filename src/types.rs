//! NewType wrappers for strong typing throughout the fleet core.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a repo name where a worker name is expected).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Unique name a worker registers under (usually its hostname).
    ///
    /// This is the key for every per-worker table in the registry. It is
    /// distinct from the worker's network address, which may change across
    /// re-registrations.
    WorkerName
);

newtype_string!(
    /// Organization that owns a repository.
    OrgName
);

newtype_string!(
    /// Repository name within an organization.
    RepoName
);

/// Opaque reference to a build owned by the external build tracker.
///
/// The fleet core never looks inside a build; it only uses the triple as an
/// index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildRef {
    pub org: OrgName,
    pub repo: RepoName,
    pub number: u64,
}

impl BuildRef {
    pub fn new(org: impl Into<OrgName>, repo: impl Into<RepoName>, number: u64) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            number,
        }
    }
}

impl fmt::Display for BuildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.org, self.repo, self.number)
    }
}

/// Identity of one executor incarnation.
///
/// Slots are reused once freed, so `(worker, slot)` alone cannot tell two
/// executors apart. The id also serves as the idempotency key workers see on
/// termination requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(Uuid);

impl ExecutorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ExecutorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
