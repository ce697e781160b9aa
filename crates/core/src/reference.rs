//! Identity of a record that may or may not have reached the server yet.

use serde::{Deserialize, Serialize};

use crate::id::{ServerId, TempId};

/// Either a locally-minted temporary id or a server-assigned id.
///
/// Records authored offline are addressed by `Temporary` until the identity
/// ledger maps them to a server id. Business code never sees a bare string
/// that could be either.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Reference {
    Temporary(TempId),
    Resolved(ServerId),
}

impl Reference {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Reference::Resolved(_))
    }

    pub fn as_resolved(&self) -> Option<&ServerId> {
        match self {
            Reference::Resolved(id) => Some(id),
            Reference::Temporary(_) => None,
        }
    }

    pub fn as_temporary(&self) -> Option<TempId> {
        match self {
            Reference::Temporary(id) => Some(*id),
            Reference::Resolved(_) => None,
        }
    }

    /// Promote a temporary reference when `lookup` knows its server id.
    pub fn resolve_with<F>(&self, lookup: F) -> Reference
    where
        F: FnOnce(&TempId) -> Option<ServerId>,
    {
        match self {
            Reference::Temporary(temp) => match lookup(temp) {
                Some(server) => Reference::Resolved(server),
                None => self.clone(),
            },
            Reference::Resolved(_) => self.clone(),
        }
    }
}

impl From<ServerId> for Reference {
    fn from(value: ServerId) -> Self {
        Reference::Resolved(value)
    }
}

impl From<TempId> for Reference {
    fn from(value: TempId) -> Self {
        Reference::Temporary(value)
    }
}

impl core::fmt::Display for Reference {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Reference::Temporary(id) => write!(f, "tmp:{id}"),
            Reference::Resolved(id) => write!(f, "{id}"),
        }
    }
}
