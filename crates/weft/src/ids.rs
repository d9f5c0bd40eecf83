//! Process-unique identifiers for tensors and operators.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

static FUID_COUNTER: AtomicU64 = AtomicU64::new(0);
static GUID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Forever-unique tensor identifier, stable across graph edits.
///
/// Minted once at tensor construction and never reassigned, so lookups by
/// `Fuid` stay valid while the optimizer rewires or deletes neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fuid(pub u64);

/// Unique operator identifier within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(pub u64);

pub(crate) fn next_fuid() -> Fuid {
    Fuid(FUID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
}

pub(crate) fn next_guid() -> Guid {
    Guid(GUID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
}

impl fmt::Display for Fuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
