//! Range and handle types shared across the pool module.

use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Identifier of one physical pool.
pub type PoolId = u16;

/// State of a granted (non-free) range.
///
/// Free ranges are not represented here; they live in the allocator's
/// free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    /// Actively in use by the owning process. Never reclaimed while the
    /// owner is alive.
    Allocated,
    /// Held by the owner but idle. Counted toward the owner's quota and
    /// eligible for eviction.
    Reserved,
}

/// Book-keeping entry for one granted range.
#[derive(Debug, Clone)]
pub struct GrantedRange {
    pub len: u64,
    pub state: RangeState,
    pub owner: SessionId,
    pub generation: u64,
    /// Set on the Allocated -> Reserved transition; drives the
    /// longest-idle-first eviction order.
    pub reserved_since: Option<Instant>,
}

/// Opaque capability token handed to clients.
///
/// The broker never interprets it beyond pool id + offset + length needed
/// to validate ownership; turning it into process-local memory is the
/// driver-mapping collaborator's job. The generation counter makes a stale
/// handle to an already-reclaimed range detectable instead of silently
/// aliasing whatever lives there now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub pool: PoolId,
    pub offset: u64,
    pub len: u64,
    pub generation: u64,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool={} [{}, {}) gen={}",
            self.pool,
            self.offset,
            self.offset + self.len,
            self.generation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        let handle = Handle {
            pool: 2,
            offset: 4096,
            len: 1024,
            generation: 7,
        };
        assert_eq!(handle.to_string(), "pool=2 [4096, 5120) gen=7");
    }

    #[test]
    fn test_handle_json_roundtrip() {
        let handle = Handle {
            pool: 0,
            offset: 0,
            len: 256,
            generation: 1,
        };
        let json = serde_json::to_string(&handle).unwrap();
        let back: Handle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }
}
