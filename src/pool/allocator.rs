//! Best-fit range allocator for one pool.
//!
//! Tracks free ranges in an offset-ordered map and granted ranges
//! (Allocated or Reserved) in a second map, so neighbor lookup and
//! coalescing on free are O(log n). Alignment padding is carved into its
//! own free fragment rather than discarded: every byte of the pool is
//! accounted for at all times (conservation invariant).

use super::range::{GrantedRange, RangeState};
use crate::error::{Error, Result};
use crate::session::SessionId;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::trace;

/// A Reserved range eligible for eviction, as seen by the reclaimer.
#[derive(Debug, Clone, Copy)]
pub struct ReclaimCandidate {
    pub offset: u64,
    pub len: u64,
    pub generation: u64,
    pub owner: SessionId,
    pub reserved_since: Instant,
}

/// In-process allocator state for one pool.
pub struct RangeAllocator {
    capacity: u64,
    /// Free ranges keyed by offset (value = length).
    free: BTreeMap<u64, u64>,
    /// Granted ranges keyed by offset.
    granted: BTreeMap<u64, GrantedRange>,
    next_generation: u64,
    allocated_bytes: u64,
    reserved_bytes: u64,
}

impl RangeAllocator {
    pub fn new(capacity: u64) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            granted: BTreeMap::new(),
            next_generation: 1,
            allocated_bytes: 0,
            reserved_bytes: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity - self.allocated_bytes - self.reserved_bytes
    }

    fn align_up(offset: u64, alignment: u64) -> u64 {
        (offset + alignment - 1) & !(alignment - 1)
    }

    pub fn validate_request(size: u64, alignment: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "allocation size cannot be zero".to_string(),
            ));
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment must be a power of two, got {alignment}"
            )));
        }
        Ok(())
    }

    /// Allocate `size` bytes at an `alignment`-aligned offset for `owner`.
    ///
    /// Best-fit: among free blocks that can hold the aligned request, pick
    /// the one with the least usable space. Returns `(offset, generation)`.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        owner: SessionId,
    ) -> Result<(u64, u64)> {
        Self::validate_request(size, alignment)?;

        let best = self
            .free
            .iter()
            .filter_map(|(&offset, &len)| {
                let aligned = Self::align_up(offset, alignment);
                let padding = aligned - offset;
                if padding >= len {
                    return None;
                }
                let usable = len - padding;
                (usable >= size).then_some((offset, usable))
            })
            .min_by_key(|&(_, usable)| usable)
            .map(|(offset, _)| offset);

        let block_offset = best.ok_or_else(|| {
            Error::Exhausted(format!(
                "no contiguous free range of {size} bytes (alignment {alignment}); {} bytes free in {} fragments",
                self.free_bytes(),
                self.free.len()
            ))
        })?;

        let block_len = self.free.remove(&block_offset).unwrap_or(0);
        let aligned = Self::align_up(block_offset, alignment);
        let padding = aligned - block_offset;
        let tail = block_len - padding - size;

        // Put the carved-off edges back; padding fragments stay tracked
        // no matter how small, so the layout always sums to capacity.
        if padding > 0 {
            self.free.insert(block_offset, padding);
        }
        if tail > 0 {
            self.free.insert(aligned + size, tail);
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.granted.insert(
            aligned,
            GrantedRange {
                len: size,
                state: RangeState::Allocated,
                owner,
                generation,
                reserved_since: None,
            },
        );
        self.allocated_bytes += size;

        trace!(
            offset = aligned,
            size,
            alignment,
            generation,
            "allocated range"
        );
        Ok((aligned, generation))
    }

    /// Re-acquire one of `owner`'s own Reserved ranges without touching the
    /// free list. Picks the smallest sufficient range whose offset already
    /// satisfies the alignment; flips it back to Allocated under a fresh
    /// generation. Ranges more than twice the requested size are skipped:
    /// the slack stays bounded the way a per-process caching allocator
    /// buckets its cached blocks. Returns `(offset, generation, len)`.
    pub fn reacquire(
        &mut self,
        owner: SessionId,
        size: u64,
        alignment: u64,
    ) -> Option<(u64, u64, u64)> {
        let offset = self
            .granted
            .iter()
            .filter(|(&offset, entry)| {
                entry.owner == owner
                    && entry.state == RangeState::Reserved
                    && entry.len >= size
                    && entry.len <= size.saturating_mul(2)
                    && offset % alignment == 0
            })
            .min_by_key(|(_, entry)| entry.len)
            .map(|(&offset, _)| offset)?;

        let generation = self.next_generation;
        self.next_generation += 1;
        let entry = self.granted.get_mut(&offset)?;
        entry.state = RangeState::Allocated;
        entry.reserved_since = None;
        entry.generation = generation;
        self.reserved_bytes -= entry.len;
        self.allocated_bytes += entry.len;

        trace!(offset, len = entry.len, generation, "reacquired reserved range");
        Some((offset, generation, entry.len))
    }

    /// Downgrade an Allocated range to Reserved (idle, evictable).
    /// Idempotent for an already-Reserved range.
    pub fn mark_reserved(&mut self, offset: u64) -> Result<()> {
        let entry = self
            .granted
            .get_mut(&offset)
            .ok_or_else(|| Error::InvalidArgument(format!("no granted range at offset {offset}")))?;
        if entry.state == RangeState::Allocated {
            entry.state = RangeState::Reserved;
            entry.reserved_since = Some(Instant::now());
            self.allocated_bytes -= entry.len;
            self.reserved_bytes += entry.len;
        }
        Ok(())
    }

    /// Upgrade a Reserved range back to Allocated in place.
    pub fn mark_allocated(&mut self, offset: u64) -> Result<()> {
        let entry = self
            .granted
            .get_mut(&offset)
            .ok_or_else(|| Error::InvalidArgument(format!("no granted range at offset {offset}")))?;
        if entry.state == RangeState::Reserved {
            entry.state = RangeState::Allocated;
            entry.reserved_since = None;
            self.reserved_bytes -= entry.len;
            self.allocated_bytes += entry.len;
        }
        Ok(())
    }

    /// Return a granted range (any state) to the free list, merging with
    /// adjacent free neighbors. Returns the freed length.
    pub fn free(&mut self, offset: u64) -> Result<u64> {
        let entry = self
            .granted
            .remove(&offset)
            .ok_or_else(|| Error::InvalidArgument(format!("no granted range at offset {offset}")))?;
        match entry.state {
            RangeState::Allocated => self.allocated_bytes -= entry.len,
            RangeState::Reserved => self.reserved_bytes -= entry.len,
        }
        self.insert_free(offset, entry.len);
        trace!(offset, len = entry.len, "freed range");
        Ok(entry.len)
    }

    fn insert_free(&mut self, mut offset: u64, mut len: u64) {
        // Merge with the free neighbor ending exactly at `offset`.
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        // Merge with the free neighbor starting exactly at the end.
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        self.free.insert(offset, len);
    }

    pub fn get(&self, offset: u64) -> Option<&GrantedRange> {
        self.granted.get(&offset)
    }

    /// Whether some free block can hold `size` bytes at `alignment`.
    pub fn can_satisfy(&self, size: u64, alignment: u64) -> bool {
        self.free.iter().any(|(&offset, &len)| {
            let padding = Self::align_up(offset, alignment) - offset;
            padding < len && len - padding >= size
        })
    }

    /// Reserved bytes held by sessions other than `excluding`.
    pub fn reserved_bytes_excluding(&self, excluding: SessionId) -> u64 {
        self.granted
            .values()
            .filter(|entry| entry.state == RangeState::Reserved && entry.owner != excluding)
            .map(|entry| entry.len)
            .sum()
    }

    /// Reserved ranges of sessions other than `excluding`, longest idle
    /// first.
    pub fn reserved_candidates(&self, excluding: SessionId) -> Vec<ReclaimCandidate> {
        let mut candidates: Vec<ReclaimCandidate> = self
            .granted
            .iter()
            .filter_map(|(&offset, entry)| {
                let reserved_since = entry.reserved_since?;
                if entry.owner == excluding {
                    return None;
                }
                Some(ReclaimCandidate {
                    offset,
                    len: entry.len,
                    generation: entry.generation,
                    owner: entry.owner,
                    reserved_since,
                })
            })
            .collect();
        candidates.sort_by_key(|c| c.reserved_since);
        candidates
    }

    /// Offsets of every range (any state) owned by `owner`.
    pub fn ranges_owned_by(&self, owner: SessionId) -> Vec<u64> {
        self.granted
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(&offset, _)| offset)
            .collect()
    }

    /// Consistency check: granted and free ranges together tile
    /// `[0, capacity)` exactly, with no overlap, and the byte counters
    /// match the state sums. A violation is a broker bug, not a client
    /// mistake, and the owning pool is faulted on it.
    pub fn verify(&self) -> Result<()> {
        let mut ranges: Vec<(u64, u64)> = self.free.iter().map(|(&o, &l)| (o, l)).collect();
        ranges.extend(self.granted.iter().map(|(&o, e)| (o, e.len)));
        ranges.sort_by_key(|&(offset, _)| offset);

        let mut cursor = 0u64;
        for (offset, len) in ranges {
            if offset != cursor {
                return Err(Error::Internal(format!(
                    "layout corruption: expected range at {cursor}, found [{offset}, {})",
                    offset + len
                )));
            }
            cursor = offset + len;
        }
        if cursor != self.capacity {
            return Err(Error::Internal(format!(
                "layout corruption: ranges cover {cursor} of {} bytes",
                self.capacity
            )));
        }

        let (mut allocated, mut reserved) = (0u64, 0u64);
        for entry in self.granted.values() {
            match entry.state {
                RangeState::Allocated => allocated += entry.len,
                RangeState::Reserved => reserved += entry.len,
            }
        }
        if allocated != self.allocated_bytes || reserved != self.reserved_bytes {
            return Err(Error::Internal(format!(
                "counter drift: allocated {allocated}/{}, reserved {reserved}/{}",
                self.allocated_bytes, self.reserved_bytes
            )));
        }
        Ok(())
    }
}
