//! Small-integer id allocator
//!
//! Hands out the smallest unused id at or above a configurable floor so ids
//! stay compact on the wire (`u16`). Ids below the floor are reserved for
//! system use and never issued.

use std::collections::BTreeSet;

use bitvec::prelude::*;
use tracing::warn;

/// Entity / client identifier as it appears on the wire
pub type EntityId = u16;

/// First id handed out by default (0-15 reserved)
pub const DEFAULT_ID_FLOOR: EntityId = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("id space exhausted ({floor}..={ceiling} all in use)")]
    Exhausted { floor: EntityId, ceiling: EntityId },
}

/// Allocator bounds and release policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdConfig {
    /// Smallest id ever returned
    pub floor: EntityId,
    /// Largest id ever returned (inclusive)
    pub ceiling: EntityId,
    /// Extra ticks an id of a destroyed entity stays quarantined after the
    /// destroying tick has been flushed (0 = released at end of that tick)
    pub release_delay_ticks: u64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            floor: DEFAULT_ID_FLOOR,
            ceiling: EntityId::MAX,
            release_delay_ticks: 0,
        }
    }
}

/// Issues and recycles ids in `floor..=ceiling`
#[derive(Debug, Clone)]
pub struct IdAllocator {
    floor: EntityId,
    ceiling: EntityId,
    /// Next never-issued id (high-water mark); `ceiling + 1` once exhausted
    next_fresh: u32,
    /// Released ids below `next_fresh`, smallest first
    free: BTreeSet<EntityId>,
    /// Liveness bit per id, indexed by the raw id
    live: BitVec,
    live_count: usize,
}

impl IdAllocator {
    pub fn new(config: IdConfig) -> Self {
        let ceiling = config.ceiling.max(config.floor);
        Self {
            floor: config.floor,
            ceiling,
            next_fresh: u32::from(config.floor),
            free: BTreeSet::new(),
            live: bitvec![0; ceiling as usize + 1],
            live_count: 0,
        }
    }

    /// Smallest currently unused id, or [`IdError::Exhausted`]
    pub fn allocate(&mut self) -> Result<EntityId, IdError> {
        // every free id is below next_fresh, so the pool holds the minimum
        let id = if let Some(id) = self.free.pop_first() {
            id
        } else if self.next_fresh <= u32::from(self.ceiling) {
            let id = self.next_fresh as EntityId;
            self.next_fresh += 1;
            id
        } else {
            return Err(IdError::Exhausted {
                floor: self.floor,
                ceiling: self.ceiling,
            });
        };

        self.live.set(id as usize, true);
        self.live_count += 1;
        Ok(id)
    }

    /// Return an id to the pool. Releasing an id that is not currently
    /// allocated is a caller bug: it is logged and ignored.
    pub fn release(&mut self, id: EntityId) -> bool {
        if !self.is_allocated(id) {
            warn!("release of id {} that is not allocated, ignoring", id);
            return false;
        }
        self.live.set(id as usize, false);
        self.live_count -= 1;

        if u32::from(id) + 1 == self.next_fresh {
            // shrink the high-water mark instead of growing the pool
            self.next_fresh -= 1;
            while self.next_fresh > u32::from(self.floor) {
                let below = (self.next_fresh - 1) as EntityId;
                if !self.free.remove(&below) {
                    break;
                }
                self.next_fresh -= 1;
            }
        } else {
            self.free.insert(id);
        }
        true
    }

    pub fn is_allocated(&self, id: EntityId) -> bool {
        id >= self.floor && self.live.get(id as usize).map_or(false, |bit| *bit)
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Ids still available for allocation
    pub fn remaining(&self) -> usize {
        (u32::from(self.ceiling) - u32::from(self.floor) + 1) as usize - self.live_count
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(IdConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(floor: EntityId, ceiling: EntityId) -> IdAllocator {
        IdAllocator::new(IdConfig {
            floor,
            ceiling,
            release_delay_ticks: 0,
        })
    }

    #[test]
    fn test_starts_at_floor() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.allocate().unwrap(), DEFAULT_ID_FLOOR);
        assert_eq!(ids.allocate().unwrap(), DEFAULT_ID_FLOOR + 1);
        assert_eq!(ids.live_count(), 2);
    }

    #[test]
    fn test_reuses_smallest_released() {
        let mut ids = small(1, 100);
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        let c = ids.allocate().unwrap();
        let _d = ids.allocate().unwrap();
        assert!(ids.release(c));
        assert!(ids.release(a));
        assert_eq!(ids.allocate().unwrap(), a);
        assert_eq!(ids.allocate().unwrap(), c);
        assert!(ids.is_allocated(b));
    }

    #[test]
    fn test_release_top_shrinks_high_water() {
        let mut ids = small(1, 100);
        let a = ids.allocate().unwrap();
        let b = ids.allocate().unwrap();
        let c = ids.allocate().unwrap();
        ids.release(b);
        ids.release(c);
        // b and c both folded back into the fresh range
        assert!(ids.free.is_empty());
        assert_eq!(ids.allocate().unwrap(), b);
        assert_eq!(a, 1);
    }

    #[test]
    fn test_exhaustion_is_distinct_error() {
        let mut ids = small(5, 7);
        for _ in 0..3 {
            ids.allocate().unwrap();
        }
        assert_eq!(
            ids.allocate(),
            Err(IdError::Exhausted {
                floor: 5,
                ceiling: 7
            })
        );
        assert_eq!(ids.remaining(), 0);
        ids.release(6);
        assert_eq!(ids.allocate(), Ok(6));
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut ids = small(1, 10);
        let a = ids.allocate().unwrap();
        let _b = ids.allocate().unwrap();
        assert!(ids.release(a));
        assert!(!ids.release(a));
        assert!(!ids.release(0));
        assert!(!ids.release(9));
        assert_eq!(ids.live_count(), 1);
        // a is handed out exactly once
        assert_eq!(ids.allocate().unwrap(), a);
        assert_eq!(ids.allocate().unwrap(), 3);
    }

    #[test]
    fn test_never_issues_live_id() {
        use std::collections::HashSet;
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut ids = small(16, 200);
        let mut held: HashSet<EntityId> = HashSet::new();
        for _ in 0..5_000 {
            if held.is_empty() || rng.gen_bool(0.55) {
                if let Ok(id) = ids.allocate() {
                    assert!(held.insert(id), "id {} issued twice", id);
                }
            } else {
                let victim = *held.iter().next().unwrap();
                held.remove(&victim);
                assert!(ids.release(victim));
            }
            assert_eq!(ids.live_count(), held.len());
        }
    }
}
