use crate::firestore::model::TargetId;

/// Hands out target ids from one of two disjoint sequences.
///
/// Ids for cached query targets are even; ids for limbo resolution targets
/// owned by the sync engine are odd, so the two never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids, continuing after `highest_target_id` (2 when nothing was allocated).
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let seed = highest_target_id.max(0);
        Self {
            last_id: seed - seed % 2,
        }
    }

    /// Odd ids starting at 1.
    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}
