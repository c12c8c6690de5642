//! Quota reorganization.
//!
//! Shrinking a quota must not orphan a single reserved slot, so occupied
//! keys slide left onto the shortest prefix of the keylist before any row
//! disappears. Two invariants make this safe:
//!
//! - claims always go to the first free key, so persisted keys form a
//!   prefix of the keylist (rows outlive their slots, never the reverse),
//! - the mapping targets are the first `occupied.len()` keys, a subset of
//!   that persisted prefix, so every target has a row to receive the slots.
//!
//! Growing a quota only updates the number on the surviving rows; the new
//! mirrors stay virtual until something claims them.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::events::SchedulerEvent;
use crate::lock::Serializer;
use crate::mirrors::keylist;
use crate::models::{Allocation, AllocationId};
use crate::storage::Storage;

use super::Scheduler;

/// Maps each occupied key to its reorganized position: occupied keys keep
/// their relative order and compact onto the keylist's prefix.
fn reordered_keylist(keys: &[Uuid], occupied: &HashSet<Uuid>) -> Vec<(Uuid, Uuid)> {
    keys.iter()
        .copied()
        .filter(|key| occupied.contains(key))
        .zip(keys.iter().copied())
        .collect()
}

impl<S: Storage> Scheduler<S> {
    /// Change the quota of an allocation, reorganizing slots as needed.
    ///
    /// Shrinking fails with `AffectedReservation` when more keys are
    /// occupied than the new quota can hold. Otherwise occupied keys
    /// compact onto the front of the keylist, quota updates on the
    /// survivors and the vacated mirror rows are deleted. The master row
    /// is never deleted.
    #[instrument(skip_all, fields(resource = %self.resource, %id, new_quota))]
    pub async fn change_quota(&self, id: AllocationId, new_quota: u32) -> Result<()> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let master = self.storage.allocation_by_id(self.resource, id).await?;
        if !master.is_master() {
            return Err(ReservationError::InvalidAllocation);
        }

        self.change_quota_inner(&master, new_quota).await
    }

    /// The reorganization itself, callable from inside another operation's
    /// critical section.
    pub(super) async fn change_quota_inner(
        &self,
        master: &Allocation,
        new_quota: u32,
    ) -> Result<()> {
        if new_quota < 1 {
            return Err(ReservationError::InvalidQuota);
        }
        if new_quota == master.quota {
            return Ok(());
        }

        let siblings = self.storage.siblings(self.resource, master.start()).await?;

        if new_quota > master.quota {
            let grown = with_quota(siblings, new_quota);
            return self.storage.update_allocations(grown).await;
        }

        let by_key: HashMap<Uuid, &Allocation> =
            siblings.iter().map(|a| (a.resource, a)).collect();

        let mut occupied: HashSet<Uuid> = HashSet::new();
        for sibling in &siblings {
            let slots = self.storage.slots_by_allocation(sibling.id).await?;
            if !slots.is_empty() {
                occupied.insert(sibling.resource);
            }
        }

        if occupied.len() as u32 > new_quota {
            return Err(ReservationError::AffectedReservation);
        }

        let keys = keylist(self.resource, master.quota);
        let mut moved = 0;

        // left-to-right: a target is either unoccupied or vacated by an
        // earlier move before its turn comes
        for (from_key, to_key) in reordered_keylist(&keys, &occupied) {
            if from_key == to_key {
                continue;
            }

            let from = by_key.get(&from_key).ok_or(ReservationError::InvalidAllocation)?;
            let to = by_key.get(&to_key).ok_or(ReservationError::InvalidAllocation)?;

            moved += self.storage.relocate_slots(from.id, to.id, to_key).await?;
        }

        let surviving_keys: HashSet<Uuid> =
            keylist(self.resource, new_quota).into_iter().collect();
        let (kept, vacated): (Vec<Allocation>, Vec<Allocation>) = siblings
            .into_iter()
            .partition(|a| surviving_keys.contains(&a.resource));

        self.storage.update_allocations(with_quota(kept, new_quota)).await?;
        if !vacated.is_empty() {
            self.storage
                .delete_allocations(vacated.into_iter().map(|a| a.id).collect())
                .await?;
        }

        debug!(moved, "quota reorganized");
        if moved > 0 {
            self.emit(SchedulerEvent::SlotsMoved {
                count: moved,
                language: self.language.clone(),
            });
        }

        Ok(())
    }
}

fn with_quota(allocations: Vec<Allocation>, quota: u32) -> Vec<Allocation> {
    allocations
        .into_iter()
        .map(|mut a| {
            a.quota = quota;
            a
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn occupied_keys_compact_onto_the_prefix() {
        let keys = keys(5);
        let occupied: HashSet<_> = [keys[1], keys[3]].into_iter().collect();

        let mapping = reordered_keylist(&keys, &occupied);
        assert_eq!(mapping, vec![(keys[1], keys[0]), (keys[3], keys[1])]);
    }

    #[test]
    fn already_compact_keys_map_to_themselves() {
        let keys = keys(4);
        let occupied: HashSet<_> = [keys[0], keys[1]].into_iter().collect();

        let mapping = reordered_keylist(&keys, &occupied);
        assert_eq!(mapping, vec![(keys[0], keys[0]), (keys[1], keys[1])]);
    }

    #[test]
    fn relative_order_is_preserved() {
        let keys = keys(6);
        let occupied: HashSet<_> = [keys[5], keys[2], keys[4]].into_iter().collect();

        let mapping = reordered_keylist(&keys, &occupied);
        let sources: Vec<_> = mapping.iter().map(|(from, _)| *from).collect();
        let targets: Vec<_> = mapping.iter().map(|(_, to)| *to).collect();

        assert_eq!(sources, vec![keys[2], keys[4], keys[5]]);
        assert_eq!(targets, vec![keys[0], keys[1], keys[2]]);
    }

    #[test]
    fn nothing_occupied_means_nothing_to_move() {
        let keys = keys(3);
        assert!(reordered_keylist(&keys, &HashSet::new()).is_empty());
    }
}
