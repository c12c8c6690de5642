//! In-memory storage implementation.
//!
//! Stores all rows in memory behind a single read-write lock. It's the
//! reference backend: suitable for tests and single-process deployments,
//! with every trait method atomic under the table lock. Rows are lost on
//! restart.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::models::{
    Allocation, AllocationId, Recurrence, RecurrenceId, Reservation, ReservationId,
    ReservationStatus, ReservationToken, ReservedSlot,
};

use super::Storage;

#[derive(Default)]
struct Tables {
    allocations: HashMap<AllocationId, Allocation>,
    // keyed by the composite uniqueness key
    slots: HashMap<(Uuid, DateTime<Utc>), ReservedSlot>,
    reservations: HashMap<ReservationId, Reservation>,
    recurrences: HashMap<RecurrenceId, Recurrence>,
}

/// In-memory implementation of the [`Storage`] trait.
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    /// Create an empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_start(mut allocations: Vec<Allocation>) -> Vec<Allocation> {
    allocations.sort_by_key(|a| (a.start(), a.resource));
    allocations
}

impl Storage for InMemoryStorage {
    async fn insert_allocations(&self, allocations: Vec<Allocation>) -> Result<()> {
        let mut tables = self.tables.write();

        for (ix, allocation) in allocations.iter().enumerate() {
            let duplicate = tables
                .allocations
                .values()
                .chain(allocations[..ix].iter())
                .any(|a| a.resource == allocation.resource && a.start() == allocation.start());

            if duplicate {
                return Err(ReservationError::TryAgain);
            }
        }

        for allocation in allocations {
            tables.allocations.insert(allocation.id, allocation);
        }

        Ok(())
    }

    async fn update_allocations(&self, allocations: Vec<Allocation>) -> Result<()> {
        let mut tables = self.tables.write();

        for allocation in allocations {
            match tables.allocations.get_mut(&allocation.id) {
                Some(existing) => *existing = allocation,
                None => return Err(ReservationError::InvalidAllocation),
            }
        }

        Ok(())
    }

    async fn delete_allocations(&self, ids: Vec<AllocationId>) -> Result<()> {
        let mut tables = self.tables.write();

        for id in ids {
            tables.allocations.remove(&id);
        }

        Ok(())
    }

    async fn allocation_by_id(&self, resource: Uuid, id: AllocationId) -> Result<Allocation> {
        let tables = self.tables.read();

        tables
            .allocations
            .get(&id)
            .filter(|a| a.mirror_of == resource)
            .cloned()
            .ok_or(ReservationError::InvalidAllocation)
    }

    async fn allocations_in_range(
        &self,
        resource: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        masters_only: bool,
    ) -> Result<Vec<Allocation>> {
        let tables = self.tables.read();

        let matching = tables
            .allocations
            .values()
            .filter(|a| a.mirror_of == resource)
            .filter(|a| !masters_only || a.is_master())
            .filter(|a| {
                (a.start() <= start && start <= a.end())
                    || (start <= a.start() && a.start() <= end)
            })
            .cloned()
            .collect();

        Ok(sorted_by_start(matching))
    }

    async fn allocations_by_groups(
        &self,
        resource: Uuid,
        groups: &[Uuid],
        masters_only: bool,
    ) -> Result<Vec<Allocation>> {
        let tables = self.tables.read();

        let matching = tables
            .allocations
            .values()
            .filter(|a| a.mirror_of == resource)
            .filter(|a| !masters_only || a.is_master())
            .filter(|a| groups.contains(&a.group))
            .cloned()
            .collect();

        Ok(sorted_by_start(matching))
    }

    async fn allocations_by_recurrence(
        &self,
        resource: Uuid,
        recurrence_id: RecurrenceId,
    ) -> Result<Vec<Allocation>> {
        let tables = self.tables.read();

        let matching = tables
            .allocations
            .values()
            .filter(|a| a.mirror_of == resource && a.recurrence_id == Some(recurrence_id))
            .cloned()
            .collect();

        Ok(sorted_by_start(matching))
    }

    async fn siblings(&self, resource: Uuid, start: DateTime<Utc>) -> Result<Vec<Allocation>> {
        let tables = self.tables.read();

        let matching = tables
            .allocations
            .values()
            .filter(|a| a.mirror_of == resource && a.start() == start)
            .cloned()
            .collect();

        Ok(sorted_by_start(matching))
    }

    async fn group_member_count(&self, resource: Uuid, group: Uuid) -> Result<usize> {
        let tables = self.tables.read();

        Ok(tables
            .allocations
            .values()
            .filter(|a| a.mirror_of == resource && a.group == group && a.is_master())
            .count())
    }

    async fn insert_slots(&self, slots: Vec<ReservedSlot>) -> Result<()> {
        let mut tables = self.tables.write();

        for (ix, slot) in slots.iter().enumerate() {
            let key_taken = tables.slots.contains_key(&(slot.resource, slot.start))
                || slots[..ix]
                    .iter()
                    .any(|s| s.resource == slot.resource && s.start == slot.start);

            if key_taken {
                return Err(ReservationError::TryAgain);
            }
        }

        for slot in slots {
            tables.slots.insert((slot.resource, slot.start), slot);
        }

        Ok(())
    }

    async fn slots_by_allocation(&self, id: AllocationId) -> Result<Vec<ReservedSlot>> {
        let tables = self.tables.read();

        let mut slots: Vec<_> = tables
            .slots
            .values()
            .filter(|s| s.allocation_id == id)
            .cloned()
            .collect();

        slots.sort_by_key(|s| s.start);
        Ok(slots)
    }

    async fn slots_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> Result<Vec<ReservedSlot>> {
        let tables = self.tables.read();

        let mut slots: Vec<_> = tables
            .slots
            .values()
            .filter(|s| s.reservation_token == token)
            .filter(|s| {
                tables
                    .allocations
                    .get(&s.allocation_id)
                    .is_some_and(|a| a.mirror_of == resource)
            })
            .cloned()
            .collect();

        slots.sort_by_key(|s| (s.start, s.resource));
        Ok(slots)
    }

    async fn delete_slots_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> Result<usize> {
        let mut tables = self.tables.write();

        let keys: Vec<_> = tables
            .slots
            .values()
            .filter(|s| s.reservation_token == token)
            .filter(|s| {
                tables
                    .allocations
                    .get(&s.allocation_id)
                    .is_some_and(|a| a.mirror_of == resource)
            })
            .map(|s| (s.resource, s.start))
            .collect();

        for key in &keys {
            tables.slots.remove(key);
        }

        Ok(keys.len())
    }

    async fn replace_slots(
        &self,
        resource: Uuid,
        token: ReservationToken,
        new_mirrors: Vec<Allocation>,
        slots: Vec<ReservedSlot>,
    ) -> Result<usize> {
        let mut tables = self.tables.write();

        let removed: Vec<_> = tables
            .slots
            .values()
            .filter(|s| s.reservation_token == token)
            .filter(|s| {
                tables
                    .allocations
                    .get(&s.allocation_id)
                    .is_some_and(|a| a.mirror_of == resource)
            })
            .map(|s| (s.resource, s.start))
            .collect();

        // everything is checked before anything moves, the lock makes the
        // swap atomic
        for mirror in &new_mirrors {
            let duplicate = tables
                .allocations
                .values()
                .any(|a| a.resource == mirror.resource && a.start() == mirror.start());
            if duplicate {
                return Err(ReservationError::TryAgain);
            }
        }

        for (ix, slot) in slots.iter().enumerate() {
            let key = (slot.resource, slot.start);
            let key_taken = (tables.slots.contains_key(&key) && !removed.contains(&key))
                || slots[..ix]
                    .iter()
                    .any(|s| s.resource == slot.resource && s.start == slot.start);

            if key_taken {
                return Err(ReservationError::TryAgain);
            }
        }

        for key in &removed {
            tables.slots.remove(key);
        }
        for mirror in new_mirrors {
            tables.allocations.insert(mirror.id, mirror);
        }
        for slot in slots {
            tables.slots.insert((slot.resource, slot.start), slot);
        }

        Ok(removed.len())
    }

    async fn relocate_slots(
        &self,
        from: AllocationId,
        to: AllocationId,
        to_resource: Uuid,
    ) -> Result<usize> {
        let mut tables = self.tables.write();

        let keys: Vec<_> = tables
            .slots
            .values()
            .filter(|s| s.allocation_id == from)
            .map(|s| (s.resource, s.start))
            .collect();

        // the destination keys must be free, reorganization moves slots
        // into allocations without any
        for (_, start) in &keys {
            if tables.slots.contains_key(&(to_resource, *start)) {
                return Err(ReservationError::TryAgain);
            }
        }

        for key in &keys {
            if let Some(mut slot) = tables.slots.remove(key) {
                slot.resource = to_resource;
                slot.allocation_id = to;
                tables.slots.insert((slot.resource, slot.start), slot);
            }
        }

        Ok(keys.len())
    }

    async fn insert_reservations(&self, reservations: Vec<Reservation>) -> Result<()> {
        let mut tables = self.tables.write();

        for reservation in reservations {
            tables.reservations.insert(reservation.id, reservation);
        }

        Ok(())
    }

    async fn update_reservations(&self, reservations: Vec<Reservation>) -> Result<()> {
        let mut tables = self.tables.write();

        for reservation in reservations {
            match tables.reservations.get_mut(&reservation.id) {
                Some(existing) => *existing = reservation,
                None => return Err(ReservationError::InvalidReservation),
            }
        }

        Ok(())
    }

    async fn delete_reservations(&self, ids: Vec<ReservationId>) -> Result<usize> {
        let mut tables = self.tables.write();

        let mut removed = 0;
        for id in ids {
            if tables.reservations.remove(&id).is_some() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn reservations_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> Result<Vec<Reservation>> {
        let tables = self.tables.read();

        let mut reservations: Vec<_> = tables
            .reservations
            .values()
            .filter(|r| r.resource == resource && r.token == token)
            .cloned()
            .collect();

        reservations.sort_by_key(|r| (r.created, r.id));
        Ok(reservations)
    }

    async fn reservations_by_target(
        &self,
        resource: Uuid,
        targets: &[Uuid],
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>> {
        let tables = self.tables.read();

        let mut reservations: Vec<_> = tables
            .reservations
            .values()
            .filter(|r| r.resource == resource && targets.contains(&r.target))
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();

        reservations.sort_by_key(|r| (r.created, r.id));
        Ok(reservations)
    }

    async fn insert_recurrence(&self, recurrence: Recurrence) -> Result<()> {
        let mut tables = self.tables.write();
        tables.recurrences.insert(recurrence.id, recurrence);
        Ok(())
    }

    async fn sweep_recurrences(&self, resource: Uuid) -> Result<usize> {
        let mut tables = self.tables.write();

        let orphaned: Vec<_> = tables
            .recurrences
            .values()
            .filter(|r| r.resource == resource)
            .filter(|r| {
                !tables
                    .allocations
                    .values()
                    .any(|a| a.recurrence_id == Some(r.id))
            })
            .map(|r| r.id)
            .collect();

        for id in &orphaned {
            tables.recurrences.remove(id);
        }

        Ok(orphaned.len())
    }

    async fn extinguish(&self, resource: Uuid) -> Result<()> {
        let mut tables = self.tables.write();

        let allocation_ids: Vec<_> = tables
            .allocations
            .values()
            .filter(|a| a.mirror_of == resource)
            .map(|a| a.id)
            .collect();

        tables
            .slots
            .retain(|_, s| !allocation_ids.contains(&s.allocation_id));
        tables.reservations.retain(|_, r| r.resource != resource);
        tables.allocations.retain(|_, a| a.mirror_of != resource);
        tables.recurrences.retain(|_, r| r.resource != resource);

        Ok(())
    }
}
