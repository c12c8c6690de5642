use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Allocation, AllocationId, Recurrence, RecurrenceId, Reservation, ReservationId,
    ReservationStatus, ReservationToken, ReservedSlot,
};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
mod tests;

/// Storage trait for the engine's row kinds.
///
/// Every method is an individually atomic operation; the scheduler composes
/// them inside its per-resource critical section. Implementations enforce
/// the `(resource, start)` uniqueness of allocations and reserved slots and
/// report violations as [`crate::ReservationError::TryAgain`], the
/// distinguished conflicting-write condition.
///
/// The `resource` argument always means the owning master's key
/// (`mirror_of`); it scopes a query to everything one scheduler manages.
pub trait Storage: Send + Sync {
    /// Insert allocation rows (masters or lazily materialized mirrors).
    ///
    /// # Errors
    /// - `TryAgain` if a row with the same `(resource, start)` exists
    fn insert_allocations(
        &self,
        allocations: Vec<Allocation>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Persist changed fields of existing allocation rows.
    ///
    /// # Errors
    /// - `InvalidAllocation` if any row does not exist
    fn update_allocations(
        &self,
        allocations: Vec<Allocation>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete allocation rows by id. Missing ids are ignored.
    fn delete_allocations(
        &self,
        ids: Vec<AllocationId>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Get one managed allocation by row id.
    ///
    /// # Errors
    /// - `InvalidAllocation` if no managed allocation has this id
    fn allocation_by_id(
        &self,
        resource: Uuid,
        id: AllocationId,
    ) -> impl Future<Output = Result<Allocation>> + Send;

    /// Managed allocations whose span intersects `[start, end]`, ordered by
    /// start. `masters_only` restricts the result to master rows.
    fn allocations_in_range(
        &self,
        resource: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        masters_only: bool,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Managed allocations belonging to any of the given groups, ordered by
    /// start.
    fn allocations_by_groups(
        &self,
        resource: Uuid,
        groups: &[Uuid],
        masters_only: bool,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Managed master allocations linked to the given recurrence.
    fn allocations_by_recurrence(
        &self,
        resource: Uuid,
        recurrence_id: RecurrenceId,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// The persisted master + mirror set of one timespan: all managed
    /// allocations starting exactly at `start`.
    fn siblings(
        &self,
        resource: Uuid,
        start: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Allocation>>> + Send;

    /// Number of managed master allocations in the given group.
    fn group_member_count(
        &self,
        resource: Uuid,
        group: Uuid,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Insert reserved slots.
    ///
    /// # Errors
    /// - `TryAgain` if any `(resource, start)` key is already claimed
    fn insert_slots(&self, slots: Vec<ReservedSlot>) -> impl Future<Output = Result<()>> + Send;

    /// All slots claimed against one allocation row.
    fn slots_by_allocation(
        &self,
        id: AllocationId,
    ) -> impl Future<Output = Result<Vec<ReservedSlot>>> + Send;

    /// All managed slots belonging to a reservation token.
    fn slots_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> impl Future<Output = Result<Vec<ReservedSlot>>> + Send;

    /// Delete all managed slots of a reservation token. Returns the number
    /// of removed slots.
    fn delete_slots_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Atomically swap every managed slot of a reservation token for a new
    /// claim, materializing any mirror rows the claim needs. Either the
    /// whole swap applies or nothing does, so the token never sits without
    /// slots. Returns the number of removed slots.
    ///
    /// # Errors
    /// - `TryAgain` if a new slot or mirror key is already taken by
    ///   someone else
    fn replace_slots(
        &self,
        resource: Uuid,
        token: ReservationToken,
        new_mirrors: Vec<Allocation>,
        slots: Vec<ReservedSlot>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Atomically re-point every slot of one allocation at another
    /// allocation row, keeping start and end. Used by quota reorganization;
    /// a single bulk move per allocation avoids aliasing when keys swap.
    fn relocate_slots(
        &self,
        from: AllocationId,
        to: AllocationId,
        to_resource: Uuid,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Insert reservation rows.
    fn insert_reservations(
        &self,
        reservations: Vec<Reservation>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Persist changed fields of existing reservation rows.
    ///
    /// # Errors
    /// - `InvalidReservation` if any row does not exist
    fn update_reservations(
        &self,
        reservations: Vec<Reservation>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete reservation rows by id. Returns the number of removed rows.
    fn delete_reservations(
        &self,
        ids: Vec<ReservationId>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Managed reservation rows sharing a token, ordered by creation.
    fn reservations_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> impl Future<Output = Result<Vec<Reservation>>> + Send;

    /// Managed reservations targeting any of the given group identifiers,
    /// optionally restricted by status.
    fn reservations_by_target(
        &self,
        resource: Uuid,
        targets: &[Uuid],
        status: Option<ReservationStatus>,
    ) -> impl Future<Output = Result<Vec<Reservation>>> + Send;

    /// Insert a recurrence grouping.
    fn insert_recurrence(
        &self,
        recurrence: Recurrence,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete recurrences of the resource that no allocation references
    /// anymore. Returns the number of swept rows.
    fn sweep_recurrences(&self, resource: Uuid) -> impl Future<Output = Result<usize>> + Send;

    /// Remove every trace of a resource: reservations, slots, allocations
    /// and recurrences.
    fn extinguish(&self, resource: Uuid) -> impl Future<Output = Result<()>> + Send;
}
