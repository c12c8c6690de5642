//! Domain events emitted by the scheduler.
//!
//! The engine never renders notifications itself; it hands the affected
//! entities plus the scheduler's language tag to whoever subscribed. Events
//! are sent on a broadcast channel after the mutation succeeded; a lagging
//! or absent subscriber never affects the operation.

use chrono::{DateTime, Utc};

use crate::models::{Allocation, Reservation, ReservedSlot};

/// One domain event, carrying the affected entities and the language the
/// outgoing notification should use.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    AllocationsAdded {
        allocations: Vec<Allocation>,
        language: String,
    },
    ReservationsMade {
        reservations: Vec<Reservation>,
        language: String,
    },
    ReservationsApproved {
        reservations: Vec<Reservation>,
        language: String,
    },
    ReservationsDenied {
        reservations: Vec<Reservation>,
        language: String,
    },
    ReservationsRevoked {
        reservations: Vec<Reservation>,
        /// Operator-supplied reason, passed through to the notification.
        reason: String,
        language: String,
    },
    ReservationTimeChanged {
        reservation: Reservation,
        old_span: (DateTime<Utc>, DateTime<Utc>),
        new_span: (DateTime<Utc>, DateTime<Utc>),
        reason: String,
        language: String,
    },
    SlotsCreated {
        slots: Vec<ReservedSlot>,
        language: String,
    },
    SlotsRemoved {
        count: usize,
        language: String,
    },
    SlotsMoved {
        count: usize,
        language: String,
    },
}
