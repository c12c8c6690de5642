//! Persisted entities of the engine.
//!
//! Three row kinds carry all state: [`Allocation`] (a bookable timespan),
//! [`Reservation`] (a pending or approved booking) and [`ReservedSlot`]
//! (one raster-tick-sized claim against an allocation). [`Recurrence`] rows
//! merely group separately bookable allocations created together.

use uuid::Uuid;

pub mod allocation;
pub mod recurrence;
pub mod reservation;
pub mod reserved_slot;

pub use allocation::Allocation;
pub use recurrence::Recurrence;
pub use reservation::{Reservation, ReservationStatus, TargetType};
pub use reserved_slot::ReservedSlot;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[cfg_attr(feature = "postgres", derive(sqlx::Type), sqlx(transparent))]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Row identity of an allocation. Distinct from the allocation's
    /// `resource` key, which is derived for mirrors.
    AllocationId
}

uuid_id! {
    /// Row identity of a reservation. Several reservation rows may share one
    /// token (one row per targeted timespan).
    ReservationId
}

uuid_id! {
    /// Row identity of a recurrence grouping.
    RecurrenceId
}

uuid_id! {
    /// The caller-facing handle of a reservation, returned by `reserve` and
    /// accepted by approve/deny/revoke/remove.
    ReservationToken
}
