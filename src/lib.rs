//! Allocation and reservation engine for bookable resources.
//!
//! Time is rasterized: spans snap to 5/10/15/30/60 minute blocks, so
//! competing reservations produce identical slot keys and conflicts reduce
//! to key collisions. An allocation with a quota of N stands for N
//! independently bookable copies of one timespan; only the first copy (the
//! master) is persisted up front, the mirrors' keys are derived and their
//! rows materialize on first claim. Reservations are two-phase: `reserve`
//! records a pending intent, `approve_reservation` claims the slots.
//!
//! The [`Scheduler`] is the entry point, one instance per resource:
//!
//! ```no_run
//! use bookable::{AllocateOptions, InMemoryStorage, ReserveRequest, Scheduler};
//! use chrono::{TimeZone, Utc};
//! use uuid::Uuid;
//!
//! # async fn demo() -> bookable::Result<()> {
//! let scheduler = Scheduler::new(InMemoryStorage::new(), Uuid::new_v4());
//!
//! let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 3, 4, 17, 0, 0).unwrap();
//! scheduler.allocate(vec![(start, end)], AllocateOptions::default()).await?;
//!
//! let token = scheduler
//!     .reserve(ReserveRequest::dates("visitor@example.org", vec![(start, end)]))
//!     .await?;
//! scheduler.approve_reservation(token).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Storage is pluggable behind the [`Storage`] trait; [`InMemoryStorage`]
//! is the reference backend, `PgStorage` (feature `postgres`, default-on)
//! the production one.

pub mod error;
pub mod events;
pub mod lock;
pub mod mirrors;
pub mod models;
pub mod raster;
pub mod scheduler;
pub mod storage;

pub use error::{ReservationError, Result};
pub use events::SchedulerEvent;
pub use lock::ResourceLocks;
pub use mirrors::Spot;
pub use models::{
    Allocation, AllocationId, Recurrence, RecurrenceId, Reservation, ReservationId,
    ReservationStatus, ReservationToken, ReservedSlot, TargetType,
};
pub use scheduler::{
    AllocateOptions, AllocationChanges, AllocationSelector, ReserveRequest, ReserveTarget,
    Scheduler,
};
pub use storage::in_memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use storage::postgres::PgStorage;
pub use storage::Storage;
