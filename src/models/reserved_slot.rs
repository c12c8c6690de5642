//! One raster-tick-sized claim against an allocation.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{AllocationId, ReservationToken};

/// A reserved raster block.
///
/// `(resource, start)` is the composite uniqueness key: because all starts
/// are rasterized, two parties claiming overlapping time produce the same
/// key and the second insert fails. The slot references the claimed
/// allocation (master or mirror) and the owning reservation's token.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedSlot {
    /// The claimed allocation's resource key.
    pub resource: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub allocation_id: AllocationId,
    pub reservation_token: ReservationToken,
}
