//! A pending or approved reservation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ReservationId, ReservationToken};

/// What a reservation row points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "reservation_target_type", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// All allocations of a group, no explicit dates on the row.
    Group,
    /// One specific allocation, with the reserved dates on the row.
    Allocation,
}

/// The two-phase lifecycle: `Pending -> Approved` via approve, deleted via
/// deny/revoke/remove. No other transitions exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "reservation_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Created by `reserve`; no reserved slots exist yet.
    Pending,
    /// Slots are materialized for every raster tick of every targeted
    /// interval, multiplied by the requested quantity.
    Approved,
}

/// One reservation row. Several rows may share a token when a single
/// `reserve` call targeted several timespans.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: ReservationId,
    pub token: ReservationToken,
    /// The targeted group identifier. For allocation-targeted rows this is
    /// the allocation's (single-member) group.
    pub target: Uuid,
    pub target_type: TargetType,
    pub resource: Uuid,
    /// None when targeting a group; the group members define the dates.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: ReservationStatus,
    /// Opaque caller payload, stored verbatim.
    pub data: Option<serde_json::Value>,
    pub email: String,
    /// Requested quantity of spots.
    pub quota: u32,
    /// Recurrence rule recorded with the request, if any.
    pub rrule: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn is_pending(&self) -> bool {
        self.status == ReservationStatus::Pending
    }

    /// Forms a nice pair with `display_end`.
    pub fn display_start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// The end plus the trailing microsecond, for display.
    pub fn display_end(&self) -> Option<DateTime<Utc>> {
        self.end.map(|end| end + Duration::microseconds(1))
    }
}
