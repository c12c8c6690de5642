use thiserror::Error;

use crate::models::ReservationToken;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ReservationError>;

/// Everything that can go wrong while allocating or reserving.
///
/// Every variant is raised synchronously from inside the critical section
/// that detected it; nothing is retried internally. The engine reports error
/// kinds only, user-facing text is the caller's concern.
#[derive(Debug, Error)]
pub enum ReservationError {
    /// A new allocation collides with an existing master on the resource.
    #[error("allocation {start} - {end} overlaps an existing allocation")]
    OverlappingAllocation {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },

    /// No free spot among master and mirrors, or fewer free spots than the
    /// requested quantity.
    #[error("the requested period is no longer available")]
    AlreadyReserved,

    /// The change would invalidate an approved reservation.
    #[error("the change would affect an existing reservation")]
    AffectedReservation,

    /// The change would invalidate a pending reservation.
    #[error("the change would affect a pending reservation")]
    AffectedPendingReservation,

    /// Reservations spanning a day or more are rejected.
    #[error("reservations must be shorter than 24 hours")]
    ReservationTooLong,

    /// Inverted or sub-five-minute spans.
    #[error("invalid reservation timespan")]
    ReservationParametersInvalid,

    /// The span is not fully covered by exactly one master allocation, or
    /// approval found nothing to claim.
    #[error("the requested period is not reservable")]
    NotReservable,

    /// The requested quantity exceeds the allocation's reservation limit.
    #[error("the requested quantity exceeds the reservation limit")]
    QuotaOverLimit,

    /// The requested quantity exceeds the allocation's quota.
    #[error("the allocation cannot hold the requested quantity")]
    QuotaImpossible,

    /// Quantities and quotas must be at least 1.
    #[error("quotas must be at least 1")]
    InvalidQuota,

    /// No reservation exists for the given token.
    #[error("unknown reservation token {0}")]
    InvalidReservationToken(ReservationToken),

    /// The reservation request produced nothing to reserve, or targets a
    /// reservation in the wrong state.
    #[error("invalid reservation request")]
    InvalidReservation,

    /// The allocation does not exist or its parameters are malformed.
    #[error("invalid allocation")]
    InvalidAllocation,

    /// Rejected by the email validation hook.
    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    /// A conflicting concurrent write was detected by the storage backend.
    /// Retry policy belongs to the caller; the engine never retries.
    #[error("a conflicting write occurred, try again")]
    TryAgain,

    /// Database operation failed.
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Internal error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for ReservationError {
    /// Write conflicts surface as the distinguished retry condition, all
    /// other driver errors pass through.
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            // 40001: serialization_failure, 23505: unique_violation
            if matches!(db.code().as_deref(), Some("40001") | Some("23505")) {
                return ReservationError::TryAgain;
            }
        }
        ReservationError::Database(err)
    }
}
