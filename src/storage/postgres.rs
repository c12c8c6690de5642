//! PostgreSQL storage implementation.
//!
//! Production backend using a sqlx connection pool. The schema's unique keys
//! on `(resource, start_at)` back up the engine's overlap guarantees at the
//! database level; unique violations and serialization failures surface as
//! [`crate::ReservationError::TryAgain`] via the error conversion.
//!
//! Multi-row writes run in one transaction so a failed batch leaves nothing
//! behind.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::models::{
    Allocation, AllocationId, Recurrence, RecurrenceId, Reservation, ReservationId,
    ReservationStatus, ReservationToken, ReservedSlot, TargetType,
};

use super::Storage;

/// PostgreSQL storage backend.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Create a new instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ReservationError::Other(e.into()))
    }
}

fn allocation_from_row(row: &PgRow) -> Result<Allocation> {
    Ok(Allocation::from_storage(
        AllocationId::from(row.try_get::<Uuid, _>("id")?),
        row.try_get("resource")?,
        row.try_get("mirror_of")?,
        row.try_get("group_id")?,
        row.try_get::<Option<Uuid>, _>("recurrence_id")?
            .map(RecurrenceId::from),
        row.try_get("start_at")?,
        row.try_get("end_at")?,
        row.try_get::<i32, _>("raster")? as u32,
        row.try_get::<i32, _>("quota")? as u32,
        row.try_get("partly_available")?,
        row.try_get("approve_manually")?,
        row.try_get::<i32, _>("reservation_quota_limit")? as u32,
        row.try_get("whole_day")?,
    ))
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation> {
    Ok(Reservation {
        id: ReservationId::from(row.try_get::<Uuid, _>("id")?),
        token: ReservationToken::from(row.try_get::<Uuid, _>("token")?),
        target: row.try_get("target")?,
        target_type: row.try_get("target_type")?,
        resource: row.try_get("resource")?,
        start: row.try_get("start_at")?,
        end: row.try_get("end_at")?,
        status: row.try_get("status")?,
        data: row.try_get("data")?,
        email: row.try_get("email")?,
        quota: row.try_get::<i32, _>("quota")? as u32,
        rrule: row.try_get("rrule")?,
        created: row.try_get("created")?,
        modified: row.try_get("modified")?,
    })
}

fn slot_from_row(row: &PgRow) -> Result<ReservedSlot> {
    Ok(ReservedSlot {
        resource: row.try_get("resource")?,
        start: row.try_get("start_at")?,
        end: row.try_get("end_at")?,
        allocation_id: AllocationId::from(row.try_get::<Uuid, _>("allocation_id")?),
        reservation_token: ReservationToken::from(row.try_get::<Uuid, _>("reservation_token")?),
    })
}

const SELECT_ALLOCATION: &str = "SELECT id, resource, mirror_of, group_id, recurrence_id, \
     start_at, end_at, raster, quota, partly_available, approve_manually, \
     reservation_quota_limit, whole_day FROM allocations";

const SELECT_RESERVATION: &str = "SELECT id, token, target, target_type, resource, start_at, \
     end_at, status, data, email, quota, rrule, created, modified FROM reservations";

const SELECT_SLOT: &str =
    "SELECT resource, start_at, end_at, allocation_id, reservation_token FROM reserved_slots";

impl Storage for PgStorage {
    async fn insert_allocations(&self, allocations: Vec<Allocation>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for allocation in allocations {
            sqlx::query(
                "INSERT INTO allocations (id, resource, mirror_of, group_id, recurrence_id, \
                 start_at, end_at, raster, quota, partly_available, approve_manually, \
                 reservation_quota_limit, whole_day) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(allocation.id.as_uuid())
            .bind(allocation.resource)
            .bind(allocation.mirror_of)
            .bind(allocation.group)
            .bind(allocation.recurrence_id.map(|id| id.as_uuid()))
            .bind(allocation.start())
            .bind(allocation.end())
            .bind(allocation.raster() as i32)
            .bind(allocation.quota as i32)
            .bind(allocation.partly_available)
            .bind(allocation.approve_manually)
            .bind(allocation.reservation_quota_limit as i32)
            .bind(allocation.whole_day)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_allocations(&self, allocations: Vec<Allocation>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for allocation in allocations {
            let updated = sqlx::query(
                "UPDATE allocations SET resource = $2, mirror_of = $3, group_id = $4, \
                 recurrence_id = $5, start_at = $6, end_at = $7, quota = $8, \
                 partly_available = $9, approve_manually = $10, \
                 reservation_quota_limit = $11, whole_day = $12 WHERE id = $1",
            )
            .bind(allocation.id.as_uuid())
            .bind(allocation.resource)
            .bind(allocation.mirror_of)
            .bind(allocation.group)
            .bind(allocation.recurrence_id.map(|id| id.as_uuid()))
            .bind(allocation.start())
            .bind(allocation.end())
            .bind(allocation.quota as i32)
            .bind(allocation.partly_available)
            .bind(allocation.approve_manually)
            .bind(allocation.reservation_quota_limit as i32)
            .bind(allocation.whole_day)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                return Err(ReservationError::InvalidAllocation);
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_allocations(&self, ids: Vec<AllocationId>) -> Result<()> {
        let ids: Vec<Uuid> = ids.into_iter().map(|id| id.as_uuid()).collect();

        sqlx::query("DELETE FROM allocations WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn allocation_by_id(&self, resource: Uuid, id: AllocationId) -> Result<Allocation> {
        let row = sqlx::query(&format!(
            "{SELECT_ALLOCATION} WHERE mirror_of = $1 AND id = $2"
        ))
        .bind(resource)
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => allocation_from_row(&row),
            None => Err(ReservationError::InvalidAllocation),
        }
    }

    async fn allocations_in_range(
        &self,
        resource: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        masters_only: bool,
    ) -> Result<Vec<Allocation>> {
        let mut sql = format!(
            "{SELECT_ALLOCATION} WHERE mirror_of = $1 AND \
             ((start_at <= $2 AND $2 <= end_at) OR ($2 <= start_at AND start_at <= $3))"
        );
        if masters_only {
            sql.push_str(" AND resource = mirror_of");
        }
        sql.push_str(" ORDER BY start_at, resource");

        let rows = sqlx::query(&sql)
            .bind(resource)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn allocations_by_groups(
        &self,
        resource: Uuid,
        groups: &[Uuid],
        masters_only: bool,
    ) -> Result<Vec<Allocation>> {
        let mut sql = format!("{SELECT_ALLOCATION} WHERE mirror_of = $1 AND group_id = ANY($2)");
        if masters_only {
            sql.push_str(" AND resource = mirror_of");
        }
        sql.push_str(" ORDER BY start_at, resource");

        let rows = sqlx::query(&sql)
            .bind(resource)
            .bind(groups)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn allocations_by_recurrence(
        &self,
        resource: Uuid,
        recurrence_id: RecurrenceId,
    ) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ALLOCATION} WHERE mirror_of = $1 AND recurrence_id = $2 \
             ORDER BY start_at, resource"
        ))
        .bind(resource)
        .bind(recurrence_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn siblings(&self, resource: Uuid, start: DateTime<Utc>) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_ALLOCATION} WHERE mirror_of = $1 AND start_at = $2 \
             ORDER BY start_at, resource"
        ))
        .bind(resource)
        .bind(start)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(allocation_from_row).collect()
    }

    async fn group_member_count(&self, resource: Uuid, group: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM allocations \
             WHERE mirror_of = $1 AND group_id = $2 AND resource = mirror_of",
        )
        .bind(resource)
        .bind(group)
        .fetch_one(&self.pool)
        .await?;

        Ok(count as usize)
    }

    async fn insert_slots(&self, slots: Vec<ReservedSlot>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for slot in slots {
            sqlx::query(
                "INSERT INTO reserved_slots (resource, start_at, end_at, allocation_id, \
                 reservation_token) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(slot.resource)
            .bind(slot.start)
            .bind(slot.end)
            .bind(slot.allocation_id.as_uuid())
            .bind(slot.reservation_token.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn slots_by_allocation(&self, id: AllocationId) -> Result<Vec<ReservedSlot>> {
        let rows = sqlx::query(&format!(
            "{SELECT_SLOT} WHERE allocation_id = $1 ORDER BY start_at"
        ))
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(slot_from_row).collect()
    }

    async fn slots_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> Result<Vec<ReservedSlot>> {
        let rows = sqlx::query(
            "SELECT s.resource, s.start_at, s.end_at, s.allocation_id, s.reservation_token \
             FROM reserved_slots s JOIN allocations a ON a.id = s.allocation_id \
             WHERE a.mirror_of = $1 AND s.reservation_token = $2 \
             ORDER BY s.start_at, s.resource",
        )
        .bind(resource)
        .bind(token.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(slot_from_row).collect()
    }

    async fn delete_slots_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> Result<usize> {
        let deleted = sqlx::query(
            "DELETE FROM reserved_slots s USING allocations a \
             WHERE a.id = s.allocation_id AND a.mirror_of = $1 AND s.reservation_token = $2",
        )
        .bind(resource)
        .bind(token.as_uuid())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted as usize)
    }

    async fn replace_slots(
        &self,
        resource: Uuid,
        token: ReservationToken,
        new_mirrors: Vec<Allocation>,
        slots: Vec<ReservedSlot>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            "DELETE FROM reserved_slots s USING allocations a \
             WHERE a.id = s.allocation_id AND a.mirror_of = $1 AND s.reservation_token = $2",
        )
        .bind(resource)
        .bind(token.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for mirror in new_mirrors {
            sqlx::query(
                "INSERT INTO allocations (id, resource, mirror_of, group_id, recurrence_id, \
                 start_at, end_at, raster, quota, partly_available, approve_manually, \
                 reservation_quota_limit, whole_day) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(mirror.id.as_uuid())
            .bind(mirror.resource)
            .bind(mirror.mirror_of)
            .bind(mirror.group)
            .bind(mirror.recurrence_id.map(|id| id.as_uuid()))
            .bind(mirror.start())
            .bind(mirror.end())
            .bind(mirror.raster() as i32)
            .bind(mirror.quota as i32)
            .bind(mirror.partly_available)
            .bind(mirror.approve_manually)
            .bind(mirror.reservation_quota_limit as i32)
            .bind(mirror.whole_day)
            .execute(&mut *tx)
            .await?;
        }

        for slot in slots {
            sqlx::query(
                "INSERT INTO reserved_slots (resource, start_at, end_at, allocation_id, \
                 reservation_token) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(slot.resource)
            .bind(slot.start)
            .bind(slot.end)
            .bind(slot.allocation_id.as_uuid())
            .bind(slot.reservation_token.as_uuid())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn relocate_slots(
        &self,
        from: AllocationId,
        to: AllocationId,
        to_resource: Uuid,
    ) -> Result<usize> {
        let moved = sqlx::query(
            "UPDATE reserved_slots SET allocation_id = $2, resource = $3 WHERE allocation_id = $1",
        )
        .bind(from.as_uuid())
        .bind(to.as_uuid())
        .bind(to_resource)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(moved as usize)
    }

    async fn insert_reservations(&self, reservations: Vec<Reservation>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for reservation in reservations {
            sqlx::query(
                "INSERT INTO reservations (id, token, target, target_type, resource, start_at, \
                 end_at, status, data, email, quota, rrule, created, modified) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(reservation.id.as_uuid())
            .bind(reservation.token.as_uuid())
            .bind(reservation.target)
            .bind(reservation.target_type)
            .bind(reservation.resource)
            .bind(reservation.start)
            .bind(reservation.end)
            .bind(reservation.status)
            .bind(reservation.data)
            .bind(reservation.email)
            .bind(reservation.quota as i32)
            .bind(reservation.rrule)
            .bind(reservation.created)
            .bind(reservation.modified)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_reservations(&self, reservations: Vec<Reservation>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for reservation in reservations {
            let updated = sqlx::query(
                "UPDATE reservations SET token = $2, target = $3, target_type = $4, \
                 start_at = $5, end_at = $6, status = $7, data = $8, email = $9, quota = $10, \
                 rrule = $11, modified = $12 WHERE id = $1",
            )
            .bind(reservation.id.as_uuid())
            .bind(reservation.token.as_uuid())
            .bind(reservation.target)
            .bind(reservation.target_type)
            .bind(reservation.start)
            .bind(reservation.end)
            .bind(reservation.status)
            .bind(reservation.data)
            .bind(reservation.email)
            .bind(reservation.quota as i32)
            .bind(reservation.rrule)
            .bind(reservation.modified)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                return Err(ReservationError::InvalidReservation);
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_reservations(&self, ids: Vec<ReservationId>) -> Result<usize> {
        let ids: Vec<Uuid> = ids.into_iter().map(|id| id.as_uuid()).collect();

        let deleted = sqlx::query("DELETE FROM reservations WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted as usize)
    }

    async fn reservations_by_token(
        &self,
        resource: Uuid,
        token: ReservationToken,
    ) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_RESERVATION} WHERE resource = $1 AND token = $2 ORDER BY created, id"
        ))
        .bind(resource)
        .bind(token.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(reservation_from_row).collect()
    }

    async fn reservations_by_target(
        &self,
        resource: Uuid,
        targets: &[Uuid],
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>> {
        let mut sql = format!("{SELECT_RESERVATION} WHERE resource = $1 AND target = ANY($2)");
        if status.is_some() {
            sql.push_str(" AND status = $3");
        }
        sql.push_str(" ORDER BY created, id");

        let mut query = sqlx::query(&sql).bind(resource).bind(targets);
        if let Some(status) = status {
            query = query.bind(status);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn insert_recurrence(&self, recurrence: Recurrence) -> Result<()> {
        sqlx::query("INSERT INTO recurrences (id, resource, rrule) VALUES ($1, $2, $3)")
            .bind(recurrence.id.as_uuid())
            .bind(recurrence.resource)
            .bind(recurrence.rrule)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn sweep_recurrences(&self, resource: Uuid) -> Result<usize> {
        let swept = sqlx::query(
            "DELETE FROM recurrences r WHERE r.resource = $1 AND NOT EXISTS \
             (SELECT 1 FROM allocations a WHERE a.recurrence_id = r.id)",
        )
        .bind(resource)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(swept as usize)
    }

    async fn extinguish(&self, resource: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM reserved_slots s USING allocations a \
             WHERE a.id = s.allocation_id AND a.mirror_of = $1",
        )
        .bind(resource)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM reservations WHERE resource = $1")
            .bind(resource)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM allocations WHERE mirror_of = $1")
            .bind(resource)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM recurrences WHERE resource = $1")
            .bind(resource)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // Helper to create a test pool (requires DATABASE_URL env var)
    async fn create_test_storage() -> PgStorage {
        let database_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        let storage = PgStorage::new(pool);
        storage.migrate().await.expect("Failed to run migrations");
        storage
    }

    #[tokio::test]
    #[ignore] // Run with: cargo test -- --ignored
    async fn test_insert_and_query_allocations() {
        let storage = create_test_storage().await;
        let resource = Uuid::new_v4();

        let start = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let allocation =
            Allocation::new(resource, Uuid::new_v4(), start, end, 15).unwrap();

        storage
            .insert_allocations(vec![allocation.clone()])
            .await
            .unwrap();

        let found = storage
            .allocations_in_range(resource, start, end, true)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, allocation.id);

        // same key again must surface as the retry condition
        let mut duplicate = allocation.clone();
        duplicate.id = AllocationId::new();
        let result = storage.insert_allocations(vec![duplicate]).await;
        assert!(matches!(result, Err(ReservationError::TryAgain)));
    }
}
