//! The per-resource scheduler: every allocation and reservation operation.
//!
//! A [`Scheduler`] manages exactly one resource. All mutating entry points
//! run inside the resource's critical section (see [`crate::lock`]), so the
//! reads a decision is based on never interleave with another in-process
//! writer. Storage calls are individually atomic; conflicting writes from
//! elsewhere surface as [`ReservationError::TryAgain`] and are never retried
//! here.
//!
//! Reservations are two-phase: `reserve` records the intent as a pending
//! row without claiming any slot, `approve_reservation` materializes the
//! slots. Allocations with `approve_manually` unset skip nothing at approval
//! time; they merely get a capacity check already at `reserve`, so callers
//! can approve immediately without surprises.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::events::SchedulerEvent;
use crate::lock::Serializer;
use crate::mirrors::{keylist, virtual_mirror, Spot};
use crate::models::{
    Allocation, AllocationId, Recurrence, RecurrenceId, Reservation, ReservationId,
    ReservationStatus, ReservationToken, ReservedSlot, TargetType,
};
use crate::raster::{is_valid_raster, rasterize_span, MIN_RASTER_VALUE};
use crate::storage::Storage;

mod quota;


/// Options for [`Scheduler::allocate`].
#[derive(Debug, Clone)]
pub struct AllocateOptions {
    /// Raster granularity in minutes. Ignored (forced to the minimum) when
    /// the allocation is not partly available, since slot keys of whole
    /// allocations never depend on it.
    pub raster: u32,
    pub quota: u32,
    pub partly_available: bool,
    /// All dates share one group and are reserved all-or-nothing.
    pub grouped: bool,
    pub approve_manually: bool,
    /// Upper bound for the quantity of a single reservation, 0 for no limit.
    pub reservation_quota_limit: u32,
    /// Align every date pair to full days before rasterizing.
    pub whole_day: bool,
    /// Recurrence rule to record when several ungrouped dates are created.
    pub rrule: Option<String>,
}

impl Default for AllocateOptions {
    fn default() -> Self {
        AllocateOptions {
            raster: 15,
            quota: 1,
            partly_available: false,
            grouped: false,
            approve_manually: true,
            reservation_quota_limit: 0,
            whole_day: false,
            rrule: None,
        }
    }
}

/// What a [`ReserveRequest`] points at.
#[derive(Debug, Clone)]
pub enum ReserveTarget {
    /// One or more timespans, each covered by exactly one allocation.
    Dates(Vec<(DateTime<Utc>, DateTime<Utc>)>),
    /// A whole allocation group, reserved all-or-nothing.
    Group(Uuid),
}

/// A reservation request, handed to [`Scheduler::reserve`].
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub email: String,
    pub target: ReserveTarget,
    /// Opaque caller payload, stored verbatim.
    pub data: Option<serde_json::Value>,
    /// Requested quantity of spots.
    pub quota: u32,
    /// Recurrence rule recorded with the request, if any.
    pub rrule: Option<String>,
}

impl ReserveRequest {
    pub fn dates(email: &str, dates: Vec<(DateTime<Utc>, DateTime<Utc>)>) -> Self {
        ReserveRequest {
            email: email.into(),
            target: ReserveTarget::Dates(dates),
            data: None,
            quota: 1,
            rrule: None,
        }
    }

    pub fn group(email: &str, group: Uuid) -> Self {
        ReserveRequest {
            email: email.into(),
            target: ReserveTarget::Group(group),
            data: None,
            quota: 1,
            rrule: None,
        }
    }
}

/// Optional attribute changes applied by [`Scheduler::move_allocation`].
#[derive(Debug, Clone, Default)]
pub struct AllocationChanges {
    pub group: Option<Uuid>,
    pub quota: Option<u32>,
    pub approve_manually: Option<bool>,
    pub reservation_quota_limit: Option<u32>,
    pub whole_day: Option<bool>,
}

/// Selects the allocations removed by [`Scheduler::remove_allocation`].
#[derive(Debug, Clone, Copy)]
pub enum AllocationSelector {
    Id(AllocationId),
    Group(Uuid),
    Recurrence(RecurrenceId),
}

/// Slot claims computed before anything is written.
///
/// Claim planning walks the keylist exactly like the final write would, but
/// records virtual mirrors and slots in memory. The plan is then persisted
/// in three storage calls (mirrors, slots, reservation update), each atomic,
/// instead of write-as-you-go.
#[derive(Debug, Default)]
struct ClaimPlan {
    new_mirrors: Vec<Allocation>,
    slots: Vec<ReservedSlot>,
}

/// Scheduler for a single resource.
pub struct Scheduler<S> {
    storage: S,
    resource: Uuid,
    language: String,
    email_valid: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    is_exposed: Arc<dyn Fn(&Allocation) -> bool + Send + Sync>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl<S> Scheduler<S> {
    pub fn new(storage: S, resource: Uuid) -> Self {
        let (events, _) = broadcast::channel(64);

        Scheduler {
            storage,
            resource,
            language: "en".into(),
            email_valid: Arc::new(plausible_email),
            is_exposed: Arc::new(|_| true),
            events,
        }
    }

    /// Language tag attached to every emitted event.
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.into();
        self
    }

    /// Replace the default email plausibility check.
    pub fn with_email_validator(
        mut self,
        validator: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.email_valid = Arc::new(validator);
        self
    }

    /// Visibility predicate: allocations it rejects cannot be reserved and
    /// are skipped by the availability aggregate.
    pub fn with_exposure(
        mut self,
        is_exposed: impl Fn(&Allocation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_exposed = Arc::new(is_exposed);
        self
    }

    /// The managed resource's key.
    pub fn resource(&self) -> Uuid {
        self.resource
    }

    /// Subscribe to domain events. Slow subscribers lag, they never block
    /// an operation.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }
}

impl<S: Storage> Scheduler<S> {
    /// Create master allocations for the given dates.
    ///
    /// The dates must not overlap each other or any existing master once
    /// rasterized. Grouped dates share one group and are reserved
    /// all-or-nothing; several ungrouped dates get linked by a recurrence
    /// row instead.
    #[instrument(skip_all, fields(resource = %self.resource, dates = dates.len()))]
    pub async fn allocate(
        &self,
        dates: Vec<(DateTime<Utc>, DateTime<Utc>)>,
        options: AllocateOptions,
    ) -> Result<Vec<Allocation>> {
        if options.quota < 1 {
            return Err(ReservationError::InvalidQuota);
        }
        if dates.is_empty() {
            return Err(ReservationError::InvalidAllocation);
        }

        let raster = if options.partly_available {
            options.raster
        } else {
            MIN_RASTER_VALUE
        };
        if !is_valid_raster(raster) {
            return Err(ReservationError::InvalidAllocation);
        }

        let _guard = Serializer::global().serialized(self.resource).await;

        let mut spans = Vec::with_capacity(dates.len());
        for (start, end) in dates {
            let (start, end) = if options.whole_day {
                align_whole_day(start, end)
            } else {
                (start, end)
            };

            if end <= start {
                return Err(ReservationError::InvalidAllocation);
            }

            spans.push(rasterize_span(start, end, raster));
        }

        for (ix, span) in spans.iter().enumerate() {
            let collision = spans[..ix]
                .iter()
                .any(|other| span.0 <= other.1 && other.0 <= span.1);

            if collision {
                return Err(ReservationError::OverlappingAllocation {
                    start: span.0,
                    end: span.1,
                });
            }

            let existing = self
                .storage
                .allocations_in_range(self.resource, span.0, span.1, true)
                .await?;
            if !existing.is_empty() {
                return Err(ReservationError::OverlappingAllocation {
                    start: span.0,
                    end: span.1,
                });
            }
        }

        let shared_group = options.grouped.then(Uuid::new_v4);
        let recurrence = (!options.grouped && spans.len() > 1)
            .then(|| Recurrence::new(self.resource, options.rrule.clone()));

        let mut masters = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            let group = shared_group.unwrap_or_else(Uuid::new_v4);
            let mut allocation = Allocation::new(self.resource, group, start, end, raster)?;
            allocation.quota = options.quota;
            allocation.partly_available = options.partly_available;
            allocation.approve_manually = options.approve_manually;
            allocation.reservation_quota_limit = options.reservation_quota_limit;
            allocation.whole_day = options.whole_day;
            allocation.recurrence_id = recurrence.as_ref().map(|r| r.id);
            masters.push(allocation);
        }

        if let Some(recurrence) = recurrence {
            self.storage.insert_recurrence(recurrence).await?;
        }
        self.storage.insert_allocations(masters.clone()).await?;

        debug!(count = masters.len(), "allocations added");
        self.emit(SchedulerEvent::AllocationsAdded {
            allocations: masters.clone(),
            language: self.language.clone(),
        });

        Ok(masters)
    }

    /// Record a reservation intent and return its token.
    ///
    /// Nothing is claimed yet; slots materialize at approval. Dates must
    /// pass the sanity checks and each be covered by exactly one allocation.
    /// When a targeted allocation belongs to a multi-member group, the whole
    /// group is reserved instead. Capacity is only checked up front for
    /// auto-approved allocations; manually approved ones queue as a
    /// waitlist and may exceed capacity.
    #[instrument(skip_all, fields(resource = %self.resource))]
    pub async fn reserve(&self, request: ReserveRequest) -> Result<ReservationToken> {
        if !(self.email_valid)(&request.email) {
            return Err(ReservationError::InvalidEmail(request.email));
        }
        if request.quota < 1 {
            return Err(ReservationError::InvalidQuota);
        }

        let _guard = Serializer::global().serialized(self.resource).await;

        let token = ReservationToken::new();
        let now = Utc::now();
        let mut rows: Vec<Reservation> = Vec::new();

        match &request.target {
            ReserveTarget::Group(group) => {
                let members = self
                    .storage
                    .allocations_by_groups(self.resource, &[*group], true)
                    .await?;
                if members.is_empty() {
                    return Err(ReservationError::NotReservable);
                }

                for member in &members {
                    if !(self.is_exposed)(member) {
                        return Err(ReservationError::NotReservable);
                    }
                    self.check_reservable(member, member.start(), member.end(), request.quota)
                        .await?;
                }

                rows.push(self.reservation_row(
                    token,
                    *group,
                    TargetType::Group,
                    None,
                    &request,
                    now,
                ));
            }
            ReserveTarget::Dates(dates) => {
                let mut reserved_groups: Vec<Uuid> = Vec::new();

                for &(start, end) in dates {
                    check_reservation_dates(start, end)?;

                    let master = self.covering_master(start, end).await?;
                    if !(self.is_exposed)(&master) {
                        return Err(ReservationError::NotReservable);
                    }
                    self.check_reservable(&master, start, end, request.quota)
                        .await?;

                    let members = self
                        .storage
                        .group_member_count(self.resource, master.group)
                        .await?;

                    if members > 1 {
                        // grouped allocations are all-or-nothing, the date
                        // expands to its whole group
                        if !reserved_groups.contains(&master.group) {
                            reserved_groups.push(master.group);
                            rows.push(self.reservation_row(
                                token,
                                master.group,
                                TargetType::Group,
                                None,
                                &request,
                                now,
                            ));
                        }
                    } else {
                        let span = rasterize_span(start, end, master.raster());
                        rows.push(self.reservation_row(
                            token,
                            master.group,
                            TargetType::Allocation,
                            Some(span),
                            &request,
                            now,
                        ));
                    }
                }
            }
        }

        if rows.is_empty() {
            return Err(ReservationError::InvalidReservation);
        }

        self.storage.insert_reservations(rows.clone()).await?;

        debug!(%token, rows = rows.len(), "reservation made");
        self.emit(SchedulerEvent::ReservationsMade {
            reservations: rows,
            language: self.language.clone(),
        });

        Ok(token)
    }

    /// Approve a pending reservation, claiming its slots.
    ///
    /// Every raster tick of every targeted interval is claimed, multiplied
    /// by the requested quantity, each unit routed to the first free spot
    /// among master and mirrors. Virtual mirrors get persisted on first
    /// claim. Fails with `AlreadyReserved` when any unit finds no spot;
    /// nothing is written in that case.
    #[instrument(skip_all, fields(resource = %self.resource, %token))]
    pub async fn approve_reservation(&self, token: ReservationToken) -> Result<Vec<Reservation>> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let rows = self.storage.reservations_by_token(self.resource, token).await?;
        if rows.is_empty() {
            return Err(ReservationError::InvalidReservationToken(token));
        }
        if rows.iter().any(|r| !r.is_pending()) {
            return Err(ReservationError::InvalidReservation);
        }

        let mut plan = ClaimPlan::default();
        for row in &rows {
            match row.target_type {
                TargetType::Group => {
                    let members = self
                        .storage
                        .allocations_by_groups(self.resource, &[row.target], true)
                        .await?;
                    if members.is_empty() {
                        return Err(ReservationError::NotReservable);
                    }

                    for member in &members {
                        self.plan_claims(
                            member,
                            member.start(),
                            member.end(),
                            row.quota,
                            token,
                            None,
                            &mut plan,
                        )
                        .await?;
                    }
                }
                TargetType::Allocation => {
                    let (start, end) = match (row.start, row.end) {
                        (Some(start), Some(end)) => (start, end),
                        _ => return Err(ReservationError::InvalidReservation),
                    };

                    let master = self.covering_master(start, end).await?;
                    self.plan_claims(&master, start, end, row.quota, token, None, &mut plan)
                        .await?;
                }
            }
        }

        if plan.slots.is_empty() {
            return Err(ReservationError::NotReservable);
        }

        if !plan.new_mirrors.is_empty() {
            self.storage.insert_allocations(plan.new_mirrors).await?;
        }
        self.storage.insert_slots(plan.slots.clone()).await?;

        let now = Utc::now();
        let approved: Vec<Reservation> = rows
            .into_iter()
            .map(|mut r| {
                r.status = ReservationStatus::Approved;
                r.modified = Some(now);
                r
            })
            .collect();
        self.storage.update_reservations(approved.clone()).await?;

        debug!(slots = plan.slots.len(), "reservation approved");
        self.emit(SchedulerEvent::ReservationsApproved {
            reservations: approved.clone(),
            language: self.language.clone(),
        });
        self.emit(SchedulerEvent::SlotsCreated {
            slots: plan.slots,
            language: self.language.clone(),
        });

        Ok(approved)
    }

    /// Deny a pending reservation, deleting its rows.
    #[instrument(skip_all, fields(resource = %self.resource, %token))]
    pub async fn deny_reservation(&self, token: ReservationToken) -> Result<()> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let rows = self.storage.reservations_by_token(self.resource, token).await?;
        if rows.is_empty() {
            return Err(ReservationError::InvalidReservationToken(token));
        }
        if rows.iter().any(|r| !r.is_pending()) {
            return Err(ReservationError::InvalidReservation);
        }

        let ids = rows.iter().map(|r| r.id).collect();
        self.storage.delete_reservations(ids).await?;

        self.emit(SchedulerEvent::ReservationsDenied {
            reservations: rows,
            language: self.language.clone(),
        });

        Ok(())
    }

    /// Revoke a reservation with a reason, removing rows and slots.
    ///
    /// The event fires before removal so subscribers still see the entities.
    #[instrument(skip_all, fields(resource = %self.resource, %token))]
    pub async fn revoke_reservation(&self, token: ReservationToken, reason: &str) -> Result<()> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let rows = self.storage.reservations_by_token(self.resource, token).await?;
        if rows.is_empty() {
            return Err(ReservationError::InvalidReservationToken(token));
        }

        self.emit(SchedulerEvent::ReservationsRevoked {
            reservations: rows.clone(),
            reason: reason.into(),
            language: self.language.clone(),
        });

        let removed = self.storage.delete_slots_by_token(self.resource, token).await?;
        let ids = rows.iter().map(|r| r.id).collect();
        self.storage.delete_reservations(ids).await?;

        if removed > 0 {
            self.emit(SchedulerEvent::SlotsRemoved {
                count: removed,
                language: self.language.clone(),
            });
        }

        Ok(())
    }

    /// Remove a reservation without ceremony: no reason, no revoked event.
    #[instrument(skip_all, fields(resource = %self.resource, %token))]
    pub async fn remove_reservation(&self, token: ReservationToken) -> Result<()> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let rows = self.storage.reservations_by_token(self.resource, token).await?;
        if rows.is_empty() {
            return Err(ReservationError::InvalidReservationToken(token));
        }

        let removed = self.storage.delete_slots_by_token(self.resource, token).await?;
        let ids = rows.iter().map(|r| r.id).collect();
        self.storage.delete_reservations(ids).await?;

        if removed > 0 {
            self.emit(SchedulerEvent::SlotsRemoved {
                count: removed,
                language: self.language.clone(),
            });
        }

        Ok(())
    }

    /// Change the email address on every row of a reservation.
    #[instrument(skip_all, fields(resource = %self.resource, %token))]
    pub async fn change_email(&self, token: ReservationToken, email: &str) -> Result<()> {
        if !(self.email_valid)(email) {
            return Err(ReservationError::InvalidEmail(email.into()));
        }

        let _guard = Serializer::global().serialized(self.resource).await;

        let mut rows = self.storage.reservations_by_token(self.resource, token).await?;
        if rows.is_empty() {
            return Err(ReservationError::InvalidReservationToken(token));
        }

        let now = Utc::now();
        for row in &mut rows {
            row.email = email.into();
            row.modified = Some(now);
        }

        self.storage.update_reservations(rows).await
    }

    /// Replace the opaque payload on every row of a reservation.
    #[instrument(skip_all, fields(resource = %self.resource, %token))]
    pub async fn change_reservation_data(
        &self,
        token: ReservationToken,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let mut rows = self.storage.reservations_by_token(self.resource, token).await?;
        if rows.is_empty() {
            return Err(ReservationError::InvalidReservationToken(token));
        }

        let now = Utc::now();
        for row in &mut rows {
            row.data = data.clone();
            row.modified = Some(now);
        }

        self.storage.update_reservations(rows).await
    }

    /// Move an approved reservation to a new timespan within its allocation.
    ///
    /// Only single-row, allocation-targeted reservations on partly available
    /// allocations can be retargeted. The token survives the move. The old
    /// slots count as free when checking the new span, so shifting within
    /// one's own booking always works if nobody else took the time.
    #[instrument(skip_all, fields(resource = %self.resource, %token))]
    pub async fn change_reservation_time(
        &self,
        token: ReservationToken,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        reason: &str,
    ) -> Result<Reservation> {
        check_reservation_dates(new_start, new_end)?;

        let _guard = Serializer::global().serialized(self.resource).await;

        let rows = self.storage.reservations_by_token(self.resource, token).await?;
        let mut row = match rows.as_slice() {
            [] => return Err(ReservationError::InvalidReservationToken(token)),
            [row] if row.target_type == TargetType::Allocation => row.clone(),
            _ => return Err(ReservationError::InvalidReservation),
        };
        if row.is_pending() {
            return Err(ReservationError::InvalidReservation);
        }

        let (old_start, old_end) = match (row.start, row.end) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(ReservationError::InvalidReservation),
        };

        let master = self.covering_master(old_start, old_end).await?;
        if !master.partly_available || !master.contains(new_start, new_end) {
            return Err(ReservationError::NotReservable);
        }

        let new_span = rasterize_span(new_start, new_end, master.raster());
        if new_span == (old_start, old_end) {
            return Ok(row);
        }

        // plan against a world where this token's slots are already gone
        let mut plan = ClaimPlan::default();
        self.plan_claims(
            &master,
            new_start,
            new_end,
            row.quota,
            token,
            Some(token),
            &mut plan,
        )
        .await?;

        // one atomic swap: a conflicting claim fails the whole exchange and
        // the old slots stay put
        self.storage
            .replace_slots(self.resource, token, plan.new_mirrors, plan.slots)
            .await?;

        row.start = Some(new_span.0);
        row.end = Some(new_span.1);
        row.modified = Some(Utc::now());
        self.storage.update_reservations(vec![row.clone()]).await?;

        self.emit(SchedulerEvent::ReservationTimeChanged {
            reservation: row.clone(),
            old_span: (old_start, old_end),
            new_span,
            reason: reason.into(),
            language: self.language.clone(),
        });

        Ok(row)
    }

    /// Move an allocation to a new timespan, optionally changing attributes.
    ///
    /// The new span must not overlap another master. A partly available
    /// allocation moves as long as its claimed slots and pending
    /// reservations stay inside the new span; a whole allocation with any
    /// of either refuses to move at all. Nothing is written until every
    /// check has passed. A quota change runs the full reorganization, and
    /// `approve_manually` and `reservation_quota_limit` propagate to every
    /// member of the group.
    #[instrument(skip_all, fields(resource = %self.resource, %id))]
    pub async fn move_allocation(
        &self,
        id: AllocationId,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        changes: AllocationChanges,
    ) -> Result<Allocation> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let master = self.storage.allocation_by_id(self.resource, id).await?;
        if !master.is_master() {
            return Err(ReservationError::InvalidAllocation);
        }

        let whole_day = changes.whole_day.unwrap_or(master.whole_day);
        let (new_start, new_end) = if whole_day {
            align_whole_day(new_start, new_end)
        } else {
            (new_start, new_end)
        };
        if new_end <= new_start {
            return Err(ReservationError::InvalidAllocation);
        }

        let span = rasterize_span(new_start, new_end, master.raster());

        let overlapping = self
            .storage
            .allocations_in_range(self.resource, span.0, span.1, true)
            .await?
            .into_iter()
            .any(|a| a.id != master.id);
        if overlapping {
            return Err(ReservationError::OverlappingAllocation {
                start: span.0,
                end: span.1,
            });
        }

        let mut siblings = self.storage.siblings(self.resource, master.start()).await?;

        // claims on a whole allocation are keyed to its start, so any span
        // change displaces them; partly available slots only need to stay
        // inside the new span
        let span_changed = span != (master.start(), master.end());

        for sibling in &siblings {
            let slots = self.storage.slots_by_allocation(sibling.id).await?;
            let displaced = if master.partly_available {
                slots.iter().any(|s| s.start < span.0 || span.1 < s.end)
            } else {
                span_changed && !slots.is_empty()
            };
            if displaced {
                return Err(ReservationError::AffectedReservation);
            }
        }

        let pending = self
            .storage
            .reservations_by_target(
                self.resource,
                &[master.group],
                Some(ReservationStatus::Pending),
            )
            .await?;
        for reservation in &pending {
            let displaced = if master.partly_available {
                matches!(
                    (reservation.start, reservation.end),
                    (Some(start), Some(end)) if start < span.0 || span.1 < end
                )
            } else {
                span_changed
            };
            if displaced {
                return Err(ReservationError::AffectedPendingReservation);
            }
        }

        // every check passed, mutation starts here: a rejected move must
        // not leave a quota change behind
        if let Some(new_quota) = changes.quota {
            if new_quota != master.quota {
                self.change_quota_inner(&master, new_quota).await?;
                siblings = self.storage.siblings(self.resource, master.start()).await?;
            }
        }

        for sibling in &mut siblings {
            sibling.set_span(new_start, new_end);
            if let Some(group) = changes.group {
                sibling.group = group;
            }
            if let Some(approve_manually) = changes.approve_manually {
                sibling.approve_manually = approve_manually;
            }
            if let Some(limit) = changes.reservation_quota_limit {
                sibling.reservation_quota_limit = limit;
            }
            if let Some(whole_day) = changes.whole_day {
                sibling.whole_day = whole_day;
            }
        }

        self.storage.update_allocations(siblings.clone()).await?;

        // approve_manually and reservation_quota_limit stay equal over a
        // whole group, not just over the moved timespan
        if changes.approve_manually.is_some() || changes.reservation_quota_limit.is_some() {
            let group = changes.group.unwrap_or(master.group);
            let mut members = self
                .storage
                .allocations_by_groups(self.resource, &[group], false)
                .await?;
            members.retain(|a| siblings.iter().all(|s| s.id != a.id));

            for member in &mut members {
                if let Some(approve_manually) = changes.approve_manually {
                    member.approve_manually = approve_manually;
                }
                if let Some(limit) = changes.reservation_quota_limit {
                    member.reservation_quota_limit = limit;
                }
            }
            if !members.is_empty() {
                self.storage.update_allocations(members).await?;
            }
        }

        debug!(start = %span.0, end = %span.1, "allocation moved");
        siblings
            .into_iter()
            .find(|a| a.id == id)
            .ok_or(ReservationError::InvalidAllocation)
    }

    /// Remove allocations with their mirrors.
    ///
    /// Rejected while any slot or reservation still references the set;
    /// orphaned recurrences are swept afterwards.
    #[instrument(skip_all, fields(resource = %self.resource))]
    pub async fn remove_allocation(&self, selector: AllocationSelector) -> Result<usize> {
        let _guard = Serializer::global().serialized(self.resource).await;

        let masters = match selector {
            AllocationSelector::Id(id) => {
                let master = self.storage.allocation_by_id(self.resource, id).await?;
                if !master.is_master() {
                    return Err(ReservationError::InvalidAllocation);
                }
                vec![master]
            }
            AllocationSelector::Group(group) => {
                self.storage
                    .allocations_by_groups(self.resource, &[group], true)
                    .await?
            }
            AllocationSelector::Recurrence(recurrence_id) => {
                self.storage
                    .allocations_by_recurrence(self.resource, recurrence_id)
                    .await?
            }
        };

        let mut doomed: Vec<Allocation> = Vec::new();
        for master in &masters {
            doomed.extend(self.storage.siblings(self.resource, master.start()).await?);
        }

        for allocation in &doomed {
            let slots = self.storage.slots_by_allocation(allocation.id).await?;
            if !slots.is_empty() {
                return Err(ReservationError::AffectedReservation);
            }
        }

        let groups: Vec<Uuid> = masters.iter().map(|m| m.group).collect();
        let reservations = self
            .storage
            .reservations_by_target(self.resource, &groups, None)
            .await?;
        if let Some(blocking) = reservations.first() {
            return Err(if blocking.is_pending() {
                ReservationError::AffectedPendingReservation
            } else {
                ReservationError::AffectedReservation
            });
        }

        let count = doomed.len();
        let ids = doomed.into_iter().map(|a| a.id).collect();
        self.storage.delete_allocations(ids).await?;
        self.storage.sweep_recurrences(self.resource).await?;

        debug!(count, "allocations removed");
        Ok(count)
    }

    /// Drop everything the scheduler manages: allocations, mirrors,
    /// reservations, slots and recurrences.
    #[instrument(skip_all, fields(resource = %self.resource))]
    pub async fn extinguish(&self) -> Result<()> {
        let _guard = Serializer::global().serialized(self.resource).await;
        self.storage.extinguish(self.resource).await
    }

    /// Find the first free spot for `[start, end]` among an allocation's
    /// master and mirrors, or None when fully booked.
    pub async fn find_spot(
        &self,
        master: &Allocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<Spot>> {
        let (persisted, reserved) = self.spot_state(master, None).await?;

        for key in keylist(self.resource, master.quota) {
            match persisted.get(&key) {
                Some(allocation) => {
                    let taken = reserved.get(&key).cloned().unwrap_or_default();
                    if allocation.is_available(start, end, &taken) {
                        return Ok(Some(Spot::Persisted(allocation.clone())));
                    }
                }
                // never persisted, so necessarily free
                None => return Ok(Some(Spot::Virtual(virtual_mirror(master, key)))),
            }
        }

        Ok(None)
    }

    /// Count the free spots for `[start, end]` among master and mirrors.
    pub async fn free_allocations_count(
        &self,
        master: &Allocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let (persisted, reserved) = self.spot_state(master, None).await?;

        let mut free = 0;
        for key in keylist(self.resource, master.quota) {
            match persisted.get(&key) {
                Some(allocation) => {
                    let taken = reserved.get(&key).cloned().unwrap_or_default();
                    if allocation.is_available(start, end, &taken) {
                        free += 1;
                    }
                }
                None => free += 1,
            }
        }

        Ok(free)
    }

    /// The mean availability percentage across all exposed spots in range.
    ///
    /// Every spot of every exposed master counts, virtual mirrors as fully
    /// free. Returns 0 when the range holds no exposed allocation.
    pub async fn availability(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64> {
        let masters = self
            .storage
            .allocations_in_range(self.resource, start, end, true)
            .await?;

        let mut total = 0.0;
        let mut spots = 0u32;
        for master in masters.iter().filter(|a| (self.is_exposed)(a)) {
            let (persisted, reserved) = self.spot_state(master, None).await?;

            for key in keylist(self.resource, master.quota) {
                let availability = match persisted.get(&key) {
                    Some(allocation) => {
                        let taken = reserved.get(&key).map_or(0, |t| t.len());
                        allocation.availability(taken)
                    }
                    None => 100.0,
                };
                total += availability;
                spots += 1;
            }
        }

        if spots == 0 {
            return Ok(0.0);
        }
        Ok(total / f64::from(spots))
    }

    /// The allocations a reservation targets: group members for group rows,
    /// the covering master for dated rows.
    pub async fn reservation_targets(&self, token: ReservationToken) -> Result<Vec<Allocation>> {
        let rows = self.storage.reservations_by_token(self.resource, token).await?;
        if rows.is_empty() {
            return Err(ReservationError::InvalidReservationToken(token));
        }

        let mut targets: Vec<Allocation> = Vec::new();
        for row in rows {
            match row.target_type {
                TargetType::Group => {
                    let members = self
                        .storage
                        .allocations_by_groups(self.resource, &[row.target], true)
                        .await?;
                    for member in members {
                        if !targets.iter().any(|t| t.id == member.id) {
                            targets.push(member);
                        }
                    }
                }
                TargetType::Allocation => {
                    if let (Some(start), Some(end)) = (row.start, row.end) {
                        let master = self.covering_master(start, end).await?;
                        if !targets.iter().any(|t| t.id == master.id) {
                            targets.push(master);
                        }
                    }
                }
            }
        }

        Ok(targets)
    }

    /// One managed allocation by row id.
    pub async fn allocation_by_id(&self, id: AllocationId) -> Result<Allocation> {
        self.storage.allocation_by_id(self.resource, id).await
    }

    /// Master allocations intersecting `[start, end]`, ordered by start.
    pub async fn allocations_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Allocation>> {
        self.storage
            .allocations_in_range(self.resource, start, end, true)
            .await
    }

    /// Master allocations of a group, ordered by start.
    pub async fn allocations_by_group(&self, group: Uuid) -> Result<Vec<Allocation>> {
        self.storage
            .allocations_by_groups(self.resource, &[group], true)
            .await
    }

    /// Master allocations of a recurrence, ordered by start.
    pub async fn allocations_by_recurrence(
        &self,
        recurrence_id: RecurrenceId,
    ) -> Result<Vec<Allocation>> {
        self.storage
            .allocations_by_recurrence(self.resource, recurrence_id)
            .await
    }

    /// The spans of a group's members, ordered by start.
    pub async fn dates_by_group(
        &self,
        group: Uuid,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let members = self
            .storage
            .allocations_by_groups(self.resource, &[group], true)
            .await?;
        Ok(members.iter().map(|a| (a.start(), a.end())).collect())
    }

    /// All rows of a reservation, ordered by creation.
    pub async fn reservations_by_token(
        &self,
        token: ReservationToken,
    ) -> Result<Vec<Reservation>> {
        self.storage.reservations_by_token(self.resource, token).await
    }

    /// All reservations targeting a group, optionally filtered by status.
    pub async fn reservations_by_group(
        &self,
        group: Uuid,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>> {
        self.storage
            .reservations_by_target(self.resource, &[group], status)
            .await
    }

    /// The slots claimed by a reservation, ordered by start.
    pub async fn slots_by_token(&self, token: ReservationToken) -> Result<Vec<ReservedSlot>> {
        self.storage.slots_by_token(self.resource, token).await
    }

    /// The master covering `[start, end]` entirely.
    ///
    /// Masters never overlap, so at most one can contain the span. No
    /// containing master means the span is not reservable.
    async fn covering_master(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Allocation> {
        let masters = self
            .storage
            .allocations_in_range(self.resource, start, end, true)
            .await?;

        masters
            .into_iter()
            .find(|a| a.contains(start, end))
            .ok_or(ReservationError::NotReservable)
    }

    /// Quantity and capacity checks shared by dated and group reservations.
    async fn check_reservable(
        &self,
        master: &Allocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        quota: u32,
    ) -> Result<()> {
        let limit = master.reservation_quota_limit;
        if limit > 0 && quota > limit {
            return Err(ReservationError::QuotaOverLimit);
        }
        if quota > master.quota {
            return Err(ReservationError::QuotaImpossible);
        }

        // manually approved allocations waitlist instead, capacity gets
        // checked at approval
        if !master.approve_manually {
            let free = self.free_allocations_count(master, start, end).await?;
            if free < quota as usize {
                return Err(ReservationError::AlreadyReserved);
            }
        }

        Ok(())
    }

    /// The persisted siblings of a master and their reserved starts, keyed
    /// by resource key. Slots of `ignore` count as free.
    async fn spot_state(
        &self,
        master: &Allocation,
        ignore: Option<ReservationToken>,
    ) -> Result<(
        HashMap<Uuid, Allocation>,
        HashMap<Uuid, HashSet<DateTime<Utc>>>,
    )> {
        let siblings = self.storage.siblings(self.resource, master.start()).await?;

        let mut persisted = HashMap::new();
        let mut reserved: HashMap<Uuid, HashSet<DateTime<Utc>>> = HashMap::new();
        for sibling in siblings {
            let starts = self
                .storage
                .slots_by_allocation(sibling.id)
                .await?
                .into_iter()
                .filter(|s| ignore.is_none_or(|t| s.reservation_token != t))
                .map(|s| s.start)
                .collect();

            reserved.insert(sibling.resource, starts);
            persisted.insert(sibling.resource, sibling);
        }

        Ok((persisted, reserved))
    }

    /// Plan `quota` spot claims of `[start, end]` against a master, adding
    /// the slots (and any mirrors to materialize) to the plan. Already
    /// planned claims count as taken, so multi-unit and multi-date requests
    /// never claim the same key twice.
    #[allow(clippy::too_many_arguments)]
    async fn plan_claims(
        &self,
        master: &Allocation,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        quota: u32,
        token: ReservationToken,
        ignore: Option<ReservationToken>,
        plan: &mut ClaimPlan,
    ) -> Result<()> {
        let (persisted, mut reserved) = self.spot_state(master, ignore).await?;

        for slot in &plan.slots {
            reserved.entry(slot.resource).or_default().insert(slot.start);
        }

        'unit: for _ in 0..quota {
            for key in keylist(self.resource, master.quota) {
                let allocation = persisted
                    .get(&key)
                    .or_else(|| plan.new_mirrors.iter().find(|a| a.resource == key))
                    .cloned()
                    .unwrap_or_else(|| virtual_mirror(master, key));

                let taken = reserved.entry(key).or_default();
                if !allocation.is_available(start, end, taken) {
                    continue;
                }

                let materialize = !persisted.contains_key(&key)
                    && !plan.new_mirrors.iter().any(|a| a.resource == key);
                if materialize {
                    plan.new_mirrors.push(allocation.clone());
                }

                for (slot_start, slot_end) in allocation.all_slots(Some(start), Some(end)) {
                    taken.insert(slot_start);
                    plan.slots.push(ReservedSlot {
                        resource: key,
                        start: slot_start,
                        end: slot_end,
                        allocation_id: allocation.id,
                        reservation_token: token,
                    });
                }

                continue 'unit;
            }

            return Err(ReservationError::AlreadyReserved);
        }

        Ok(())
    }

    fn reservation_row(
        &self,
        token: ReservationToken,
        target: Uuid,
        target_type: TargetType,
        span: Option<(DateTime<Utc>, DateTime<Utc>)>,
        request: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Reservation {
        Reservation {
            id: ReservationId::new(),
            token,
            target,
            target_type,
            resource: self.resource,
            start: span.map(|s| s.0),
            end: span.map(|s| s.1),
            status: ReservationStatus::Pending,
            data: request.data.clone(),
            email: request.email.clone(),
            quota: request.quota,
            rrule: request.rrule.clone(),
            created: now,
            modified: None,
        }
    }
}

/// Spans of a day or more are rejected, as are inverted or sub-five-minute
/// ones. Checked on the raw dates, before any rasterization.
fn check_reservation_dates(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end <= start || end - start < Duration::minutes(5) {
        return Err(ReservationError::ReservationParametersInvalid);
    }
    if end - start >= Duration::hours(24) {
        return Err(ReservationError::ReservationTooLong);
    }
    Ok(())
}

/// Expand a span to full days: midnight to one microsecond before the next
/// midnight. An end falling exactly on midnight belongs to the previous day.
fn align_whole_day(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let day_start = start.date_naive().and_time(NaiveTime::MIN).and_utc();

    let last_day = (end - Duration::microseconds(1)).date_naive().max(start.date_naive());
    let day_end = last_day.and_time(NaiveTime::MIN).and_utc() + Duration::days(1)
        - Duration::microseconds(1);

    (day_start, day_end)
}

/// A cheap plausibility check, not an RFC validation. Replaceable via
/// [`Scheduler::with_email_validator`].
fn plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}
