//! A timespan within which one or many timeslots can be reserved.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{ReservationError, Result};
use crate::models::{AllocationId, RecurrenceId};
use crate::raster::{is_valid_raster, iterate_span, rasterize_end, rasterize_span, rasterize_start, SpanIter};

/// A master allocation or one of its mirrors.
///
/// Start and end are rasterized on the way in and never stored unaligned.
/// The raster is set at construction and immutable afterwards. Masters are
/// the rows whose `resource` equals their `mirror_of`; mirrors carry a
/// derived `resource` key (see [`crate::mirrors`]).
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub id: AllocationId,
    /// The allocation's own key. Equal to `mirror_of` for masters, derived
    /// for mirrors.
    pub resource: Uuid,
    /// The owning master's resource key.
    pub mirror_of: Uuid,
    /// Group identifier shared by allocations reserved all-or-nothing.
    pub group: Uuid,
    /// Links allocations created together in one ungrouped `allocate` call.
    pub recurrence_id: Option<RecurrenceId>,
    pub(crate) start: DateTime<Utc>,
    pub(crate) end: DateTime<Utc>,
    pub(crate) raster: u32,
    /// Number of independently bookable copies of this timespan.
    pub quota: u32,
    /// If set, parts of the allocation can be reserved raster-block-wise.
    /// Otherwise a reservation always takes the whole span.
    pub partly_available: bool,
    /// If set, reservations queue as pending until an operator approves them.
    pub approve_manually: bool,
    /// Upper bound for the quantity of a single reservation, 0 for no limit.
    pub reservation_quota_limit: u32,
    /// Marks allocations aligned to whole days at creation.
    pub whole_day: bool,
}

impl Allocation {
    /// Create a master allocation for the given resource.
    ///
    /// Fails with [`ReservationError::InvalidAllocation`] if the raster is
    /// not one of the supported granularities.
    pub fn new(
        resource: Uuid,
        group: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        raster: u32,
    ) -> Result<Self> {
        if !is_valid_raster(raster) {
            return Err(ReservationError::InvalidAllocation);
        }

        let (start, end) = rasterize_span(start, end, raster);

        Ok(Allocation {
            id: AllocationId::new(),
            resource,
            mirror_of: resource,
            group,
            recurrence_id: None,
            start,
            end,
            raster,
            quota: 1,
            partly_available: false,
            approve_manually: true,
            reservation_quota_limit: 0,
            whole_day: false,
        })
    }

    /// Rebuild an allocation from already-rasterized storage fields.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_storage(
        id: AllocationId,
        resource: Uuid,
        mirror_of: Uuid,
        group: Uuid,
        recurrence_id: Option<RecurrenceId>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        raster: u32,
        quota: u32,
        partly_available: bool,
        approve_manually: bool,
        reservation_quota_limit: u32,
        whole_day: bool,
    ) -> Self {
        Allocation {
            id,
            resource,
            mirror_of,
            group,
            recurrence_id,
            start,
            end,
            raster,
            quota,
            partly_available,
            approve_manually,
            reservation_quota_limit,
            whole_day,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// The raster granularity in minutes. Set once, never changed.
    pub fn raster(&self) -> u32 {
        self.raster
    }

    /// Move the span; both ends are rasterized with the allocation's raster.
    pub(crate) fn set_span(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.start = rasterize_start(start, self.raster);
        self.end = rasterize_end(end, self.raster);
    }

    /// Forms a nice pair with `display_end`.
    pub fn display_start(&self) -> DateTime<Utc> {
        self.start
    }

    /// The end plus the trailing microsecond, for display.
    pub fn display_end(&self) -> DateTime<Utc> {
        self.end + Duration::microseconds(1)
    }

    /// True for the one physically-first allocation of a timespan.
    pub fn is_master(&self) -> bool {
        self.resource == self.mirror_of
    }

    /// True if the rasterized `[start, end]` intersects this allocation.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let (start, end) = rasterize_span(start, end, self.raster);

        if self.start <= start && start <= self.end {
            return true;
        }

        if start <= self.start && self.start <= end {
            return true;
        }

        false
    }

    /// True if the rasterized `[start, end]` lies entirely within the span.
    pub fn contains(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let (start, end) = rasterize_span(start, end, self.raster);
        self.start <= start && end <= self.end
    }

    /// Clips the given dates to the allocation's own bounds. Missing dates
    /// default to the allocation's span.
    pub fn align_dates(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = start.unwrap_or(self.start).max(self.start);
        let end = end.unwrap_or(self.end).min(self.end);
        (start, end)
    }

    /// All slots within the (optionally clipped) span, reserved or free.
    ///
    /// Partly available allocations yield one slot per raster block; whole
    /// allocations yield a single slot covering the full span.
    pub fn all_slots(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> AllSlots {
        let (start, end) = self.align_dates(start, end);

        if self.partly_available {
            AllSlots::Rastered(iterate_span(start, end, self.raster))
        } else {
            AllSlots::Whole(Some((self.start, self.end)))
        }
    }

    /// The slots not claimed by any of the given reserved starts.
    pub fn free_slots<'a>(
        &'a self,
        reserved: &'a HashSet<DateTime<Utc>>,
    ) -> impl Iterator<Item = (DateTime<Utc>, DateTime<Utc>)> + 'a {
        self.all_slots(None, None)
            .filter(move |(start, _)| !reserved.contains(start))
    }

    /// True if every slot within `[start, end]` is still free.
    pub fn is_available(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reserved: &HashSet<DateTime<Utc>>,
    ) -> bool {
        self.all_slots(Some(start), Some(end))
            .all(|(slot_start, _)| !reserved.contains(&slot_start))
    }

    /// Reserved slots as a percentage of all slots.
    ///
    /// Defined as 0 when nothing is reserved. The slot total cannot be zero
    /// for a well-formed allocation, but a malformed one reports 0 rather
    /// than dividing by zero.
    pub fn occupation_rate(&self, reserved_count: usize) -> f64 {
        if reserved_count == 0 {
            return 0.0;
        }

        let total = self.all_slots(None, None).count();
        if total == 0 {
            return 0.0;
        }

        reserved_count as f64 / total as f64 * 100.0
    }

    /// The inverse of [`Self::occupation_rate`]: free slots in percent.
    pub fn availability(&self, reserved_count: usize) -> f64 {
        100.0 - self.occupation_rate(reserved_count)
    }

    /// Partitions the span into contiguous blocks of free or reserved time.
    ///
    /// Each entry is `(percentage, reserved)`, ordered from start to end.
    /// An allocation from 8 to 9 with a reservation from 8:15 to 8:30 yields
    /// `[(25.0, false), (25.0, true), (50.0, false)]`.
    pub fn availability_partitions(&self, reserved: &HashSet<DateTime<Utc>>) -> Vec<(f64, bool)> {
        if reserved.is_empty() {
            return vec![(100.0, false)];
        }

        let slots: Vec<bool> = self
            .all_slots(None, None)
            .map(|(start, _)| reserved.contains(&start))
            .collect();

        if slots.is_empty() {
            return vec![(100.0, false)];
        }

        let step = 100.0 / slots.len() as f64;

        let mut partitions: Vec<(f64, bool)> = Vec::new();
        for flag in slots {
            match partitions.last_mut() {
                Some((percentage, last)) if *last == flag => *percentage += step,
                _ => partitions.push((step, flag)),
            }
        }

        // swallow floating point drift in the last block
        let total: f64 = partitions.iter().map(|(p, _)| p).sum();
        if let Some((last, _)) = partitions.last_mut() {
            *last -= total - 100.0;
        }

        partitions
    }
}

/// Iterator behind [`Allocation::all_slots`].
#[derive(Debug, Clone)]
pub enum AllSlots {
    Rastered(SpanIter),
    Whole(Option<(DateTime<Utc>, DateTime<Utc>)>),
}

impl Iterator for AllSlots {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            AllSlots::Rastered(iter) => iter.next(),
            AllSlots::Whole(slot) => slot.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    fn partly_available(start: DateTime<Utc>, end: DateTime<Utc>, raster: u32) -> Allocation {
        let mut allocation =
            Allocation::new(Uuid::new_v4(), Uuid::new_v4(), start, end, raster).unwrap();
        allocation.partly_available = true;
        allocation
    }

    #[test]
    fn invalid_raster_is_rejected() {
        let result = Allocation::new(Uuid::new_v4(), Uuid::new_v4(), hour(8, 0), hour(9, 0), 7);
        assert!(matches!(result, Err(ReservationError::InvalidAllocation)));
    }

    #[test]
    fn span_is_rasterized_on_construction() {
        let allocation = partly_available(hour(8, 7), hour(8, 52), 15);
        assert_eq!(allocation.start(), hour(8, 0));
        assert_eq!(allocation.display_end(), hour(9, 0));
    }

    #[test]
    fn overlaps_is_symmetric_on_rasterized_spans() {
        let allocation = partly_available(hour(8, 0), hour(9, 0), 15);

        assert!(allocation.overlaps(hour(8, 30), hour(9, 30)));
        assert!(allocation.overlaps(hour(7, 30), hour(8, 10)));
        assert!(!allocation.overlaps(hour(9, 0), hour(10, 0)));
        assert!(!allocation.overlaps(hour(7, 0), hour(8, 0)));
    }

    #[test]
    fn contains_requires_full_coverage() {
        let allocation = partly_available(hour(8, 0), hour(9, 0), 15);

        assert!(allocation.contains(hour(8, 0), hour(9, 0)));
        assert!(allocation.contains(hour(8, 15), hour(8, 45)));
        assert!(!allocation.contains(hour(7, 45), hour(8, 30)));
        assert!(!allocation.contains(hour(8, 30), hour(9, 15)));
    }

    #[test]
    fn all_slots_yields_one_slot_per_raster_block() {
        let allocation = partly_available(hour(8, 0), hour(9, 0), 15);
        let slots: Vec<_> = allocation.all_slots(None, None).collect();

        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].0, hour(8, 0));
        assert_eq!(slots[3].0, hour(8, 45));
    }

    #[test]
    fn whole_allocations_yield_a_single_slot() {
        let mut allocation = partly_available(hour(8, 0), hour(9, 0), 15);
        allocation.partly_available = false;

        let slots: Vec<_> = allocation.all_slots(None, None).collect();
        assert_eq!(slots, vec![(allocation.start(), allocation.end())]);
    }

    #[test]
    fn free_slots_skips_reserved_starts() {
        let allocation = partly_available(hour(8, 0), hour(9, 0), 15);
        let reserved: HashSet<_> = [hour(8, 0), hour(8, 15)].into_iter().collect();

        let free: Vec<_> = allocation.free_slots(&reserved).map(|(s, _)| s).collect();
        assert_eq!(free, vec![hour(8, 30), hour(8, 45)]);
    }

    #[test]
    fn occupation_rate_handles_the_empty_case() {
        let allocation = partly_available(hour(8, 0), hour(9, 0), 15);

        assert_eq!(allocation.occupation_rate(0), 0.0);
        assert_eq!(allocation.occupation_rate(2), 50.0);
        assert_eq!(allocation.availability(2), 50.0);
        assert_eq!(allocation.occupation_rate(4), 100.0);
    }

    #[test]
    fn partitions_group_contiguous_blocks() {
        let allocation = partly_available(hour(8, 0), hour(9, 0), 15);
        let reserved: HashSet<_> = [hour(8, 15)].into_iter().collect();

        let partitions = allocation.availability_partitions(&reserved);
        assert_eq!(partitions, vec![(25.0, false), (25.0, true), (50.0, false)]);
    }
}
