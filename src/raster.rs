//! Time quantization primitives.
//!
//! All stored and queried timespans are snapped to a raster so that start
//! times cannot fall on arbitrary instants. Two reservations competing for
//! the same period therefore always produce the same slot keys, and slot
//! collision reduces to an equality check on `(resource, start)`.
//!
//! A raster of 30 minutes turns `19:01 - 19:30` and `19:00 - 19:29` into the
//! identical span `19:00 - 19:29:59.999999`: the end of a slot is the start
//! of the next one minus one microsecond, so adjacent slots abut exactly with
//! no gap and no overlap.

use chrono::{DateTime, Duration, Timelike, Utc};

/// The raster values must divide an hour without remainder.
pub const VALID_RASTER_VALUES: [u32; 5] = [5, 10, 15, 30, 60];

/// The smallest valid raster, in minutes.
pub const MIN_RASTER_VALUE: u32 = 5;

/// The largest valid raster, in minutes.
pub const MAX_RASTER_VALUE: u32 = 60;

/// Returns true if the given granularity is one of the supported rasters.
pub fn is_valid_raster(raster: u32) -> bool {
    VALID_RASTER_VALUES.contains(&raster)
}

/// Snaps a date to the beginning of its raster block.
pub fn rasterize_start(date: DateTime<Utc>, raster: u32) -> DateTime<Utc> {
    debug_assert!(is_valid_raster(raster));

    let delta = Duration::minutes(i64::from(date.minute() % raster))
        + Duration::seconds(i64::from(date.second()))
        + Duration::nanoseconds(i64::from(date.timestamp_subsec_nanos()));

    date - delta
}

/// Snaps a date to the end of its raster block.
///
/// The result is the start of the next block minus one microsecond. A date
/// landing exactly on a block boundary belongs to the previous block, so it
/// is only trimmed by the microsecond.
pub fn rasterize_end(date: DateTime<Utc>, raster: u32) -> DateTime<Utc> {
    debug_assert!(is_valid_raster(raster));

    let on_boundary =
        date.minute() % raster == 0 && date.second() == 0 && date.timestamp_subsec_nanos() == 0;

    if on_boundary {
        date - Duration::microseconds(1)
    } else {
        rasterize_start(date, raster) + Duration::minutes(i64::from(raster))
            - Duration::microseconds(1)
    }
}

/// Rasterizes both ends of a span.
pub fn rasterize_span(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    raster: u32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    (rasterize_start(start, raster), rasterize_end(end, raster))
}

/// Iterates through all raster blocks within the given span.
///
/// The span is rasterized first; each yielded pair covers exactly one raster
/// block of `raster` minutes minus one microsecond. The iterator is finite
/// and can be cloned to restart the walk.
pub fn iterate_span(start: DateTime<Utc>, end: DateTime<Utc>, raster: u32) -> SpanIter {
    let (start, end) = rasterize_span(start, end, raster);
    SpanIter { step: start, end, raster }
}

/// Iterator over the raster blocks of a span, produced by [`iterate_span`].
#[derive(Debug, Clone)]
pub struct SpanIter {
    step: DateTime<Utc>,
    end: DateTime<Utc>,
    raster: u32,
}

impl Iterator for SpanIter {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.step > self.end {
            return None;
        }

        let slot_start = self.step;
        let slot_end =
            slot_start + Duration::minutes(i64::from(self.raster)) - Duration::microseconds(1);

        self.step += Duration::minutes(i64::from(self.raster));

        Some((slot_start, slot_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn date(h: u32, m: u32, s: u32, micro: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap() + Duration::microseconds(micro.into())
    }

    #[rstest]
    #[case(5)]
    #[case(10)]
    #[case(15)]
    #[case(30)]
    #[case(60)]
    fn rasterize_start_floors_and_is_idempotent(#[case] raster: u32) {
        let d = date(19, 7, 23, 512);
        let snapped = rasterize_start(d, raster);

        assert!(snapped <= d);
        assert_eq!(snapped.second(), 0);
        assert_eq!(snapped.timestamp_subsec_nanos(), 0);
        assert_eq!(snapped.minute() % raster, 0);
        assert_eq!(rasterize_start(snapped, raster), snapped);
    }

    #[test]
    fn rasterize_end_trims_boundary_by_one_microsecond() {
        let boundary = date(19, 30, 0, 0);
        assert_eq!(rasterize_end(boundary, 30), boundary - Duration::microseconds(1));
    }

    #[test]
    fn rasterize_end_extends_to_block_end() {
        let d = date(19, 1, 0, 0);
        assert_eq!(rasterize_end(d, 30), date(19, 30, 0, 0) - Duration::microseconds(1));

        // seconds past a minute boundary also push into the block
        let d = date(19, 0, 30, 0);
        assert_eq!(rasterize_end(d, 30), date(19, 30, 0, 0) - Duration::microseconds(1));
    }

    #[test]
    fn overlapping_requests_collapse_to_the_same_span() {
        let a = rasterize_span(date(19, 1, 0, 0), date(19, 30, 0, 0), 30);
        let b = rasterize_span(date(19, 0, 0, 0), date(19, 29, 0, 0), 30);
        assert_eq!(a, b);
    }

    #[rstest]
    #[case(5)]
    #[case(15)]
    #[case(60)]
    fn iterate_span_is_contiguous_and_covers_the_span(#[case] raster: u32) {
        let start = date(8, 0, 0, 0);
        let end = date(10, 0, 0, 0) - Duration::microseconds(1);

        let slots: Vec<_> = iterate_span(start, end, raster).collect();
        assert_eq!(slots.len() as u32, 120 / raster);

        assert_eq!(slots.first().unwrap().0, start);
        assert_eq!(slots.last().unwrap().1, end);

        for pair in slots.windows(2) {
            // next slot begins exactly one microsecond after the previous ends
            assert_eq!(pair[0].1 + Duration::microseconds(1), pair[1].0);
        }
    }

    #[test]
    fn iterate_span_is_restartable() {
        let iter = iterate_span(date(8, 0, 0, 0), date(9, 0, 0, 0), 15);
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, second);
    }
}
