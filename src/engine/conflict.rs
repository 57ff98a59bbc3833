use std::collections::HashSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_MULTI_DAY_DATES;
use crate::model::{Blackout, Booking, ConflictHit, ConflictKind, TimeWindow};
use crate::sources::SourceError;

use super::bitmap::validate_window;
use super::{Engine, EngineError};

/// The overlap rule: half-open intervals, touching boundaries never overlap.
pub fn overlaps(a: &TimeWindow, b: &TimeWindow) -> bool {
    a.start < b.end && b.start < a.end
}

/// Overlap after widening `existing` to `[start - buffer, end + buffer)`.
/// The buffer pads other people's lessons, never the candidate itself.
pub fn overlaps_with_buffer(
    candidate: &TimeWindow,
    existing: &TimeWindow,
    buffer_minutes: u16,
) -> bool {
    let widened = TimeWindow {
        start: existing.start.saturating_sub(buffer_minutes),
        end: existing.end.saturating_add(buffer_minutes),
    };
    overlaps(candidate, &widened)
}

/// Everything that blocks `candidate` on `date`: active bookings widened by
/// the buffer, plus any blackout (whole-day). Non-blocking booking states are
/// never reported.
pub fn blocking_hits(
    bookings: &[Booking],
    blackouts: &[Blackout],
    date: NaiveDate,
    candidate: &TimeWindow,
    buffer_minutes: u16,
) -> Vec<ConflictHit> {
    let mut hits = Vec::new();

    for booking in bookings {
        if booking.date == date
            && booking.is_blocking()
            && overlaps_with_buffer(candidate, &booking.window, buffer_minutes)
        {
            hits.push(ConflictHit {
                date,
                window: booking.window,
                kind: ConflictKind::Booking { id: booking.id, status: booking.status },
            });
        }
    }

    for blackout in blackouts {
        if blackout.date == date {
            hits.push(ConflictHit {
                date,
                window: TimeWindow::full_day(),
                kind: ConflictKind::Blackout { reason: blackout.reason.clone() },
            });
        }
    }

    hits
}

pub(super) fn map_source_error(e: SourceError) -> EngineError {
    match e {
        SourceError::Constraint(m) => EngineError::ConstraintViolation(m),
        SourceError::Timeout(m) | SourceError::Unavailable(m) => {
            EngineError::Storage { message: m, retryable: true }
        }
    }
}

impl Engine {
    /// Fetch bookings and blackouts for one instructor over an inclusive
    /// date range. One call per collaborator regardless of span width.
    pub(super) async fn fetch_blocking_inputs(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<(Vec<Booking>, Vec<Blackout>), EngineError> {
        let bookings = self
            .bookings
            .bookings_in_range(instructor_id, from, to)
            .await
            .map_err(map_source_error)?;
        let blackouts = self
            .blackouts
            .blackouts_in_range(instructor_id, from, to)
            .await
            .map_err(map_source_error)?;
        Ok((bookings, blackouts))
    }

    /// All blocking intervals colliding with `candidate` on `date`, using the
    /// instructor's configured buffer.
    pub async fn find_overlapping_windows(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
        candidate: TimeWindow,
    ) -> Result<Vec<ConflictHit>, EngineError> {
        validate_window(&candidate)?;
        let buffer = self.buffer_minutes(instructor_id).await;
        let (bookings, blackouts) = self.fetch_blocking_inputs(instructor_id, date, date).await?;
        let hits = blocking_hits(&bookings, &blackouts, date, &candidate, buffer);
        if !hits.is_empty() {
            metrics::counter!(crate::observability::CONFLICTS_FOUND_TOTAL)
                .increment(hits.len() as u64);
        }
        Ok(hits)
    }

    /// Batched variant for recurring candidates: one collaborator fetch over
    /// the whole date span, then a per-date check.
    pub async fn check_multi_day_conflicts(
        &self,
        instructor_id: Ulid,
        dates: &[NaiveDate],
        candidate: TimeWindow,
    ) -> Result<Vec<ConflictHit>, EngineError> {
        validate_window(&candidate)?;
        if dates.is_empty() {
            return Ok(Vec::new());
        }
        if dates.len() > MAX_MULTI_DAY_DATES {
            return Err(EngineError::LimitExceeded("too many dates in one conflict check"));
        }

        let from = *dates.iter().min().expect("non-empty");
        let to = *dates.iter().max().expect("non-empty");
        let buffer = self.buffer_minutes(instructor_id).await;
        let (bookings, blackouts) = self.fetch_blocking_inputs(instructor_id, from, to).await?;

        let wanted: HashSet<NaiveDate> = dates.iter().copied().collect();
        let mut hits = Vec::new();
        for date in wanted {
            hits.extend(blocking_hits(&bookings, &blackouts, date, &candidate, buffer));
        }
        hits.sort_by_key(|h| (h.date, h.window.start));

        if !hits.is_empty() {
            metrics::counter!(crate::observability::CONFLICTS_FOUND_TOTAL)
                .increment(hits.len() as u64);
        }
        Ok(hits)
    }

    /// Read-only probe for the API layer: would this window conflict?
    /// Never reserves anything.
    pub async fn is_window_conflicting(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    ) -> Result<Vec<ConflictHit>, EngineError> {
        self.find_overlapping_windows(instructor_id, date, window).await
    }

    async fn buffer_minutes(&self, instructor_id: Ulid) -> u16 {
        match self.store.get_calendar(&instructor_id) {
            Some(cal) => cal.read().await.buffer_minutes,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, TimeOfDay};

    fn t(h: u16, m: u16) -> TimeOfDay {
        TimeOfDay::from_hm(h, m).unwrap()
    }

    fn w(s: (u16, u16), e: (u16, u16)) -> TimeWindow {
        TimeWindow::new(t(s.0, s.1), t(e.0, e.1))
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn booking(day: u32, window: TimeWindow, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            date: d(day),
            window,
            status,
        }
    }

    // ── overlap law ──────────────────────────────────────────

    #[test]
    fn overlap_law() {
        let cases = [
            ((9, 0), (10, 0), (9, 30), (10, 30), true),
            ((9, 0), (10, 0), (10, 0), (11, 0), false), // touching
            ((9, 0), (12, 0), (10, 0), (11, 0), true),  // containment
            ((9, 0), (10, 0), (11, 0), (12, 0), false), // disjoint
            ((9, 0), (10, 0), (9, 0), (10, 0), true),   // identical
        ];
        for (s1, e1, s2, e2, expected) in cases {
            let a = w(s1, e1);
            let b = w(s2, e2);
            assert_eq!(overlaps(&a, &b), expected, "{a} vs {b}");
            assert_eq!(overlaps(&b, &a), expected, "symmetry {b} vs {a}");
        }
    }

    // ── buffer law (spec'd boundary cases) ───────────────────

    #[test]
    fn buffer_widens_existing_not_candidate() {
        let existing = w((10, 0), (11, 0));

        // 15-minute buffer reaches into 11:00-11:30
        assert!(overlaps_with_buffer(&w((11, 0), (11, 30)), &existing, 15));
        // and backwards into 09:50-10:00 (not grid-aligned; raw math still applies)
        let before = TimeWindow::new(t(9, 50), t(10, 0));
        assert!(overlaps_with_buffer(&before, &existing, 15));
        // but not past the widened end
        let clear = TimeWindow::new(t(11, 16), t(11, 30));
        assert!(!overlaps_with_buffer(&clear, &existing, 15));
        // zero buffer: touching never conflicts
        assert!(!overlaps_with_buffer(&w((11, 0), (11, 30)), &existing, 0));
    }

    #[test]
    fn buffer_clamps_at_day_edges() {
        let early = TimeWindow::new(TimeOfDay::MIDNIGHT, t(1, 0));
        // widening start below midnight saturates instead of wrapping
        assert!(overlaps_with_buffer(&w((0, 0), (0, 15)), &early, 120));

        let late = TimeWindow::new(t(23, 0), TimeOfDay::END_OF_DAY);
        assert!(overlaps_with_buffer(&TimeWindow::new(t(23, 45), TimeOfDay::END_OF_DAY), &late, 120));
    }

    // ── blocking_hits ────────────────────────────────────────

    #[test]
    fn only_active_statuses_block() {
        let candidate = w((10, 30), (11, 30));
        let bookings = vec![
            booking(2, w((10, 0), (11, 0)), BookingStatus::Confirmed),
            booking(2, w((10, 0), (11, 0)), BookingStatus::Completed),
            booking(2, w((10, 0), (11, 0)), BookingStatus::Pending),
            booking(2, w((10, 0), (11, 0)), BookingStatus::Cancelled),
        ];
        let hits = blocking_hits(&bookings, &[], d(2), &candidate, 0);
        assert_eq!(hits.len(), 2);
        for hit in &hits {
            match &hit.kind {
                ConflictKind::Booking { status, .. } => assert!(status.is_blocking()),
                other => panic!("unexpected hit {other:?}"),
            }
        }
    }

    #[test]
    fn other_dates_never_block() {
        let candidate = w((10, 0), (11, 0));
        let bookings = vec![booking(3, w((10, 0), (11, 0)), BookingStatus::Confirmed)];
        assert!(blocking_hits(&bookings, &[], d(2), &candidate, 0).is_empty());
    }

    #[test]
    fn blackout_blocks_whole_day() {
        let iid = Ulid::new();
        let blackouts = vec![Blackout {
            instructor_id: iid,
            date: d(2),
            reason: Some("conference".into()),
        }];
        let hits = blocking_hits(&[], &blackouts, d(2), &w((6, 0), (6, 15)), 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].window, TimeWindow::full_day());
        assert!(matches!(hits[0].kind, ConflictKind::Blackout { .. }));
    }

    #[test]
    fn source_error_mapping() {
        assert!(matches!(
            map_source_error(SourceError::Timeout("t".into())),
            EngineError::Storage { retryable: true, .. }
        ));
        assert!(matches!(
            map_source_error(SourceError::Constraint("c".into())),
            EngineError::ConstraintViolation(_)
        ));
    }
}
