use chrono::{Datelike, Days, NaiveDate};
use tracing::{debug, info};
use ulid::Ulid;

use crate::cache::WeekCache;
use crate::limits::MAX_RANGE_DAYS;
use crate::model::{
    Booking, CalendarState, Event, PatternApplyReport, Slot, TimeWindow, WeekCopyReport,
    WeekPattern,
};

use super::bitmap;
use super::{Engine, EngineError};

/// The seven consecutive dates starting at `start`. Pure expansion; callers
/// decide whether `start` must be a Monday.
pub fn calculate_week_dates(start: NaiveDate) -> [NaiveDate; 7] {
    std::array::from_fn(|i| start + Days::new(i as u64))
}

/// Extract one week of availability from locked calendar state. Decodes each
/// day's bitmap, so the pattern reports coalesced coverage — the single
/// uniform extraction contract for every week-level consumer.
fn pattern_from_calendar(cal: &CalendarState, week_start: NaiveDate) -> WeekPattern {
    let mut pattern = WeekPattern::default();
    for date in calculate_week_dates(week_start) {
        let windows = cal
            .day(date)
            .map(|day| bitmap::windows_from_bits(&day.bits))
            .unwrap_or_default();
        pattern.set_weekday(date.weekday(), windows);
    }
    pattern
}

/// Active bookings on `date`, exact windows, deduplicated and sorted.
fn preserved_windows(bookings: &[Booking], date: NaiveDate) -> Vec<TimeWindow> {
    let mut windows: Vec<TimeWindow> = Vec::new();
    for booking in bookings {
        if booking.date == date && booking.is_blocking() && !windows.contains(&booking.window) {
            windows.push(booking.window);
        }
    }
    windows.sort_by_key(|w| w.start);
    windows
}

/// One computed day rewrite: preserved booking windows plus what survives of
/// the pattern around them.
struct DayPlan {
    date: NaiveDate,
    slots: Vec<Slot>,
    pattern_written: usize,
    pattern_skipped: usize,
    preserved: usize,
}

/// Preserved booking windows are written verbatim. A pattern window that
/// collides with one counts as skipped, but its uncovered remainder still
/// applies. Blackout days take no pattern at all.
fn plan_day(
    date: NaiveDate,
    pattern_windows: &[TimeWindow],
    bookings: &[Booking],
    blacked_out: bool,
) -> DayPlan {
    let preserved = preserved_windows(bookings, date);
    let mut slots: Vec<Slot> = preserved
        .iter()
        .map(|w| Slot { id: Ulid::new(), window: *w })
        .collect();

    let mut written = 0;
    let mut skipped = 0;
    for window in pattern_windows {
        if blacked_out {
            skipped += 1;
            continue;
        }
        let pieces = bitmap::subtract_windows(std::slice::from_ref(window), &preserved);
        if pieces.len() == 1 && pieces[0] == *window {
            slots.push(Slot { id: Ulid::new(), window: *window });
            written += 1;
        } else {
            skipped += 1;
            for piece in pieces {
                slots.push(Slot { id: Ulid::new(), window: piece });
                written += 1;
            }
        }
    }
    slots.sort_by_key(|s| s.window.start);

    DayPlan {
        date,
        slots,
        pattern_written: written,
        pattern_skipped: skipped,
        preserved: preserved.len(),
    }
}

impl Engine {
    /// One week of availability, all seven weekday keys always present.
    /// Read-through the week cache.
    pub async fn get_week_pattern(
        &self,
        instructor_id: Ulid,
        week_start: NaiveDate,
    ) -> Result<WeekPattern, EngineError> {
        let key = WeekCache::week_key(instructor_id, week_start);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let pattern = match self.store.get_calendar(&instructor_id) {
            None => WeekPattern::default(),
            Some(cal) => pattern_from_calendar(&*cal.read().await, week_start),
        };
        self.cache.put(key, pattern.clone());
        Ok(pattern)
    }

    /// Rewrite the target week with the source week's per-weekday pattern,
    /// never touching time that backs an active booking.
    ///
    /// The whole copy runs under one calendar write lock: the source pattern
    /// read, the booking fetch, and all seven day rewrites commit or none of
    /// the computed state does.
    pub async fn copy_week_availability(
        &self,
        instructor_id: Ulid,
        from_week: NaiveDate,
        to_week: NaiveDate,
    ) -> Result<WeekCopyReport, EngineError> {
        metrics::counter!(crate::observability::WEEK_OPS_TOTAL, "op" => "copy_week").increment(1);
        let mut guard = self.calendar_write(instructor_id).await?;

        let source = pattern_from_calendar(&guard, from_week);
        let target_dates = calculate_week_dates(to_week);
        let (bookings, blackouts) = self
            .fetch_blocking_inputs(instructor_id, target_dates[0], target_dates[6])
            .await?;

        // Plan all seven days before touching anything.
        let mut report = WeekCopyReport::default();
        let mut writes: Vec<Event> = Vec::new();
        for date in target_dates {
            let blacked_out = blackouts.iter().any(|b| b.date == date);
            let plan = plan_day(date, source.for_weekday(date.weekday()), &bookings, blacked_out);

            report.slots_created += plan.pattern_written;
            report.slots_skipped += plan.pattern_skipped;
            if plan.preserved > 0 {
                report.dates_with_preserved_bookings.push(date);
            }
            if plan.pattern_written > 0 {
                report.dates_created += 1;
            }

            // A date that had no record and gains no windows stays unset.
            if guard.day(date).is_none() && plan.slots.is_empty() {
                continue;
            }
            writes.push(Event::DayReplaced {
                instructor_id,
                date: plan.date,
                bits: bitmap::bits_from_slots(&plan.slots).to_vec(),
                slots: plan.slots,
            });
        }

        for event in &writes {
            self.persist_and_apply(&mut guard, event).await?;
        }
        metrics::counter!(crate::observability::BULK_DATES_TOTAL).increment(writes.len() as u64);

        info!(
            %instructor_id, %from_week, %to_week,
            created = report.slots_created, skipped = report.slots_skipped,
            "week copied"
        );
        Ok(report)
    }

    /// Apply the source week's per-weekday pattern across an arbitrary date
    /// range, with the same preserve-and-skip contract as the week copy.
    /// Commits per date (idempotent day rewrites), invoking `progress` with
    /// `(processed, total)` after each date.
    pub async fn apply_pattern_to_date_range(
        &self,
        instructor_id: Ulid,
        from_week: NaiveDate,
        start_date: NaiveDate,
        end_date: NaiveDate,
        mut progress: Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Result<PatternApplyReport, EngineError> {
        if end_date < start_date {
            return Err(EngineError::InvalidRange { reason: "end date before start date" });
        }
        let total = (end_date - start_date).num_days() + 1;
        if total > MAX_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        let total = total as usize;

        metrics::counter!(crate::observability::WEEK_OPS_TOTAL, "op" => "apply_pattern")
            .increment(1);
        let mut guard = self.calendar_write(instructor_id).await?;

        let source = pattern_from_calendar(&guard, from_week);
        let (bookings, blackouts) = self
            .fetch_blocking_inputs(instructor_id, start_date, end_date)
            .await?;

        let mut report = PatternApplyReport::default();
        report.total_bookings_preserved = bookings
            .iter()
            .filter(|b| b.is_blocking() && b.date >= start_date && b.date <= end_date)
            .count();

        for index in 0..total {
            let date = start_date + Days::new(index as u64);
            let blacked_out = blackouts.iter().any(|b| b.date == date);
            let plan = plan_day(date, source.for_weekday(date.weekday()), &bookings, blacked_out);

            report.slots_created += plan.pattern_written;
            report.slots_skipped += plan.pattern_skipped;

            let existed = guard.day(date).is_some();
            if !existed && plan.slots.is_empty() {
                // Nothing to clear, nothing to write.
            } else {
                let event = Event::DayReplaced {
                    instructor_id,
                    date,
                    bits: bitmap::bits_from_slots(&plan.slots).to_vec(),
                    slots: plan.slots,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                if existed {
                    report.dates_modified += 1;
                } else {
                    report.dates_created += 1;
                }
                metrics::counter!(crate::observability::BULK_DATES_TOTAL).increment(1);
            }

            if let Some(cb) = progress.as_mut() {
                cb(index + 1, total);
            }
        }

        debug!(
            %instructor_id, %start_date, %end_date,
            created = report.dates_created, modified = report.dates_modified,
            "pattern applied to range"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, TimeOfDay};
    use chrono::Weekday;

    fn t(h: u16) -> TimeOfDay {
        TimeOfDay::from_hm(h, 0).unwrap()
    }

    fn w(sh: u16, eh: u16) -> TimeWindow {
        TimeWindow::new(t(sh), t(eh))
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn week_dates_are_seven_consecutive() {
        let start = d(2025, 6, 2); // a Monday
        let dates = calculate_week_dates(start);
        assert_eq!(dates.len(), 7);
        assert_eq!(dates[0], start);
        assert_eq!(dates[6], d(2025, 6, 8));
        assert_eq!(dates[0].weekday(), Weekday::Mon);
        assert_eq!(dates[6].weekday(), Weekday::Sun);
    }

    #[test]
    fn week_dates_do_not_require_monday() {
        let start = d(2025, 6, 4); // a Wednesday
        let dates = calculate_week_dates(start);
        assert_eq!(dates[0].weekday(), Weekday::Wed);
        assert_eq!(dates[6], d(2025, 6, 10));
    }

    #[test]
    fn plan_day_skips_pattern_windows_over_preserved() {
        let date = d(2025, 6, 4);
        let booking = Booking {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            date,
            window: w(10, 11),
            status: BookingStatus::Confirmed,
        };
        // 09:00-12:00 collides with the preserved 10:00-11:00: counted as
        // skipped, but its remainder around the booking still applies.
        // 14:00-16:00 applies untouched.
        let plan = plan_day(date, &[w(9, 12), w(14, 16)], &[booking], false);
        assert_eq!(plan.preserved, 1);
        assert_eq!(plan.pattern_skipped, 1);
        assert_eq!(plan.pattern_written, 3); // 09-10, 11-12, 14-16
        let windows: Vec<TimeWindow> = plan.slots.iter().map(|s| s.window).collect();
        assert_eq!(windows, vec![w(9, 10), w(10, 11), w(11, 12), w(14, 16)]);
    }

    #[test]
    fn plan_day_blackout_skips_everything_but_keeps_preserved() {
        let date = d(2025, 6, 4);
        let plan = plan_day(date, &[w(9, 12)], &[], true);
        assert_eq!(plan.pattern_written, 0);
        assert_eq!(plan.pattern_skipped, 1);
        assert!(plan.slots.is_empty());
    }

    #[test]
    fn plan_day_dedupes_identical_booking_windows() {
        let date = d(2025, 6, 4);
        let mk = |status| Booking {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            date,
            window: w(10, 11),
            status,
        };
        let plan = plan_day(
            date,
            &[],
            &[mk(BookingStatus::Confirmed), mk(BookingStatus::Completed)],
            false,
        );
        assert_eq!(plan.slots.len(), 1);
    }

    #[test]
    fn plan_day_ignores_inactive_bookings() {
        let date = d(2025, 6, 4);
        let cancelled = Booking {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            date,
            window: w(10, 11),
            status: BookingStatus::Cancelled,
        };
        let plan = plan_day(date, &[w(9, 12)], &[cancelled], false);
        assert_eq!(plan.preserved, 0);
        assert_eq!(plan.pattern_written, 1);
    }
}
