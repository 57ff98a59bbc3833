use chrono::NaiveDate;
use tracing::debug;
use ulid::Ulid;

use crate::limits::MAX_SLOTS_PER_DAY;
use crate::model::{Booking, BookingStatus, Event, Gap, Slot, TimeOfDay, TimeWindow};

use super::bitmap::{self, validate_time, validate_window};
use super::conflict::{blocking_hits, overlaps};
use super::{Engine, EngineError};

fn record_op(op: &'static str, started: std::time::Instant) {
    metrics::counter!(crate::observability::SLOT_OPS_TOTAL, "op" => op).increment(1);
    metrics::histogram!(crate::observability::SLOT_OP_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}

/// First active booking whose window overlaps `window`, if any.
fn active_booking_on<'a>(bookings: &'a [Booking], window: &TimeWindow) -> Option<&'a Booking> {
    bookings
        .iter()
        .find(|b| b.is_blocking() && overlaps(&b.window, window))
}

impl Engine {
    /// Open a new availability window.
    ///
    /// With `validate_conflicts`, any collision with an active booking or a
    /// blackout fails the call, naming the blockers. With `auto_merge`,
    /// touching free windows coalesce into the new one; windows backing an
    /// active booking are never merge candidates.
    pub async fn create_slot(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
        validate_conflicts: bool,
        auto_merge: bool,
    ) -> Result<Ulid, EngineError> {
        validate_window(&window)?;
        let started = std::time::Instant::now();
        let mut guard = self.calendar_write(instructor_id).await?;

        if let Some(day) = guard.day(date) {
            if day.slots.len() >= MAX_SLOTS_PER_DAY {
                return Err(EngineError::LimitExceeded("too many slots on one day"));
            }
            if let Some(existing) = day.slots.iter().find(|s| s.window == window) {
                return Err(EngineError::DuplicateSlot { existing: existing.id, window });
            }
        }

        // Bookings are needed for conflict validation and for keeping booked
        // windows out of the merge; fetch once under the lock.
        let needs_bookings = validate_conflicts || auto_merge;
        let (bookings, blackouts) = if needs_bookings {
            self.fetch_blocking_inputs(instructor_id, date, date).await?
        } else {
            (Vec::new(), Vec::new())
        };

        if validate_conflicts {
            let hits = blocking_hits(&bookings, &blackouts, date, &window, guard.buffer_minutes);
            if !hits.is_empty() {
                metrics::counter!(crate::observability::CONFLICTS_FOUND_TOTAL)
                    .increment(hits.len() as u64);
                return Err(EngineError::Conflict(hits));
            }
        }

        let id = Ulid::new();

        let existing: Vec<Slot> = if auto_merge {
            guard.day(date).map(|d| d.slots.clone()).unwrap_or_default()
        } else {
            Vec::new()
        };

        if auto_merge && !existing.is_empty() {
            let mut merged = window;
            let mut absorbed: Vec<Ulid> = Vec::new();
            // Chase the chain: absorbing one neighbor can make the next one
            // touch. Slots are few per day, so the rescan is cheap.
            loop {
                let mut grew = false;
                for slot in &existing {
                    if absorbed.contains(&slot.id) || !slot.window.touches(&merged) {
                        continue;
                    }
                    if active_booking_on(&bookings, &slot.window).is_some() {
                        continue; // booked windows keep their identity
                    }
                    merged = TimeWindow::new(
                        merged.start.min(slot.window.start),
                        merged.end.max(slot.window.end),
                    );
                    absorbed.push(slot.id);
                    grew = true;
                }
                if !grew {
                    break;
                }
            }

            if !absorbed.is_empty() {
                let mut slots: Vec<Slot> = existing
                    .iter()
                    .filter(|s| !absorbed.contains(&s.id))
                    .copied()
                    .collect();
                slots.push(Slot { id, window: merged });
                slots.sort_by_key(|s| s.window.start);
                let event = Event::DayReplaced {
                    instructor_id,
                    date,
                    bits: bitmap::bits_from_slots(&slots).to_vec(),
                    slots,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                record_op("create_merged", started);
                debug!(%instructor_id, %date, %merged, absorbed = absorbed.len(), "slot created with merge");
                return Ok(id);
            }
        }

        let event = Event::SlotCreated { id, instructor_id, date, window };
        self.persist_and_apply(&mut guard, &event).await?;
        record_op("create", started);
        debug!(%instructor_id, %date, %window, "slot created");
        Ok(id)
    }

    /// Move or resize a window. A slot backing an active booking cannot be
    /// updated — the booking must be moved or cancelled first.
    pub async fn update_slot(
        &self,
        slot_id: Ulid,
        new_start: Option<TimeOfDay>,
        new_end: Option<TimeOfDay>,
    ) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        let (date, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let instructor_id = guard.instructor_id;
        let current = guard
            .day(date)
            .and_then(|d| d.slot(slot_id))
            .copied()
            .ok_or(EngineError::NotFound(slot_id))?;

        let window = TimeWindow {
            start: new_start.unwrap_or(current.window.start),
            end: new_end.unwrap_or(current.window.end),
        };
        validate_window(&window)?;

        let (bookings, blackouts) = self.fetch_blocking_inputs(instructor_id, date, date).await?;
        if let Some(booking) = active_booking_on(&bookings, &current.window) {
            return Err(EngineError::SlotHasBooking { slot: slot_id, booking: booking.id });
        }

        if let Some(day) = guard.day(date)
            && let Some(dup) = day.slots.iter().find(|s| s.id != slot_id && s.window == window)
        {
            return Err(EngineError::DuplicateSlot { existing: dup.id, window });
        }

        let hits = blocking_hits(&bookings, &blackouts, date, &window, guard.buffer_minutes);
        if !hits.is_empty() {
            return Err(EngineError::Conflict(hits));
        }

        let event = Event::SlotUpdated { id: slot_id, instructor_id, date, window };
        self.persist_and_apply(&mut guard, &event).await?;
        record_op("update", started);
        debug!(%slot_id, old = %current.window, new = %window, "slot updated");
        Ok(())
    }

    /// Remove a window. Without `force`, a pending booking on the window also
    /// blocks; `force` bypasses only that soft check. An active booking is a
    /// hard rule — deletion fails no matter what.
    pub async fn delete_slot(&self, slot_id: Ulid, force: bool) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        let (date, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let instructor_id = guard.instructor_id;
        let current = guard
            .day(date)
            .and_then(|d| d.slot(slot_id))
            .copied()
            .ok_or(EngineError::NotFound(slot_id))?;

        let (bookings, _) = self.fetch_blocking_inputs(instructor_id, date, date).await?;
        if let Some(booking) = active_booking_on(&bookings, &current.window) {
            return Err(EngineError::SlotHasBooking { slot: slot_id, booking: booking.id });
        }
        if !force
            && let Some(pending) = bookings.iter().find(|b| {
                b.status == BookingStatus::Pending && overlaps(&b.window, &current.window)
            })
        {
            return Err(EngineError::SlotHasBooking { slot: slot_id, booking: pending.id });
        }

        let event = Event::SlotDeleted { id: slot_id, instructor_id, date };
        self.persist_and_apply(&mut guard, &event).await?;
        record_op("delete", started);
        debug!(%slot_id, %date, window = %current.window, "slot deleted");
        Ok(())
    }

    /// Coalesce overlapping/touching free windows into minimal covering
    /// windows. With `preserve_booked`, windows under an active booking are
    /// excluded from merging and are never absorbed, even when adjacent.
    /// Returns how many windows were eliminated.
    pub async fn merge_overlapping_slots(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
        preserve_booked: bool,
    ) -> Result<usize, EngineError> {
        let started = std::time::Instant::now();
        let mut guard = self.calendar_write(instructor_id).await?;
        let Some(day) = guard.day(date) else {
            return Ok(0);
        };
        if day.slots.len() <= 1 {
            return Ok(0);
        }

        let bookings = if preserve_booked {
            self.fetch_blocking_inputs(instructor_id, date, date).await?.0
        } else {
            Vec::new()
        };

        let mut kept: Vec<Slot> = Vec::new();
        let mut groups: Vec<(TimeWindow, Vec<Ulid>)> = Vec::new();
        for slot in &day.slots {
            if preserve_booked && active_booking_on(&bookings, &slot.window).is_some() {
                kept.push(*slot);
                continue;
            }
            match groups.last_mut() {
                Some((window, members)) if slot.window.start <= window.end => {
                    window.end = window.end.max(slot.window.end);
                    members.push(slot.id);
                }
                _ => groups.push((slot.window, vec![slot.id])),
            }
        }

        let before = day.slots.len();
        let mut slots = kept;
        for (window, members) in groups {
            // Singleton groups keep their identity; real merges get a new id.
            let id = if members.len() == 1 { members[0] } else { Ulid::new() };
            slots.push(Slot { id, window });
        }
        slots.sort_by_key(|s| s.window.start);

        let eliminated = before - slots.len();
        if eliminated == 0 {
            return Ok(0);
        }

        let event = Event::DayReplaced {
            instructor_id,
            date,
            bits: bitmap::bits_from_slots(&slots).to_vec(),
            slots,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_op("merge", started);
        debug!(%instructor_id, %date, eliminated, "slots merged");
        Ok(eliminated)
    }

    /// Split a window in two at `at`, which must lie strictly inside it.
    /// Returns the ids of the left and right halves.
    pub async fn split_slot(
        &self,
        slot_id: Ulid,
        at: TimeOfDay,
    ) -> Result<(Ulid, Ulid), EngineError> {
        validate_time(at)?;
        let started = std::time::Instant::now();
        let (date, mut guard) = self.resolve_slot_write(&slot_id).await?;
        let instructor_id = guard.instructor_id;
        let current = guard
            .day(date)
            .and_then(|d| d.slot(slot_id))
            .copied()
            .ok_or(EngineError::NotFound(slot_id))?;

        if at <= current.window.start || at >= current.window.end {
            return Err(EngineError::SplitOutsideWindow { at, window: current.window });
        }

        let left = Slot { id: Ulid::new(), window: TimeWindow::new(current.window.start, at) };
        let right = Slot { id: Ulid::new(), window: TimeWindow::new(at, current.window.end) };

        let mut slots: Vec<Slot> = guard
            .day(date)
            .map(|d| d.slots.iter().filter(|s| s.id != slot_id).copied().collect())
            .unwrap_or_default();
        slots.push(left);
        slots.push(right);
        slots.sort_by_key(|s| s.window.start);

        let event = Event::DayReplaced {
            instructor_id,
            date,
            bits: bitmap::bits_from_slots(&slots).to_vec(),
            slots,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        record_op("split", started);
        debug!(%slot_id, %at, "slot split");
        Ok((left.id, right.id))
    }

    /// Uncovered intervals of at least `min_gap_minutes` between the day's
    /// covered runs, sorted by start. Read-only.
    pub async fn find_gaps_in_availability(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
        min_gap_minutes: u16,
    ) -> Result<Vec<Gap>, EngineError> {
        let windows = self.day_windows(instructor_id, date).await?;
        let mut gaps = Vec::new();
        for pair in windows.windows(2) {
            let duration = pair[1].start.minutes() - pair[0].end.minutes();
            if duration >= min_gap_minutes {
                gaps.push(Gap {
                    start: pair[0].end,
                    end: pair[1].start,
                    duration_minutes: duration,
                });
            }
        }
        Ok(gaps)
    }

    /// Suggest a packing of the day's coverage into back-to-back windows of
    /// exactly `target_duration_minutes`, dropping shorter remainders.
    /// Suggestions only — nothing is written.
    pub async fn optimize_availability(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
        target_duration_minutes: u16,
    ) -> Result<Vec<TimeWindow>, EngineError> {
        if target_duration_minutes == 0
            || target_duration_minutes > crate::limits::MINUTES_PER_DAY
            || target_duration_minutes % crate::limits::GRANULARITY_MINUTES != 0
        {
            return Err(EngineError::InvalidRange {
                reason: "target duration must be a positive multiple of the slot granularity",
            });
        }

        let windows = self.day_windows(instructor_id, date).await?;
        let mut suggestions = Vec::new();
        for window in windows {
            let mut cursor = window.start;
            while cursor.minutes() + target_duration_minutes <= window.end.minutes() {
                let end = cursor.saturating_add(target_duration_minutes);
                suggestions.push(TimeWindow::new(cursor, end));
                cursor = end;
            }
        }
        Ok(suggestions)
    }
}
