use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, Weekday};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::limits::{DAY_BITMAP_BYTES, GRANULARITY_MINUTES, MINUTES_PER_DAY};

/// Minute-of-day — the only time-of-day type.
///
/// Valid values are `0..=1440`; `1440` (24:00) only appears as an exclusive
/// window end, so the last granularity cell of the day stays addressable.
/// Rendered as `"HH:MM"` at the serde boundary and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(MINUTES_PER_DAY);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Whether this boundary sits on the granularity grid.
    pub fn is_aligned(self) -> bool {
        self.0 % GRANULARITY_MINUTES == 0
    }

    /// Index of the granularity cell starting at this time.
    pub fn cell(self) -> usize {
        (self.0 / GRANULARITY_MINUTES) as usize
    }

    pub fn saturating_sub(self, minutes: u16) -> Self {
        Self(self.0.saturating_sub(minutes))
    }

    pub fn saturating_add(self, minutes: u16) -> Self {
        Self((self.0 as u32 + minutes as u32).min(MINUTES_PER_DAY as u32) as u16)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        let hour: u16 = h.parse().map_err(|_| format!("bad hour in {s:?}"))?;
        let minute: u16 = m.parse().map_err(|_| format!("bad minute in {s:?}"))?;
        TimeOfDay::from_hm(hour, minute).ok_or_else(|| format!("out of range: {s:?}"))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "window start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> u16 {
        self.end.minutes() - self.start.minutes()
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping or touching end-to-start.
    pub fn touches(&self, other: &TimeWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_time(&self, t: TimeOfDay) -> bool {
        self.start <= t && t < self.end
    }

    pub fn contains_window(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The whole calendar day.
    pub fn full_day() -> Self {
        Self {
            start: TimeOfDay::MIDNIGHT,
            end: TimeOfDay::END_OF_DAY,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Booking lifecycle states as reported by the booking collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Only confirmed and completed bookings block availability writes.
    pub fn is_blocking(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Completed)
    }
}

/// A booking row as seen from the read-only booking collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub status: BookingStatus,
}

impl Booking {
    pub fn is_blocking(&self) -> bool {
        self.status.is_blocking()
    }
}

/// Whole-day exclusion, independent of any window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blackout {
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub reason: Option<String>,
}

/// One identified availability window inside a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub window: TimeWindow,
}

/// A single day's availability record.
///
/// `slots` carries window identity (sorted by start, mutually non-overlapping
/// unless the caller opted out of merging); `bits` is the canonical bitmap
/// encoding of the same coverage, kept in sync by the store on every mutation.
/// `cleared` distinguishes "explicitly emptied" from a day that was never
/// configured (which has no record at all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarDay {
    pub slots: Vec<Slot>,
    pub bits: [u8; DAY_BITMAP_BYTES],
    pub cleared: bool,
}

impl Default for CalendarDay {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            bits: [0u8; DAY_BITMAP_BYTES],
            cleared: false,
        }
    }
}

impl CalendarDay {
    /// Insert a slot maintaining sort order by window start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.window.start, |s| s.window.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// Slots whose window overlaps the query window.
    /// Binary search skips slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeWindow) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.window.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.window.end > query.start)
    }

    pub fn windows(&self) -> Vec<TimeWindow> {
        self.slots.iter().map(|s| s.window).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Lifecycle state of a day record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    /// No record was ever written for this date.
    Unset,
    /// At least one window is open.
    HasWindows,
    /// A record exists but its last window was removed.
    Cleared,
}

/// All availability state for one instructor.
#[derive(Debug, Clone)]
pub struct CalendarState {
    pub instructor_id: Ulid,
    /// Minimum gap in minutes required around other people's bookings.
    pub buffer_minutes: u16,
    pub days: BTreeMap<NaiveDate, CalendarDay>,
    /// Whether `CalendarCreated` is durable in the WAL. Checked under the
    /// calendar write lock so the creation record always precedes the first
    /// slot event for this instructor.
    pub(crate) persisted: bool,
}

impl CalendarState {
    pub fn new(instructor_id: Ulid, buffer_minutes: u16) -> Self {
        Self {
            instructor_id,
            buffer_minutes,
            days: BTreeMap::new(),
            persisted: false,
        }
    }

    pub fn day(&self, date: NaiveDate) -> Option<&CalendarDay> {
        self.days.get(&date)
    }

    pub fn day_mut(&mut self, date: NaiveDate) -> Option<&mut CalendarDay> {
        self.days.get_mut(&date)
    }

    /// The day record for `date`, created empty if absent.
    pub fn ensure_day(&mut self, date: NaiveDate) -> &mut CalendarDay {
        self.days.entry(date).or_default()
    }

    pub fn day_state(&self, date: NaiveDate) -> DayState {
        match self.days.get(&date) {
            None => DayState::Unset,
            Some(day) if day.is_empty() => DayState::Cleared,
            Some(_) => DayState::HasWindows,
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// `DayReplaced` carries the day's bitmap verbatim: that byte array is the
/// stable persisted layout, so its bit→minute mapping must never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CalendarCreated {
        instructor_id: Ulid,
        buffer_minutes: u16,
    },
    BufferChanged {
        instructor_id: Ulid,
        buffer_minutes: u16,
    },
    SlotCreated {
        id: Ulid,
        instructor_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    },
    SlotUpdated {
        id: Ulid,
        instructor_id: Ulid,
        date: NaiveDate,
        window: TimeWindow,
    },
    SlotDeleted {
        id: Ulid,
        instructor_id: Ulid,
        date: NaiveDate,
    },
    /// Wholesale day rewrite (merge, split, bulk week operations).
    DayReplaced {
        instructor_id: Ulid,
        date: NaiveDate,
        bits: Vec<u8>,
        slots: Vec<Slot>,
    },
    /// Zero the day's bits but retain the record.
    DayCleared {
        instructor_id: Ulid,
        date: NaiveDate,
    },
}

impl Event {
    pub fn instructor_id(&self) -> Ulid {
        match self {
            Event::CalendarCreated { instructor_id, .. }
            | Event::BufferChanged { instructor_id, .. }
            | Event::SlotCreated { instructor_id, .. }
            | Event::SlotUpdated { instructor_id, .. }
            | Event::SlotDeleted { instructor_id, .. }
            | Event::DayReplaced { instructor_id, .. }
            | Event::DayCleared { instructor_id, .. } => *instructor_id,
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Event::SlotCreated { date, .. }
            | Event::SlotUpdated { date, .. }
            | Event::SlotDeleted { date, .. }
            | Event::DayReplaced { date, .. }
            | Event::DayCleared { date, .. } => Some(*date),
            Event::CalendarCreated { .. } | Event::BufferChanged { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// What a candidate window collided with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConflictKind {
    Booking { id: Ulid, status: BookingStatus },
    Blackout { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictHit {
    pub date: NaiveDate,
    /// The blocking interval (whole day for blackouts).
    pub window: TimeWindow,
    pub kind: ConflictKind,
}

/// An uncovered interval between availability windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub duration_minutes: u16,
}

/// One week of availability windows keyed by weekday.
/// All seven keys are always present, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekPattern {
    pub monday: Vec<TimeWindow>,
    pub tuesday: Vec<TimeWindow>,
    pub wednesday: Vec<TimeWindow>,
    pub thursday: Vec<TimeWindow>,
    pub friday: Vec<TimeWindow>,
    pub saturday: Vec<TimeWindow>,
    pub sunday: Vec<TimeWindow>,
}

impl WeekPattern {
    pub fn for_weekday(&self, weekday: Weekday) -> &[TimeWindow] {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    pub fn set_weekday(&mut self, weekday: Weekday, windows: Vec<TimeWindow>) {
        let target = match weekday {
            Weekday::Mon => &mut self.monday,
            Weekday::Tue => &mut self.tuesday,
            Weekday::Wed => &mut self.wednesday,
            Weekday::Thu => &mut self.thursday,
            Weekday::Fri => &mut self.friday,
            Weekday::Sat => &mut self.saturday,
            Weekday::Sun => &mut self.sunday,
        };
        *target = windows;
    }

    pub fn is_empty(&self) -> bool {
        self.monday.is_empty()
            && self.tuesday.is_empty()
            && self.wednesday.is_empty()
            && self.thursday.is_empty()
            && self.friday.is_empty()
            && self.saturday.is_empty()
            && self.sunday.is_empty()
    }
}

/// Outcome of `copy_week_availability`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WeekCopyReport {
    pub dates_created: usize,
    pub slots_created: usize,
    pub slots_skipped: usize,
    pub dates_with_preserved_bookings: Vec<NaiveDate>,
}

/// Outcome of `apply_pattern_to_date_range`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatternApplyReport {
    pub dates_created: usize,
    pub dates_modified: usize,
    pub slots_created: usize,
    pub slots_skipped: usize,
    pub total_bookings_preserved: usize,
}
