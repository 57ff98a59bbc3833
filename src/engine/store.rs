use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::{CalendarState, Event, Slot};

use super::bitmap;

pub type SharedCalendar = Arc<RwLock<CalendarState>>;

/// In-memory availability store: one calendar per instructor, one record per
/// `(instructor, date)` inside it, plus a reverse index from slot id to its
/// owning row. All mutation flows through `apply_event`, which is also the
/// WAL replay path.
pub struct AvailabilityStore {
    calendars: DashMap<Ulid, SharedCalendar>,
    slot_index: DashMap<Ulid, (Ulid, NaiveDate)>,
}

impl Default for AvailabilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            slot_index: DashMap::new(),
        }
    }

    // ── Calendar access ──────────────────────────────────────

    pub fn calendar_count(&self) -> usize {
        self.calendars.len()
    }

    pub fn contains_calendar(&self, instructor_id: &Ulid) -> bool {
        self.calendars.contains_key(instructor_id)
    }

    pub fn get_calendar(&self, instructor_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(instructor_id).map(|e| e.value().clone())
    }

    pub fn insert_calendar(&self, instructor_id: Ulid, calendar: SharedCalendar) {
        self.calendars.insert(instructor_id, calendar);
    }

    /// Atomic get-or-create. The entry lock closes the race where two first
    /// writers for the same instructor would otherwise both insert, orphaning
    /// one writer's calendar.
    pub fn get_or_create_calendar(&self, instructor_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(instructor_id)
            .or_insert_with(|| Arc::new(RwLock::new(CalendarState::new(instructor_id, 0))))
            .value()
            .clone()
    }

    pub fn instructor_ids(&self) -> Vec<Ulid> {
        self.calendars.iter().map(|e| *e.key()).collect()
    }

    // ── Slot index ───────────────────────────────────────────

    pub fn resolve_slot(&self, slot_id: &Ulid) -> Option<(Ulid, NaiveDate)> {
        self.slot_index.get(slot_id).map(|e| *e.value())
    }

    fn map_slot(&self, slot_id: Ulid, instructor_id: Ulid, date: NaiveDate) {
        self.slot_index.insert(slot_id, (instructor_id, date));
    }

    fn unmap_slot(&self, slot_id: &Ulid) {
        self.slot_index.remove(slot_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply one event to a calendar the caller has write-locked.
    /// Keeps the day's bitmap and the slot index in sync with the slot list.
    pub fn apply_event(&self, cal: &mut CalendarState, event: &Event) {
        match event {
            Event::BufferChanged { buffer_minutes, .. } => {
                cal.buffer_minutes = *buffer_minutes;
            }
            Event::SlotCreated { id, instructor_id, date, window } => {
                let day = cal.ensure_day(*date);
                day.insert_slot(Slot { id: *id, window: *window });
                day.cleared = false;
                day.bits = bitmap::bits_from_slots(&day.slots);
                self.map_slot(*id, *instructor_id, *date);
            }
            Event::SlotUpdated { id, instructor_id, date, window } => {
                if let Some(day) = cal.day_mut(*date) {
                    day.remove_slot(*id);
                    day.insert_slot(Slot { id: *id, window: *window });
                    day.bits = bitmap::bits_from_slots(&day.slots);
                }
                self.map_slot(*id, *instructor_id, *date);
            }
            Event::SlotDeleted { id, date, .. } => {
                if let Some(day) = cal.day_mut(*date) {
                    day.remove_slot(*id);
                    day.bits = bitmap::bits_from_slots(&day.slots);
                    if day.is_empty() {
                        day.cleared = true;
                    }
                }
                self.unmap_slot(id);
            }
            Event::DayReplaced { instructor_id, date, bits, slots } => {
                let day = cal.ensure_day(*date);
                for old in &day.slots {
                    self.slot_index.remove(&old.id);
                }
                day.slots = slots.clone();
                day.slots.sort_by_key(|s| s.window.start);
                day.bits = bitmap::bits_from_slots(&day.slots);
                debug_assert_eq!(day.bits.as_slice(), bits.as_slice());
                day.cleared = day.is_empty();
                for slot in &day.slots {
                    self.map_slot(slot.id, *instructor_id, *date);
                }
            }
            Event::DayCleared { date, .. } => {
                if let Some(day) = cal.day_mut(*date) {
                    for old in &day.slots {
                        self.slot_index.remove(&old.id);
                    }
                    day.slots.clear();
                    day.bits = [0u8; crate::limits::DAY_BITMAP_BYTES];
                    day.cleared = true;
                }
            }
            // Calendar creation is handled at the map level by the engine.
            Event::CalendarCreated { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TimeOfDay, TimeWindow};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn w(sh: u16, eh: u16) -> TimeWindow {
        TimeWindow::new(
            TimeOfDay::from_hm(sh, 0).unwrap(),
            TimeOfDay::from_hm(eh, 0).unwrap(),
        )
    }

    #[test]
    fn slot_lifecycle_keeps_bits_and_index_in_sync() {
        let store = AvailabilityStore::new();
        let iid = Ulid::new();
        let mut cal = CalendarState::new(iid, 0);
        let sid = Ulid::new();

        store.apply_event(
            &mut cal,
            &Event::SlotCreated { id: sid, instructor_id: iid, date: d(2), window: w(9, 10) },
        );
        assert_eq!(store.resolve_slot(&sid), Some((iid, d(2))));
        let day = cal.day(d(2)).unwrap();
        assert_eq!(bitmap::windows_from_bits(&day.bits), vec![w(9, 10)]);

        store.apply_event(
            &mut cal,
            &Event::SlotUpdated { id: sid, instructor_id: iid, date: d(2), window: w(14, 16) },
        );
        let day = cal.day(d(2)).unwrap();
        assert_eq!(bitmap::windows_from_bits(&day.bits), vec![w(14, 16)]);

        store.apply_event(
            &mut cal,
            &Event::SlotDeleted { id: sid, instructor_id: iid, date: d(2) },
        );
        assert_eq!(store.resolve_slot(&sid), None);
        let day = cal.day(d(2)).unwrap();
        assert!(day.cleared);
        assert!(bitmap::is_all_zero(&day.bits));
    }

    #[test]
    fn day_replaced_swaps_slot_identities() {
        let store = AvailabilityStore::new();
        let iid = Ulid::new();
        let mut cal = CalendarState::new(iid, 0);
        let old_id = Ulid::new();

        store.apply_event(
            &mut cal,
            &Event::SlotCreated { id: old_id, instructor_id: iid, date: d(3), window: w(9, 10) },
        );

        let new_slot = Slot { id: Ulid::new(), window: w(9, 12) };
        store.apply_event(
            &mut cal,
            &Event::DayReplaced {
                instructor_id: iid,
                date: d(3),
                bits: bitmap::bits_from_slots(std::slice::from_ref(&new_slot)).to_vec(),
                slots: vec![new_slot],
            },
        );

        assert_eq!(store.resolve_slot(&old_id), None);
        assert_eq!(store.resolve_slot(&new_slot.id), Some((iid, d(3))));
        assert_eq!(cal.day(d(3)).unwrap().slots.len(), 1);
    }

    #[test]
    fn day_cleared_retains_record() {
        let store = AvailabilityStore::new();
        let iid = Ulid::new();
        let mut cal = CalendarState::new(iid, 0);
        let sid = Ulid::new();

        store.apply_event(
            &mut cal,
            &Event::SlotCreated { id: sid, instructor_id: iid, date: d(4), window: w(9, 10) },
        );
        store.apply_event(&mut cal, &Event::DayCleared { instructor_id: iid, date: d(4) });

        let day = cal.day(d(4)).expect("record retained after clear");
        assert!(day.cleared);
        assert!(day.is_empty());
        assert_eq!(store.resolve_slot(&sid), None);
    }

    #[test]
    fn buffer_changed_applies() {
        let store = AvailabilityStore::new();
        let iid = Ulid::new();
        let mut cal = CalendarState::new(iid, 0);
        store.apply_event(&mut cal, &Event::BufferChanged { instructor_id: iid, buffer_minutes: 30 });
        assert_eq!(cal.buffer_minutes, 30);
    }
}
