pub mod bitmap;
mod conflict;
mod error;
mod slots;
mod store;
mod weeks;

pub use conflict::{blocking_hits, overlaps, overlaps_with_buffer};
pub use error::{EngineError, ErrorKind};
pub use store::{AvailabilityStore, SharedCalendar};
pub use weeks::calculate_week_dates;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::cache::WeekCache;
use crate::limits::{MAX_BUFFER_MINUTES, MAX_CALENDARS};
use crate::model::{CalendarState, DayState, Event, TimeWindow};
use crate::sources::{BlackoutSource, BookingSource};
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Appends are batched: buffer the first
/// event, drain whatever else is immediately queued, then one fsync for the
/// whole batch before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let started = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(started.elapsed().as_secs_f64());

                for (_, tx) in batch {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }

                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch (these callers were already told it failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The availability engine: slot-level and week-level mutations over
/// per-instructor calendars, conflict checks against the read-only booking
/// and blackout collaborators, durability via the WAL.
///
/// Every mutating operation holds its calendar's write lock from the conflict
/// read through the bitmap write — that lock is the transaction boundary, so
/// a booking created between check and write by a concurrent caller on the
/// same calendar is impossible.
pub struct Engine {
    pub(crate) store: AvailabilityStore,
    wal_tx: mpsc::Sender<WalCommand>,
    pub(crate) bookings: Arc<dyn BookingSource>,
    pub(crate) blackouts: Arc<dyn BlackoutSource>,
    pub cache: WeekCache,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        bookings: Arc<dyn BookingSource>,
        blackouts: Arc<dyn BlackoutSource>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: AvailabilityStore::new(),
            wal_tx,
            bookings,
            blackouts,
            cache: WeekCache::new(),
        };

        // Replay — we are the sole owner of every calendar Arc here, so
        // try_write always succeeds. Never block_on inside an async context.
        for event in &events {
            match event {
                Event::CalendarCreated { instructor_id, buffer_minutes } => {
                    if !engine.store.contains_calendar(instructor_id) {
                        let mut cal = CalendarState::new(*instructor_id, *buffer_minutes);
                        cal.persisted = true;
                        engine.store.insert_calendar(*instructor_id, Arc::new(RwLock::new(cal)));
                    }
                }
                other => {
                    if let Some(cal) = engine.store.get_calendar(&other.instructor_id()) {
                        let mut guard = cal.try_write().expect("replay: uncontended write");
                        engine.store.apply_event(&mut guard, other);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::CALENDARS_ACTIVE)
            .set(engine.store.calendar_count() as f64);
        debug!(events = events.len(), "engine replayed");
        Ok(engine)
    }

    /// Write an event to the WAL via the group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + cache invalidation in one call. Every mutation
    /// commits through here; invalidation happens before the write returns,
    /// so readers never observe a stale week.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut CalendarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(cal, event);
        if let Some(date) = event.date() {
            self.invalidate_weeks_containing(event.instructor_id(), date);
        }
        Ok(())
    }

    /// Drop every cached week pattern whose 7-day window contains `date`.
    pub(super) fn invalidate_weeks_containing(&self, instructor_id: Ulid, date: NaiveDate) {
        for offset in 0..7 {
            let week_start = date - chrono::Days::new(offset);
            self.cache.invalidate(&WeekCache::week_key(instructor_id, week_start));
        }
    }

    /// Write-lock the instructor's calendar, creating it lazily on the first
    /// write. `CalendarCreated` is logged under the lock, so it is always
    /// durable before the first slot event for this instructor.
    pub(super) async fn calendar_write(
        &self,
        instructor_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<CalendarState>, EngineError> {
        if !self.store.contains_calendar(&instructor_id)
            && self.store.calendar_count() >= MAX_CALENDARS
        {
            return Err(EngineError::LimitExceeded("too many calendars"));
        }
        let cal = self.store.get_or_create_calendar(instructor_id);
        let mut guard = cal.write_owned().await;
        if !guard.persisted {
            self.wal_append(&Event::CalendarCreated {
                instructor_id,
                buffer_minutes: guard.buffer_minutes,
            })
            .await?;
            guard.persisted = true;
            metrics::gauge!(crate::observability::CALENDARS_ACTIVE)
                .set(self.store.calendar_count() as f64);
        }
        Ok(guard)
    }

    /// Resolve a slot id to its date and write-lock the owning calendar.
    pub(super) async fn resolve_slot_write(
        &self,
        slot_id: &Ulid,
    ) -> Result<(NaiveDate, tokio::sync::OwnedRwLockWriteGuard<CalendarState>), EngineError> {
        let (instructor_id, date) = self
            .store
            .resolve_slot(slot_id)
            .ok_or(EngineError::NotFound(*slot_id))?;
        let cal = self
            .store
            .get_calendar(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let guard = cal.write_owned().await;
        Ok((date, guard))
    }

    pub fn calendar_count(&self) -> usize {
        self.store.calendar_count()
    }

    /// Per-instructor buffer configuration (minutes around other bookings).
    pub async fn set_buffer_minutes(
        &self,
        instructor_id: Ulid,
        buffer_minutes: u16,
    ) -> Result<(), EngineError> {
        if buffer_minutes > MAX_BUFFER_MINUTES {
            return Err(EngineError::LimitExceeded("buffer too large"));
        }
        let mut guard = self.calendar_write(instructor_id).await?;
        let event = Event::BufferChanged { instructor_id, buffer_minutes };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Decoded availability windows for one day (coalesced coverage).
    pub async fn day_windows(
        &self,
        instructor_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<TimeWindow>, EngineError> {
        let Some(cal) = self.store.get_calendar(&instructor_id) else {
            return Ok(Vec::new());
        };
        let guard = cal.read().await;
        Ok(guard
            .day(date)
            .map(|day| bitmap::windows_from_bits(&day.bits))
            .unwrap_or_default())
    }

    pub async fn day_state(&self, instructor_id: Ulid, date: NaiveDate) -> DayState {
        match self.store.get_calendar(&instructor_id) {
            Some(cal) => cal.read().await.day_state(date),
            None => DayState::Unset,
        }
    }

    /// Rewrite the WAL down to the events that recreate current state:
    /// one `CalendarCreated` plus one `DayReplaced` per day record (cleared
    /// days included, so the cleared-vs-unset distinction survives restart).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        for instructor_id in self.store.instructor_ids() {
            let Some(cal) = self.store.get_calendar(&instructor_id) else {
                continue;
            };
            let guard = cal.read().await;
            events.push(Event::CalendarCreated {
                instructor_id,
                buffer_minutes: guard.buffer_minutes,
            });
            for (date, day) in &guard.days {
                events.push(Event::DayReplaced {
                    instructor_id,
                    date: *date,
                    bits: day.bits.to_vec(),
                    slots: day.slots.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
