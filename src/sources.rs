//! Read-only collaborators: bookings and blackout dates.
//!
//! The engine never mutates bookings or blackouts; it only asks "what blocks
//! this instructor between these dates". Production deployments implement
//! these traits over their own persistence; the in-memory implementations
//! here back the test suite and small embeddings.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Blackout, Booking};

/// Collaborator failure. Timeouts and outages are retryable; constraint
/// violations mean the caller's input was bad and retrying won't help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    Timeout(String),
    Unavailable(String),
    Constraint(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Timeout(_) | SourceError::Unavailable(_))
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Timeout(m) => write!(f, "source timeout: {m}"),
            SourceError::Unavailable(m) => write!(f, "source unavailable: {m}"),
            SourceError::Constraint(m) => write!(f, "source constraint violation: {m}"),
        }
    }
}

impl std::error::Error for SourceError {}

#[async_trait]
pub trait BookingSource: Send + Sync {
    /// All bookings for `instructor_id` with `from <= date <= to`, any status.
    /// The engine filters blocking statuses itself.
    async fn bookings_in_range(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Booking>, SourceError>;
}

#[async_trait]
pub trait BlackoutSource: Send + Sync {
    async fn blackouts_in_range(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Blackout>, SourceError>;
}

/// In-memory booking source keyed by instructor.
#[derive(Default)]
pub struct InMemoryBookings {
    by_instructor: DashMap<Ulid, Vec<Booking>>,
}

impl InMemoryBookings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, booking: Booking) {
        self.by_instructor
            .entry(booking.instructor_id)
            .or_default()
            .push(booking);
    }

    pub fn set_status(&self, booking_id: Ulid, status: crate::model::BookingStatus) {
        for mut entry in self.by_instructor.iter_mut() {
            for b in entry.value_mut().iter_mut() {
                if b.id == booking_id {
                    b.status = status;
                }
            }
        }
    }
}

#[async_trait]
impl BookingSource for InMemoryBookings {
    async fn bookings_in_range(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Booking>, SourceError> {
        Ok(self
            .by_instructor
            .get(&instructor_id)
            .map(|e| {
                e.value()
                    .iter()
                    .filter(|b| b.date >= from && b.date <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory blackout source keyed by instructor.
#[derive(Default)]
pub struct InMemoryBlackouts {
    by_instructor: DashMap<Ulid, Vec<Blackout>>,
}

impl InMemoryBlackouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, blackout: Blackout) {
        self.by_instructor
            .entry(blackout.instructor_id)
            .or_default()
            .push(blackout);
    }
}

#[async_trait]
impl BlackoutSource for InMemoryBlackouts {
    async fn blackouts_in_range(
        &self,
        instructor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Blackout>, SourceError> {
        Ok(self
            .by_instructor
            .get(&instructor_id)
            .map(|e| {
                e.value()
                    .iter()
                    .filter(|b| b.date >= from && b.date <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, TimeOfDay, TimeWindow};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn window(sh: u16, eh: u16) -> TimeWindow {
        TimeWindow::new(
            TimeOfDay::from_hm(sh, 0).unwrap(),
            TimeOfDay::from_hm(eh, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn bookings_filtered_by_instructor_and_range() {
        let src = InMemoryBookings::new();
        let alice = Ulid::new();
        let bob = Ulid::new();

        src.insert(Booking {
            id: Ulid::new(),
            instructor_id: alice,
            date: d(2025, 6, 2),
            window: window(10, 11),
            status: BookingStatus::Confirmed,
        });
        src.insert(Booking {
            id: Ulid::new(),
            instructor_id: alice,
            date: d(2025, 6, 20),
            window: window(10, 11),
            status: BookingStatus::Confirmed,
        });
        src.insert(Booking {
            id: Ulid::new(),
            instructor_id: bob,
            date: d(2025, 6, 2),
            window: window(10, 11),
            status: BookingStatus::Confirmed,
        });

        let hits = src
            .bookings_in_range(alice, d(2025, 6, 1), d(2025, 6, 7))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].date, d(2025, 6, 2));
    }

    #[tokio::test]
    async fn status_updates_visible() {
        let src = InMemoryBookings::new();
        let alice = Ulid::new();
        let bid = Ulid::new();
        src.insert(Booking {
            id: bid,
            instructor_id: alice,
            date: d(2025, 6, 2),
            window: window(10, 11),
            status: BookingStatus::Confirmed,
        });
        src.set_status(bid, BookingStatus::Cancelled);

        let hits = src
            .bookings_in_range(alice, d(2025, 6, 2), d(2025, 6, 2))
            .await
            .unwrap();
        assert_eq!(hits[0].status, BookingStatus::Cancelled);
        assert!(!hits[0].is_blocking());
    }

    #[tokio::test]
    async fn blackouts_range_inclusive() {
        let src = InMemoryBlackouts::new();
        let alice = Ulid::new();
        src.insert(Blackout {
            instructor_id: alice,
            date: d(2025, 7, 4),
            reason: Some("holiday".into()),
        });

        let hits = src
            .blackouts_in_range(alice, d(2025, 7, 4), d(2025, 7, 4))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let none = src
            .blackouts_in_range(alice, d(2025, 7, 5), d(2025, 7, 10))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn retryable_classification() {
        assert!(SourceError::Timeout("t".into()).is_retryable());
        assert!(SourceError::Unavailable("u".into()).is_retryable());
        assert!(!SourceError::Constraint("c".into()).is_retryable());
    }
}
