//! freebusy — availability and booking-conflict engine.
//!
//! Instructor availability is stored as one compact bitmap per day (96
//! fifteen-minute cells). The engine converts bitmaps to and from explicit
//! time windows, detects conflicts against bookings and blackout dates (with
//! configurable buffer time), and performs bulk week-level rewrites that
//! never destroy time backing an active booking.

pub mod cache;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sources;
pub mod wal;

pub use engine::{Engine, EngineError, ErrorKind};
pub use model::{
    Blackout, Booking, BookingStatus, ConflictHit, ConflictKind, DayState, Gap,
    PatternApplyReport, Slot, TimeOfDay, TimeWindow, WeekCopyReport, WeekPattern,
};
