use ulid::Ulid;

use crate::model::{ConflictHit, TimeOfDay, TimeWindow};

/// Coarse classification for API-layer mapping and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    BusinessRule,
    Storage,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// Boundary not on the granularity grid.
    MisalignedTime(TimeOfDay),
    /// `end <= start`.
    EmptyWindow { start: TimeOfDay, end: TimeOfDay },
    /// Split point not strictly inside the window.
    SplitOutsideWindow { at: TimeOfDay, window: TimeWindow },
    /// Malformed range input: bulk date ranges, target durations.
    InvalidRange { reason: &'static str },
    /// A free window with exactly these boundaries already exists.
    DuplicateSlot { existing: Ulid, window: TimeWindow },
    /// Candidate collides with active bookings and/or blackout dates.
    Conflict(Vec<ConflictHit>),
    /// The slot backs an active booking; move or cancel the booking first.
    SlotHasBooking { slot: Ulid, booking: Ulid },
    LimitExceeded(&'static str),
    /// Storage-level constraint violation caused by caller input.
    /// Classified as validation: retrying the same input cannot succeed.
    ConstraintViolation(String),
    /// Collaborator/persistence failure. Timeouts are retryable.
    Storage { message: String, retryable: bool },
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::MisalignedTime(_)
            | EngineError::EmptyWindow { .. }
            | EngineError::SplitOutsideWindow { .. }
            | EngineError::InvalidRange { .. }
            | EngineError::ConstraintViolation(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::DuplicateSlot { .. } | EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::SlotHasBooking { .. } => ErrorKind::BusinessRule,
            EngineError::Storage { .. } | EngineError::WalError(_) => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage { retryable: true, .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::MisalignedTime(t) => {
                write!(f, "time {t} is not aligned to the slot granularity")
            }
            EngineError::EmptyWindow { start, end } => {
                write!(f, "window end {end} must be after start {start}")
            }
            EngineError::SplitOutsideWindow { at, window } => {
                write!(f, "split point {at} must be between slot start and end times ({window})")
            }
            EngineError::InvalidRange { reason } => write!(f, "invalid range: {reason}"),
            EngineError::DuplicateSlot { existing, window } => {
                write!(f, "slot {window} already exists: {existing}")
            }
            EngineError::Conflict(hits) => {
                write!(f, "window conflicts with {} blocking interval(s):", hits.len())?;
                for hit in hits {
                    match &hit.kind {
                        crate::model::ConflictKind::Booking { id, .. } => {
                            write!(f, " booking {id} {} {}", hit.date, hit.window)?;
                        }
                        crate::model::ConflictKind::Blackout { .. } => {
                            write!(f, " blackout {}", hit.date)?;
                        }
                    }
                }
                Ok(())
            }
            EngineError::SlotHasBooking { slot, booking } => {
                write!(f, "cannot modify slot {slot}: active booking {booking} occupies it")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::ConstraintViolation(m) => write!(f, "constraint violation: {m}"),
            EngineError::Storage { message, retryable } => {
                write!(f, "storage error ({}): {message}", if *retryable { "retryable" } else { "permanent" })
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
