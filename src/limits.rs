//! Hard limits and the fixed time grid.
//!
//! The grid constants define the bitmap layout and are load-bearing for
//! persisted data: changing them invalidates every stored day bitmap.

/// Minimum addressable time unit. Every window boundary must align to it.
pub const GRANULARITY_MINUTES: u16 = 15;

/// Length of a calendar day in minutes.
pub const MINUTES_PER_DAY: u16 = 1440;

/// Number of granularity cells in one day (96 at 15-minute granularity).
pub const CELLS_PER_DAY: usize = (MINUTES_PER_DAY / GRANULARITY_MINUTES) as usize;

/// Fixed byte length of a day bitmap.
pub const DAY_BITMAP_BYTES: usize = CELLS_PER_DAY / 8;

/// Upper bound on stored windows for a single day.
pub const MAX_SLOTS_PER_DAY: usize = CELLS_PER_DAY;

/// Widest date range accepted by bulk pattern application.
pub const MAX_RANGE_DAYS: i64 = 366;

/// Most dates accepted by one multi-day conflict check.
pub const MAX_MULTI_DAY_DATES: usize = 92;

/// Most instructor calendars one engine will hold.
pub const MAX_CALENDARS: usize = 100_000;

/// Largest configurable buffer between bookings.
pub const MAX_BUFFER_MINUTES: u16 = 240;
