//! Day-bitmap codec.
//!
//! A day is 96 fifteen-minute cells packed into 12 bytes. Cell `i` covers
//! minutes `[i*15, i*15 + 15)` from local midnight and lives at bit `i % 8`
//! (LSB-first) of byte `i / 8`. This mapping is identical on encode and
//! decode and is persisted inside `DayReplaced` WAL records, so it must stay
//! stable across releases.

use crate::limits::{CELLS_PER_DAY, DAY_BITMAP_BYTES, GRANULARITY_MINUTES};
use crate::model::{Slot, TimeOfDay, TimeWindow};

use super::EngineError;

pub type DayBits = [u8; DAY_BITMAP_BYTES];

/// Encode windows into a day bitmap.
///
/// Rejects windows with `end <= start`, misaligned boundaries, or boundaries
/// outside the day. Overlapping input windows are ORed together rather than
/// rejected.
pub fn bits_from_windows(windows: &[TimeWindow]) -> Result<DayBits, EngineError> {
    let mut bits = [0u8; DAY_BITMAP_BYTES];
    for window in windows {
        validate_window(window)?;
        set_window(&mut bits, window);
    }
    Ok(bits)
}

/// Decode a day bitmap into sorted, non-overlapping windows.
/// Contiguous runs of set cells come back as one window, so windows that
/// were adjacent on encode merge on decode.
pub fn windows_from_bits(bits: &DayBits) -> Vec<TimeWindow> {
    let mut windows = Vec::new();
    let mut run_start: Option<usize> = None;

    for cell in 0..=CELLS_PER_DAY {
        let set = cell < CELLS_PER_DAY && cell_is_set(bits, cell);
        match (set, run_start) {
            (true, None) => run_start = Some(cell),
            (false, Some(start)) => {
                windows.push(TimeWindow::new(cell_start(start), cell_start(cell)));
                run_start = None;
            }
            _ => {}
        }
    }

    windows
}

/// Encode a day's slot list. Slot windows are validated at the API boundary,
/// so state held by the store always encodes cleanly.
pub(crate) fn bits_from_slots(slots: &[Slot]) -> DayBits {
    let mut bits = [0u8; DAY_BITMAP_BYTES];
    for slot in slots {
        set_window(&mut bits, &slot.window);
    }
    bits
}

/// OR a window's cells into the bitmap.
pub fn set_window(bits: &mut DayBits, window: &TimeWindow) {
    for cell in window.start.cell()..window.end.cell() {
        bits[cell / 8] |= 1 << (cell % 8);
    }
}

/// Clear a window's cells from the bitmap.
pub fn clear_window(bits: &mut DayBits, window: &TimeWindow) {
    for cell in window.start.cell()..window.end.cell() {
        bits[cell / 8] &= !(1 << (cell % 8));
    }
}

pub fn is_all_zero(bits: &DayBits) -> bool {
    bits.iter().all(|b| *b == 0)
}

/// Subtract `cuts` from `base`, both sorted by start. Returns the uncovered
/// remainder of `base` as sorted, non-overlapping windows.
pub fn subtract_windows(base: &[TimeWindow], cuts: &[TimeWindow]) -> Vec<TimeWindow> {
    let mut result = Vec::new();
    let mut ci = 0;

    for b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ci < cuts.len() && cuts[ci].end <= current_start {
            ci += 1;
        }

        let mut j = ci;
        while j < cuts.len() && cuts[j].start < current_end {
            let cut = &cuts[j];
            if cut.start > current_start {
                result.push(TimeWindow::new(current_start, cut.start));
            }
            current_start = current_start.max(cut.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeWindow::new(current_start, current_end));
        }
    }

    result
}

fn cell_is_set(bits: &DayBits, cell: usize) -> bool {
    bits[cell / 8] & (1 << (cell % 8)) != 0
}

fn cell_start(cell: usize) -> TimeOfDay {
    TimeOfDay::from_minutes(cell as u16 * GRANULARITY_MINUTES).expect("cell within day")
}

/// Shared boundary validation: alignment, ordering, day range.
/// `end` may be 24:00 exactly; `start` must be strictly inside the day.
pub(crate) fn validate_window(window: &TimeWindow) -> Result<(), EngineError> {
    validate_time(window.start)?;
    validate_time(window.end)?;
    if window.end <= window.start {
        return Err(EngineError::EmptyWindow {
            start: window.start,
            end: window.end,
        });
    }
    Ok(())
}

pub(crate) fn validate_time(t: TimeOfDay) -> Result<(), EngineError> {
    if !t.is_aligned() {
        return Err(EngineError::MisalignedTime(t));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn t(h: u16, m: u16) -> TimeOfDay {
        TimeOfDay::from_hm(h, m).unwrap()
    }

    fn w(s: (u16, u16), e: (u16, u16)) -> TimeWindow {
        TimeWindow::new(t(s.0, s.1), t(e.0, e.1))
    }

    #[test]
    fn layout_is_lsb_first() {
        // 00:00-01:00 covers cells 0..4 → low nibble of byte 0
        let bits = bits_from_windows(&[w((0, 0), (1, 0))]).unwrap();
        assert_eq!(bits[0], 0b0000_1111);
        assert!(bits[1..].iter().all(|b| *b == 0));

        // 02:00-02:15 is cell 8 → bit 0 of byte 1
        let bits = bits_from_windows(&[w((2, 0), (2, 15))]).unwrap();
        assert_eq!(bits[0], 0);
        assert_eq!(bits[1], 0b0000_0001);
    }

    #[test]
    fn last_cell_reachable() {
        let window = TimeWindow::new(t(23, 45), TimeOfDay::END_OF_DAY);
        let bits = bits_from_windows(&[window]).unwrap();
        assert_eq!(bits[11], 0b1000_0000);
        assert_eq!(windows_from_bits(&bits), vec![window]);
    }

    #[test]
    fn full_day_roundtrip() {
        let bits = bits_from_windows(&[TimeWindow::full_day()]).unwrap();
        assert!(bits.iter().all(|b| *b == 0xFF));
        assert_eq!(windows_from_bits(&bits), vec![TimeWindow::full_day()]);
    }

    #[test]
    fn decode_merges_adjacent_runs() {
        let bits =
            bits_from_windows(&[w((9, 0), (10, 0)), w((10, 0), (11, 0)), w((14, 0), (15, 0))])
                .unwrap();
        assert_eq!(
            windows_from_bits(&bits),
            vec![w((9, 0), (11, 0)), w((14, 0), (15, 0))]
        );
    }

    #[test]
    fn overlapping_inputs_are_ored() {
        let a = bits_from_windows(&[w((9, 0), (11, 0)), w((10, 0), (12, 0))]).unwrap();
        let b = bits_from_windows(&[w((9, 0), (12, 0))]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn encode_rejects_empty_window() {
        let zero = TimeWindow { start: t(10, 0), end: t(10, 0) };
        assert!(matches!(
            bits_from_windows(&[zero]),
            Err(EngineError::EmptyWindow { .. })
        ));
        let backwards = TimeWindow { start: t(11, 0), end: t(10, 0) };
        assert!(matches!(
            bits_from_windows(&[backwards]),
            Err(EngineError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn encode_rejects_misaligned_boundary() {
        let odd = TimeWindow { start: t(9, 7), end: t(10, 0) };
        assert!(matches!(
            bits_from_windows(&[odd]),
            Err(EngineError::MisalignedTime(at)) if at == t(9, 7)
        ));
    }

    #[test]
    fn roundtrip_is_stable() {
        // bits_from_windows(windows_from_bits(b)) == b for codec-produced b
        let cases: Vec<Vec<TimeWindow>> = vec![
            vec![],
            vec![w((0, 0), (0, 15))],
            vec![w((9, 0), (12, 0)), w((13, 30), (17, 15))],
            vec![w((6, 0), (7, 0)), w((7, 0), (8, 0)), w((22, 0), (23, 45))],
            vec![TimeWindow::full_day()],
        ];
        for windows in cases {
            let bits = bits_from_windows(&windows).unwrap();
            let decoded = windows_from_bits(&bits);
            let reencoded = bits_from_windows(&decoded).unwrap();
            assert_eq!(reencoded, bits, "failed for {windows:?}");
        }
    }

    #[test]
    fn subtract_no_overlap() {
        let base = vec![w((9, 0), (10, 0)), w((11, 0), (12, 0))];
        let cuts = vec![w((10, 0), (11, 0))];
        assert_eq!(subtract_windows(&base, &cuts), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![w((10, 0), (11, 0))];
        let cuts = vec![w((9, 0), (12, 0))];
        assert!(subtract_windows(&base, &cuts).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![w((9, 0), (12, 0))];
        let cuts = vec![w((10, 0), (11, 0))];
        assert_eq!(
            subtract_windows(&base, &cuts),
            vec![w((9, 0), (10, 0)), w((11, 0), (12, 0))]
        );
    }

    #[test]
    fn subtract_partial_edges() {
        let base = vec![w((9, 0), (12, 0))];
        assert_eq!(
            subtract_windows(&base, &[w((8, 0), (10, 0))]),
            vec![w((10, 0), (12, 0))]
        );
        assert_eq!(
            subtract_windows(&base, &[w((11, 0), (13, 0))]),
            vec![w((9, 0), (11, 0))]
        );
    }

    #[test]
    fn subtract_multiple_cuts() {
        let base = vec![w((6, 0), (22, 0))];
        let cuts = vec![w((8, 0), (9, 0)), w((12, 0), (13, 0)), w((18, 0), (19, 0))];
        assert_eq!(
            subtract_windows(&base, &cuts),
            vec![
                w((6, 0), (8, 0)),
                w((9, 0), (12, 0)),
                w((13, 0), (18, 0)),
                w((19, 0), (22, 0)),
            ]
        );
    }

    #[test]
    fn set_then_clear_window() {
        let mut bits = [0u8; DAY_BITMAP_BYTES];
        set_window(&mut bits, &w((9, 0), (12, 0)));
        assert!(!is_all_zero(&bits));
        clear_window(&mut bits, &w((9, 0), (12, 0)));
        assert!(is_all_zero(&bits));
    }

    #[test]
    fn clear_partial_window_splits_run() {
        let mut bits = [0u8; DAY_BITMAP_BYTES];
        set_window(&mut bits, &w((9, 0), (12, 0)));
        clear_window(&mut bits, &w((10, 0), (11, 0)));
        assert_eq!(
            windows_from_bits(&bits),
            vec![w((9, 0), (10, 0)), w((11, 0), (12, 0))]
        );
    }

    #[test]
    fn bits_from_slots_skips_validation_but_matches_encoder() {
        let slots = vec![
            Slot { id: Ulid::new(), window: w((9, 0), (10, 0)) },
            Slot { id: Ulid::new(), window: w((9, 30), (11, 0)) },
        ];
        let via_slots = bits_from_slots(&slots);
        let via_windows = bits_from_windows(&[w((9, 0), (11, 0))]).unwrap();
        assert_eq!(via_slots, via_windows);
    }
}
