//! Contiguous seat-block allocation.
//!
//! Pure and deterministic: rows are visited in ascending order, seats in
//! ascending seat number, and only ordered containers are used, so identical
//! inputs always produce the same block.

use std::collections::BTreeMap;

use crate::models::{SeatId, SeatView};

/// Returns `count` seats of one row with consecutive seat numbers, or an empty
/// vec when no such block is free.
///
/// Without an anchor the first free window across all rows wins. With an
/// anchor only the anchor's row is considered: first the window starting at the
/// anchor and extending right, then the one ending at the anchor.
pub fn allocate(seat_map: &[SeatView], count: usize, anchor: Option<SeatId>) -> Vec<SeatId> {
    if count == 0 {
        return Vec::new();
    }
    match anchor {
        Some(anchor) => allocate_anchored(seat_map, count, anchor),
        None => allocate_first_fit(seat_map, count),
    }
}

/// Available seats grouped by row, each row sorted by seat number.
fn available_rows(seat_map: &[SeatView]) -> BTreeMap<i32, Vec<&SeatView>> {
    let mut rows: BTreeMap<i32, Vec<&SeatView>> = BTreeMap::new();
    for seat in seat_map.iter().filter(|s| s.is_available()) {
        rows.entry(seat.row_num).or_default().push(seat);
    }
    for seats in rows.values_mut() {
        seats.sort_by_key(|s| (s.seat_num, s.seat_id));
    }
    rows
}

fn is_consecutive(window: &[&SeatView]) -> bool {
    window
        .windows(2)
        .all(|pair| pair[1].seat_num == pair[0].seat_num + 1)
}

fn allocate_first_fit(seat_map: &[SeatView], count: usize) -> Vec<SeatId> {
    for seats in available_rows(seat_map).values() {
        if let Some(window) = seats.windows(count).find(|w| is_consecutive(w)) {
            return window.iter().map(|s| s.seat_id).collect();
        }
    }
    Vec::new()
}

fn allocate_anchored(seat_map: &[SeatView], count: usize, anchor: SeatId) -> Vec<SeatId> {
    let Some(anchor_seat) = seat_map.iter().find(|s| s.seat_id == anchor) else {
        return Vec::new();
    };
    if !anchor_seat.is_available() {
        return Vec::new();
    }

    let row: BTreeMap<i32, SeatId> = seat_map
        .iter()
        .filter(|s| s.row_num == anchor_seat.row_num && s.is_available())
        .map(|s| (s.seat_num, s.seat_id))
        .collect();

    // a block longer than the row can never fit
    if count > row.len() {
        return Vec::new();
    }
    let Ok(span) = i32::try_from(count - 1) else {
        return Vec::new();
    };
    let anchor_num = anchor_seat.seat_num;
    let rightward = anchor_num.checked_add(span).map(|end| anchor_num..=end);
    let leftward = anchor_num.checked_sub(span).map(|start| start..=anchor_num);

    [rightward, leftward]
        .into_iter()
        .flatten()
        .find_map(|range| range.map(|num| row.get(&num).copied()).collect::<Option<Vec<_>>>())
        .unwrap_or_default()
}
