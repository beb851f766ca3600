// Prototune
// Copyright (C) 2021  Wesley Merkel
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Bounds of the piano roll grid and the instrument knobs.
//!
//! A roll is [`TICKS`] columns wide and [`ROWS`] rows tall. Row 0 is the top of the grid and
//! plays MIDI note [`TOP_PITCH`]; every row further down is one semitone lower.
//!
//! Local edits are clamped into range with the `clamp_*` functions before they are recorded.
//! Values arriving from other clients are checked with the `check_*` functions instead, since a
//! remote value out of range means the sender is broken, not that a drag went past the edge.

use std::ops::RangeInclusive;

/// Number of ticks (columns) in a roll.
pub const TICKS: u32 = 64;

/// Number of rows (semitones) in a roll.
pub const ROWS: u32 = 88;

/// The MIDI note number played by row 0.
pub const TOP_PITCH: u32 = 108;

/// Volume knob range, in decibels.
pub const VOLUME_DB: RangeInclusive<f64> = -60.0..=0.0;

/// Range of the reverb and delay wet/dry knobs.
pub const MIX: RangeInclusive<f64> = 0.0..=1.0;

/// Clamps a horizontal position to `0..TICKS`.
pub fn clamp_tick(tick: i64) -> u32 {
    tick.max(0).min(i64::from(TICKS - 1)) as u32
}

/// Clamps a vertical position to `0..ROWS`.
pub fn clamp_row(row: i64) -> u32 {
    row.max(0).min(i64::from(ROWS - 1)) as u32
}

/// Lengths shorter than one tick become one tick.
pub fn clamp_length(length: i64) -> u32 {
    length.max(1).min(i64::from(u32::MAX)) as u32
}

pub fn clamp_volume(db: f64) -> f64 {
    clamp_to(db, &VOLUME_DB)
}

pub fn clamp_mix(mix: f64) -> f64 {
    clamp_to(mix, &MIX)
}

fn clamp_to(value: f64, range: &RangeInclusive<f64>) -> f64 {
    if value.is_nan() {
        return *range.start();
    }
    value.max(*range.start()).min(*range.end())
}

pub fn check_tick(tick: i64) -> Option<u32> {
    check_index(tick, TICKS)
}

pub fn check_row(row: i64) -> Option<u32> {
    check_index(row, ROWS)
}

pub fn check_length(length: i64) -> Option<u32> {
    if length >= 1 && length <= i64::from(u32::MAX) {
        Some(length as u32)
    } else {
        None
    }
}

pub fn check_volume(db: f64) -> Option<f64> {
    Some(db).filter(|db| VOLUME_DB.contains(db))
}

pub fn check_mix(mix: f64) -> Option<f64> {
    Some(mix).filter(|mix| MIX.contains(mix))
}

fn check_index(index: i64, len: u32) -> Option<u32> {
    if index >= 0 && index < i64::from(len) {
        Some(index as u32)
    } else {
        None
    }
}

/// The MIDI note number played by notes on `row`.
pub fn pitch(row: u32) -> u32 {
    TOP_PITCH.saturating_sub(row)
}
