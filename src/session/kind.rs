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

use serde::{Deserialize, Serialize};
use std::fmt;

/// The sound preset an instrument plays its roll with.
///
/// On the wire a kind is the lowercase preset name, e.g. `"casio"` or `"808"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Piano,
    Casio,
    Clarinet,
    #[serde(rename = "808")]
    Tr808,
    #[serde(rename = "909")]
    Tr909,
    Cr78,
    Room,
    Bedroom,
    Synth,
    Pulse,
    Square,
    Sine,
    Triangle,
    Sawtooth,
}

impl Default for InstrumentKind {
    /// Returns `InstrumentKind::Casio`.
    fn default() -> InstrumentKind {
        InstrumentKind::Casio
    }
}

impl InstrumentKind {
    /// All presets, in the order they are listed in the instrument picker.
    pub const ALL: [InstrumentKind; 14] = [
        InstrumentKind::Piano,
        InstrumentKind::Casio,
        InstrumentKind::Clarinet,
        InstrumentKind::Tr808,
        InstrumentKind::Tr909,
        InstrumentKind::Cr78,
        InstrumentKind::Room,
        InstrumentKind::Bedroom,
        InstrumentKind::Synth,
        InstrumentKind::Pulse,
        InstrumentKind::Square,
        InstrumentKind::Sine,
        InstrumentKind::Triangle,
        InstrumentKind::Sawtooth,
    ];

    /// The name used for this preset on the wire.
    pub fn name(self) -> &'static str {
        match self {
            InstrumentKind::Piano => "piano",
            InstrumentKind::Casio => "casio",
            InstrumentKind::Clarinet => "clarinet",
            InstrumentKind::Tr808 => "808",
            InstrumentKind::Tr909 => "909",
            InstrumentKind::Cr78 => "cr78",
            InstrumentKind::Room => "room",
            InstrumentKind::Bedroom => "bedroom",
            InstrumentKind::Synth => "synth",
            InstrumentKind::Pulse => "pulse",
            InstrumentKind::Square => "square",
            InstrumentKind::Sine => "sine",
            InstrumentKind::Triangle => "triangle",
            InstrumentKind::Sawtooth => "sawtooth",
        }
    }

    /// Drum kits map each row to a separate sample rather than to a pitch.
    pub fn is_drum_kit(self) -> bool {
        matches!(
            self,
            InstrumentKind::Tr808
                | InstrumentKind::Tr909
                | InstrumentKind::Cr78
                | InstrumentKind::Room
                | InstrumentKind::Bedroom
        )
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
