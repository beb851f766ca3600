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

//! The keyed store of instruments, rolls and notes.
//!
//! A [`Session`] is the canonical local copy of everything collaborating clients share. It is a
//! plain map from identifiers to entity structs; how the session is drawn is up to whoever
//! subscribes to its mutations (see [`Replicator::subscribe`](crate::Replicator::subscribe)).
//!
//! The store is only mutated by the [`Replicator`](crate::Replicator). Every mutating method
//! returns the [`Mutation`] describing what actually changed, or `None` when the call changed
//! nothing, and the replicator routes these records through its
//! [`Observer`](crate::observer::Observer).
//!
//! Ownership follows the user interface: a session owns its instruments, every instrument owns
//! exactly one [`Roll`], and a roll owns its notes. Removing an instrument removes its roll and
//! every note in it.

pub mod grid;
mod id;
mod kind;

pub use id::{InstrumentId, NoteId, RollId};
pub use kind::InstrumentKind;

use crate::observer::Mutation;
use std::collections::BTreeMap;
use thiserror::Error;

/// A specialized [`Result`] type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned when a store operation refers to something that is not there.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("no instrument with id {0}")]
    UnknownInstrument(InstrumentId),
    #[error("no roll with id {0}")]
    UnknownRoll(RollId),
    #[error("no note with id {note} in roll {roll}")]
    UnknownNote { roll: RollId, note: NoteId },
    #[error("roll {0} already belongs to another instrument")]
    RollInUse(RollId),
    #[error("note {note} already lives in roll {roll}")]
    NoteInUse { note: NoteId, roll: RollId },
}

/// Volume given to new instruments, in decibels.
pub const DEFAULT_VOLUME_DB: f64 = -5.0;

/// An instrument track.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    id: InstrumentId,
    roll: RollId,
    kind: InstrumentKind,
    volume_db: f64,
    reverb: f64,
    delay: f64,
}

impl Instrument {
    /// Creates an instrument with fresh instrument and roll ids.
    ///
    /// The instrument starts at [`DEFAULT_VOLUME_DB`] with no reverb or delay.
    pub fn new(kind: InstrumentKind) -> Instrument {
        Instrument {
            id: InstrumentId::new(),
            roll: RollId::new(),
            kind,
            volume_db: DEFAULT_VOLUME_DB,
            reverb: 0.0,
            delay: 0.0,
        }
    }

    pub(crate) fn from_parts(
        id: InstrumentId,
        roll: RollId,
        kind: InstrumentKind,
        volume_db: f64,
        reverb: f64,
        delay: f64,
    ) -> Instrument {
        Instrument {
            id,
            roll,
            kind,
            volume_db,
            reverb,
            delay,
        }
    }

    /// Sets the volume, clamped to [`grid::VOLUME_DB`].
    pub fn volume(mut self, db: f64) -> Instrument {
        self.volume_db = grid::clamp_volume(db);
        self
    }

    /// Sets the reverb mix, clamped to [`grid::MIX`].
    pub fn reverb(mut self, mix: f64) -> Instrument {
        self.reverb = grid::clamp_mix(mix);
        self
    }

    /// Sets the delay mix, clamped to [`grid::MIX`].
    pub fn delay(mut self, mix: f64) -> Instrument {
        self.delay = grid::clamp_mix(mix);
        self
    }

    pub fn id(&self) -> InstrumentId {
        self.id
    }

    /// The id of the roll holding this instrument's notes.
    pub fn roll(&self) -> RollId {
        self.roll
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn volume_db(&self) -> f64 {
        self.volume_db
    }

    pub fn reverb_mix(&self) -> f64 {
        self.reverb
    }

    pub fn delay_mix(&self) -> f64 {
        self.delay
    }

    // Applies the patch and returns the keys whose values actually changed.
    fn apply(&mut self, patch: &InstrumentPatch) -> InstrumentPatch {
        InstrumentPatch {
            kind: set(&mut self.kind, patch.kind),
            volume_db: set(&mut self.volume_db, patch.volume_db),
            reverb: set(&mut self.reverb, patch.reverb),
            delay: set(&mut self.delay, patch.delay),
        }
    }
}

/// A partial update to an [`Instrument`].
///
/// Keys left as `None` are not touched when the patch is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstrumentPatch {
    pub kind: Option<InstrumentKind>,
    pub volume_db: Option<f64>,
    pub reverb: Option<f64>,
    pub delay: Option<f64>,
}

impl InstrumentPatch {
    pub fn new() -> InstrumentPatch {
        InstrumentPatch::default()
    }

    pub fn kind(mut self, kind: InstrumentKind) -> InstrumentPatch {
        self.kind = Some(kind);
        self
    }

    pub fn volume(mut self, db: f64) -> InstrumentPatch {
        self.volume_db = Some(db);
        self
    }

    pub fn reverb(mut self, mix: f64) -> InstrumentPatch {
        self.reverb = Some(mix);
        self
    }

    pub fn delay(mut self, mix: f64) -> InstrumentPatch {
        self.delay = Some(mix);
        self
    }

    /// Returns `true` if the patch does not set any key.
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.volume_db.is_none()
            && self.reverb.is_none()
            && self.delay.is_none()
    }

    /// Folds a later patch into this one. Keys set by `later` win.
    pub fn merge(&mut self, later: &InstrumentPatch) {
        self.kind = later.kind.or(self.kind);
        self.volume_db = later.volume_db.or(self.volume_db);
        self.reverb = later.reverb.or(self.reverb);
        self.delay = later.delay.or(self.delay);
    }

    /// Clamps every set value into its knob range.
    pub fn clamped(self) -> InstrumentPatch {
        InstrumentPatch {
            kind: self.kind,
            volume_db: self.volume_db.map(grid::clamp_volume),
            reverb: self.reverb.map(grid::clamp_mix),
            delay: self.delay.map(grid::clamp_mix),
        }
    }
}

/// A note block on a roll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    id: NoteId,
    roll: RollId,
    tick: u32,
    row: u32,
    length: u32,
}

impl Note {
    /// Creates a one tick long note with a fresh id. The position is clamped to the grid.
    pub fn new(roll: RollId, tick: i64, row: i64) -> Note {
        Note {
            id: NoteId::new(),
            roll,
            tick: grid::clamp_tick(tick),
            row: grid::clamp_row(row),
            length: 1,
        }
    }

    pub(crate) fn from_parts(id: NoteId, roll: RollId, tick: u32, row: u32, length: u32) -> Note {
        Note {
            id,
            roll,
            tick,
            row,
            length,
        }
    }

    /// Sets the length in ticks. Anything below one tick becomes one tick.
    pub fn length(mut self, length: i64) -> Note {
        self.length = grid::clamp_length(length);
        self
    }

    pub fn id(&self) -> NoteId {
        self.id
    }

    /// The roll this note belongs to.
    pub fn roll(&self) -> RollId {
        self.roll
    }

    /// The column the note starts on.
    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// The row the note sits on, counted from the top of the grid.
    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn length_ticks(&self) -> u32 {
        self.length
    }

    /// The MIDI note number this note plays.
    pub fn pitch(&self) -> u32 {
        grid::pitch(self.row)
    }

    fn apply(&mut self, patch: &NotePatch) -> NotePatch {
        NotePatch {
            tick: set(&mut self.tick, patch.tick),
            row: set(&mut self.row, patch.row),
            length: set(&mut self.length, patch.length),
        }
    }
}

/// A partial update to a [`Note`].
///
/// The builder methods take signed grid coordinates, as produced by drag gestures, and clamp
/// them to the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotePatch {
    pub tick: Option<u32>,
    pub row: Option<u32>,
    pub length: Option<u32>,
}

impl NotePatch {
    pub fn new() -> NotePatch {
        NotePatch::default()
    }

    pub fn tick(mut self, tick: i64) -> NotePatch {
        self.tick = Some(grid::clamp_tick(tick));
        self
    }

    pub fn row(mut self, row: i64) -> NotePatch {
        self.row = Some(grid::clamp_row(row));
        self
    }

    pub fn length(mut self, length: i64) -> NotePatch {
        self.length = Some(grid::clamp_length(length));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tick.is_none() && self.row.is_none() && self.length.is_none()
    }

    /// Folds a later patch into this one. Keys set by `later` win.
    pub fn merge(&mut self, later: &NotePatch) {
        self.tick = later.tick.or(self.tick);
        self.row = later.row.or(self.row);
        self.length = later.length.or(self.length);
    }

    /// Clamps every set value to the grid.
    pub fn clamped(self) -> NotePatch {
        NotePatch {
            tick: self.tick.map(|tick| grid::clamp_tick(i64::from(tick))),
            row: self.row.map(|row| grid::clamp_row(i64::from(row))),
            length: self.length.map(|length| grid::clamp_length(i64::from(length))),
        }
    }
}

// Writes `value` into `slot` and returns it, unless it is missing or equal to what is there.
fn set<T: PartialEq + Copy>(slot: &mut T, value: Option<T>) -> Option<T> {
    match value {
        Some(value) if *slot != value => {
            *slot = value;
            Some(value)
        }
        _ => None,
    }
}

/// The notes belonging to one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Roll {
    id: RollId,
    owner: InstrumentId,
    notes: BTreeMap<NoteId, Note>,
}

impl Roll {
    pub fn id(&self) -> RollId {
        self.id
    }

    /// The instrument that owns this roll.
    pub fn owner(&self) -> InstrumentId {
        self.owner
    }

    pub fn note(&self, id: NoteId) -> Option<&Note> {
        self.notes.get(&id)
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

/// The complete collaborative state: every instrument and every roll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    instruments: BTreeMap<InstrumentId, Instrument>,
    rolls: BTreeMap<RollId, Roll>,
    // Which roll each note lives in. Note ids are unique across the session.
    note_rolls: BTreeMap<NoteId, RollId>,
}

impl Session {
    pub fn new() -> Session {
        Session::default()
    }

    pub fn instrument(&self, id: InstrumentId) -> Option<&Instrument> {
        self.instruments.get(&id)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.values()
    }

    pub fn roll(&self, id: RollId) -> Option<&Roll> {
        self.rolls.get(&id)
    }

    pub fn rolls(&self) -> impl Iterator<Item = &Roll> {
        self.rolls.values()
    }

    /// Looks up a note in the given roll.
    pub fn note(&self, roll: RollId, id: NoteId) -> Option<&Note> {
        self.rolls.get(&roll).and_then(|roll| roll.note(id))
    }

    /// The roll a note lives in.
    pub fn note_roll(&self, id: NoteId) -> Option<RollId> {
        self.note_rolls.get(&id).copied()
    }

    /// The notes in a roll. Empty if there is no such roll.
    pub fn notes(&self, roll: RollId) -> impl Iterator<Item = &Note> {
        self.rolls.get(&roll).into_iter().flat_map(Roll::notes)
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.len()
    }

    /// Total number of notes across all rolls.
    pub fn note_count(&self) -> usize {
        self.rolls.values().map(Roll::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    /// Adds an instrument and its empty roll. Does nothing if the id is already present.
    pub(crate) fn insert_instrument(&mut self, instrument: Instrument) -> Result<Option<Mutation>> {
        if self.instruments.contains_key(&instrument.id) {
            return Ok(None);
        }
        if self.rolls.contains_key(&instrument.roll) {
            return Err(Error::RollInUse(instrument.roll));
        }
        self.rolls.insert(
            instrument.roll,
            Roll {
                id: instrument.roll,
                owner: instrument.id,
                notes: BTreeMap::new(),
            },
        );
        self.instruments.insert(instrument.id, instrument.clone());
        Ok(Some(Mutation::InstrumentCreated(instrument)))
    }

    pub(crate) fn update_instrument(
        &mut self,
        id: InstrumentId,
        patch: &InstrumentPatch,
    ) -> Result<Option<Mutation>> {
        let instrument = self
            .instruments
            .get_mut(&id)
            .ok_or(Error::UnknownInstrument(id))?;
        let changed = instrument.apply(patch);
        if changed.is_empty() {
            return Ok(None);
        }
        Ok(Some(Mutation::InstrumentUpdated { id, patch: changed }))
    }

    /// Removes an instrument together with its roll and every note on it.
    pub(crate) fn remove_instrument(&mut self, id: InstrumentId) -> Option<Mutation> {
        let instrument = self.instruments.remove(&id)?;
        if let Some(roll) = self.rolls.remove(&instrument.roll) {
            for note in roll.notes.keys() {
                self.note_rolls.remove(note);
            }
        }
        Some(Mutation::InstrumentRemoved {
            id,
            roll: instrument.roll,
        })
    }

    /// Adds a note to its roll. Does nothing if the roll already has a note with that id.
    ///
    /// # Errors
    ///
    /// Returns an error if the roll does not exist or the note id is already used in another
    /// roll.
    pub(crate) fn insert_note(&mut self, note: Note) -> Result<Option<Mutation>> {
        let roll = self
            .rolls
            .get_mut(&note.roll)
            .ok_or(Error::UnknownRoll(note.roll))?;
        match self.note_rolls.get(&note.id) {
            Some(&owner) if owner == note.roll => return Ok(None),
            Some(&owner) => {
                return Err(Error::NoteInUse {
                    note: note.id,
                    roll: owner,
                })
            }
            None => {}
        }
        self.note_rolls.insert(note.id, note.roll);
        roll.notes.insert(note.id, note.clone());
        Ok(Some(Mutation::NoteCreated(note)))
    }

    pub(crate) fn update_note(
        &mut self,
        roll: RollId,
        id: NoteId,
        patch: &NotePatch,
    ) -> Result<Option<Mutation>> {
        let note = self
            .rolls
            .get_mut(&roll)
            .ok_or(Error::UnknownRoll(roll))?
            .notes
            .get_mut(&id)
            .ok_or(Error::UnknownNote { roll, note: id })?;
        let changed = note.apply(patch);
        if changed.is_empty() {
            return Ok(None);
        }
        Ok(Some(Mutation::NoteUpdated {
            roll,
            id,
            patch: changed,
        }))
    }

    pub(crate) fn remove_note(&mut self, roll: RollId, id: NoteId) -> Option<Mutation> {
        self.rolls.get_mut(&roll)?.notes.remove(&id)?;
        self.note_rolls.remove(&id);
        Some(Mutation::NoteRemoved { roll, id })
    }

    /// Drops everything.
    pub(crate) fn clear(&mut self) -> Mutation {
        self.instruments.clear();
        self.rolls.clear();
        self.note_rolls.clear();
        Mutation::Reset
    }
}
