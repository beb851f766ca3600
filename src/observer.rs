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

//! Change detection and coalescing.
//!
//! Every mutation of the [`Session`](crate::session::Session) produces a [`Mutation`] record.
//! The [`Observer`] collects the records of one tick in a [`Batch`] and turns them into the
//! outgoing [`Change`]s when the tick ends:
//!
//! * Attribute updates to the same entity within a tick become a single update carrying every
//!   changed key. A key written twice keeps its last value.
//! * Creations and removals are separate changes, one per entity, in the order they happened.
//!   A structural change closes the entity's open update, so an update recorded after it goes
//!   into a new change that is sent after it.
//!
//! While the observer is suspended it ignores records entirely. The replicator suspends it
//! around everything it does on behalf of a remote message, which is what keeps a change
//! received from another client from being sent straight back out.

use crate::session::{Instrument, InstrumentId, InstrumentPatch, Note, NoteId, NotePatch, RollId};
use std::collections::HashMap;

/// A record of one change made to the session.
///
/// Subscribers of [`Replicator::subscribe`](crate::Replicator::subscribe) receive these for
/// every mutation, local or remote, which is enough to keep a rendered view in step with the
/// store.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    InstrumentCreated(Instrument),
    /// Carries only the keys whose values changed.
    InstrumentUpdated {
        id: InstrumentId,
        patch: InstrumentPatch,
    },
    /// The instrument's roll and all of its notes went with it.
    InstrumentRemoved { id: InstrumentId, roll: RollId },
    NoteCreated(Note),
    /// Carries only the keys whose values changed.
    NoteUpdated {
        roll: RollId,
        id: NoteId,
        patch: NotePatch,
    },
    NoteRemoved { roll: RollId, id: NoteId },
    /// The whole session was cleared ahead of an import.
    Reset,
}

/// A coalesced local change, ready to be sent to the other clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    InstrumentCreate(Instrument),
    InstrumentUpdate {
        id: InstrumentId,
        patch: InstrumentPatch,
    },
    InstrumentRemove { id: InstrumentId },
    NoteCreate(Note),
    NoteUpdate {
        roll: RollId,
        id: NoteId,
        patch: NotePatch,
    },
    NoteRemove { roll: RollId, id: NoteId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Entity {
    Instrument(InstrumentId),
    Note(NoteId),
}

/// The changes recorded during one tick.
#[derive(Debug, Default)]
pub struct Batch {
    changes: Vec<Change>,
    // Index into `changes` of the update each entity's attribute writes are folded into.
    open_updates: HashMap<Entity, usize>,
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    pub fn push(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::InstrumentCreated(instrument) => self.structural(
                Entity::Instrument(instrument.id()),
                Change::InstrumentCreate(instrument.clone()),
            ),
            Mutation::InstrumentUpdated { id, patch } => {
                let entity = Entity::Instrument(*id);
                match self.open_updates.get(&entity).copied() {
                    Some(index) => {
                        if let Change::InstrumentUpdate { patch: pending, .. } =
                            &mut self.changes[index]
                        {
                            pending.merge(patch);
                        }
                    }
                    None => self.open(
                        entity,
                        Change::InstrumentUpdate {
                            id: *id,
                            patch: *patch,
                        },
                    ),
                }
            }
            Mutation::InstrumentRemoved { id, .. } => {
                self.structural(Entity::Instrument(*id), Change::InstrumentRemove { id: *id })
            }
            Mutation::NoteCreated(note) => {
                self.structural(Entity::Note(note.id()), Change::NoteCreate(note.clone()))
            }
            Mutation::NoteUpdated { roll, id, patch } => {
                let entity = Entity::Note(*id);
                match self.open_updates.get(&entity).copied() {
                    Some(index) => {
                        if let Change::NoteUpdate { patch: pending, .. } = &mut self.changes[index]
                        {
                            pending.merge(patch);
                        }
                    }
                    None => self.open(
                        entity,
                        Change::NoteUpdate {
                            roll: *roll,
                            id: *id,
                            patch: *patch,
                        },
                    ),
                }
            }
            Mutation::NoteRemoved { roll, id } => self.structural(
                Entity::Note(*id),
                Change::NoteRemove {
                    roll: *roll,
                    id: *id,
                },
            ),
            Mutation::Reset => log::warn!("ignoring session reset recorded outside of an import"),
        }
    }

    fn structural(&mut self, entity: Entity, change: Change) {
        self.open_updates.remove(&entity);
        self.changes.push(change);
    }

    fn open(&mut self, entity: Entity, change: Change) {
        self.open_updates.insert(entity, self.changes.len());
        self.changes.push(change);
    }

    /// Number of changes that would be sent if the tick ended now.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Ends the tick, returning its changes in the order they were first recorded.
    pub fn drain(&mut self) -> Vec<Change> {
        self.open_updates.clear();
        std::mem::take(&mut self.changes)
    }
}

/// Watches the session for local mutations.
#[derive(Debug, Default)]
pub struct Observer {
    depth: usize,
    resumptions: usize,
    batch: Batch,
}

impl Observer {
    pub fn new() -> Observer {
        Observer::default()
    }

    /// Returns `false` while suspended.
    pub fn is_observing(&self) -> bool {
        self.depth == 0
    }

    /// How many times observation has been resumed after a suspension.
    ///
    /// Nested suspensions count once, when the outermost one ends.
    pub fn resumptions(&self) -> usize {
        self.resumptions
    }

    /// The changes recorded so far in the current tick.
    pub fn pending(&self) -> &Batch {
        &self.batch
    }

    pub(crate) fn suspend(&mut self) {
        self.depth += 1;
    }

    pub(crate) fn resume(&mut self) {
        match self.depth {
            0 => log::warn!("observer resumed without being suspended"),
            1 => {
                self.depth = 0;
                self.resumptions += 1;
            }
            _ => self.depth -= 1,
        }
    }

    /// Records a mutation unless suspended. Returns whether it was recorded.
    pub(crate) fn record(&mut self, mutation: &Mutation) -> bool {
        if !self.is_observing() {
            return false;
        }
        self.batch.push(mutation);
        true
    }

    pub(crate) fn take(&mut self) -> Vec<Change> {
        self.batch.drain()
    }
}
