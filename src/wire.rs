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

//! The JSON messages exchanged by collaborating clients.
//!
//! Every message is a JSON object with an `action` key naming its kind. The relay forwards
//! messages untouched, so this format is the whole contract between clients:
//!
//! | action              | fields                                                    |
//! |---------------------|-----------------------------------------------------------|
//! | `session-get`       |                                                           |
//! | `editor-import`     | `instruments: {id: props}`, `rolls: {roll: {id: note}}`   |
//! | `instrument-create` | `uuid`, `props: {roll, instrument, volume, reverb, delay}` |
//! | `instrument-update` | `uuid`, `props: {changed keys}`                           |
//! | `instrument-remove` | `uuid`                                                    |
//! | `note-create`       | `roll`, `note: {uuid, x, y, length}`                      |
//! | `note-update`       | `roll`, `changes: {uuid, changed keys}`                   |
//! | `note-remove`       | `roll`, `note: {uuid}`                                    |
//!
//! `x` is the tick a note starts on, `y` the row it sits on and `length` its length in ticks.
//! Numeric values are written as JSON numbers; on input, numeric strings are accepted too.
//! Keys this module does not know about are ignored.
//!
//! # Examples
//!
//! ```
//! use prototune::wire::{self, WireMessage};
//!
//! let message = wire::decode(r#"{"action": "instrument-remove", "uuid": "5f0c4a8e-3c1b-4d2a-9e7f-0123456789ab"}"#)?;
//! assert!(matches!(message, WireMessage::InstrumentRemove { .. }));
//! # wire::Result::Ok(())
//! ```

mod lenient;

use crate::observer::Change;
use crate::session::{InstrumentId, InstrumentKind, NoteId, RollId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A specialized [`Result`] type for encoding and decoding messages.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by [`encode`] and [`decode`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
}

/// A message as sent over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Asks the other clients for the current session.
    SessionGet,
    /// The full session, sent in reply to `session-get`.
    EditorImport(SessionSnapshot),
    InstrumentCreate {
        uuid: InstrumentId,
        props: InstrumentProps,
    },
    InstrumentUpdate {
        uuid: InstrumentId,
        props: InstrumentProps,
    },
    InstrumentRemove {
        uuid: InstrumentId,
    },
    NoteCreate {
        roll: RollId,
        note: NoteFields,
    },
    NoteUpdate {
        roll: RollId,
        changes: NoteFields,
    },
    NoteRemove {
        roll: RollId,
        note: NoteRef,
    },
}

impl WireMessage {
    /// The value of the `action` key.
    pub fn action(&self) -> &'static str {
        match self {
            WireMessage::SessionGet => "session-get",
            WireMessage::EditorImport(_) => "editor-import",
            WireMessage::InstrumentCreate { .. } => "instrument-create",
            WireMessage::InstrumentUpdate { .. } => "instrument-update",
            WireMessage::InstrumentRemove { .. } => "instrument-remove",
            WireMessage::NoteCreate { .. } => "note-create",
            WireMessage::NoteUpdate { .. } => "note-update",
            WireMessage::NoteRemove { .. } => "note-remove",
        }
    }
}

/// Instrument attributes. Updates only carry the keys that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll: Option<RollId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument: Option<InstrumentKind>,
    #[serde(
        default,
        deserialize_with = "lenient::number",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::number",
        skip_serializing_if = "Option::is_none"
    )]
    pub reverb: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient::number",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay: Option<f64>,
}

/// A note's id together with some or all of its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteFields {
    pub uuid: NoteId,
    #[serde(
        default,
        deserialize_with = "lenient::integer",
        skip_serializing_if = "Option::is_none"
    )]
    pub x: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::integer",
        skip_serializing_if = "Option::is_none"
    )]
    pub y: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::integer",
        skip_serializing_if = "Option::is_none"
    )]
    pub length: Option<i64>,
}

/// A note's attributes as they appear in a session snapshot, keyed by note id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteProps {
    #[serde(
        default,
        deserialize_with = "lenient::integer",
        skip_serializing_if = "Option::is_none"
    )]
    pub x: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::integer",
        skip_serializing_if = "Option::is_none"
    )]
    pub y: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::integer",
        skip_serializing_if = "Option::is_none"
    )]
    pub length: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRef {
    pub uuid: NoteId,
}

/// The full state of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub instruments: BTreeMap<InstrumentId, InstrumentProps>,
    #[serde(default)]
    pub rolls: BTreeMap<RollId, BTreeMap<NoteId, NoteProps>>,
}

impl From<Change> for WireMessage {
    fn from(change: Change) -> WireMessage {
        match change {
            Change::InstrumentCreate(instrument) => WireMessage::InstrumentCreate {
                uuid: instrument.id(),
                props: InstrumentProps {
                    roll: Some(instrument.roll()),
                    instrument: Some(instrument.kind()),
                    volume: Some(instrument.volume_db()),
                    reverb: Some(instrument.reverb_mix()),
                    delay: Some(instrument.delay_mix()),
                },
            },
            Change::InstrumentUpdate { id, patch } => WireMessage::InstrumentUpdate {
                uuid: id,
                props: InstrumentProps {
                    roll: None,
                    instrument: patch.kind,
                    volume: patch.volume_db,
                    reverb: patch.reverb,
                    delay: patch.delay,
                },
            },
            Change::InstrumentRemove { id } => WireMessage::InstrumentRemove { uuid: id },
            Change::NoteCreate(note) => WireMessage::NoteCreate {
                roll: note.roll(),
                note: NoteFields {
                    uuid: note.id(),
                    x: Some(i64::from(note.tick())),
                    y: Some(i64::from(note.row())),
                    length: Some(i64::from(note.length_ticks())),
                },
            },
            Change::NoteUpdate { roll, id, patch } => WireMessage::NoteUpdate {
                roll,
                changes: NoteFields {
                    uuid: id,
                    x: patch.tick.map(i64::from),
                    y: patch.row.map(i64::from),
                    length: patch.length.map(i64::from),
                },
            },
            Change::NoteRemove { roll, id } => WireMessage::NoteRemove {
                roll,
                note: NoteRef { uuid: id },
            },
        }
    }
}

/// Serializes a message to JSON text.
pub fn encode(message: &WireMessage) -> Result<String> {
    serde_json::to_string(message).map_err(Error::Encode)
}

/// Parses JSON text into a message.
///
/// # Errors
///
/// Returns an error if the text is not JSON, the action is unknown, a required key is missing
/// or a value has the wrong type.
pub fn decode(text: &str) -> Result<WireMessage> {
    serde_json::from_str(text).map_err(Error::Decode)
}
