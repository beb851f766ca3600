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

//! Keeps a local session in step with the other clients.
//!
//! A [`Replicator`] owns the local [`Session`] and a [`Channel`] to the other members. It works
//! in both directions:
//!
//! * **Outgoing.** Local edits go through the replicator's mutation methods
//!   ([`add_note`](Replicator::add_note), [`update_note`](Replicator::update_note), ...). They
//!   take effect in the session immediately and are recorded by the [`Observer`]. Calling
//!   [`flush`](Replicator::flush) at the end of a tick coalesces the recorded mutations and sends
//!   them, so a drag that moves a note across twenty cells in one frame goes out as a single
//!   `note-update`.
//!
//! * **Incoming.** Messages from the channel are applied with
//!   [`apply_remote_change`](Replicator::apply_remote_change) (or [`receive`](Replicator::receive)
//!   and [`poll`](Replicator::poll), which decode first). The observer is suspended for the whole
//!   apply, so nothing applied on behalf of another client is ever sent back out.
//!
//! Updates carry only the keys that changed and the last update applied wins. Two clients
//! editing the same note at the same moment are not reconciled beyond that.
//!
//! When the channel goes away local edits keep working but are no longer sent, and they are not
//! queued either. After [`reconnect`](Replicator::reconnect) the replicator asks for the session
//! again and the answer replaces the local one.
//!
//! # Examples
//!
//! ```
//! use prototune::{channel::Relay, session::NotePatch, Replicator};
//!
//! let relay = Relay::new();
//! let mut alice = Replicator::new(relay.join());
//! let mut bob = Replicator::new(relay.join());
//!
//! let piano = alice.add_instrument()?;
//! let roll = alice.session().instrument(piano).unwrap().roll();
//! let note = alice.add_note(roll, 4, 40)?;
//! alice.flush();
//!
//! bob.poll();
//! assert_eq!(bob.session(), alice.session());
//!
//! // Three writes in one tick, one message.
//! alice.update_note(roll, note, NotePatch::new().tick(5))?;
//! alice.update_note(roll, note, NotePatch::new().row(41))?;
//! alice.update_note(roll, note, NotePatch::new().length(2))?;
//! assert_eq!(alice.flush(), 1);
//!
//! assert_eq!(bob.poll(), 1);
//! assert_eq!(bob.session().note(roll, note).unwrap().tick(), 5);
//! # prototune::session::Result::Ok(())
//! ```

use crate::channel::Channel;
use crate::observer::{Change, Mutation, Observer};
use crate::session::{
    self, grid, Instrument, InstrumentId, InstrumentKind, InstrumentPatch, Note, NoteId,
    NotePatch, RollId, Session, DEFAULT_VOLUME_DB,
};
use crate::wire::{self, InstrumentProps, NoteFields, NoteProps, SessionSnapshot, WireMessage};
use std::{fmt, sync::mpsc};
use thiserror::Error;

/// The error type returned when a remote message can not be applied.
///
/// Neither kind of error is fatal. The message is dropped and the session is left as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    /// The message refers to an instrument, roll or note that does not exist here.
    #[error("{0}")]
    UnknownEntity(session::Error),
    /// The message could not be decoded, is missing a required key or has a value out of range.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl From<session::Error> for ApplyError {
    fn from(err: session::Error) -> ApplyError {
        match err {
            session::Error::RollInUse(_) | session::Error::NoteInUse { .. } => {
                ApplyError::MalformedMessage(err.to_string())
            }
            err => ApplyError::UnknownEntity(err),
        }
    }
}

impl From<wire::Error> for ApplyError {
    fn from(err: wire::Error) -> ApplyError {
        ApplyError::MalformedMessage(err.to_string())
    }
}

fn malformed(reason: impl Into<String>) -> ApplyError {
    ApplyError::MalformedMessage(reason.into())
}

/// The state of the replicator's connection to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Local changes are sent.
    Online,
    /// A `session-get` was sent and the replicator is waiting for the session. Local changes
    /// are sent.
    Joining,
    /// The channel is closed. Local changes are dropped.
    Offline,
}

/// Configuration for a [`Replicator`]. See the builder methods on `Replicator`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub default_instrument: InstrumentKind,
    pub default_volume_db: f64,
    pub default_note_length: u32,
    pub answer_session_requests: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            default_instrument: InstrumentKind::default(),
            default_volume_db: DEFAULT_VOLUME_DB,
            default_note_length: 1,
            answer_session_requests: false,
        }
    }
}

/// Replicates a [`Session`] over a [`Channel`].
pub struct Replicator<C> {
    channel: C,
    session: Session,
    observer: Observer,
    subscribers: Vec<mpsc::Sender<Mutation>>,
    settings: Settings,
    link: Link,
}

impl<C> fmt::Debug for Replicator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("session", &self.session)
            .field("observer", &self.observer)
            .field("subscribers", &self.subscribers.len())
            .field("settings", &self.settings)
            .field("link", &self.link)
            .finish()
    }
}

impl<C: Channel> Replicator<C> {
    /// Creates a replicator with an empty session.
    ///
    /// This does not ask the other clients for their session; call [`join`](Replicator::join)
    /// for that.
    pub fn new(channel: C) -> Replicator<C> {
        let link = if channel.is_open() {
            Link::Online
        } else {
            Link::Offline
        };
        Replicator {
            channel,
            session: Session::new(),
            observer: Observer::new(),
            subscribers: Vec::new(),
            settings: Settings::default(),
            link,
        }
    }

    /// The preset used by [`add_instrument`](Replicator::add_instrument).
    ///
    /// Defaults to [`InstrumentKind::Casio`].
    pub fn default_instrument(mut self, kind: InstrumentKind) -> Self {
        self.settings.default_instrument = kind;
        self
    }

    /// The volume new instruments start at, in decibels.
    ///
    /// Defaults to [`DEFAULT_VOLUME_DB`].
    pub fn default_volume(mut self, db: f64) -> Self {
        self.settings.default_volume_db = grid::clamp_volume(db);
        self
    }

    /// The length, in ticks, of notes created by [`add_note`](Replicator::add_note).
    ///
    /// Defaults to 1.
    pub fn default_note_length(mut self, length: u32) -> Self {
        self.settings.default_note_length = length.max(1);
        self
    }

    /// Whether to answer `session-get` requests from other clients with the local session.
    ///
    /// Usually the relay server answers these. Enable this on clients whose relay does not keep
    /// session state. Defaults to `false`.
    pub fn answer_session_requests(mut self, answer: bool) -> Self {
        self.settings.answer_session_requests = answer;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Subscribes to every mutation of the session, local and remote.
    ///
    /// This is how a view stays in step with the store. Mutations accumulate in the channel until
    /// they are received, so drop the receiver promptly when it is no longer needed.
    pub fn subscribe(&mut self) -> mpsc::Receiver<Mutation> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.push(sender);
        receiver
    }

    // ============================================================
    // ==================== Local mutations =======================
    // ============================================================

    /// Adds an instrument using the default preset and volume. Returns its id.
    pub fn add_instrument(&mut self) -> session::Result<InstrumentId> {
        self.add_instrument_with(self.settings.default_instrument)
    }

    /// Adds an instrument using the given preset and the default volume. Returns its id.
    pub fn add_instrument_with(&mut self, kind: InstrumentKind) -> session::Result<InstrumentId> {
        let instrument = Instrument::new(kind).volume(self.settings.default_volume_db);
        self.insert_instrument(instrument)
    }

    /// Adds an already built instrument. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if another instrument owns the same roll.
    pub fn insert_instrument(&mut self, instrument: Instrument) -> session::Result<InstrumentId> {
        let id = instrument.id();
        let mutation = self.session.insert_instrument(instrument)?;
        self.observe(mutation);
        Ok(id)
    }

    /// Changes some of an instrument's attributes. Values are clamped to their knob ranges.
    pub fn update_instrument(
        &mut self,
        id: InstrumentId,
        patch: InstrumentPatch,
    ) -> session::Result<()> {
        let mutation = self.session.update_instrument(id, &patch.clamped())?;
        self.observe(mutation);
        Ok(())
    }

    /// Removes an instrument with its roll and notes. Returns `false` if there was no such
    /// instrument.
    pub fn remove_instrument(&mut self, id: InstrumentId) -> bool {
        let mutation = self.session.remove_instrument(id);
        let removed = mutation.is_some();
        self.observe(mutation);
        removed
    }

    /// Adds a note of the default length at the given grid position, clamped to the grid.
    pub fn add_note(&mut self, roll: RollId, tick: i64, row: i64) -> session::Result<NoteId> {
        let length = i64::from(self.settings.default_note_length);
        self.add_note_with_length(roll, tick, row, length)
    }

    /// Adds a note at the given grid position. Position and length are clamped to the grid.
    pub fn add_note_with_length(
        &mut self,
        roll: RollId,
        tick: i64,
        row: i64,
        length: i64,
    ) -> session::Result<NoteId> {
        self.insert_note(Note::new(roll, tick, row).length(length))
    }

    /// Adds an already built note. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the note's roll does not exist.
    pub fn insert_note(&mut self, note: Note) -> session::Result<NoteId> {
        let id = note.id();
        let mutation = self.session.insert_note(note)?;
        self.observe(mutation);
        Ok(id)
    }

    /// Moves or resizes a note. Values are clamped to the grid.
    pub fn update_note(&mut self, roll: RollId, id: NoteId, patch: NotePatch) -> session::Result<()> {
        let mutation = self.session.update_note(roll, id, &patch.clamped())?;
        self.observe(mutation);
        Ok(())
    }

    /// Removes a note. Returns `false` if there was no such note.
    pub fn remove_note(&mut self, roll: RollId, id: NoteId) -> bool {
        let mutation = self.session.remove_note(roll, id);
        let removed = mutation.is_some();
        self.observe(mutation);
        removed
    }

    /// Ends the current tick: sends everything recorded since the last flush.
    ///
    /// Returns the number of messages sent.
    pub fn flush(&mut self) -> usize {
        let changes = self.observer.take();
        let mut sent = 0;
        for change in changes {
            if self.apply_local_change(change) {
                sent += 1;
            }
        }
        sent
    }

    /// Sends one change to the other clients. Returns whether it was sent.
    ///
    /// The change is dropped if the replicator is offline.
    pub fn apply_local_change(&mut self, change: Change) -> bool {
        self.transmit(&change.into())
    }

    // ============================================================
    // ==================== Remote changes ========================
    // ============================================================

    /// Applies every message waiting on the channel. Returns how many were applied.
    ///
    /// Messages that can not be applied are logged and dropped.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Some(text) = self.channel.try_recv() {
            if self.receive(&text).is_ok() {
                applied += 1;
            }
        }
        applied
    }

    /// Decodes and applies one message.
    pub fn receive(&mut self, text: &str) -> Result<(), ApplyError> {
        log::debug!("recv: {}", text);
        match wire::decode(text) {
            Ok(message) => self.apply_remote_change(message),
            Err(err) => {
                log::warn!("dropping message: {}", err);
                Err(err.into())
            }
        }
    }

    /// Applies a message received from another client.
    ///
    /// Creates are idempotent, updates only touch the keys they carry and removes of things that
    /// are not there do nothing. Nothing done here is recorded for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::UnknownEntity`] for an update (or a note creation) that refers to
    /// something that does not exist, and [`ApplyError::MalformedMessage`] for a message that is
    /// missing a required key or carries an out of range value. Either way the session is
    /// unchanged.
    pub fn apply_remote_change(&mut self, message: WireMessage) -> Result<(), ApplyError> {
        let action = message.action();
        let result = self.unobserved(|replicator| replicator.apply_unobserved(message));
        if let Err(err) = &result {
            log::warn!("dropping {} message: {}", action, err);
        }
        result
    }

    fn apply_unobserved(&mut self, message: WireMessage) -> Result<(), ApplyError> {
        match message {
            WireMessage::SessionGet => self.answer_session_request(),
            WireMessage::EditorImport(snapshot) => self.import_session(snapshot),
            WireMessage::InstrumentCreate { uuid, props } => {
                let instrument = instrument_from_props(uuid, &props)?;
                let mutation = self.session.insert_instrument(instrument)?;
                if mutation.is_none() {
                    log::debug!("instrument {} already exists", uuid);
                }
                self.observe(mutation);
            }
            WireMessage::InstrumentUpdate { uuid, props } => {
                let patch = instrument_patch(&props)?;
                if let (Some(roll), Some(instrument)) = (props.roll, self.session.instrument(uuid))
                {
                    if roll != instrument.roll() {
                        return Err(malformed(format!(
                            "instrument {} can not move to roll {}",
                            uuid, roll
                        )));
                    }
                }
                let mutation = self.session.update_instrument(uuid, &patch)?;
                self.observe(mutation);
            }
            WireMessage::InstrumentRemove { uuid } => {
                let mutation = self.session.remove_instrument(uuid);
                if mutation.is_none() {
                    log::debug!("instrument {} already removed", uuid);
                }
                self.observe(mutation);
            }
            WireMessage::NoteCreate { roll, note } => {
                let note = note_from_fields(roll, &note)?;
                let mutation = self.session.insert_note(note)?;
                self.observe(mutation);
            }
            WireMessage::NoteUpdate { roll, changes } => {
                let patch = note_patch(&changes)?;
                let mutation = self.session.update_note(roll, changes.uuid, &patch)?;
                self.observe(mutation);
            }
            WireMessage::NoteRemove { roll, note } => {
                let mutation = self.session.remove_note(roll, note.uuid);
                if mutation.is_none() {
                    log::debug!("note {} already removed from roll {}", note.uuid, roll);
                }
                self.observe(mutation);
            }
        }
        Ok(())
    }

    /// Replaces the whole session with a snapshot.
    ///
    /// Observation is suspended once for the whole import. Entries in the snapshot that are
    /// invalid, or notes in rolls that no imported instrument owns, are logged and skipped. Local
    /// changes that have not been flushed yet are dropped.
    pub fn import_session(&mut self, snapshot: SessionSnapshot) {
        let dropped = self.observer.take().len();
        if dropped > 0 {
            log::warn!("dropping {} unsent changes replaced by the import", dropped);
        }
        self.unobserved(|replicator| {
            let reset = replicator.session.clear();
            replicator.observe(Some(reset));

            for (&id, props) in snapshot.instruments.iter() {
                let inserted = instrument_from_props(id, props).and_then(|instrument| {
                    Ok(replicator.session.insert_instrument(instrument)?)
                });
                match inserted {
                    Ok(mutation) => replicator.observe(mutation),
                    Err(err) => log::warn!("skipping instrument {} in import: {}", id, err),
                }
            }

            for (&roll, notes) in snapshot.rolls.iter() {
                for (&id, props) in notes.iter() {
                    let inserted = note_from_props(roll, id, props)
                        .and_then(|note| Ok(replicator.session.insert_note(note)?));
                    match inserted {
                        Ok(mutation) => replicator.observe(mutation),
                        Err(err) => log::warn!("skipping note {} in import: {}", id, err),
                    }
                }
            }
        });
        if self.link == Link::Joining {
            self.link = Link::Online;
        }
        log::debug!(
            "imported {} instruments and {} notes",
            self.session.instrument_count(),
            self.session.note_count()
        );
    }

    /// The local session in wire form.
    pub fn export_session(&self) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::default();
        for instrument in self.session.instruments() {
            snapshot
                .instruments
                .insert(instrument.id(), instrument_props(instrument));
        }
        for roll in self.session.rolls() {
            let notes = roll
                .notes()
                .map(|note| {
                    let props = NoteProps {
                        x: Some(i64::from(note.tick())),
                        y: Some(i64::from(note.row())),
                        length: Some(i64::from(note.length_ticks())),
                    };
                    (note.id(), props)
                })
                .collect();
            snapshot.rolls.insert(roll.id(), notes);
        }
        snapshot
    }

    fn answer_session_request(&mut self) {
        if self.settings.answer_session_requests {
            let snapshot = self.export_session();
            self.transmit(&WireMessage::EditorImport(snapshot));
        } else {
            log::debug!("ignoring session request");
        }
    }

    // ============================================================
    // ==================== Connection ============================
    // ============================================================

    /// Asks the other clients for the session. The answer replaces the local session.
    ///
    /// Returns `false` if the request could not be sent.
    pub fn join(&mut self) -> bool {
        if !self.channel.is_open() {
            self.go_offline();
            return false;
        }
        self.link = Link::Joining;
        self.transmit(&WireMessage::SessionGet)
    }

    /// Stops sending local changes. Pending changes are dropped.
    pub fn disconnect(&mut self) {
        self.go_offline();
    }

    /// Replaces the channel and joins the session again.
    ///
    /// Local changes made while offline are dropped rather than sent.
    pub fn reconnect(&mut self, channel: C) -> bool {
        let dropped = self.observer.take().len();
        if dropped > 0 {
            log::warn!("dropping {} changes made while offline", dropped);
        }
        self.channel = channel;
        self.link = Link::Online;
        self.join()
    }

    fn go_offline(&mut self) {
        if self.link != Link::Offline {
            log::warn!("channel closed; local changes will not be sent until reconnected");
        }
        self.link = Link::Offline;
        let dropped = self.observer.take().len();
        if dropped > 0 {
            log::warn!("dropping {} unsent changes", dropped);
        }
    }

    fn transmit(&mut self, message: &WireMessage) -> bool {
        if self.link == Link::Offline {
            log::debug!("offline, dropping {}", message.action());
            return false;
        }
        if !self.channel.is_open() {
            self.go_offline();
            return false;
        }
        let text = match wire::encode(message) {
            Ok(text) => text,
            Err(err) => {
                log::error!("{}", err);
                return false;
            }
        };
        log::debug!("send: {}", text);
        match self.channel.send(text) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to send {}: {}", message.action(), err);
                self.go_offline();
                false
            }
        }
    }

    // ============================================================
    // ==================== Observation ===========================
    // ============================================================

    fn unobserved<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.observer.suspend();
        let result = f(self);
        self.observer.resume();
        result
    }

    fn observe(&mut self, mutation: Option<Mutation>) {
        if let Some(mutation) = mutation {
            self.observer.record(&mutation);
            self.subscribers
                .retain(|subscriber| subscriber.send(mutation.clone()).is_ok());
        }
    }
}

fn instrument_props(instrument: &Instrument) -> InstrumentProps {
    InstrumentProps {
        roll: Some(instrument.roll()),
        instrument: Some(instrument.kind()),
        volume: Some(instrument.volume_db()),
        reverb: Some(instrument.reverb_mix()),
        delay: Some(instrument.delay_mix()),
    }
}

fn instrument_from_props(id: InstrumentId, props: &InstrumentProps) -> Result<Instrument, ApplyError> {
    let roll = props
        .roll
        .ok_or_else(|| malformed(format!("instrument {} has no roll", id)))?;
    let kind = props
        .instrument
        .ok_or_else(|| malformed(format!("instrument {} has no preset", id)))?;
    let patch = instrument_patch(props)?;
    Ok(Instrument::from_parts(
        id,
        roll,
        kind,
        patch.volume_db.unwrap_or(DEFAULT_VOLUME_DB),
        patch.reverb.unwrap_or(0.0),
        patch.delay.unwrap_or(0.0),
    ))
}

fn instrument_patch(props: &InstrumentProps) -> Result<InstrumentPatch, ApplyError> {
    Ok(InstrumentPatch {
        kind: props.instrument,
        volume_db: checked("volume", props.volume, grid::check_volume)?,
        reverb: checked("reverb", props.reverb, grid::check_mix)?,
        delay: checked("delay", props.delay, grid::check_mix)?,
    })
}

fn note_from_fields(roll: RollId, fields: &NoteFields) -> Result<Note, ApplyError> {
    let patch = note_patch(fields)?;
    let tick = patch
        .tick
        .ok_or_else(|| malformed(format!("note {} has no x", fields.uuid)))?;
    let row = patch
        .row
        .ok_or_else(|| malformed(format!("note {} has no y", fields.uuid)))?;
    Ok(Note::from_parts(
        fields.uuid,
        roll,
        tick,
        row,
        patch.length.unwrap_or(1),
    ))
}

fn note_from_props(roll: RollId, id: NoteId, props: &NoteProps) -> Result<Note, ApplyError> {
    note_from_fields(
        roll,
        &NoteFields {
            uuid: id,
            x: props.x,
            y: props.y,
            length: props.length,
        },
    )
}

fn note_patch(fields: &NoteFields) -> Result<NotePatch, ApplyError> {
    Ok(NotePatch {
        tick: checked("x", fields.x, grid::check_tick)?,
        row: checked("y", fields.y, grid::check_row)?,
        length: checked("length", fields.length, grid::check_length)?,
    })
}

fn checked<T, U>(
    key: &str,
    value: Option<T>,
    check: impl Fn(T) -> Option<U>,
) -> Result<Option<U>, ApplyError>
where
    T: Copy + fmt::Display,
{
    value
        .map(|value| check(value).ok_or_else(|| malformed(format!("{} {} is out of range", key, value))))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{self, ChannelError};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct FakeChannel {
        sent: Vec<String>,
        inbox: VecDeque<String>,
        closed: bool,
    }

    impl Channel for FakeChannel {
        fn send(&mut self, text: String) -> channel::Result<()> {
            if self.closed {
                return Err(ChannelError::Closed);
            }
            self.sent.push(text);
            Ok(())
        }

        fn try_recv(&mut self) -> Option<String> {
            self.inbox.pop_front()
        }

        fn is_open(&self) -> bool {
            !self.closed
        }
    }

    fn replicator() -> Replicator<FakeChannel> {
        Replicator::new(FakeChannel::default())
    }

    fn sent(replicator: &Replicator<FakeChannel>) -> Vec<Value> {
        replicator
            .channel()
            .sent
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    fn remote(replicator: &mut Replicator<FakeChannel>, message: Value) -> Result<(), ApplyError> {
        replicator.receive(&message.to_string())
    }

    // An instrument that already went out, so later flushes only carry what the test does.
    fn with_instrument() -> (Replicator<FakeChannel>, InstrumentId, RollId) {
        let mut replicator = replicator();
        let id = replicator.add_instrument().unwrap();
        let roll = replicator.session().instrument(id).unwrap().roll();
        replicator.flush();
        replicator.channel_mut().sent.clear();
        (replicator, id, roll)
    }

    #[test]
    fn local_instrument_is_announced() {
        let mut replicator = replicator().default_instrument(InstrumentKind::Piano);
        let id = replicator.add_instrument().unwrap();
        let roll = replicator.session().instrument(id).unwrap().roll();

        assert_eq!(replicator.flush(), 1);
        assert_eq!(
            sent(&replicator),
            vec![json!({
                "action": "instrument-create",
                "uuid": id.to_string(),
                "props": {
                    "roll": roll.to_string(),
                    "instrument": "piano",
                    "volume": -5.0,
                    "reverb": 0.0,
                    "delay": 0.0,
                },
            })]
        );
    }

    #[test]
    fn settings_shape_new_entities() {
        let mut replicator = replicator()
            .default_instrument(InstrumentKind::Synth)
            .default_volume(-80.0)
            .default_note_length(0);
        assert_eq!(
            replicator.settings(),
            &Settings {
                default_instrument: InstrumentKind::Synth,
                default_volume_db: -60.0,
                default_note_length: 1,
                answer_session_requests: false,
            }
        );

        let mut replicator = {
            let id = replicator.add_instrument().unwrap();
            let instrument = replicator.session().instrument(id).unwrap();
            assert_eq!(instrument.kind(), InstrumentKind::Synth);
            assert_eq!(instrument.volume_db(), -60.0);
            replicator.default_note_length(3)
        };
        let roll = replicator.session().rolls().next().unwrap().id();
        let note = replicator.add_note(roll, 0, 0).unwrap();
        assert_eq!(replicator.session().note(roll, note).unwrap().length_ticks(), 3);
    }

    #[test]
    fn attribute_writes_in_one_tick_are_one_message() {
        let (mut replicator, _, roll) = with_instrument();
        let note = replicator.add_note(roll, 0, 0).unwrap();
        replicator.flush();
        replicator.channel_mut().sent.clear();

        replicator
            .update_note(roll, note, NotePatch::new().tick(5))
            .unwrap();
        replicator
            .update_note(roll, note, NotePatch::new().row(3))
            .unwrap();
        replicator
            .update_note(roll, note, NotePatch::new().length(2))
            .unwrap();

        assert_eq!(replicator.flush(), 1);
        assert_eq!(
            sent(&replicator),
            vec![json!({
                "action": "note-update",
                "roll": roll.to_string(),
                "changes": { "uuid": note.to_string(), "x": 5, "y": 3, "length": 2 },
            })]
        );
    }

    #[test]
    fn writes_that_change_nothing_send_nothing() {
        let (mut replicator, id, _) = with_instrument();
        replicator
            .update_instrument(id, InstrumentPatch::new().volume(-5.0))
            .unwrap();
        assert_eq!(replicator.flush(), 0);
    }

    #[test]
    fn local_producers_clamp() {
        let (mut replicator, id, roll) = with_instrument();
        let note = replicator.add_note(roll, 70, -3).unwrap();
        replicator
            .update_instrument(id, InstrumentPatch::new().reverb(4.0))
            .unwrap();
        replicator.flush();

        let stored = replicator.session().note(roll, note).unwrap();
        assert_eq!((stored.tick(), stored.row()), (63, 0));
        assert_eq!(replicator.session().instrument(id).unwrap().reverb_mix(), 1.0);
        assert_eq!(sent(&replicator)[0]["note"]["x"], json!(63));
        assert_eq!(sent(&replicator)[1]["props"], json!({ "reverb": 1.0 }));
    }

    #[test]
    fn removing_an_instrument_sends_one_message() {
        let (mut replicator, id, roll) = with_instrument();
        replicator.add_note(roll, 1, 1).unwrap();
        replicator.add_note(roll, 2, 2).unwrap();
        replicator.flush();
        replicator.channel_mut().sent.clear();

        assert!(replicator.remove_instrument(id));
        assert_eq!(replicator.flush(), 1);
        assert_eq!(
            sent(&replicator),
            vec![json!({ "action": "instrument-remove", "uuid": id.to_string() })]
        );
        assert_eq!(replicator.session().note_count(), 0);
    }

    #[test]
    fn remote_changes_are_not_sent_back() {
        let (mut replicator, _, roll) = with_instrument();
        let note = NoteId::new();
        remote(
            &mut replicator,
            json!({
                "action": "note-create",
                "roll": roll.to_string(),
                "note": { "uuid": note.to_string(), "x": 3, "y": 10, "length": 1 },
            }),
        )
        .unwrap();

        assert!(replicator.observer().pending().is_empty());
        assert_eq!(replicator.flush(), 0);
        assert!(replicator.channel().sent.is_empty());
        assert_eq!(replicator.session().note(roll, note).unwrap().tick(), 3);
    }

    #[test]
    fn remote_creates_are_idempotent() {
        let mut replicator = replicator();
        let (id, roll) = (InstrumentId::new(), RollId::new());
        let create = json!({
            "action": "instrument-create",
            "uuid": id.to_string(),
            "props": { "roll": roll.to_string(), "instrument": "sine" },
        });
        remote(&mut replicator, create.clone()).unwrap();
        remote(&mut replicator, create).unwrap();
        assert_eq!(replicator.session().instrument_count(), 1);

        let note = json!({
            "action": "note-create",
            "roll": roll.to_string(),
            "note": { "uuid": NoteId::new().to_string(), "x": 0, "y": 0 },
        });
        remote(&mut replicator, note.clone()).unwrap();
        remote(&mut replicator, note).unwrap();
        assert_eq!(replicator.session().note_count(), 1);
        assert_eq!(
            replicator.session().instrument(id).unwrap().volume_db(),
            DEFAULT_VOLUME_DB
        );
    }

    #[test]
    fn remote_updates_are_partial() {
        let (mut replicator, _, roll) = with_instrument();
        let note = replicator.add_note_with_length(roll, 1, 3, 2).unwrap();
        replicator.flush();

        remote(
            &mut replicator,
            json!({
                "action": "note-update",
                "roll": roll.to_string(),
                "changes": { "uuid": note.to_string(), "x": 5 },
            }),
        )
        .unwrap();

        let stored = replicator.session().note(roll, note).unwrap();
        assert_eq!(
            (stored.tick(), stored.row(), stored.length_ticks()),
            (5, 3, 2)
        );
    }

    #[test]
    fn remote_instrument_updates_accept_string_numbers() {
        let (mut replicator, id, _) = with_instrument();
        remote(
            &mut replicator,
            json!({
                "action": "instrument-update",
                "uuid": id.to_string(),
                "props": { "volume": "-30", "instrument": "808" },
            }),
        )
        .unwrap();

        let instrument = replicator.session().instrument(id).unwrap();
        assert_eq!(instrument.volume_db(), -30.0);
        assert_eq!(instrument.kind(), InstrumentKind::Tr808);
    }

    #[test]
    fn unknown_ids_are_reported_and_ignored() {
        let (mut replicator, _, roll) = with_instrument();
        let before = replicator.session().clone();
        let missing = NoteId::new();

        let result = remote(
            &mut replicator,
            json!({
                "action": "note-update",
                "roll": roll.to_string(),
                "changes": { "uuid": missing.to_string(), "x": 5 },
            }),
        );
        assert_eq!(
            result,
            Err(ApplyError::UnknownEntity(session::Error::UnknownNote {
                roll,
                note: missing,
            }))
        );
        assert_eq!(replicator.session(), &before);

        let orphan = RollId::new();
        let result = remote(
            &mut replicator,
            json!({
                "action": "note-create",
                "roll": orphan.to_string(),
                "note": { "uuid": missing.to_string(), "x": 0, "y": 0 },
            }),
        );
        assert_eq!(
            result,
            Err(ApplyError::UnknownEntity(session::Error::UnknownRoll(orphan)))
        );

        // Removes of missing things are no-ops.
        remote(
            &mut replicator,
            json!({
                "action": "note-remove",
                "roll": roll.to_string(),
                "note": { "uuid": missing.to_string() },
            }),
        )
        .unwrap();
        remote(
            &mut replicator,
            json!({ "action": "instrument-remove", "uuid": InstrumentId::new().to_string() }),
        )
        .unwrap();
        assert_eq!(replicator.session(), &before);
        assert!(replicator.observer().is_observing());
    }

    #[test]
    fn malformed_messages_are_reported_and_ignored() {
        let (mut replicator, id, roll) = with_instrument();
        let before = replicator.session().clone();

        let messages = vec![
            json!({ "action": "note-create", "roll": roll.to_string() }),
            json!({
                "action": "note-create",
                "roll": roll.to_string(),
                "note": { "uuid": NoteId::new().to_string(), "y": 4 },
            }),
            json!({
                "action": "note-create",
                "roll": roll.to_string(),
                "note": { "uuid": NoteId::new().to_string(), "x": 64, "y": 4 },
            }),
            json!({
                "action": "instrument-create",
                "uuid": InstrumentId::new().to_string(),
                "props": { "instrument": "piano" },
            }),
            json!({
                "action": "instrument-create",
                "uuid": InstrumentId::new().to_string(),
                "props": { "roll": roll.to_string(), "instrument": "piano" },
            }),
            json!({
                "action": "instrument-update",
                "uuid": id.to_string(),
                "props": { "reverb": 2 },
            }),
            json!({
                "action": "instrument-update",
                "uuid": id.to_string(),
                "props": { "roll": RollId::new().to_string() },
            }),
        ];
        for message in messages {
            match remote(&mut replicator, message.clone()) {
                Err(ApplyError::MalformedMessage(_)) => {}
                other => panic!("{} gave {:?}", message, other),
            }
        }
        assert!(matches!(
            replicator.receive("{not json"),
            Err(ApplyError::MalformedMessage(_))
        ));
        assert_eq!(replicator.session(), &before);
    }

    #[test]
    fn remote_instrument_removal_cascades() {
        let (mut replicator, id, roll) = with_instrument();
        let first = replicator.add_note(roll, 0, 0).unwrap();
        let second = replicator.add_note(roll, 1, 1).unwrap();
        replicator.flush();

        remote(
            &mut replicator,
            json!({ "action": "instrument-remove", "uuid": id.to_string() }),
        )
        .unwrap();

        assert!(replicator.session().note(roll, first).is_none());
        assert!(replicator.session().note(roll, second).is_none());
        assert_eq!(replicator.session().notes(roll).count(), 0);
        assert_eq!(replicator.flush(), 0);
    }

    #[test]
    fn import_replaces_everything_and_resumes_once() {
        let (mut replicator, old, _) = with_instrument();
        let resumptions = replicator.observer().resumptions();

        let (a, b) = (InstrumentId::new(), InstrumentId::new());
        let (roll_a, roll_b) = (RollId::new(), RollId::new());
        let note = |x: i64| json!({ "x": x, "y": 10, "length": 1 });
        let fresh = || NoteId::new().to_string();
        remote(
            &mut replicator,
            json!({
                "action": "editor-import",
                "instruments": {
                    a.to_string(): { "roll": roll_a.to_string(), "instrument": "piano" },
                    b.to_string(): { "roll": roll_b.to_string(), "instrument": "909", "volume": -12 },
                },
                "rolls": {
                    roll_a.to_string(): {
                        fresh(): note(0),
                        fresh(): note(1),
                        fresh(): note(2),
                    },
                    roll_b.to_string(): {
                        fresh(): note(3),
                        fresh(): note(4),
                    },
                },
            }),
        )
        .unwrap();

        let session = replicator.session();
        assert_eq!(session.instrument_count(), 2);
        assert_eq!(session.note_count(), 5);
        assert!(session.instrument(old).is_none());
        assert_eq!(session.notes(roll_a).count(), 3);
        assert_eq!(session.instrument(b).unwrap().volume_db(), -12.0);
        assert_eq!(replicator.observer().resumptions(), resumptions + 1);
        assert_eq!(replicator.flush(), 0);
    }

    #[test]
    fn import_drops_unflushed_local_changes() {
        let mut replicator = replicator();
        let id = replicator.add_instrument().unwrap();

        replicator.import_session(SessionSnapshot::default());
        assert!(replicator.session().instrument(id).is_none());
        assert!(replicator.observer().pending().is_empty());
        assert_eq!(replicator.flush(), 0);
        assert!(replicator.channel().sent.is_empty());
    }

    #[test]
    fn remote_note_ids_can_not_move_between_rolls() {
        let (mut replicator, _, first) = with_instrument();
        let other = replicator.add_instrument().unwrap();
        let second = replicator.session().instrument(other).unwrap().roll();
        let note = replicator.add_note(first, 2, 2).unwrap();
        replicator.flush();

        let result = remote(
            &mut replicator,
            json!({
                "action": "note-create",
                "roll": second.to_string(),
                "note": { "uuid": note.to_string(), "x": 5, "y": 5 },
            }),
        );
        assert!(matches!(result, Err(ApplyError::MalformedMessage(_))));
        assert_eq!(replicator.session().note_count(), 1);
        assert_eq!(replicator.session().note_roll(note), Some(first));
        assert_eq!(replicator.session().notes(second).count(), 0);
    }

    #[test]
    fn local_changes_can_be_sent_one_at_a_time() {
        let (mut replicator, id, _) = with_instrument();
        assert!(replicator.apply_local_change(Change::InstrumentRemove { id }));
        assert_eq!(
            sent(&replicator),
            vec![json!({ "action": "instrument-remove", "uuid": id.to_string() })]
        );

        replicator.disconnect();
        assert!(!replicator.apply_local_change(Change::InstrumentRemove { id }));
        assert_eq!(replicator.channel().sent.len(), 1);
    }

    #[test]
    fn import_skips_orphaned_notes() {
        let mut replicator = replicator();
        let mut snapshot = SessionSnapshot::default();
        let mut notes = std::collections::BTreeMap::new();
        notes.insert(
            NoteId::new(),
            NoteProps {
                x: Some(0),
                y: Some(0),
                length: Some(1),
            },
        );
        snapshot.rolls.insert(RollId::new(), notes);

        replicator.import_session(snapshot);
        assert!(replicator.session().is_empty());
        assert_eq!(replicator.session().note_count(), 0);
    }

    #[test]
    fn exported_sessions_import_to_the_same_session() {
        let (mut source, id, roll) = with_instrument();
        source.add_note(roll, 7, 12).unwrap();
        source
            .update_instrument(id, InstrumentPatch::new().delay(0.35))
            .unwrap();

        let mut copy = replicator();
        copy.import_session(source.export_session());
        assert_eq!(copy.session(), source.session());
    }

    #[test]
    fn session_requests_are_answered_when_enabled() {
        let (replicator, _, roll) = with_instrument();
        let mut replicator = replicator.answer_session_requests(true);
        replicator.add_note(roll, 1, 2).unwrap();
        replicator.flush();
        replicator.channel_mut().sent.clear();

        remote(&mut replicator, json!({ "action": "session-get" })).unwrap();
        let sent = sent(&replicator);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["action"], json!("editor-import"));
        assert_eq!(sent[0]["rolls"][roll.to_string()].as_object().unwrap().len(), 1);

        let mut quiet = self::replicator();
        remote(&mut quiet, json!({ "action": "session-get" })).unwrap();
        assert!(quiet.channel().sent.is_empty());
    }

    #[test]
    fn offline_changes_are_dropped() {
        let (mut replicator, _, roll) = with_instrument();
        replicator.channel_mut().closed = true;

        replicator.add_note(roll, 0, 0).unwrap();
        assert_eq!(replicator.flush(), 0);
        assert_eq!(replicator.link(), Link::Offline);
        // Edits still apply locally.
        assert_eq!(replicator.session().note_count(), 1);

        replicator.add_note(roll, 1, 0).unwrap();
        assert!(replicator.reconnect(FakeChannel::default()));
        assert_eq!(replicator.link(), Link::Joining);
        assert_eq!(replicator.flush(), 0);
        assert_eq!(sent(&replicator), vec![json!({ "action": "session-get" })]);

        remote(
            &mut replicator,
            json!({ "action": "editor-import", "instruments": {}, "rolls": {} }),
        )
        .unwrap();
        assert_eq!(replicator.link(), Link::Online);
        assert!(replicator.session().is_empty());
    }

    #[test]
    fn disconnect_drops_pending_changes() {
        let (mut replicator, _, roll) = with_instrument();
        replicator.add_note(roll, 0, 0).unwrap();
        replicator.disconnect();
        assert!(replicator.observer().pending().is_empty());
        replicator.add_note(roll, 1, 0).unwrap();
        assert_eq!(replicator.flush(), 0);
        assert!(replicator.channel().sent.is_empty());
    }

    #[test]
    fn subscribers_see_local_and_remote_mutations() {
        let (mut replicator, _, roll) = with_instrument();
        let mutations = replicator.subscribe();

        let local = replicator.add_note(roll, 0, 0).unwrap();
        let other = NoteId::new();
        remote(
            &mut replicator,
            json!({
                "action": "note-create",
                "roll": roll.to_string(),
                "note": { "uuid": other.to_string(), "x": 1, "y": 1 },
            }),
        )
        .unwrap();
        replicator
            .update_note(roll, local, NotePatch::new().tick(9))
            .unwrap();

        let received: Vec<Mutation> = mutations.try_iter().collect();
        assert_eq!(received.len(), 3);
        assert!(matches!(&received[0], Mutation::NoteCreated(note) if note.id() == local));
        assert!(matches!(&received[1], Mutation::NoteCreated(note) if note.id() == other));
        assert_eq!(
            received[2],
            Mutation::NoteUpdated {
                roll,
                id: local,
                patch: NotePatch::new().tick(9),
            }
        );

        drop(mutations);
        replicator.remove_note(roll, local);
        assert_eq!(replicator.subscribers.len(), 0);
    }
}
