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

//! Session replication for collaborative piano-roll sequencers.
//!
//! # Introduction
//!
//! Prototune keeps a shared music session in sync between everyone editing it. A session is a
//! set of instruments, each with a piano roll of notes on a 64 tick by 88 row grid. Every client
//! holds a complete copy of the session, edits it locally and tells the others what changed by
//! sending small JSON messages through a relay.
//!
//! The crate is built from a few small pieces:
//!
//!  * [`session`](crate::session) - The keyed store of instruments, rolls and notes, along with
//!    the grid ranges every value is clamped to.
//!
//!  * [`observer`](crate::observer) - Watches the store for local mutations and coalesces the
//!    writes of one tick into as few messages as possible.
//!
//!  * [`wire`](crate::wire) - The JSON message format shared by every client.
//!
//!  * [`channel`](crate::channel) - The [`Channel`](channel::Channel) trait the replicator sends
//!    and receives through, and [`Relay`](channel::Relay), an in-memory relay for tests and
//!    single-process sessions.
//!
//!  * [`replicator`](crate::replicator) - The [`Replicator`] that ties the others together. Local
//!    edits go out, remote edits come in, and nothing that came in is ever sent back out.
//!
//! # Examples
//!
//! Two clients sharing a session through an in-memory relay:
//!
//! ```
//! use prototune::{
//!     channel::Relay,
//!     session::{InstrumentKind, InstrumentPatch},
//!     Replicator,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::new();
//!
//!     // The first client starts the session.
//!     let mut host = Replicator::new(relay.join()).answer_session_requests(true);
//!     let drums = host.add_instrument_with(InstrumentKind::Tr808)?;
//!     let roll = host.session().instrument(drums).unwrap().roll();
//!     for tick in (0..16).step_by(4) {
//!         host.add_note(roll, tick, 40)?;
//!     }
//!     host.flush();
//!
//!     // A second client joins late and asks for the whole session.
//!     let mut guest = Replicator::new(relay.join());
//!     guest.join();
//!     host.poll();
//!     guest.poll();
//!     assert_eq!(guest.session(), host.session());
//!
//!     // From now on edits flow both ways.
//!     guest.update_instrument(drums, InstrumentPatch::new().reverb(0.3))?;
//!     guest.flush();
//!     host.poll();
//!     assert_eq!(host.session().instrument(drums).unwrap().reverb_mix(), 0.3);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Consistency
//!
//! Updates carry only the keys that changed, and whichever update a client applies last wins.
//! There is no vector clock or operational transform, so two clients moving the same note at the
//! same moment can briefly disagree until one of them moves it again. Creations are idempotent
//! and removals of things that are already gone are ignored, so duplicate delivery is harmless.

pub mod channel;
pub mod observer;
pub mod replicator;
pub mod session;
pub mod wire;

pub use observer::{Change, Mutation};
pub use replicator::{ApplyError, Link, Replicator, Settings};
