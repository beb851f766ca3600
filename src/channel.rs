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

//! The message channel connecting a client to the rest of the session.
//!
//! The [`Replicator`](crate::Replicator) does not talk to a socket directly. It is given a
//! [`Channel`] when it is created, which lets the transport be anything that can deliver text
//! messages reliably and in order: a WebSocket to a relay server, or the in-memory [`Relay`]
//! provided here.
//!
//! # Examples
//!
//! ```
//! use prototune::channel::{Channel, Relay};
//!
//! let relay = Relay::new();
//! let mut alice = relay.join();
//! let mut bob = relay.join();
//!
//! alice.send("hello".to_owned())?;
//! assert_eq!(bob.try_recv().as_deref(), Some("hello"));
//! // Senders do not hear their own messages.
//! assert_eq!(alice.try_recv(), None);
//! # prototune::channel::Result::Ok(())
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
};
use thiserror::Error;

/// A specialized [`Result`] type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// The error type returned by [`Channel::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("transport failed: {0}")]
    Transport(String),
}

/// A reliable, ordered, text message channel to the other members of a session.
pub trait Channel {
    /// Sends a message to every other member of the session.
    fn send(&mut self, text: String) -> Result<()>;

    /// Returns the next message received from another member, if one is waiting.
    fn try_recv(&mut self) -> Option<String>;

    /// Returns `false` once the channel can no longer send.
    fn is_open(&self) -> bool;
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn send(&mut self, text: String) -> Result<()> {
        (**self).send(text)
    }

    fn try_recv(&mut self) -> Option<String> {
        (**self).try_recv()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// An in-memory relay that forwards every message to all other members.
///
/// `Relay` is safe to clone and share between threads. Each call to [`Relay::join`] adds a
/// member. Members whose channels have been dropped are forgotten the next time a message is
/// relayed.
#[derive(Clone, Default)]
pub struct Relay(Arc<RelayInner>);

#[derive(Default)]
struct RelayInner {
    members: Mutex<Vec<Member>>,
    member_id_counter: AtomicUsize,
}

struct Member {
    id: usize,
    sender: mpsc::Sender<String>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("members", &self.members())
            .finish()
    }
}

impl Relay {
    pub fn new() -> Relay {
        Relay::default()
    }

    /// Adds a member and returns its end of the relay.
    pub fn join(&self) -> RelayChannel {
        let id = self.0.member_id_counter.fetch_add(1, Ordering::Relaxed);
        let (sender, inbox) = mpsc::channel();
        self.lock_members().push(Member { id, sender });
        log::debug!("relay member {} joined", id);
        RelayChannel {
            relay: self.clone(),
            id,
            inbox,
            open: true,
        }
    }

    /// Number of members currently connected.
    pub fn members(&self) -> usize {
        self.lock_members().len()
    }

    fn broadcast(&self, from: usize, text: &str) {
        let mut members = self.lock_members();
        let mut offset = 0;
        for i in 0..members.len() {
            let member = &members[i - offset];
            if member.id == from {
                continue;
            }
            if member.sender.send(text.to_owned()).is_err() {
                log::debug!("relay member {} is gone", member.id);
                members.remove(i - offset);
                offset += 1;
            }
        }
    }

    fn leave(&self, id: usize) {
        self.lock_members().retain(|member| member.id != id);
        log::debug!("relay member {} left", id);
    }

    fn lock_members(&self) -> std::sync::MutexGuard<'_, Vec<Member>> {
        self.0
            .members
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One member's connection to a [`Relay`].
pub struct RelayChannel {
    relay: Relay,
    id: usize,
    inbox: mpsc::Receiver<String>,
    open: bool,
}

impl fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayChannel")
            .field("id", &self.id)
            .field("open", &self.open)
            .finish()
    }
}

impl RelayChannel {
    /// Leaves the relay. Sending afterwards fails with [`ChannelError::Closed`].
    pub fn close(&mut self) {
        if self.open {
            self.open = false;
            self.relay.leave(self.id);
        }
    }
}

impl Channel for RelayChannel {
    fn send(&mut self, text: String) -> Result<()> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        self.relay.broadcast(self.id, &text);
        Ok(())
    }

    fn try_recv(&mut self) -> Option<String> {
        self.inbox.try_recv().ok()
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.close();
    }
}
