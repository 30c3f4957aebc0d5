//! Participant struct definition
//!
//! The server-side identity and mailbox of one handshaked client.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::room::Room;
use crate::types::{ParticipantId, RoomId};

/// Connected participant
///
/// Shared between its owning session and the room it is a member of.
/// The room reference is non-owning.
#[derive(Debug)]
pub struct Participant {
    /// Unique identifier for this participant
    id: ParticipantId,
    /// Display name given in Helo
    name: String,
    /// Room the participant currently belongs to
    room: Mutex<Option<Weak<Room>>>,
    /// Server → Client message queue
    outbound: mpsc::Sender<ServerMessage>,
    /// Fired once when the room asks the session to go away
    disconnect: CancellationToken,
}

impl Participant {
    /// Create a new participant with the given name and outbound queue
    pub fn new(name: impl Into<String>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: ParticipantId::new(),
            name: name.into(),
            room: Mutex::new(None),
            outbound,
            disconnect: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Room this participant is a member of, if it still exists
    pub fn current_room(&self) -> Option<Arc<Room>> {
        self.room.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Point the back-reference at `room`, returning the previous room
    pub(crate) fn set_room(&self, room: Weak<Room>) -> Option<Arc<Room>> {
        self.room.lock().replace(room).and_then(|old| old.upgrade())
    }

    /// Clear the back-reference if it still points at `room_id`
    pub(crate) fn leave_room(&self, room_id: RoomId) {
        let mut room = self.room.lock();
        let points_here = room
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(true, |current| current.id() == room_id);
        if points_here {
            *room = None;
        }
    }

    /// Queue a message for this participant
    ///
    /// Returns an error if the queue is closed (session gone).
    pub async fn deliver(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Leave the current room and notify the owning session
    pub fn disconnect(&self) {
        if let Some(room) = self.current_room() {
            room.remove_participant(self.id);
        }
        self.disconnect.cancel();
    }

    /// Resolves once [`Participant::disconnect`] has been called
    pub async fn disconnected(&self) {
        self.disconnect.cancelled().await;
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnect.is_cancelled()
    }
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
