//! Room definition
//!
//! A room is a broadcast domain. Membership lives behind a mutex; every
//! message posted to the room goes through a single consumer task that
//! snapshots the membership and fans the message out.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::fsm::{StateMachine, Transitions};
use crate::manager::Registry;
use crate::message::{ClientCommand, ClientRequest, ServerMessage};
use crate::participant::Participant;
use crate::types::{ParticipantId, RoomId};

/// A client command on its way into a room
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub request: ClientRequest,
    pub participant: Arc<Participant>,
}

/// Consumer states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Idle,
    Receiving,
}

/// Consumer events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    Command(ClientCommand),
    ReadyAgain,
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomState::Idle => f.write_str("idle"),
            RoomState::Receiving => f.write_str("receiving"),
        }
    }
}

impl fmt::Display for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomEvent::Command(command) => command.fmt(f),
            RoomEvent::ReadyAgain => f.write_str("ready_again"),
        }
    }
}

/// Transition table of the room consumer
pub struct RoomMachine;

impl Transitions for RoomMachine {
    type State = RoomState;
    type Event = RoomEvent;

    const INITIAL: RoomState = RoomState::Idle;

    fn next(state: RoomState, event: RoomEvent) -> Option<RoomState> {
        match (state, event) {
            (RoomState::Idle, RoomEvent::Command(ClientCommand::WriteMessage)) => {
                Some(RoomState::Receiving)
            }
            (RoomState::Receiving, RoomEvent::ReadyAgain) => Some(RoomState::Idle),
            _ => None,
        }
    }

    fn settle(state: RoomState) -> Option<RoomEvent> {
        match state {
            RoomState::Receiving => Some(RoomEvent::ReadyAgain),
            RoomState::Idle => None,
        }
    }
}

/// Chat room
///
/// Owned by the [`RoomManager`](crate::manager::RoomManager). Once closed it
/// rejects new participants and its consumer task is gone for good.
pub struct Room {
    id: RoomId,
    name: String,
    members: Mutex<HashMap<ParticipantId, Arc<Participant>>>,
    inbound: mpsc::Sender<RoomMessage>,
    close_signal: CancellationToken,
    closed: AtomicBool,
    registry: Weak<Registry>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Room {
    /// Create a room and start its consumer task
    pub(crate) fn spawn(name: &str, queue_size: usize, registry: Weak<Registry>) -> Arc<Self> {
        let (inbound, receiver) = mpsc::channel(queue_size);
        let room = Arc::new(Self {
            id: RoomId::new(),
            name: name.to_string(),
            members: Mutex::new(HashMap::new()),
            inbound,
            close_signal: CancellationToken::new(),
            closed: AtomicBool::new(false),
            registry,
        });

        tokio::spawn(consume(
            Arc::downgrade(&room),
            room.close_signal.clone(),
            receiver,
        ));
        room
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of current members
    pub fn participant_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Check if a participant is in this room
    pub fn contains(&self, id: ParticipantId) -> bool {
        self.members.lock().contains_key(&id)
    }

    /// Add a participant, moving it out of any previous room
    pub fn add_participant(
        self: &Arc<Self>,
        participant: &Arc<Participant>,
    ) -> Result<(), AppError> {
        if let Some(previous) = participant.set_room(Arc::downgrade(self)) {
            if previous.id != self.id {
                previous.remove_participant(participant.id());
            }
        }

        {
            let mut members = self.members.lock();
            if !self.is_closed() {
                members.insert(participant.id(), Arc::clone(participant));
                drop(members);
                info!("Participant {} joined room {}", participant, self);
                return Ok(());
            }
        }

        participant.leave_room(self.id);
        Err(AppError::RoomClosed(self.id))
    }

    /// Remove a participant; missing ids are ignored
    pub fn remove_participant(&self, id: ParticipantId) {
        let removed = self.members.lock().remove(&id);
        if let Some(participant) = removed {
            participant.leave_room(self.id);
            debug!("Participant {} left room {}", participant, self);
        }
    }

    /// Queue a command for the consumer task
    pub async fn submit(&self, msg: RoomMessage) -> Result<(), AppError> {
        if self.is_closed() {
            return Err(AppError::RoomClosed(self.id));
        }
        self.inbound
            .send(msg)
            .await
            .map_err(|_| AppError::RoomClosed(self.id))
    }

    /// Close the room; later calls are no-ops
    ///
    /// Deregisters from the manager, disconnects every member and stops
    /// the consumer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Room {} closing", self);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.drain();
        self.close_signal.cancel();
    }

    /// Copy of the current membership
    fn snapshot(&self) -> Vec<Arc<Participant>> {
        self.members.lock().values().cloned().collect()
    }

    async fn handle(&self, sm: &mut StateMachine<RoomMachine>, msg: RoomMessage) {
        let command = msg.request.command();
        if let Err(e) = sm.fire(RoomEvent::Command(command)) {
            error!("Room {} failed to submit {}: {}", self, command, e);
            return;
        }

        if let ClientRequest::WriteMessage(write) = &msg.request {
            self.broadcast(msg.participant.name(), &write.body).await;
        }

        sm.settle();
    }

    /// Forward a message to every member, sender included
    async fn broadcast(&self, author: &str, body: &str) {
        let members = self.snapshot();
        debug!(
            "Room {} forwarding message from {} to {} members",
            self,
            author,
            members.len()
        );

        for participant in members {
            let forward = ServerMessage::forward_message(author, body);
            if participant.deliver(forward).await.is_err() {
                warn!("Forward to {} failed: queue closed", participant);
            }
        }
    }

    /// Empty the membership and disconnect everyone that was in it
    fn drain(&self) {
        let members: Vec<_> = {
            let mut members = self.members.lock();
            members.drain().map(|(_, participant)| participant).collect()
        };

        for participant in members {
            participant.leave_room(self.id);
            participant.disconnect();
        }
    }
}

/// Consumer loop; exits for good once the room closes or is dropped
///
/// Only a weak reference is held between messages, so a room that is
/// deregistered and released without being closed still ends this task.
async fn consume(
    room: Weak<Room>,
    close_signal: CancellationToken,
    mut receiver: mpsc::Receiver<RoomMessage>,
) {
    let mut sm = StateMachine::<RoomMachine>::new();
    debug!("Room consumer started");

    loop {
        tokio::select! {
            biased;

            () = close_signal.cancelled() => break,

            msg = receiver.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                let Some(room) = room.upgrade() else {
                    break;
                };
                room.handle(&mut sm, msg).await;
            }
        }
    }

    debug!("Room consumer ended");
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
