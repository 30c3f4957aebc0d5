//! Per-connection chat session
//!
//! One session runs for every `RouteChat` stream. It owns the server-side
//! protocol state machine and two pumps:
//! - the receive loop feeds decoded client commands into the state machine
//! - the send loop drains the participant's outbound queue into the stream
//!
//! Both stop on a single per-session cancellation token. Termination is
//! requested at most once, optionally with a grace delay so that a final
//! Shutdown notice can reach the client first.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_GRACE_DELAY, DEFAULT_PARTICIPANT_QUEUE};
use crate::error::{AppError, TransportError};
use crate::fsm::{StateMachine, Transitions};
use crate::manager::RoomManager;
use crate::message::{
    ClientCommand, ClientMessage, ClientRequest, Helo, ServerMessage, WriteMessage,
};
use crate::participant::Participant;
use crate::room::RoomMessage;
use crate::transport::{Inbound, Outbound};
use crate::types::RoomId;

/// Server-side protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Booting,
    Ready,
    Receiving,
    Closed,
}

/// Server-side protocol events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Command(ClientCommand),
    ReadyAgain,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Booting => "booting",
            SessionState::Ready => "ready",
            SessionState::Receiving => "receiving",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Command(command) => command.fmt(f),
            SessionEvent::ReadyAgain => f.write_str("ready_again"),
        }
    }
}

/// Transition table of the server-side protocol
pub struct SessionMachine;

impl Transitions for SessionMachine {
    type State = SessionState;
    type Event = SessionEvent;

    const INITIAL: SessionState = SessionState::Booting;

    fn next(state: SessionState, event: SessionEvent) -> Option<SessionState> {
        use SessionState::{Booting, Closed, Ready, Receiving};

        match (state, event) {
            (Booting, SessionEvent::Command(ClientCommand::Helo)) => Some(Ready),
            (Ready, SessionEvent::Command(ClientCommand::WriteMessage)) => Some(Receiving),
            (Receiving, SessionEvent::ReadyAgain) => Some(Ready),
            (Booting | Ready | Receiving, SessionEvent::Command(ClientCommand::Quit)) => {
                Some(Closed)
            }
            _ => None,
        }
    }

    fn settle(state: SessionState) -> Option<SessionEvent> {
        match state {
            SessionState::Receiving => Some(SessionEvent::ReadyAgain),
            _ => None,
        }
    }
}

/// Per-session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wait between a Shutdown notice and teardown
    pub grace_delay: Duration,
    /// Capacity of each participant's outbound queue
    pub participant_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace_delay: DEFAULT_GRACE_DELAY,
            participant_queue: DEFAULT_PARTICIPANT_QUEUE,
        }
    }
}

/// The `RouteChat` service
///
/// Holds what every session needs: the room manager and the room new
/// participants are checked into.
#[derive(Debug, Clone)]
pub struct ChatService {
    manager: RoomManager,
    default_room: RoomId,
    config: SessionConfig,
}

impl ChatService {
    pub fn new(manager: RoomManager, default_room: RoomId, config: SessionConfig) -> Self {
        Self {
            manager,
            default_room,
            config,
        }
    }

    pub fn manager(&self) -> &RoomManager {
        &self.manager
    }

    pub fn default_room(&self) -> RoomId {
        self.default_room
    }

    /// Serve one bidirectional stream until the session terminates
    ///
    /// `shutdown` force-stops the session when cancelled, abandoning any
    /// send still in flight. Per-session failures are logged here and never
    /// returned; the protocol state the session ended in is.
    pub async fn route_chat(
        &self,
        peer: &str,
        inbound: Inbound<ClientMessage>,
        outbound: Outbound<ServerMessage>,
        shutdown: &CancellationToken,
    ) -> SessionState {
        let token = shutdown.child_token();
        let (terminator, close) = Terminator::new();
        let supervisor = tokio::spawn(supervise(close, token.clone(), self.config.grace_delay));

        let mut session = Session {
            peer: peer.to_string(),
            service: self.clone(),
            sm: StateMachine::new(),
            participant: None,
            outbound: Some(outbound),
            send_task: None,
            terminator,
            token,
            force: shutdown.clone(),
        };

        debug!("Session for {} started", peer);
        session.receive(inbound).await;

        if let Some(task) = session.send_task.take() {
            if let Err(e) = task.await {
                error!("Send loop for {} failed: {}", peer, e);
            }
        }
        if let Err(e) = supervisor.await {
            error!("Termination supervisor for {} failed: {}", peer, e);
        }

        session.leave_room();
        let state = session.sm.current();
        info!("Session for {} ended in state {}", peer, state);
        state
    }
}

/// Request to end a session
#[derive(Debug, Clone, Copy)]
struct CloseCommand {
    delay: bool,
}

/// One-shot termination trigger; only the first request counts
#[derive(Debug, Clone)]
struct Terminator {
    trigger: Arc<Mutex<Option<oneshot::Sender<CloseCommand>>>>,
}

impl Terminator {
    fn new() -> (Self, oneshot::Receiver<CloseCommand>) {
        let (tx, rx) = oneshot::channel();
        let terminator = Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
        };
        (terminator, rx)
    }

    fn terminate(&self, delay: bool) {
        if let Some(tx) = self.trigger.lock().take() {
            let _ = tx.send(CloseCommand { delay });
        }
    }
}

/// Cancel `token` once termination is requested, after `grace` if delayed
async fn supervise(
    close: oneshot::Receiver<CloseCommand>,
    token: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        cmd = close => {
            if let Ok(CloseCommand { delay: true }) = cmd {
                debug!("Delaying session teardown by {:?}", grace);
                tokio::select! {
                    () = tokio::time::sleep(grace) => {}
                    () = token.cancelled() => {}
                }
            }
        }
        () = token.cancelled() => {}
    }
    token.cancel();
}

struct Session {
    peer: String,
    service: ChatService,
    sm: StateMachine<SessionMachine>,
    participant: Option<Arc<Participant>>,
    outbound: Option<Outbound<ServerMessage>>,
    send_task: Option<JoinHandle<()>>,
    terminator: Terminator,
    token: CancellationToken,
    /// Server force-stop; cancelled only when shutdown gives up waiting
    force: CancellationToken,
}

impl Session {
    /// Receive loop: runs until EOF, a fatal transport error or cancellation
    async fn receive(&mut self, mut inbound: Inbound<ClientMessage>) {
        loop {
            let next = tokio::select! {
                biased;

                () = self.token.cancelled() => break,
                next = inbound.next() => next,
            };

            match next {
                None => {
                    debug!("Stream from {} ended", self.peer);
                    self.terminator.terminate(false);
                    break;
                }
                Some(Err(e)) if e.is_recoverable() => {
                    warn!("Dropping envelope from {}: {}", self.peer, e);
                }
                Some(Err(e)) => {
                    warn!("Receive from {} failed: {}", self.peer, e);
                    self.terminator.terminate(false);
                    break;
                }
                Some(Ok(msg)) => self.handle(msg).await,
            }
        }
    }

    async fn handle(&mut self, msg: ClientMessage) {
        let command = msg.command;
        debug!("Got {} from {}", command, self.peer);

        let request = match msg.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!("Cannot decode {} from {}: {}", command, self.peer, e);
                return;
            }
        };

        let event = SessionEvent::Command(command);
        if let Err(e) = self.sm.check(event) {
            warn!("Failed to submit {} from {}: {}", command, self.peer, e);
            return;
        }

        match request {
            ClientRequest::Helo(helo) => {
                if let Err(e) = self.check_in(helo).await {
                    error!("Room checkout for {} failed: {}", self.peer, e);
                    self.terminator.terminate(false);
                    return;
                }
            }
            ClientRequest::WriteMessage(write) => self.forward(write).await,
            ClientRequest::Quit => self.terminator.terminate(false),
        }

        self.advance(event);
    }

    fn advance(&mut self, event: SessionEvent) {
        match self.sm.fire(event) {
            Ok(state) => debug!("Session {} -> {}", self.peer, state),
            Err(e) => warn!("Failed to submit {} from {}: {}", event, self.peer, e),
        }
        if let Some(state) = self.sm.settle() {
            debug!("Session {} -> {}", self.peer, state);
        }
    }

    /// Helo side effect: create the participant, join the default room,
    /// confirm and start the send loop
    async fn check_in(&mut self, helo: Helo) -> Result<(), AppError> {
        let room_id = self.service.default_room;
        let room = self
            .service
            .manager
            .get_room(room_id)
            .ok_or(AppError::RoomNotFound(room_id))?;

        let (tx, queue) = mpsc::channel(self.service.config.participant_queue.max(1));
        let participant = Arc::new(Participant::new(helo.author, tx));

        // Queued before joining so no broadcast can overtake it
        participant
            .deliver(ServerMessage::confirm_room_checkout())
            .await
            .map_err(|_| AppError::ChannelSend)?;
        room.add_participant(&participant)?;

        let Some(outbound) = self.outbound.take() else {
            room.remove_participant(participant.id());
            return Err(AppError::ChannelSend);
        };

        self.send_task = Some(tokio::spawn(pump_outbound(
            Arc::clone(&participant),
            queue,
            outbound,
            Stop {
                token: self.token.clone(),
                force: self.force.clone(),
                terminator: self.terminator.clone(),
            },
        )));
        info!("{} checked in as {}", self.peer, participant);
        self.participant = Some(participant);

        Ok(())
    }

    /// WriteMessage side effect: hand the command to the current room
    async fn forward(&mut self, write: WriteMessage) {
        let Some(participant) = &self.participant else {
            warn!("WriteMessage from {} without participant", self.peer);
            return;
        };
        let Some(room) = participant.current_room() else {
            warn!("{} is not in a room", participant);
            return;
        };

        let msg = RoomMessage {
            request: ClientRequest::WriteMessage(write),
            participant: Arc::clone(participant),
        };
        tokio::select! {
            biased;

            () = self.token.cancelled() => {
                debug!("Forward from {} abandoned", participant);
            }
            res = room.submit(msg) => {
                if let Err(e) = res {
                    warn!("Forward from {} failed: {}", participant, e);
                }
            }
        }
    }

    fn leave_room(&self) {
        if let Some(participant) = &self.participant {
            if let Some(room) = participant.current_room() {
                room.remove_participant(participant.id());
            }
        }
    }
}

/// Ways the send loop is told to stop
struct Stop {
    token: CancellationToken,
    force: CancellationToken,
    terminator: Terminator,
}

/// Send loop: outbound queue and disconnect notice → stream
///
/// Every send is raced against the session token so a peer that stops
/// reading cannot hold the session open past termination.
async fn pump_outbound(
    participant: Arc<Participant>,
    mut queue: mpsc::Receiver<ServerMessage>,
    mut outbound: Outbound<ServerMessage>,
    stop: Stop,
) {
    let mut notified = false;

    loop {
        let (msg, notice) = tokio::select! {
            biased;

            () = stop.token.cancelled() => break,

            () = participant.disconnected(), if !notified => {
                notified = true;
                debug!("Got disconnect notice for {}", participant);
                (ServerMessage::shutdown(), true)
            }

            msg = queue.recv() => match msg {
                Some(msg) => (msg, false),
                None => break,
            },
        };

        let sent = tokio::select! {
            biased;

            () = stop.token.cancelled() => break,
            sent = outbound.send(msg) => sent,
        };

        match sent {
            Ok(()) if notice => stop.terminator.terminate(true),
            Ok(()) => {}
            Err(e) => {
                log_send_failure(&participant, &e);
                stop.terminator.terminate(false);
                break;
            }
        }
    }

    tokio::select! {
        biased;

        () = stop.force.cancelled() => {
            debug!("Dropping stream to {} without closing", participant);
        }
        res = outbound.close() => {
            if let Err(e) = res {
                debug!("Closing stream to {} failed: {}", participant, e);
            }
        }
    }
    debug!("Send loop for {} ended", participant);
}

fn log_send_failure(participant: &Participant, err: &TransportError) {
    match err {
        TransportError::Closed => debug!("Stream to {} already closed", participant),
        other => error!("Send to {} failed: {}", participant, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ServerCommand, ServerEvent};
    use crate::transport::memory::{self, Peer};
    use serde_json::json;
    use tokio::time::{timeout, Instant};
    use tokio_tungstenite::tungstenite;

    type ClientPeer = Peer<ClientMessage, ServerMessage>;

    fn service(grace_delay: Duration) -> ChatService {
        let manager = RoomManager::new();
        let default_room = manager.create_room("default").unwrap();
        ChatService::new(
            manager,
            default_room,
            SessionConfig {
                grace_delay,
                participant_queue: 32,
            },
        )
    }

    fn connect(
        service: &ChatService,
        shutdown: &CancellationToken,
    ) -> (ClientPeer, JoinHandle<SessionState>) {
        let (outbound, inbound, peer) = memory::channel();
        let service = service.clone();
        let shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            service
                .route_chat("test", inbound, outbound, &shutdown)
                .await
        });
        (peer, task)
    }

    async fn finished(task: JoinHandle<SessionState>) -> SessionState {
        timeout(Duration::from_secs(1), task)
            .await
            .expect("session still running")
            .unwrap()
    }

    async fn recv(peer: &mut ClientPeer) -> ServerMessage {
        timeout(Duration::from_secs(1), peer.from_near.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("stream closed")
    }

    async fn check_in(peer: &mut ClientPeer, author: &str) {
        peer.send(ClientMessage::helo(author));
        assert_eq!(recv(peer).await.command, ServerCommand::ConfirmRoomCheckout);
    }

    fn room_size(service: &ChatService) -> usize {
        service
            .manager()
            .get_room(service.default_room())
            .map_or(0, |room| room.participant_count())
    }

    #[test]
    fn test_session_machine_path() {
        let mut sm = StateMachine::<SessionMachine>::new();
        let mut visited = vec![sm.current()];

        visited.push(sm.fire(SessionEvent::Command(ClientCommand::Helo)).unwrap());
        for _ in 0..2 {
            visited.push(sm.fire(SessionEvent::Command(ClientCommand::WriteMessage)).unwrap());
            visited.extend(sm.settle());
        }
        visited.push(sm.fire(SessionEvent::Command(ClientCommand::Quit)).unwrap());

        use SessionState::*;
        assert_eq!(
            visited,
            vec![Booting, Ready, Receiving, Ready, Receiving, Ready, Closed]
        );
    }

    #[test]
    fn test_session_machine_rejections() {
        let mut sm = StateMachine::<SessionMachine>::new();
        assert!(sm.fire(SessionEvent::Command(ClientCommand::WriteMessage)).is_err());
        assert!(sm.fire(SessionEvent::ReadyAgain).is_err());
        assert_eq!(sm.current(), SessionState::Booting);

        sm.fire(SessionEvent::Command(ClientCommand::Helo)).unwrap();
        assert!(sm.fire(SessionEvent::Command(ClientCommand::Helo)).is_err());

        sm.fire(SessionEvent::Command(ClientCommand::Quit)).unwrap();
        assert!(sm.fire(SessionEvent::Command(ClientCommand::Quit)).is_err());
        assert!(sm.fire(SessionEvent::Command(ClientCommand::WriteMessage)).is_err());
    }

    #[tokio::test]
    async fn test_helo_confirms_room_checkout() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, _task) = connect(&service, &shutdown);

        check_in(&mut alice, "alice").await;
        assert_eq!(room_size(&service), 1);
    }

    #[tokio::test]
    async fn test_message_fans_out_to_room() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, alice_task) = connect(&service, &shutdown);
        let (mut bob, _bob_task) = connect(&service, &shutdown);

        check_in(&mut alice, "alice").await;
        check_in(&mut bob, "bob").await;

        alice.send(ClientMessage::write_message("hi"));

        let expected = ServerEvent::ForwardMessage(crate::message::ForwardMessage {
            author: "alice".to_string(),
            body: "hi".to_string(),
        });
        assert_eq!(recv(&mut bob).await.decode().unwrap(), expected);
        assert_eq!(recv(&mut alice).await.decode().unwrap(), expected);

        alice.send(ClientMessage::quit());
        assert_eq!(finished(alice_task).await, SessionState::Closed);
        assert!(timeout(Duration::from_secs(1), alice.from_near.recv())
            .await
            .unwrap()
            .is_none());
        assert_eq!(room_size(&service), 1);
    }

    #[tokio::test]
    async fn test_write_before_helo_is_dropped() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut bob, _bob_task) = connect(&service, &shutdown);
        let (mut alice, _alice_task) = connect(&service, &shutdown);
        check_in(&mut bob, "bob").await;

        alice.send(ClientMessage::write_message("early"));
        check_in(&mut alice, "alice").await;
        alice.send(ClientMessage::write_message("later"));

        match recv(&mut bob).await.decode().unwrap() {
            ServerEvent::ForwardMessage(forward) => assert_eq!(forward.body, "later"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_helo_leaves_session_booting() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, task) = connect(&service, &shutdown);

        alice.send(ClientMessage {
            command: ClientCommand::Helo,
            operation: json!({ "name": "alice" }),
        });
        alice.send(ClientMessage::write_message("ignored"));

        assert!(timeout(Duration::from_millis(200), alice.from_near.recv())
            .await
            .is_err());
        assert_eq!(room_size(&service), 0);
        assert!(!task.is_finished());

        check_in(&mut alice, "alice").await;
        assert_eq!(room_size(&service), 1);
    }

    #[tokio::test]
    async fn test_undecodable_envelope_is_not_fatal() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, _task) = connect(&service, &shutdown);

        let json_err = serde_json::from_str::<ClientMessage>("nope").unwrap_err();
        alice.send_err(TransportError::Decode(json_err));

        check_in(&mut alice, "alice").await;
    }

    #[tokio::test]
    async fn test_eof_ends_session_and_leaves_room() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, task) = connect(&service, &shutdown);
        check_in(&mut alice, "alice").await;

        alice.close();

        assert_eq!(finished(task).await, SessionState::Ready);
        assert_eq!(room_size(&service), 0);
    }

    #[tokio::test]
    async fn test_transport_error_ends_session() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, task) = connect(&service, &shutdown);
        check_in(&mut alice, "alice").await;

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        alice.send_err(TransportError::WebSocket(tungstenite::Error::Io(io)));

        assert_eq!(finished(task).await, SessionState::Ready);
        assert_eq!(room_size(&service), 0);
    }

    #[tokio::test]
    async fn test_quit_before_helo() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (alice, task) = connect(&service, &shutdown);

        alice.send(ClientMessage::quit());

        assert_eq!(finished(task).await, SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_close_sends_shutdown_then_waits_grace_delay() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, task) = connect(&service, &shutdown);
        check_in(&mut alice, "alice").await;

        service.manager().close();
        assert_eq!(recv(&mut alice).await.command, ServerCommand::Shutdown);
        let notified_at = Instant::now();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());

        let state = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        assert!(notified_at.elapsed() >= Duration::from_secs(4));
        assert_eq!(state, SessionState::Ready);
    }

    #[tokio::test]
    async fn test_forced_shutdown_stops_booting_session() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (_alice, task) = connect(&service, &shutdown);

        shutdown.cancel();

        assert_eq!(finished(task).await, SessionState::Booting);
    }

    #[tokio::test]
    async fn test_helo_into_closed_room_aborts() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        service.manager().close();
        let (mut alice, task) = connect(&service, &shutdown);

        alice.send(ClientMessage::helo("alice"));

        assert_eq!(finished(task).await, SessionState::Booting);
        assert!(timeout(Duration::from_secs(1), alice.from_near.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_session_walks_write_cycle_to_closed() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, task) = connect(&service, &shutdown);
        check_in(&mut alice, "alice").await;

        for body in ["one", "two", "three"] {
            alice.send(ClientMessage::write_message(body));
            match recv(&mut alice).await.decode().unwrap() {
                ServerEvent::ForwardMessage(forward) => assert_eq!(forward.body, body),
                other => panic!("unexpected {:?}", other),
            }
        }
        alice.send(ClientMessage::quit());

        assert_eq!(finished(task).await, SessionState::Closed);
        assert_eq!(room_size(&service), 0);
    }

    #[tokio::test]
    async fn test_forced_shutdown_stops_session_with_stalled_reader() {
        let service = service(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let (mut alice, task) = connect(&service, &shutdown);
        check_in(&mut alice, "alice").await;

        // Never read again: the stream, participant queue and room queue all fill up
        for i in 0..400 {
            alice.send(ClientMessage::write_message(&format!("msg {}", i)));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());

        shutdown.cancel();

        assert_eq!(finished(task).await, SessionState::Ready);
        assert_eq!(room_size(&service), 0);
    }
}
