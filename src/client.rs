//! Chat client
//!
//! The peer side of `RouteChat`. Pairs with the server by sending Helo,
//! then relays user input as WriteMessage and reports forwarded messages
//! from other authors until either side quits.

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, TransportError};
use crate::fsm::{StateMachine, Transitions};
use crate::message::{ClientMessage, ForwardMessage, ServerCommand, ServerEvent, ServerMessage};
use crate::transport::{self, Inbound, Outbound};

/// Input line that ends the chat
pub const QUIT_INPUT: &str = "q";

/// Client-side protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Booting,
    Pairing,
    Ready,
    Receiving,
    Closed,
}

/// Client-side protocol events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Pair,
    Server(ServerCommand),
    ReadyAgain,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Booting => "booting",
            ClientState::Pairing => "pairing",
            ClientState::Ready => "ready",
            ClientState::Receiving => "receiving",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Pair => f.write_str("pair"),
            ClientEvent::Server(command) => command.fmt(f),
            ClientEvent::ReadyAgain => f.write_str("ready_again"),
        }
    }
}

/// Transition table of the client-side protocol
pub struct ClientMachine;

impl Transitions for ClientMachine {
    type State = ClientState;
    type Event = ClientEvent;

    const INITIAL: ClientState = ClientState::Booting;

    fn next(state: ClientState, event: ClientEvent) -> Option<ClientState> {
        use ClientState::{Booting, Closed, Pairing, Ready, Receiving};

        match (state, event) {
            (Booting, ClientEvent::Pair) => Some(Pairing),
            (Pairing, ClientEvent::Server(ServerCommand::ConfirmRoomCheckout)) => Some(Ready),
            (Ready, ClientEvent::Server(ServerCommand::ForwardMessage)) => Some(Receiving),
            (Receiving, ClientEvent::ReadyAgain) => Some(Ready),
            (
                Booting | Pairing | Ready | Receiving,
                ClientEvent::Server(ServerCommand::Shutdown),
            ) => Some(Closed),
            _ => None,
        }
    }

    fn settle(state: ClientState) -> Option<ClientEvent> {
        match state {
            ClientState::Receiving => Some(ClientEvent::ReadyAgain),
            _ => None,
        }
    }
}

/// What the client reports to its user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Checked into the room; input is now accepted
    Joined,
    /// Message from another author
    Message(ForwardMessage),
    /// Server asked us to leave
    Shutdown,
    /// Server closed the stream
    Disconnected,
}

enum Flow {
    Continue,
    Stop,
}

/// A connected chat client
pub struct ChatClient {
    author: String,
    inbound: Inbound<ServerMessage>,
    outbound: Outbound<ClientMessage>,
    sm: StateMachine<ClientMachine>,
}

impl ChatClient {
    pub fn new(
        author: impl Into<String>,
        outbound: Outbound<ClientMessage>,
        inbound: Inbound<ServerMessage>,
    ) -> Self {
        Self {
            author: author.into(),
            inbound,
            outbound,
            sm: StateMachine::new(),
        }
    }

    /// Dial a server at `url` (`ws://host:port`)
    pub async fn connect(url: &str, author: impl Into<String>) -> Result<Self, AppError> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (outbound, inbound) = transport::client_channel(ws);
        info!("Connected to {}", url);
        Ok(Self::new(author, outbound, inbound))
    }

    pub fn state(&self) -> ClientState {
        self.sm.current()
    }

    /// Pair with the server and chat until either side quits
    ///
    /// Lines from `input` are sent once the room checkout is confirmed;
    /// `q` or the end of `input` quits. Events for the user go to `events`.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<String>,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<(), AppError> {
        self.sm.fire(ClientEvent::Pair)?;
        self.outbound.send(ClientMessage::helo(&self.author)).await?;

        loop {
            let joined = matches!(self.sm.current(), ClientState::Ready | ClientState::Receiving);

            tokio::select! {
                msg = self.inbound.next() => match msg {
                    None => {
                        debug!("Server closed the stream");
                        let _ = events.send(ChatEvent::Disconnected).await;
                        return Ok(());
                    }
                    Some(Err(e)) if e.is_recoverable() => warn!("Dropping server envelope: {}", e),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(msg)) => {
                        if let Flow::Stop = self.handle(msg, &events).await? {
                            return Ok(());
                        }
                    }
                },

                line = input.recv(), if joined => match line {
                    None => return self.quit().await,
                    Some(line) => {
                        let line = line.trim_end_matches(['\r', '\n']);
                        if line == QUIT_INPUT {
                            return self.quit().await;
                        }
                        if !line.is_empty() {
                            self.outbound.send(ClientMessage::write_message(line)).await?;
                        }
                    }
                },
            }
        }
    }

    async fn handle(
        &mut self,
        msg: ServerMessage,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<Flow, AppError> {
        let command = msg.command;
        debug!("Got {}", command);

        let event = match msg.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!("Cannot decode {}: {}", command, e);
                return Ok(Flow::Continue);
            }
        };

        if let Err(e) = self.sm.fire(ClientEvent::Server(command)) {
            error!("Failed to submit {}: {}", command, e);
            return Ok(Flow::Continue);
        }

        let flow = match event {
            ServerEvent::ConfirmRoomCheckout => {
                info!("Joined the room as {}", self.author);
                let _ = events.send(ChatEvent::Joined).await;
                Flow::Continue
            }
            ServerEvent::ForwardMessage(forward) => {
                if forward.author != self.author {
                    let _ = events.send(ChatEvent::Message(forward)).await;
                }
                Flow::Continue
            }
            ServerEvent::Shutdown => {
                info!("Server is shutting down");
                self.send_quit().await?;
                let _ = events.send(ChatEvent::Shutdown).await;
                Flow::Stop
            }
        };

        self.sm.settle();
        Ok(flow)
    }

    async fn quit(mut self) -> Result<(), AppError> {
        self.send_quit().await?;
        if let Err(e) = self.outbound.close().await {
            debug!("Closing stream failed: {}", e);
        }
        Ok(())
    }

    /// Send Quit; a stream the server already closed is not an error
    async fn send_quit(&mut self) -> Result<(), AppError> {
        match self.outbound.send(ClientMessage::quit()).await {
            Ok(()) | Err(TransportError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
