//! WebSocket Chat Relay Library
//!
//! A multi-participant chat relay built with tokio-tungstenite. Clients
//! pair with the server over a bidirectional stream of JSON envelopes and
//! are checked into a shared room that fans each message out to everyone.
//!
//! # Features
//! - WebSocket transport with one JSON envelope per text frame
//! - Explicit state machines for sessions, rooms and clients
//! - Room fan-out in arrival order
//! - Graceful shutdown with a per-session grace delay and a hard deadline
//!
//! # Architecture
//! - `Server` owns the listener, the `RoomManager` and the default room
//! - Each connection runs a session task that drives its `SessionMachine`
//! - Each `Room` has a consumer task draining its inbound queue
//! - Each `Participant` has an outbound queue pumped to its stream
//!
//! # Example
//! ```ignore
//! use std::time::Duration;
//! use chat_relay::{config::ServerConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(&ServerConfig::default()).await?;
//!     tokio::select! {
//!         res = server.serve() => res?,
//!         _ = tokio::signal::ctrl_c() => {}
//!     }
//!     server.shutdown(Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod fsm;
pub mod handler;
pub mod logging;
pub mod manager;
pub mod message;
pub mod participant;
pub mod room;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{ChatClient, ChatEvent};
pub use error::{AppError, ConfigError, SendError, TransportError};
pub use handler::handle_connection;
pub use manager::RoomManager;
pub use message::{ClientMessage, ServerMessage};
pub use participant::Participant;
pub use room::Room;
pub use server::{Server, ShutdownOutcome};
pub use session::ChatService;
pub use types::{ParticipantId, RoomId};
