//! Chat server lifecycle
//!
//! The server owns the listener, the room manager and the default room.
//! Each accepted connection runs as a tracked task so that shutdown can wait
//! for every session, and force-cancel them when the deadline passes.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::manager::RoomManager;
use crate::session::{ChatService, SessionConfig};
use crate::types::RoomId;

/// Name of the room every participant is checked into
pub const DEFAULT_ROOM_NAME: &str = "default";

/// How [`Server::shutdown`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every session finished before the deadline
    Graceful,
    /// The deadline passed and remaining sessions were cancelled
    Forced,
}

/// The chat server
pub struct Server {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    service: ChatService,
    connections: TaskTracker,
    stop_accepting: CancellationToken,
    force_stop: CancellationToken,
}

impl Server {
    /// Bind the listener and create the default room
    pub async fn bind(config: &ServerConfig) -> Result<Self, AppError> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let manager = RoomManager::with_queue_size(config.room_queue);
        let default_room = manager.create_room(DEFAULT_ROOM_NAME)?;

        let service = ChatService::new(
            manager,
            default_room,
            SessionConfig {
                grace_delay: config.grace_delay,
                participant_queue: config.participant_queue,
            },
        );

        info!("Chat server bound to {}", local_addr);

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            service,
            connections: TaskTracker::new(),
            stop_accepting: CancellationToken::new(),
            force_stop: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &RoomManager {
        self.service.manager()
    }

    pub fn default_room(&self) -> RoomId {
        self.service.default_room()
    }

    /// Accept connections until shutdown begins
    pub async fn serve(&self) -> Result<(), AppError> {
        let guard = self.listener.lock().await;
        let Some(listener) = guard.as_ref() else {
            return Err(AppError::ServerClosed);
        };

        info!("Chat server listening on {}", self.local_addr);

        loop {
            tokio::select! {
                biased;

                () = self.stop_accepting.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New connection from {}", addr);
                        let service = self.service.clone();
                        let shutdown = self.force_stop.child_token();

                        self.connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, service, shutdown).await {
                                error!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        info!("Chat server stopped accepting connections");
        Ok(())
    }

    /// Disconnect everyone and stop the server
    ///
    /// Closes every room, which pushes a Shutdown notice to each session,
    /// then waits up to `timeout` for the sessions to finish. Sessions
    /// still running after that are cancelled. The listener is released
    /// exactly once; calling this again is harmless.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownOutcome {
        info!("Shutting down chat server");

        self.service.manager().close();
        self.stop_accepting.cancel();
        self.connections.close();

        let outcome = match tokio::time::timeout(timeout, self.connections.wait()).await {
            Ok(()) => ShutdownOutcome::Graceful,
            Err(_) => {
                warn!("Graceful shutdown timed out, killing");
                self.force_stop.cancel();
                self.connections.wait().await;
                ShutdownOutcome::Forced
            }
        };

        match self.listener.lock().await.take() {
            Some(listener) => {
                drop(listener);
                debug!("Listener on {} closed", self.local_addr);
            }
            None => debug!("Listener on {} already closed", self.local_addr),
        }

        info!("Chat server shut down ({:?})", outcome);
        outcome
    }
}
