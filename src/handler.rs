//! WebSocket connection handler
//!
//! Performs the WebSocket handshake on a freshly accepted TCP connection and
//! hands the resulting envelope stream to the chat service.

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AppError;
use crate::session::ChatService;
use crate::transport;

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, then runs one chat session until it
/// terminates or `shutdown` is cancelled.
pub async fn handle_connection(
    stream: TcpStream,
    service: ChatService,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio::select! {
        () = shutdown.cancelled() => {
            debug!("Shutdown before handshake with {}", peer_addr);
            return Ok(());
        }
        ws = tokio_tungstenite::accept_async(stream) => ws?,
    };
    let (outbound, inbound) = transport::server_channel(ws_stream);

    info!("Client connected from {}", peer_addr);

    let state = service
        .route_chat(&peer_addr, inbound, outbound, &shutdown)
        .await;

    info!("Client {} disconnected ({})", peer_addr, state);

    Ok(())
}
