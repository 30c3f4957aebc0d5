//! Envelope transport over WebSocket
//!
//! The session and client only see a typed stream of inbound envelopes and
//! a typed sink of outbound envelopes. This module binds those to a
//! WebSocket carrying one JSON text frame per envelope.

use std::pin::Pin;

use futures_util::future;
use futures_util::sink::Sink;
use futures_util::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::TransportError;
use crate::message::{ClientMessage, ServerMessage};

/// Inbound half: envelopes until the peer closes (`None`)
pub type Inbound<T> = BoxStream<'static, Result<T, TransportError>>;

/// Outbound half
pub type Outbound<T> = Pin<Box<dyn Sink<T, Error = TransportError> + Send>>;

/// Split a WebSocket into JSON envelope halves
pub fn json_channel<S, In, Out>(ws: WebSocketStream<S>) -> (Outbound<Out>, Inbound<In>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    let (ws_sender, ws_receiver) = ws.split();

    let outbound = ws_sender
        .sink_map_err(TransportError::from)
        .with(|msg: Out| future::ready(encode(&msg)));

    let inbound = stream::unfold(ws_receiver, |mut ws_receiver| async move {
        loop {
            match ws_receiver.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => {
                    let decoded = serde_json::from_str::<In>(&text).map_err(TransportError::from);
                    return Some((decoded, ws_receiver));
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Peer sent close frame");
                    return None;
                }
                Some(Ok(_)) => {
                    // Binary, ping and pong frames carry no envelopes
                }
                Some(Err(e)) => match TransportError::from(e) {
                    TransportError::Closed => return None,
                    err => return Some((Err(err), ws_receiver)),
                },
            }
        }
    });

    (Box::pin(outbound), inbound.boxed())
}

/// Server side of a connection: client envelopes in, server envelopes out
pub fn server_channel<S>(
    ws: WebSocketStream<S>,
) -> (Outbound<ServerMessage>, Inbound<ClientMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    json_channel(ws)
}

/// Client side of a connection: server envelopes in, client envelopes out
pub fn client_channel<S>(
    ws: WebSocketStream<S>,
) -> (Outbound<ClientMessage>, Inbound<ServerMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    json_channel(ws)
}

fn encode<T: Serialize>(msg: &T) -> Result<Message, TransportError> {
    let json = serde_json::to_string(msg)?;
    Ok(Message::Text(json.into()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ClientCommand;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_json_channel_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut outbound, mut inbound) = server_channel(ws);

            let first = inbound.next().await.unwrap().unwrap();
            assert_eq!(first.command, ClientCommand::Helo);

            // Not an envelope: reported, stream stays usable
            let second = inbound.next().await.unwrap();
            assert!(matches!(second, Err(TransportError::Decode(_))));

            outbound.send(ServerMessage::confirm_room_checkout()).await.unwrap();

            assert!(inbound.next().await.is_none());
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (ws, _) = tokio_tungstenite::client_async(format!("ws://{}", addr), stream)
            .await
            .unwrap();
        let (mut ws_sender, mut ws_receiver) = ws.split();

        let helo = serde_json::to_string(&ClientMessage::helo("alice")).unwrap();
        ws_sender.send(Message::Text(helo.into())).await.unwrap();
        ws_sender.send(Message::Text("not json".into())).await.unwrap();

        let reply = ws_receiver.next().await.unwrap().unwrap();
        let reply: ServerMessage = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert_eq!(reply, ServerMessage::confirm_room_checkout());

        ws_sender.close().await.unwrap();
        server.await.unwrap();
    }
}
