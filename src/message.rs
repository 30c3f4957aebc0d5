//! Message protocol definitions
//!
//! JSON envelopes exchanged on the `RouteChat` stream. Every envelope carries
//! a command and an untyped `operation`; the typed payload is decoded per
//! command before it reaches a state machine.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Commands a client can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCommand {
    /// Handshake carrying the author name
    Helo,
    /// Post a message to the current room
    WriteMessage,
    /// Leave the chat
    Quit,
}

impl ClientCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientCommand::Helo => "helo",
            ClientCommand::WriteMessage => "write_message",
            ClientCommand::Quit => "quit",
        }
    }
}

impl std::fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands the server can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerCommand {
    /// Helo accepted, participant joined the default room
    ConfirmRoomCheckout,
    /// A message posted in the room
    ForwardMessage,
    /// The server is going away
    Shutdown,
}

impl ServerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerCommand::ConfirmRoomCheckout => "confirm_room_checkout",
            ServerCommand::ForwardMessage => "forward_message",
            ServerCommand::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client → Server envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub command: ClientCommand,
    #[serde(default)]
    pub operation: Value,
}

/// Server → Client envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub command: ServerCommand,
    #[serde(default)]
    pub operation: Value,
}

/// Helo payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Helo {
    pub author: String,
}

/// WriteMessage payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMessage {
    pub body: String,
}

/// ForwardMessage payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMessage {
    pub author: String,
    pub body: String,
}

/// A decoded client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Helo(Helo),
    WriteMessage(WriteMessage),
    Quit,
}

impl ClientRequest {
    pub fn command(&self) -> ClientCommand {
        match self {
            ClientRequest::Helo(_) => ClientCommand::Helo,
            ClientRequest::WriteMessage(_) => ClientCommand::WriteMessage,
            ClientRequest::Quit => ClientCommand::Quit,
        }
    }
}

/// A decoded server command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ConfirmRoomCheckout,
    ForwardMessage(ForwardMessage),
    Shutdown,
}

impl ClientMessage {
    pub fn helo(author: &str) -> Self {
        Self {
            command: ClientCommand::Helo,
            operation: json!({ "author": author }),
        }
    }

    pub fn write_message(body: &str) -> Self {
        Self {
            command: ClientCommand::WriteMessage,
            operation: json!({ "body": body }),
        }
    }

    pub fn quit() -> Self {
        Self {
            command: ClientCommand::Quit,
            operation: Value::Null,
        }
    }

    /// Decode the operation according to the command
    ///
    /// The quit operation is ignored.
    pub fn decode(&self) -> Result<ClientRequest, serde_json::Error> {
        Ok(match self.command {
            ClientCommand::Helo => ClientRequest::Helo(Helo::deserialize(&self.operation)?),
            ClientCommand::WriteMessage => {
                ClientRequest::WriteMessage(WriteMessage::deserialize(&self.operation)?)
            }
            ClientCommand::Quit => ClientRequest::Quit,
        })
    }
}

impl ServerMessage {
    pub fn confirm_room_checkout() -> Self {
        Self {
            command: ServerCommand::ConfirmRoomCheckout,
            operation: Value::Null,
        }
    }

    pub fn forward_message(author: &str, body: &str) -> Self {
        Self {
            command: ServerCommand::ForwardMessage,
            operation: json!({ "author": author, "body": body }),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            command: ServerCommand::Shutdown,
            operation: Value::Null,
        }
    }

    /// Decode the operation according to the command
    pub fn decode(&self) -> Result<ServerEvent, serde_json::Error> {
        Ok(match self.command {
            ServerCommand::ConfirmRoomCheckout => ServerEvent::ConfirmRoomCheckout,
            ServerCommand::ForwardMessage => {
                ServerEvent::ForwardMessage(ForwardMessage::deserialize(&self.operation)?)
            }
            ServerCommand::Shutdown => ServerEvent::Shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize() {
        let json = r#"{"command": "helo", "operation": {"author": "Alice"}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.command, ClientCommand::Helo);
        match msg.decode().unwrap() {
            ClientRequest::Helo(helo) => assert_eq!(helo.author, "Alice"),
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_quit_without_operation() {
        let msg: ClientMessage = serde_json::from_str(r#"{"command": "quit"}"#).unwrap();
        assert_eq!(msg.decode().unwrap(), ClientRequest::Quit);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let json = r#"{"command": "dance", "operation": null}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_malformed_helo_payload() {
        let msg = ClientMessage {
            command: ClientCommand::Helo,
            operation: json!({ "name": "Alice" }),
        };
        assert!(msg.decode().is_err());
    }

    #[test]
    fn test_server_message_serialize() {
        let msg = ServerMessage::forward_message("alice", "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"command\":\"forward_message\""));
        assert!(json.contains("\"author\":\"alice\""));
        assert!(json.contains("\"body\":\"hi\""));
    }

    #[test]
    fn test_shutdown_carries_no_payload() {
        let json = serde_json::to_string(&ServerMessage::shutdown()).unwrap();
        assert_eq!(json, r#"{"command":"shutdown","operation":null}"#);
    }

    #[test]
    fn test_forward_message_decode() {
        let msg = ServerMessage::forward_message("bob", "yo");
        assert_eq!(
            msg.decode().unwrap(),
            ServerEvent::ForwardMessage(ForwardMessage {
                author: "bob".to_string(),
                body: "yo".to_string(),
            })
        );
    }
}
