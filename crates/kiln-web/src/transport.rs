//! Pusher-protocol websocket client (the protocol Reverb speaks).
//!
//! The connection runs on its own task. It reports [`TransportEvent`]s on a
//! channel and takes [`TransportCommand`]s, so the sync client never touches
//! the socket directly.

use crate::error::SyncError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const SUBSCRIBE: &str = "pusher:subscribe";
pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";
pub const ERROR: &str = "pusher:error";

/// One protocol frame. `data` is sent as a JSON-encoded string by most
/// servers; [`PusherMessage::decode`] unwraps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl PusherMessage {
    pub fn new(event: impl Into<String>, channel: Option<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel,
            data,
        }
    }

    pub fn subscribe(channel: &str) -> Self {
        Self::new(SUBSCRIBE, None, json!({"channel": channel}))
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(UNSUBSCRIBE, None, json!({"channel": channel}))
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        let mut message: PusherMessage =
            serde_json::from_str(text).map_err(|e| SyncError::Protocol(e.to_string()))?;
        if let Value::String(raw) = &message.data {
            if let Ok(inner) = serde_json::from_str::<Value>(raw) {
                message.data = inner;
            }
        }
        Ok(message)
    }

    pub fn encode(&self) -> String {
        json!({
            "event": self.event,
            "channel": self.channel,
            "data": self.data,
        })
        .to_string()
    }

    /// Frame with `data` encoded as a string, as servers send it.
    pub fn encode_for_client(&self) -> String {
        let mut frame = json!({
            "event": self.event,
            "data": self.data.to_string(),
        });
        if let Some(channel) = &self.channel {
            frame["channel"] = json!(channel);
        }
        frame.to_string()
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.data
            .get("socket_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting,
    /// `socket_id` can be missing on a provisional connect.
    Connected { socket_id: Option<String> },
    Disconnected,
    /// The transport could not be set up at all.
    Unavailable(String),
    Error(String),
    Subscribed { channel: String },
    SubscriptionError { channel: Option<String>, message: String },
    Message(PusherMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

/// Handle to a running connection task.
pub struct TransportHandle {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedSender<TransportCommand>,
    socket_id: watch::Receiver<Option<String>>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    /// A handle wired to caller-owned channels, for driving the sync client
    /// without a socket.
    pub fn from_channels(
        events: mpsc::UnboundedReceiver<TransportEvent>,
        commands: mpsc::UnboundedSender<TransportCommand>,
        socket_id: watch::Receiver<Option<String>>,
    ) -> Self {
        Self {
            events,
            commands,
            socket_id,
            task: None,
        }
    }

    pub fn socket_id(&self) -> Option<String> {
        self.socket_id.borrow().clone()
    }

    pub fn send(&self, command: TransportCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub async fn shutdown(mut self) {
        let _ = self.commands.send(TransportCommand::Close);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Connects to `url` on a background task.
pub fn spawn_pusher(url: String) -> TransportHandle {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (socket_tx, socket_rx) = watch::channel(None);
    let task = tokio::spawn(run_connection(url, event_tx, command_rx, socket_tx));
    TransportHandle {
        events: event_rx,
        commands: command_tx,
        socket_id: socket_rx,
        task: Some(task),
    }
}

async fn run_connection(
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    socket_id: watch::Sender<Option<String>>,
) {
    let _ = events.send(TransportEvent::Connecting);
    let (stream, _) = match connect_async(url.as_str()).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(%url, error = %err, "websocket unavailable");
            let _ = events.send(TransportEvent::Unavailable(err.to_string()));
            return;
        }
    };
    info!(%url, "websocket open");
    let (mut sink, mut stream) = stream.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message = match PusherMessage::decode(&text) {
                        Ok(message) => message,
                        Err(err) => {
                            debug!(error = %err, "ignoring undecodable frame");
                            continue;
                        }
                    };
                    match message.event.as_str() {
                        CONNECTION_ESTABLISHED => {
                            let id = message.socket_id().map(str::to_string);
                            let _ = socket_id.send(id.clone());
                            let _ = events.send(TransportEvent::Connected { socket_id: id });
                        }
                        PING => {
                            let pong = PusherMessage::new(PONG, None, json!({})).encode();
                            if sink.send(Message::Text(pong)).await.is_err() {
                                let _ = events.send(TransportEvent::Disconnected);
                                break;
                            }
                        }
                        SUBSCRIPTION_SUCCEEDED => {
                            let channel = message.channel.unwrap_or_default();
                            let _ = events.send(TransportEvent::Subscribed { channel });
                        }
                        SUBSCRIPTION_ERROR => {
                            let _ = events.send(TransportEvent::SubscriptionError {
                                channel: message.channel,
                                message: message.data.to_string(),
                            });
                        }
                        ERROR => {
                            let text = message
                                .data
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown error")
                                .to_string();
                            let _ = events.send(TransportEvent::Error(text));
                        }
                        _ => {
                            let _ = events.send(TransportEvent::Message(message));
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(TransportEvent::Disconnected);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(TransportEvent::Error(err.to_string()));
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(TransportCommand::Subscribe(channel)) => {
                    let frame = PusherMessage::subscribe(&channel).encode();
                    if let Err(err) = sink.send(Message::Text(frame)).await {
                        let _ = events.send(TransportEvent::Error(err.to_string()));
                        break;
                    }
                }
                Some(TransportCommand::Unsubscribe(channel)) => {
                    let frame = PusherMessage::unsubscribe(&channel).encode();
                    let _ = sink.send(Message::Text(frame)).await;
                }
                Some(TransportCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = events.send(TransportEvent::Disconnected);
                    break;
                }
            },
        }
    }
    let _ = socket_id.send(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_unwraps_string_data() {
        let frame = r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"123.456\",\"activity_timeout\":30}"}"#;
        let message = PusherMessage::decode(frame).expect("frame");
        assert_eq!(message.event, CONNECTION_ESTABLISHED);
        assert_eq!(message.socket_id(), Some("123.456"));
    }

    #[test]
    fn provisional_connect_has_no_socket_id() {
        let message = PusherMessage::decode(r#"{"event":"pusher:connection_established","data":"{}"}"#)
            .expect("frame");
        assert_eq!(message.socket_id(), None);
    }

    #[test]
    fn subscribe_and_server_frames_encode() {
        let sub: Value = serde_json::from_str(&PusherMessage::subscribe("form-version.7").encode())
            .expect("json");
        assert_eq!(sub["event"], json!(SUBSCRIBE));
        assert_eq!(sub["data"]["channel"], json!("form-version.7"));

        let event = PusherMessage::new(
            "App\\Events\\FormVersionUpdateEvent",
            Some("form-version.7".to_string()),
            json!({"id": 7}),
        );
        let decoded = PusherMessage::decode(&event.encode_for_client()).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(PusherMessage::decode("not json"), Err(SyncError::Protocol(_))));
    }
}
