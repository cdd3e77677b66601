use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::MeetError;
use crate::events::{EventEmitter, MeetEvent};
use crate::transport::{DataConnection, PeerId};

/// Shared message store between the session event tasks and `ChatChannel`.
pub type MessageStore = Arc<Mutex<Vec<ChatMessage>>>;

/// A file picked in the shell. `handle` is the shell's transient local
/// reference to it (object URL, temp path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub handle: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageOrigin {
    Local,
    Remote { peer_id: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_name: String,
    pub origin: MessageOrigin,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub sender_name: String,
    pub text: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

/// Application payloads carried over data connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Sent by the room peer to every newly opened connection.
    Greeting { text: String },
    /// Display name of the sender, sent once per connection.
    Introduce { display_name: String },
    Chat(ChatPayload),
}

impl PeerMessage {
    pub fn to_value(&self) -> serde_json::Value {
        // Only strings and integers inside, serialization cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Append-only chat log plus the data connections messages are forwarded on.
#[derive(Clone)]
pub struct ChatChannel {
    sender_name: Arc<Mutex<String>>,
    emitter: EventEmitter,
    messages: MessageStore,
    links: Arc<Mutex<HashMap<PeerId, Arc<dyn DataConnection>>>>,
}

impl ChatChannel {
    pub fn new(sender_name: impl Into<String>, emitter: EventEmitter) -> Self {
        Self {
            sender_name: Arc::new(Mutex::new(sender_name.into())),
            emitter,
            messages: Arc::new(Mutex::new(Vec::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn set_sender_name(&self, name: impl Into<String>) {
        *self.sender_name.lock().await = name.into();
    }

    pub async fn sender_name(&self) -> String {
        self.sender_name.lock().await.clone()
    }

    /// Append locally right away, then forward to every linked peer.
    ///
    /// There is no acknowledgement. A failed forward is logged and the
    /// message stays in the local log.
    pub async fn send_message(
        &self,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<ChatMessage, MeetError> {
        if text.trim().is_empty() && attachment.is_none() {
            return Err(MeetError::EmptyMessage);
        }

        let sender_name = self.sender_name().await;
        let msg = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_name: sender_name.clone(),
            origin: MessageOrigin::Local,
            text: text.to_string(),
            attachment: attachment.clone(),
            timestamp_ms: now_ms(),
        };
        self.append(msg.clone()).await;

        let payload = PeerMessage::Chat(ChatPayload {
            sender_name,
            text: text.to_string(),
            attachment,
        })
        .to_value();
        let links: Vec<_> = self.links.lock().await.values().cloned().collect();
        for link in links {
            if let Err(e) = link.send(payload.clone()) {
                tracing::warn!("chat forward to {} failed: {e}", link.peer());
            }
        }

        Ok(msg)
    }

    /// Append a message that arrived from `peer_id`, in arrival order.
    pub async fn receive_message(&self, peer_id: &str, payload: ChatPayload) -> ChatMessage {
        let msg = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender_name: payload.sender_name,
            origin: MessageOrigin::Remote { peer_id: peer_id.to_string() },
            text: payload.text,
            attachment: payload.attachment,
            timestamp_ms: now_ms(),
        };
        tracing::debug!("chat from {peer_id}: {}", msg.text);
        self.append(msg.clone()).await;
        msg
    }

    async fn append(&self, msg: ChatMessage) {
        self.messages.lock().await.push(msg.clone());
        self.emitter.emit(MeetEvent::ChatMessageReceived(msg));
    }

    pub async fn attach(&self, peer_id: &str, connection: Arc<dyn DataConnection>) {
        self.links.lock().await.insert(peer_id.to_string(), connection);
    }

    pub async fn detach(&self, peer_id: &str) {
        self.links.lock().await.remove(peer_id);
    }

    pub async fn detach_all(&self) {
        self.links.lock().await.clear();
    }

    pub async fn linked_peers(&self) -> Vec<PeerId> {
        self.links.lock().await.keys().cloned().collect()
    }

    /// Get all messages in the current session.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    /// Clear all messages (on leaving the room).
    pub async fn clear(&self) {
        self.messages.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::transport::{DataEvent, PeerEvent, PeerTransport};

    fn payload(name: &str, text: &str) -> ChatPayload {
        ChatPayload { sender_name: name.into(), text: text.into(), attachment: None }
    }

    #[tokio::test]
    async fn arrival_order_is_preserved() {
        let chat = ChatChannel::new("me", EventEmitter::new());
        chat.send_message("hi", None).await.unwrap();
        chat.receive_message("peer-1", payload("you", "yo")).await;

        let log = chat.messages().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].origin, MessageOrigin::Local);
        assert_eq!(log[0].text, "hi");
        assert_eq!(log[1].origin, MessageOrigin::Remote { peer_id: "peer-1".into() });
        assert_eq!(log[1].text, "yo");
    }

    #[tokio::test]
    async fn duplicates_are_kept() {
        let chat = ChatChannel::new("me", EventEmitter::new());
        chat.receive_message("p", payload("you", "same")).await;
        chat.receive_message("p", payload("you", "same")).await;
        assert_eq!(chat.messages().await.len(), 2);
    }

    #[tokio::test]
    async fn blank_message_without_attachment_is_rejected() {
        let chat = ChatChannel::new("me", EventEmitter::new());
        assert_eq!(chat.send_message("   ", None).await, Err(MeetError::EmptyMessage));

        let file = Attachment {
            handle: "blob:1".into(),
            name: "cat.png".into(),
            mime_type: "image/png".into(),
            size: 42,
        };
        let msg = chat.send_message("", Some(file)).await.unwrap();
        assert!(msg.attachment.as_ref().unwrap().is_image());
        assert_eq!(chat.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn send_forwards_over_linked_connection() {
        let net = LoopbackNetwork::new();
        let (_host, mut host_events) = net.create_peer(Some("room")).await.unwrap();
        let (guest, _guest_events) = net.create_peer(None).await.unwrap();
        let _ = host_events.recv().await;
        let (conn, _guest_data) = guest.connect("room").await.unwrap();

        let Some(PeerEvent::Connection(_, mut host_data)) = host_events.recv().await else {
            panic!("expected connection");
        };
        assert!(matches!(host_data.recv().await, Some(DataEvent::Open)));

        let chat = ChatChannel::new("guest", EventEmitter::new());
        chat.attach("room", conn).await;
        chat.send_message("hello room", None).await.unwrap();

        match host_data.recv().await {
            Some(DataEvent::Data(value)) => {
                let msg = PeerMessage::from_value(value).unwrap();
                assert_eq!(msg, PeerMessage::Chat(payload("guest", "hello room")));
            }
            other => panic!("expected chat payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_link_stays_local() {
        let chat = ChatChannel::new("me", EventEmitter::new());
        chat.send_message("alone", None).await.unwrap();
        assert!(chat.linked_peers().await.is_empty());
        assert_eq!(chat.messages().await[0].text, "alone");
    }

    #[test]
    fn greeting_wire_shape() {
        let value = PeerMessage::Greeting { text: "hello".into() }.to_value();
        assert_eq!(value["type"], "greeting");
        assert_eq!(value["text"], "hello");
    }
}
