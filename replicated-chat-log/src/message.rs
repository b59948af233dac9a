//! Event messages exchanged by chat sessions and persisted in the chat log.
//!
//! Every message kind carries the same [`BaseMessage`] header (event name,
//! sequence id, timestamp). [`EventMessage`] is the closed set of kinds and
//! owns the binary codec used for storage and for the replication payload:
//! one discriminator byte followed by the bincode body of the variant, so a
//! decoder never has to guess the variant from the shape of the bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("empty message payload")]
    Empty,
    #[error("unknown message type tag {0}")]
    UnknownType(u8),
    #[error("failed to encode {kind} message: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
    #[error("malformed {kind} message: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Free-form JSON body carried by content and error messages.
///
/// Human-readable encoders (JSON) see the value inline. Binary encoders get the
/// JSON text, since bincode cannot decode self-describing values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(pub serde_json::Value);

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let text = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&text)
        }
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            serde_json::Value::deserialize(deserializer).map(Payload)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text)
                .map(Payload)
                .map_err(serde::de::Error::custom)
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Header shared by every message kind.
///
/// `id` is 0 until the log store assigns one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseMessage {
    #[serde(rename = "@")]
    pub event_name: String,
    #[serde(rename = "!id", default)]
    pub id: u64,
    #[serde(default)]
    pub utc_timestamp: i64,
}

impl BaseMessage {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    pub base: BaseMessage,
    #[serde(rename = "t")]
    pub kind: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub base: BaseMessage,
    pub nick: String,
    pub rooms: Vec<String>,
}

/// A message addressed from one participant (or group) to another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipientMessage {
    pub base: BaseMessage,
    pub to: String,
    pub from: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub recipient: RecipientMessage,
    #[serde(rename = "msg")]
    pub message: String,
}

impl ChatMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient: RecipientMessage {
                base: BaseMessage::new("chat"),
                to: to.into(),
                from: from.into(),
            },
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipientContentMessage {
    pub recipient: RecipientMessage,
    #[serde(rename = "pack_msg")]
    pub content: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NickMessage {
    pub base: BaseMessage,
    #[serde(rename = "oldNick")]
    pub old_nick: String,
    #[serde(rename = "newNick")]
    pub new_nick: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StringMessage {
    pub base: BaseMessage,
    #[serde(rename = "msg")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub base: BaseMessage,
    #[serde(rename = "error_type")]
    pub error_type: String,
    pub error: String,
    pub body: Payload,
}

/// Discriminator written in front of every encoded message.
///
/// Tag values are part of the persisted format; new kinds get new tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 1,
    Handshake = 2,
    Chat = 3,
    AddressedContent = 4,
    NicknameChange = 5,
    PlainText = 6,
    Error = 7,
    Recipient = 8,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Ping,
        MessageKind::Handshake,
        MessageKind::Chat,
        MessageKind::AddressedContent,
        MessageKind::NicknameChange,
        MessageKind::PlainText,
        MessageKind::Error,
        MessageKind::Recipient,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Handshake => "handshake",
            MessageKind::Chat => "chat",
            MessageKind::AddressedContent => "addressed_content",
            MessageKind::NicknameChange => "nickname_change",
            MessageKind::PlainText => "plain_text",
            MessageKind::Error => "error",
            MessageKind::Recipient => "recipient",
        }
    }
}

/// Any message that can travel through the chat log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventMessage {
    Ping(PingMessage),
    Handshake(HandshakeMessage),
    Chat(ChatMessage),
    AddressedContent(RecipientContentMessage),
    NicknameChange(NickMessage),
    PlainText(StringMessage),
    Error(ErrorMessage),
    Recipient(RecipientMessage),
}

impl EventMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            EventMessage::Ping(_) => MessageKind::Ping,
            EventMessage::Handshake(_) => MessageKind::Handshake,
            EventMessage::Chat(_) => MessageKind::Chat,
            EventMessage::AddressedContent(_) => MessageKind::AddressedContent,
            EventMessage::NicknameChange(_) => MessageKind::NicknameChange,
            EventMessage::PlainText(_) => MessageKind::PlainText,
            EventMessage::Error(_) => MessageKind::Error,
            EventMessage::Recipient(_) => MessageKind::Recipient,
        }
    }

    pub fn base(&self) -> &BaseMessage {
        match self {
            EventMessage::Ping(m) => &m.base,
            EventMessage::Handshake(m) => &m.base,
            EventMessage::Chat(m) => &m.recipient.base,
            EventMessage::AddressedContent(m) => &m.recipient.base,
            EventMessage::NicknameChange(m) => &m.base,
            EventMessage::PlainText(m) => &m.base,
            EventMessage::Error(m) => &m.base,
            EventMessage::Recipient(m) => &m.base,
        }
    }

    fn base_mut(&mut self) -> &mut BaseMessage {
        match self {
            EventMessage::Ping(m) => &mut m.base,
            EventMessage::Handshake(m) => &mut m.base,
            EventMessage::Chat(m) => &mut m.recipient.base,
            EventMessage::AddressedContent(m) => &mut m.recipient.base,
            EventMessage::NicknameChange(m) => &mut m.base,
            EventMessage::PlainText(m) => &mut m.base,
            EventMessage::Error(m) => &mut m.base,
            EventMessage::Recipient(m) => &mut m.base,
        }
    }

    pub fn id(&self) -> u64 {
        self.base().id
    }

    pub fn event_name(&self) -> &str {
        &self.base().event_name
    }

    pub fn utc_timestamp(&self) -> i64 {
        self.base().utc_timestamp
    }

    /// Sets the send timestamp to the current time.
    pub fn stamp(&mut self) {
        self.base_mut().utc_timestamp = unix_now();
    }

    /// Assigns the sequence id. Only the log store calls this.
    pub(crate) fn set_id(&mut self, id: u64) {
        self.base_mut().id = id;
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let kind = self.kind();
        let body = match self {
            EventMessage::Ping(m) => bincode::serialize(m),
            EventMessage::Handshake(m) => bincode::serialize(m),
            EventMessage::Chat(m) => bincode::serialize(m),
            EventMessage::AddressedContent(m) => bincode::serialize(m),
            EventMessage::NicknameChange(m) => bincode::serialize(m),
            EventMessage::PlainText(m) => bincode::serialize(m),
            EventMessage::Error(m) => bincode::serialize(m),
            EventMessage::Recipient(m) => bincode::serialize(m),
        }
        .map_err(|source| MessageError::Encode {
            kind: kind.name(),
            source,
        })?;

        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(kind.tag());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let (&tag, body) = bytes.split_first().ok_or(MessageError::Empty)?;
        let kind = MessageKind::from_tag(tag).ok_or(MessageError::UnknownType(tag))?;
        let decoded = match kind {
            MessageKind::Ping => bincode::deserialize(body).map(EventMessage::Ping),
            MessageKind::Handshake => bincode::deserialize(body).map(EventMessage::Handshake),
            MessageKind::Chat => bincode::deserialize(body).map(EventMessage::Chat),
            MessageKind::AddressedContent => {
                bincode::deserialize(body).map(EventMessage::AddressedContent)
            }
            MessageKind::NicknameChange => {
                bincode::deserialize(body).map(EventMessage::NicknameChange)
            }
            MessageKind::PlainText => bincode::deserialize(body).map(EventMessage::PlainText),
            MessageKind::Error => bincode::deserialize(body).map(EventMessage::Error),
            MessageKind::Recipient => bincode::deserialize(body).map(EventMessage::Recipient),
        };
        decoded.map_err(|source| MessageError::Decode {
            kind: kind.name(),
            source,
        })
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for EventMessage {
                fn from(message: $ty) -> Self {
                    EventMessage::$variant(message)
                }
            }
        )*
    };
}

impl_from_variant! {
    Ping => PingMessage,
    Handshake => HandshakeMessage,
    Chat => ChatMessage,
    AddressedContent => RecipientContentMessage,
    NicknameChange => NickMessage,
    PlainText => StringMessage,
    Error => ErrorMessage,
    Recipient => RecipientMessage,
}
