//! Wire envelopes exchanged with the voice service
//!
//! Every message is one JSON object. The service keys its fields in Japanese
//! (`メッセージ識別`, `セッションID`, ...); this module maps them onto
//! [`Envelope`] and back. Inbound messages may carry the kind under either
//! `メッセージ識別` or `type`, and the session id under either `セッションID`
//! or `ソケットID`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{CAPTURE_CHANNEL, PCM_MIME};
use crate::error::ProtocolError;

/// Message kind carried by an envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect,
    Init,
    InputAudio,
    OutputAudio,
    CancelAudio,
    Ping,
    InputText,
    Operations,
    /// Anything the core does not interpret (transcripts, welcome text, ...)
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Connect => "connect",
            MessageKind::Init => "init",
            MessageKind::InputAudio => "input_audio",
            MessageKind::OutputAudio => "output_audio",
            MessageKind::CancelAudio => "cancel_audio",
            MessageKind::Ping => "ping",
            MessageKind::InputText => "input_text",
            MessageKind::Operations => "operations",
            MessageKind::Other(name) => name,
        }
    }

    /// Kinds that belong to the audio pipeline rather than the collaborator
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            MessageKind::InputAudio | MessageKind::OutputAudio | MessageKind::CancelAudio
        )
    }

    /// Handshake-level kinds are also written under the `type` key
    fn uses_type_key(&self) -> bool {
        matches!(self, MessageKind::Connect | MessageKind::Ping)
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        match value {
            "connect" => MessageKind::Connect,
            "init" => MessageKind::Init,
            "input_audio" => MessageKind::InputAudio,
            "output_audio" => MessageKind::OutputAudio,
            "cancel_audio" => MessageKind::CancelAudio,
            "ping" => MessageKind::Ping,
            "input_text" => MessageKind::InputText,
            "operations" => MessageKind::Operations,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical stream multiplexed over one socket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Channel {
    Index(i64),
    Named(String),
}

impl Channel {
    /// Microphone input and cancellation notices
    pub const fn capture() -> Self {
        Channel::Index(CAPTURE_CHANNEL)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Index(index) => write!(f, "{}", index),
            Channel::Named(name) => f.write_str(name),
        }
    }
}

/// Payload encoding of an audio envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioEncoding {
    /// Raw 16-bit little-endian mono PCM
    Pcm,
    /// Container format identified by its MIME-like tag
    Container(String),
}

impl AudioEncoding {
    pub fn from_mime(mime: &str) -> Self {
        if mime.to_ascii_lowercase().contains("pcm") {
            AudioEncoding::Pcm
        } else {
            AudioEncoding::Container(mime.to_string())
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            AudioEncoding::Pcm => PCM_MIME,
            AudioEncoding::Container(mime) => mime,
        }
    }
}

/// One structured message on the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub kind: MessageKind,
    pub session_id: Option<String>,
    pub slot: Option<i64>,
    pub channel: Option<Channel>,
    /// Encoding tag for audio, text for transcripts, structured data otherwise
    pub content: Option<Value>,
    /// Base64 audio payload
    pub file: Option<String>,
    /// Fields the core does not interpret, kept for the collaborator
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            session_id: None,
            slot: None,
            channel: None,
            content: None,
            file: None,
            extra: Map::new(),
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_content(mut self, content: impl Into<Value>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Handshake request, carrying the session to resume if one is known
    pub fn connect(session_id: Option<String>, slot: Option<i64>) -> Self {
        let mut envelope = Self::new(MessageKind::Connect).with_session(session_id);
        envelope.slot = slot;
        envelope
    }

    /// One captured microphone frame
    pub fn input_audio(session_id: Option<String>, base64_pcm: String) -> Self {
        let mut envelope = Self::new(MessageKind::InputAudio)
            .with_session(session_id)
            .with_channel(Channel::capture())
            .with_content(PCM_MIME);
        envelope.file = Some(base64_pcm);
        envelope
    }

    pub fn cancel_audio(session_id: Option<String>) -> Self {
        Self::new(MessageKind::CancelAudio)
            .with_session(session_id)
            .with_channel(Channel::capture())
    }

    pub fn ping(timestamp_ms: i64) -> Self {
        let mut envelope = Self::new(MessageKind::Ping);
        envelope.extra.insert("timestamp".into(), Value::from(timestamp_ms));
        envelope
    }

    /// Text input; the service routes the reply to `output_channel`
    pub fn input_text(session_id: Option<String>, text: &str, output_channel: Channel) -> Self {
        let mut envelope = Self::new(MessageKind::InputText)
            .with_session(session_id)
            .with_channel(Channel::Named("input".into()))
            .with_content(text);
        envelope.extra.insert(
            "出力先チャンネル".into(),
            serde_json::to_value(output_channel).unwrap_or(Value::Null),
        );
        envelope
    }

    pub fn operations(session_id: Option<String>, buttons: Value) -> Self {
        let mut content = Map::new();
        content.insert("ボタン".into(), buttons);
        Self::new(MessageKind::Operations)
            .with_session(session_id)
            .with_content(Value::Object(content))
    }

    /// Encoding tag of an audio envelope, `audio/pcm` when absent
    pub fn audio_encoding(&self) -> AudioEncoding {
        let mime = self
            .content
            .as_ref()
            .and_then(Value::as_str)
            .or_else(|| self.extra.get("mime_type").and_then(Value::as_str))
            .unwrap_or(PCM_MIME);
        AudioEncoding::from_mime(mime)
    }

    /// Base64 audio payload, looked up under every key the service has used
    pub fn audio_payload(&self) -> Option<&str> {
        self.file
            .as_deref()
            .filter(|payload| !payload.is_empty())
            .or_else(|| {
                ["base64_data", "audio", "data"].iter().find_map(|key| {
                    self.extra
                        .get(*key)
                        .and_then(Value::as_str)
                        .filter(|payload| !payload.is_empty())
                })
            })
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Self::try_from(wire)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Field layout on the socket
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    type_field: Option<String>,
    #[serde(rename = "メッセージ識別", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(rename = "セッションID", default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(rename = "ソケットID", default, skip_serializing_if = "Option::is_none")]
    socket_id: Option<String>,
    #[serde(rename = "ソケット番号", default, skip_serializing_if = "Option::is_none")]
    slot: Option<Value>,
    #[serde(rename = "チャンネル", default, skip_serializing_if = "Option::is_none")]
    channel: Option<Channel>,
    #[serde(rename = "メッセージ内容", default, skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(rename = "ファイル名", default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Slot indices arrive as numbers or numeric strings
fn parse_slot(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let kind = wire
            .kind
            .filter(|kind| !kind.is_empty())
            .or(wire.type_field.filter(|kind| !kind.is_empty()))
            .ok_or(ProtocolError::MissingKind)?;

        Ok(Self {
            kind: MessageKind::from(kind.as_str()),
            session_id: wire.session_id.or(wire.socket_id),
            slot: wire.slot.as_ref().and_then(parse_slot),
            channel: wire.channel,
            content: wire.content.filter(|content| !content.is_null()),
            file: wire.file,
            extra: wire.extra,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.kind.as_str().to_string();
        Self {
            type_field: envelope.kind.uses_type_key().then(|| kind.clone()),
            kind: Some(kind),
            session_id: envelope.session_id,
            socket_id: None,
            slot: envelope.slot.map(Value::from),
            channel: envelope.channel,
            content: envelope.content,
            file: envelope.file,
            extra: envelope.extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_with_socket_id() {
        let text = r#"{"ソケットID":"abc","ソケット番号":-1,"チャンネル":-1,"メッセージ識別":"init","メッセージ内容":{}}"#;
        let envelope = Envelope::parse(text).unwrap();

        assert_eq!(envelope.kind, MessageKind::Init);
        assert_eq!(envelope.session_id.as_deref(), Some("abc"));
        assert_eq!(envelope.slot, Some(-1));
        assert_eq!(envelope.channel, Some(Channel::Index(-1)));
    }

    #[test]
    fn test_parse_kind_from_type_key() {
        let envelope = Envelope::parse(r#"{"type":"init","セッションID":"s1","ソケット番号":"2"}"#).unwrap();
        assert_eq!(envelope.kind, MessageKind::Init);
        assert_eq!(envelope.slot, Some(2));
    }

    #[test]
    fn test_parse_both_kind_keys_prefers_service_key() {
        let envelope = Envelope::parse(r#"{"type":"x","メッセージ識別":"output_text"}"#).unwrap();
        assert_eq!(envelope.kind, MessageKind::Other("output_text".into()));
    }

    #[test]
    fn test_missing_kind_rejected() {
        assert!(matches!(
            Envelope::parse(r#"{"セッションID":"s1"}"#),
            Err(ProtocolError::MissingKind)
        ));
        assert!(matches!(Envelope::parse("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_connect_writes_type_key() {
        let json = Envelope::connect(Some("s1".into()), Some(0)).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "connect");
        assert_eq!(value["メッセージ識別"], "connect");
        assert_eq!(value["セッションID"], "s1");
        assert_eq!(value["ソケット番号"], 0);
    }

    #[test]
    fn test_input_audio_layout() {
        let json = Envelope::input_audio(Some("s1".into()), "AAA=".into())
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["メッセージ識別"], "input_audio");
        assert_eq!(value["チャンネル"], -1);
        assert_eq!(value["メッセージ内容"], "audio/pcm");
        assert_eq!(value["ファイル名"], "AAA=");
        assert!(value.get("type").is_none());
    }

    #[test]
    fn test_named_channel_and_extra_fields_survive() {
        let text = r#"{"メッセージ識別":"output_text","チャンネル":"input","メッセージ内容":"hello","サムネイル画像":null}"#;
        let envelope = Envelope::parse(text).unwrap();

        assert_eq!(envelope.channel, Some(Channel::Named("input".into())));
        assert_eq!(envelope.content, Some(Value::from("hello")));
        assert!(envelope.extra.contains_key("サムネイル画像"));
    }

    #[test]
    fn test_audio_payload_fallback_keys() {
        let envelope = Envelope::parse(
            r#"{"type":"output_audio","ファイル名":"","audio":"AQI=","mime_type":"audio/wav"}"#,
        )
        .unwrap();

        assert_eq!(envelope.audio_payload(), Some("AQI="));
        assert_eq!(envelope.audio_encoding(), AudioEncoding::Container("audio/wav".into()));
    }

    #[test]
    fn test_audio_encoding_defaults_to_pcm() {
        let envelope = Envelope::new(MessageKind::OutputAudio);
        assert_eq!(envelope.audio_encoding(), AudioEncoding::Pcm);
        assert_eq!(AudioEncoding::from_mime("audio/PCM;rate=24000"), AudioEncoding::Pcm);
    }

    #[test]
    fn test_input_text_routes_output_channel() {
        let json = Envelope::input_text(None, "hi", Channel::Index(1)).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["チャンネル"], "input");
        assert_eq!(value["出力先チャンネル"], 1);
        assert_eq!(value["メッセージ内容"], "hi");
    }
}
