//! Packets: typed, immutable messages with an optional out-of-band payload stream.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::transfer::TransferError;

/// Reader over the bytes of a payload.
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the payload stream. Called at most once.
pub type PayloadOpener = Box<dyn FnOnce() -> BoxFuture<'static, io::Result<PayloadReader>> + Send>;

/// Bulk data referenced by a packet. A stream, not a buffer: it can be opened once.
///
/// The `source_closed` token is cancelled by the link the payload arrived on when that link
/// goes away, so readers fail instead of hanging.
pub struct Payload {
    size: Option<u64>,
    opener: Mutex<Option<PayloadOpener>>,
    source_closed: CancellationToken,
}

impl Payload {
    /// Payload whose stream is opened lazily (e.g. a transport connection dialed on demand).
    pub fn deferred(size: Option<u64>, opener: PayloadOpener) -> Self {
        Self {
            size,
            opener: Mutex::new(Some(opener)),
            source_closed: CancellationToken::new(),
        }
    }

    /// Payload backed by an already open reader.
    pub fn from_reader(reader: PayloadReader, size: Option<u64>) -> Self {
        Self::deferred(
            size,
            Box::new(move || async move { Ok::<PayloadReader, io::Error>(reader) }.boxed()),
        )
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::from_reader(Box::new(io::Cursor::new(bytes)), Some(size))
    }

    /// Tie the payload to a source (usually a link) whose closing aborts the read.
    pub fn with_source_token(mut self, token: CancellationToken) -> Self {
        self.source_closed = token;
        self
    }

    /// Declared size in bytes, if the sender announced one.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn source_closed(&self) -> &CancellationToken {
        &self.source_closed
    }

    pub fn is_consumed(&self) -> bool {
        self.opener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Open the stream. Fails with `AlreadyConsumed` on every call after the first.
    pub async fn open(&self) -> Result<PayloadReader, TransferError> {
        let opener = self
            .opener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TransferError::AlreadyConsumed)?;
        if self.source_closed.is_cancelled() {
            return Err(TransferError::SourceClosed);
        }
        tokio::select! {
            _ = self.source_closed.cancelled() => Err(TransferError::SourceClosed),
            opened = opener() => opened.map_err(|e| TransferError::Io(e.to_string())),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("size", &self.size)
            .field("consumed", &self.is_consumed())
            .field("source_closed", &self.source_closed.is_cancelled())
            .finish()
    }
}

/// An immutable typed message. Construction goes through the consuming `with_*` methods;
/// once shared, a packet never changes.
#[derive(Debug, Clone)]
pub struct Packet {
    packet_type: String,
    id: i64,
    body: Map<String, Value>,
    payload_size: Option<i64>,
    payload_transfer_info: Map<String, Value>,
    payload: Option<Arc<Payload>>,
}

/// Serialized form of a packet. `payloadSize` is -1 when the sender does not know the size.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePacket {
    id: i64,
    #[serde(rename = "type")]
    packet_type: String,
    #[serde(default)]
    body: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    payload_transfer_info: Map<String, Value>,
}

impl Packet {
    pub fn new(packet_type: impl Into<String>) -> Self {
        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            packet_type: packet_type.into(),
            id,
            body: Map::new(),
            payload_size: None,
            payload_transfer_info: Map::new(),
            payload: None,
        }
    }

    /// Set a body field. Values that fail to serialize are stored as null.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.body.insert(key.into(), value);
        self
    }

    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// Attach a payload stream. The announced size follows the payload's own size.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload_size = Some(payload.size().map(|s| s as i64).unwrap_or(-1));
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Transport-specific data telling the receiver where to fetch the payload from.
    pub fn with_payload_transfer_info(mut self, info: Map<String, Value>) -> Self {
        self.payload_transfer_info = info;
        self
    }

    pub fn packet_type(&self) -> &str {
        &self.packet_type
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn has(&self, key: &str) -> bool {
        self.body.contains_key(key)
    }

    /// Typed field lookup. `None` if the key is missing or has the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn payload(&self) -> Option<&Arc<Payload>> {
        self.payload.as_ref()
    }

    /// True when the packet announces a payload, whether or not a stream is attached yet.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some() || self.payload_size.is_some()
    }

    pub fn payload_size(&self) -> Option<i64> {
        self.payload_size
    }

    pub fn payload_transfer_info(&self) -> &Map<String, Value> {
        &self.payload_transfer_info
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&WirePacket {
            id: self.id,
            packet_type: self.packet_type.clone(),
            body: self.body.clone(),
            payload_size: self.payload_size,
            payload_transfer_info: self.payload_transfer_info.clone(),
        })
    }

    pub(crate) fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        let wire: WirePacket = serde_json::from_slice(bytes)?;
        Ok(Self {
            packet_type: wire.packet_type,
            id: wire.id,
            body: wire.body,
            payload_size: wire.payload_size,
            payload_transfer_info: wire.payload_transfer_info,
            payload: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[test]
    fn typed_field_access() {
        let p = Packet::new("tether.test")
            .with_field("name", "Phone1")
            .with_field("count", 3)
            .with_field("flag", true)
            .with_field("list", vec!["a", "b"]);
        assert_eq!(p.packet_type(), "tether.test");
        assert_eq!(p.get::<String>("name").as_deref(), Some("Phone1"));
        assert_eq!(p.get::<i64>("count"), Some(3));
        assert_eq!(p.get::<bool>("flag"), Some(true));
        assert_eq!(p.get::<Vec<String>>("list").unwrap(), vec!["a", "b"]);
        assert_eq!(p.get::<bool>("name"), None);
        assert!(!p.get_or("missing", false));
        assert!(p.has("count"));
        assert!(!p.has_payload());
    }

    #[test]
    fn json_keeps_every_value_kind() {
        let body = json!({
            "s": "text",
            "i": -42,
            "f": 1.5,
            "b": false,
            "n": null,
            "arr": [1, "two", [3]],
            "obj": {"nested": {"deep": true}}
        });
        let p = Packet::new("tether.test")
            .with_id(7)
            .with_body(body.as_object().unwrap().clone());
        let decoded = Packet::from_json(&p.to_json().unwrap()).unwrap();
        assert_eq!(decoded.id(), 7);
        assert_eq!(decoded.packet_type(), "tether.test");
        assert_eq!(Value::Object(decoded.body().clone()), body);
    }

    #[test]
    fn payload_size_announced_on_wire() {
        let mut info = Map::new();
        info.insert("port".into(), json!(1739));
        let p = Packet::new("tether.test")
            .with_payload(Payload::from_bytes(vec![0u8; 10]))
            .with_payload_transfer_info(info);
        let decoded = Packet::from_json(&p.to_json().unwrap()).unwrap();
        assert_eq!(decoded.payload_size(), Some(10));
        assert!(decoded.has_payload());
        assert!(decoded.payload().is_none());
        assert_eq!(decoded.payload_transfer_info()["port"], json!(1739));
    }

    #[tokio::test]
    async fn payload_opens_once() {
        let p = Packet::new("tether.test").with_payload(Payload::from_bytes(b"icon".to_vec()));
        let copy = p.clone();
        let mut reader = p.payload().unwrap().open().await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"icon");
        assert!(copy.payload().unwrap().is_consumed());
        assert!(matches!(
            copy.payload().unwrap().open().await,
            Err(TransferError::AlreadyConsumed)
        ));
    }

    #[tokio::test]
    async fn closed_source_fails_open() {
        let token = CancellationToken::new();
        let payload = Payload::from_bytes(vec![1, 2, 3]).with_source_token(token.clone());
        token.cancel();
        assert!(matches!(
            payload.open().await,
            Err(TransferError::SourceClosed)
        ));
    }
}
