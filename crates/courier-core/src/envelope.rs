//! Envelope model and wire codec
//!
//! An [`Envelope`] is the typed unit exchanged between peers. It carries exactly
//! one of three payload kinds:
//!
//! - **Text**: UTF-8 text, kept as-is
//! - **Binary**: opaque bytes, stored gzip-compressed and decompressed on read
//! - **Object**: a serde value, stored as a bincode blob tagged with its type
//!   name and deserialized only when read
//!
//! Envelopes travel as [`WireMessage`] frames. A frame has one optional field per
//! kind; decoding picks the first populated field in the order text, binary,
//! object, so exactly one envelope kind comes out of every frame.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{CourierError, DecodeError, Result};
use crate::types::PeerName;

/// Returned by [`Envelope::text`] on a binary envelope
pub const BINARY_TEXT_PLACEHOLDER: &str =
    "Binary message cannot return the text, use TextualMessage instead";

/// Returned by [`Envelope::bytes`] on a text envelope
pub const TEXT_STREAM_PLACEHOLDER: &str =
    "Textual message cannot return the InputStream, use BinaryMessage instead";

// ----------------------------------------------------------------------------
// Envelope Kind
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Text,
    Binary,
    Object,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeKind::Text => write!(f, "Text"),
            EnvelopeKind::Binary => write!(f, "Binary"),
            EnvelopeKind::Object => write!(f, "Object"),
        }
    }
}

// ----------------------------------------------------------------------------
// Object Blob
// ----------------------------------------------------------------------------

/// Serialized object payload together with the logical type it was written as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectBlob {
    type_name: String,
    data: Vec<u8>,
}

impl ObjectBlob {
    /// Serialize a value into a blob
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            type_name: type_name::<T>().to_string(),
            data: bincode::serialize(value)?,
        })
    }

    /// Build a blob from raw parts received from the wire
    pub fn from_parts<T: Into<String>>(type_name: T, data: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }

    /// Deserialize the blob as `T`.
    ///
    /// Fails with [`DecodeError::TypeMismatch`] when the blob was written as a
    /// different type (the logical type is not available here) and with
    /// [`DecodeError::MalformedObject`] when the bytes do not parse.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let expected = type_name::<T>();
        if self.type_name != expected {
            return Err(DecodeError::TypeMismatch {
                expected: expected.to_string(),
                found: self.type_name.clone(),
            }
            .into());
        }

        bincode::deserialize(&self.data).map_err(|e| {
            DecodeError::MalformedObject {
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Text(String),
    /// Gzip-compressed bytes
    Binary(Vec<u8>),
    Object(ObjectBlob),
}

/// Immutable typed message between two peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    source: PeerName,
    destination: PeerName,
    payload: Payload,
}

impl Envelope {
    /// Create a text envelope
    pub fn new_text<S, D, T>(source: S, destination: D, text: T) -> Result<Self>
    where
        S: Into<String>,
        D: Into<String>,
        T: Into<String>,
    {
        let (source, destination) = validate_endpoints(source, destination)?;
        let text = text.into();
        if text.is_empty() {
            return Err(CourierError::invalid_argument("text payload must not be empty"));
        }

        Ok(Self {
            source,
            destination,
            payload: Payload::Text(text),
        })
    }

    /// Create a binary envelope, compressing the bytes
    pub fn new_binary<S, D>(source: S, destination: D, bytes: &[u8]) -> Result<Self>
    where
        S: Into<String>,
        D: Into<String>,
    {
        let (source, destination) = validate_endpoints(source, destination)?;
        if bytes.is_empty() {
            return Err(CourierError::invalid_argument("binary payload must not be empty"));
        }

        Ok(Self {
            source,
            destination,
            payload: Payload::Binary(compress(bytes)?),
        })
    }

    /// Create an object envelope, serializing the value
    pub fn new_object<S, D, T>(source: S, destination: D, value: &T) -> Result<Self>
    where
        S: Into<String>,
        D: Into<String>,
        T: Serialize,
    {
        let (source, destination) = validate_endpoints(source, destination)?;

        Ok(Self {
            source,
            destination,
            payload: Payload::Object(ObjectBlob::encode(value)?),
        })
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            Payload::Text(_) => EnvelopeKind::Text,
            Payload::Binary(_) => EnvelopeKind::Binary,
            Payload::Object(_) => EnvelopeKind::Object,
        }
    }

    pub fn source(&self) -> &PeerName {
        &self.source
    }

    pub fn destination(&self) -> &PeerName {
        &self.destination
    }

    /// Text of a text envelope. A binary envelope yields an explanatory
    /// placeholder; an object envelope has no text form.
    pub fn text(&self) -> Result<Cow<'_, str>> {
        match &self.payload {
            Payload::Text(text) => Ok(Cow::Borrowed(text.as_str())),
            Payload::Binary(_) => Ok(Cow::Borrowed(BINARY_TEXT_PLACEHOLDER)),
            Payload::Object(_) => Err(CourierError::Unsupported {
                accessor: "text",
                kind: EnvelopeKind::Object,
            }),
        }
    }

    /// Decompressed bytes of a binary envelope. A text envelope yields the
    /// bytes of an explanatory placeholder; an object envelope has no stream.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match &self.payload {
            Payload::Binary(compressed) => Ok(decompress(compressed)?),
            Payload::Text(_) => Ok(TEXT_STREAM_PLACEHOLDER.as_bytes().to_vec()),
            Payload::Object(_) => Err(CourierError::Unsupported {
                accessor: "bytes",
                kind: EnvelopeKind::Object,
            }),
        }
    }

    /// Deserialize the object carried by an object envelope
    pub fn object<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.payload {
            Payload::Object(blob) => blob.decode(),
            _ => Err(CourierError::Unsupported {
                accessor: "object",
                kind: self.kind(),
            }),
        }
    }

    /// Raw blob of an object envelope, without deserializing it
    pub fn object_blob(&self) -> Option<&ObjectBlob> {
        match &self.payload {
            Payload::Object(blob) => Some(blob),
            _ => None,
        }
    }

    /// Size of the payload as carried on the wire
    pub fn wire_len(&self) -> usize {
        match &self.payload {
            Payload::Text(text) => text.len(),
            Payload::Binary(compressed) => compressed.len(),
            Payload::Object(blob) => blob.data.len(),
        }
    }

    /// Build the wire frame for this envelope
    pub fn to_wire(&self) -> WireMessage {
        let mut wire = WireMessage {
            from: self.source.to_string(),
            to: self.destination.to_string(),
            ..WireMessage::default()
        };

        match &self.payload {
            Payload::Text(text) => wire.payload = Some(text.clone()),
            Payload::Binary(compressed) => wire.binary = Some(compressed.clone()),
            Payload::Object(blob) => wire.object = Some(blob.clone()),
        }

        wire
    }

    /// Rebuild an envelope from a wire frame.
    ///
    /// The first populated field wins: text, then binary, then object. Binary
    /// fields must hold a valid compressed stream.
    pub fn from_wire(wire: WireMessage) -> Result<Self> {
        let (source, destination) = validate_endpoints(wire.from, wire.to)?;

        let payload = if let Some(text) = wire.payload {
            Payload::Text(text)
        } else if let Some(compressed) = wire.binary {
            decompress(&compressed)?;
            Payload::Binary(compressed)
        } else if let Some(blob) = wire.object {
            if blob.type_name.is_empty() {
                return Err(DecodeError::MalformedObject {
                    reason: "missing type name".to_string(),
                }
                .into());
            }
            Payload::Object(blob)
        } else {
            return Err(DecodeError::EmptyMessage.into());
        };

        Ok(Self {
            source,
            destination,
            payload,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{} -> {}: ", self.kind(), self.source, self.destination)?;
        match &self.payload {
            Payload::Text(text) => {
                let preview: String = text.chars().take(32).collect();
                if preview.len() < text.len() {
                    write!(f, "\"{}...\"", preview)?;
                } else {
                    write!(f, "\"{}\"", preview)?;
                }
            }
            Payload::Binary(compressed) => {
                let head = &compressed[..compressed.len().min(8)];
                write!(f, "{} bytes gz:{}", compressed.len(), hex::encode(head))?;
            }
            Payload::Object(blob) => write!(f, "{} ({} bytes)", blob.type_name, blob.data.len())?,
        }
        write!(f, "]")
    }
}

fn validate_endpoints<S, D>(source: S, destination: D) -> Result<(PeerName, PeerName)>
where
    S: Into<String>,
    D: Into<String>,
{
    let source = PeerName::new(source)
        .map_err(|_| CourierError::invalid_argument("envelope source must not be empty"))?;
    let destination = PeerName::new(destination)
        .map_err(|_| CourierError::invalid_argument("envelope destination must not be empty"))?;
    Ok((source, destination))
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let to_error = |e: std::io::Error| CourierError::Serialization {
        reason: format!("gzip compression failed: {}", e),
    };

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(to_error)?;
    encoder.finish().map_err(to_error)
}

fn decompress(compressed: &[u8]) -> core::result::Result<Vec<u8>, DecodeError> {
    if compressed.is_empty() {
        return Err(DecodeError::Compression {
            reason: "empty stream".to_string(),
        });
    }

    let mut out = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Compression {
            reason: e.to_string(),
        })?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Wire Message
// ----------------------------------------------------------------------------

/// Frame exchanged over overlay channels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub from: String,
    pub to: String,
    #[serde(rename = "payLoad")]
    pub payload: Option<String>,
    pub binary: Option<Vec<u8>>,
    pub object: Option<ObjectBlob>,
}

impl WireMessage {
    /// Serialize the frame to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a frame from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            DecodeError::Frame {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Kind the frame decodes to, following field priority
    pub fn populated_kind(&self) -> Option<EnvelopeKind> {
        if self.payload.is_some() {
            Some(EnvelopeKind::Text)
        } else if self.binary.is_some() {
            Some(EnvelopeKind::Binary)
        } else if self.object.is_some() {
            Some(EnvelopeKind::Object)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: i64,
    }

    #[test]
    fn test_text_envelope() {
        let envelope = Envelope::new_text("alice", "bob", "hello").unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Text);
        assert_eq!(envelope.source().as_str(), "alice");
        assert_eq!(envelope.destination().as_str(), "bob");
        assert_eq!(envelope.text().unwrap(), "hello");
        assert_eq!(envelope.bytes().unwrap(), TEXT_STREAM_PLACEHOLDER.as_bytes());
    }

    #[test]
    fn test_binary_envelope_is_compressed() {
        let data = vec![7u8; 4096];
        let envelope = Envelope::new_binary("alice", "bob", &data).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Binary);
        assert!(envelope.wire_len() < data.len());
        assert_eq!(envelope.bytes().unwrap(), data);
        assert_eq!(envelope.text().unwrap(), BINARY_TEXT_PLACEHOLDER);
    }

    #[test]
    fn test_object_envelope() {
        let reading = Reading {
            sensor: "t1".to_string(),
            value: -40,
        };
        let envelope = Envelope::new_object("alice", "bob", &reading).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Object);
        assert_eq!(envelope.object::<Reading>().unwrap(), reading);
        assert!(matches!(
            envelope.text(),
            Err(CourierError::Unsupported { accessor: "text", .. })
        ));
        assert!(matches!(
            envelope.bytes(),
            Err(CourierError::Unsupported { accessor: "bytes", .. })
        ));
    }

    #[test]
    fn test_object_type_mismatch() {
        let envelope = Envelope::new_object("alice", "bob", &42u32).unwrap();
        assert!(matches!(
            envelope.object::<String>(),
            Err(CourierError::Decode(DecodeError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_malformed_object_blob() {
        let wire = WireMessage {
            from: "alice".to_string(),
            to: "bob".to_string(),
            object: Some(ObjectBlob::from_parts(type_name::<Reading>(), vec![1])),
            ..WireMessage::default()
        };
        let envelope = Envelope::from_wire(wire).unwrap();
        assert!(matches!(
            envelope.object::<Reading>(),
            Err(CourierError::Decode(DecodeError::MalformedObject { .. }))
        ));
    }

    #[test]
    fn test_object_on_text_is_unsupported() {
        let envelope = Envelope::new_text("alice", "bob", "hi").unwrap();
        assert!(matches!(
            envelope.object::<String>(),
            Err(CourierError::Unsupported {
                accessor: "object",
                kind: EnvelopeKind::Text
            })
        ));
    }

    #[test]
    fn test_construction_rejects_empty_fields() {
        assert!(matches!(
            Envelope::new_text("", "bob", "x"),
            Err(CourierError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Envelope::new_text("alice", "", "x"),
            Err(CourierError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Envelope::new_text("alice", "bob", ""),
            Err(CourierError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Envelope::new_binary("alice", "bob", &[]),
            Err(CourierError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Envelope::new_object("", "bob", &1u8),
            Err(CourierError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_wire_priority_text_first() {
        let wire = WireMessage {
            from: "alice".to_string(),
            to: "bob".to_string(),
            payload: Some("text wins".to_string()),
            binary: Some(vec![0xde, 0xad]),
            object: Some(ObjectBlob::encode(&1u8).unwrap()),
        };
        assert_eq!(wire.populated_kind(), Some(EnvelopeKind::Text));

        let envelope = Envelope::from_wire(wire).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Text);
        assert_eq!(envelope.text().unwrap(), "text wins");
    }

    #[test]
    fn test_wire_priority_binary_over_object() {
        let binary = Envelope::new_binary("alice", "bob", b"payload").unwrap().to_wire();
        let wire = WireMessage {
            object: Some(ObjectBlob::encode(&1u8).unwrap()),
            ..binary
        };

        let envelope = Envelope::from_wire(wire).unwrap();
        assert_eq!(envelope.kind(), EnvelopeKind::Binary);
        assert_eq!(envelope.bytes().unwrap(), b"payload");
    }

    #[test]
    fn test_wire_rejects_corrupt_binary() {
        let wire = WireMessage {
            from: "alice".to_string(),
            to: "bob".to_string(),
            binary: Some(vec![1, 2, 3, 4]),
            ..WireMessage::default()
        };
        assert!(matches!(
            Envelope::from_wire(wire),
            Err(CourierError::Decode(DecodeError::Compression { .. }))
        ));
    }

    #[test]
    fn test_wire_rejects_empty_message() {
        let wire = WireMessage {
            from: "alice".to_string(),
            to: "bob".to_string(),
            ..WireMessage::default()
        };
        assert_eq!(wire.populated_kind(), None);
        assert!(matches!(
            Envelope::from_wire(wire),
            Err(CourierError::Decode(DecodeError::EmptyMessage))
        ));
    }

    #[test]
    fn test_frame_encoding() {
        let envelope = Envelope::new_text("alice", "bob", "over the wire").unwrap();
        let bytes = envelope.to_wire().encode().unwrap();
        let decoded = Envelope::from_wire(WireMessage::decode(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, envelope);

        assert!(matches!(
            WireMessage::decode(&[0xff]),
            Err(CourierError::Decode(DecodeError::Frame { .. }))
        ));
    }

    #[test]
    fn test_display_names_endpoints() {
        let envelope = Envelope::new_text("alice", "bob", "hi").unwrap();
        assert_eq!(envelope.to_string(), "Text[alice -> bob: \"hi\"]");

        let envelope = Envelope::new_binary("alice", "bob", b"data").unwrap();
        assert!(envelope.to_string().starts_with("Binary[alice -> bob: "));
        assert!(envelope.to_string().contains("gz:1f8b"));
    }
}
