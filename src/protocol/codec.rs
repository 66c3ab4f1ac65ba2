//! Payload codec boundary
//!
//! The server never interprets payload bytes itself. An application hands it
//! a [`Codec`] that maps each message-type tag to a decode function and knows
//! how to serialize outbound payloads.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoding error: {0}")]
    Encoding(#[source] BoxError),

    #[error("Decoding error: {0}")]
    Decoding(#[source] BoxError),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Unknown message tag: {0}")]
    UnknownTag(u32),
}

/// Decodes the payload bytes of one frame
pub type DecodeFn<P> = Box<dyn Fn(&[u8]) -> Result<P, CodecError> + Send + Sync>;

/// Serializes one payload, without the tag
pub type EncodeFn<P> = Box<dyn Fn(&P) -> Result<Vec<u8>, CodecError> + Send + Sync>;

/// Pluggable payload encoding
pub trait Codec: Send + Sync + 'static {
    /// Decoded payload handed to the application. Shared by reference across
    /// tasks while a frame is written.
    type Payload: Send + Sync + 'static;

    /// Decode function for `tag`, or `None` if the tag is not recognized
    fn decoder(&self, tag: u32) -> Option<&DecodeFn<Self::Payload>>;

    /// Serialize a payload
    fn encode(&self, payload: &Self::Payload) -> Result<Vec<u8>, CodecError>;
}

/// A codec built from one decode function per tag
///
/// ```ignore
/// let codec = TagRegistry::new(|p: &Payload| match p {
///     Payload::Chat(chat) => bincode_encode(chat),
/// })
/// .register_bincode(0, Payload::Chat);
/// ```
pub struct TagRegistry<P> {
    decoders: HashMap<u32, DecodeFn<P>>,
    encoder: EncodeFn<P>,
}

impl<P: Send + Sync + 'static> TagRegistry<P> {
    /// Create an empty registry with the given serializer
    pub fn new<F>(encoder: F) -> Self
    where
        F: Fn(&P) -> Result<Vec<u8>, CodecError> + Send + Sync + 'static,
    {
        Self {
            decoders: HashMap::new(),
            encoder: Box::new(encoder),
        }
    }

    /// Register a decode function for `tag`, replacing any previous one
    pub fn register<F>(mut self, tag: u32, decode: F) -> Self
    where
        F: Fn(&[u8]) -> Result<P, CodecError> + Send + Sync + 'static,
    {
        self.decoders.insert(tag, Box::new(decode));
        self
    }

    /// Register a bincode-encoded type for `tag`
    pub fn register_bincode<T>(self, tag: u32, wrap: fn(T) -> P) -> Self
    where
        T: DeserializeOwned + 'static,
    {
        self.register(tag, move |bytes| bincode_decode::<T>(bytes).map(wrap))
    }

    /// Register a JSON-encoded type for `tag`
    pub fn register_json<T>(self, tag: u32, wrap: fn(T) -> P) -> Self
    where
        T: DeserializeOwned + 'static,
    {
        self.register(tag, move |bytes| json_decode::<T>(bytes).map(wrap))
    }

    pub fn contains(&self, tag: u32) -> bool {
        self.decoders.contains_key(&tag)
    }

    /// Registered tags in ascending order
    pub fn tags(&self) -> Vec<u32> {
        let mut tags: Vec<u32> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Decode `bytes` as the payload registered for `tag`
    pub fn decode(&self, tag: u32, bytes: &[u8]) -> Result<P, CodecError> {
        let decode = self.decoders.get(&tag).ok_or(CodecError::UnknownTag(tag))?;
        decode(bytes)
    }
}

impl<P: Send + Sync + 'static> Codec for TagRegistry<P> {
    type Payload = P;

    fn decoder(&self, tag: u32) -> Option<&DecodeFn<P>> {
        self.decoders.get(&tag)
    }

    fn encode(&self, payload: &P) -> Result<Vec<u8>, CodecError> {
        (self.encoder)(payload)
    }
}

impl<P> fmt::Debug for TagRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&u32> = self.decoders.keys().collect();
        tags.sort_unstable();
        f.debug_struct("TagRegistry").field("tags", &tags).finish()
    }
}

/// Pass-through codec: every tag is recognized and the payload is the raw bytes
pub struct RawCodec {
    decode: DecodeFn<Bytes>,
}

impl RawCodec {
    pub fn new() -> Self {
        Self {
            decode: Box::new(|bytes| Ok(Bytes::copy_from_slice(bytes))),
        }
    }
}

impl Default for RawCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for RawCodec {
    type Payload = Bytes;

    fn decoder(&self, _tag: u32) -> Option<&DecodeFn<Bytes>> {
        Some(&self.decode)
    }

    fn encode(&self, payload: &Bytes) -> Result<Vec<u8>, CodecError> {
        Ok(payload.to_vec())
    }
}

impl fmt::Debug for RawCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawCodec")
    }
}

pub fn bincode_encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Encoding(e as BoxError))
}

pub fn bincode_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Decoding(e as BoxError))
}

pub fn json_encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encoding(Box::new(e)))
}

pub fn json_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decoding(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Payload {
        Chat(Chat),
        Ping(Ping),
    }

    fn registry() -> TagRegistry<Payload> {
        TagRegistry::new(|p: &Payload| match p {
            Payload::Chat(chat) => bincode_encode(chat),
            Payload::Ping(ping) => json_encode(ping),
        })
        .register_bincode(0, Payload::Chat)
        .register_json(5, Payload::Ping)
    }

    #[test]
    fn test_registry_lookup() {
        let codec = registry();
        assert!(codec.contains(0));
        assert!(codec.contains(5));
        assert!(!codec.contains(1));
        assert!(codec.decoder(1).is_none());
        assert_eq!(codec.tags(), vec![0, 5]);
    }

    #[test]
    fn test_registry_decodes_registered_types() {
        let codec = registry();
        let chat = Payload::Chat(Chat { text: "hello".to_string() });
        let bytes = codec.encode(&chat).unwrap();
        assert_eq!(codec.decode(0, &bytes).unwrap(), chat);

        let ping = Payload::Ping(Ping { seq: 9 });
        let bytes = codec.encode(&ping).unwrap();
        assert_eq!(bytes, br#"{"seq":9}"#.to_vec());
        assert_eq!(codec.decode(5, &bytes).unwrap(), ping);
    }

    #[test]
    fn test_unknown_tag() {
        let codec = registry();
        match codec.decode(42, b"whatever") {
            Err(CodecError::UnknownTag(42)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload_is_decoding_error() {
        let codec = registry();
        assert!(matches!(
            codec.decode(5, b"not json"),
            Err(CodecError::Decoding(_))
        ));
    }

    #[test]
    fn test_bincode_error_keeps_source() {
        let codec = registry();
        let err = codec.decode(0, &[1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::Decoding(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_raw_codec_accepts_every_tag() {
        let codec = RawCodec::new();
        let decode = codec.decoder(0xDEAD_BEEF).unwrap();
        assert_eq!(decode(&b"abc"[..]).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(codec.encode(&Bytes::from_static(b"xyz")).unwrap(), b"xyz".to_vec());
    }
}
