//! Frame encoding/decoding
//!
//! Applies the tag prefix around codec output. See the module docs of
//! [`crate::protocol`] for the wire layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use super::{Codec, CodecError, BUFFER_SIZE, TAG_SIZE};

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<P> {
    /// Message-type tag
    pub tag: u32,
    /// The decoded payload
    pub payload: P,
}

impl<P> Frame<P> {
    pub fn new(tag: u32, payload: P) -> Self {
        Self { tag, payload }
    }
}

/// Encodes payloads into the wire format
pub struct Encoder<C> {
    codec: Arc<C>,
}

impl<C: Codec> Encoder<C> {
    pub fn new(codec: Arc<C>) -> Self {
        Self { codec }
    }

    /// Serialize `payload` and prefix it with `tag`
    pub fn encode(&self, tag: u32, payload: &C::Payload) -> Result<Bytes, CodecError> {
        let body = self.codec.encode(payload)?;
        let size = TAG_SIZE + body.len();

        if size >= BUFFER_SIZE {
            return Err(CodecError::MessageTooLarge(size, BUFFER_SIZE));
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(tag);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}

impl<C> Clone for Encoder<C> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
        }
    }
}

/// Decodes records read from the transport
pub struct Decoder<C> {
    codec: Arc<C>,
}

impl<C: Codec> Decoder<C> {
    pub fn new(codec: Arc<C>) -> Self {
        Self { codec }
    }

    /// Attempt to decode one record.
    ///
    /// Returns `Ok(None)` for records too short to hold a payload and for tags
    /// the codec does not recognize. Neither is an error.
    pub fn decode(&self, record: &[u8]) -> Result<Option<Frame<C::Payload>>, CodecError> {
        if record.len() <= TAG_SIZE {
            return Ok(None);
        }

        let mut header = &record[..TAG_SIZE];
        let tag = header.get_u32();

        let Some(decode) = self.codec.decoder(tag) else {
            tracing::trace!(tag, "Ignoring frame with unknown tag");
            return Ok(None);
        };

        let payload = decode(&record[TAG_SIZE..])?;
        Ok(Some(Frame::new(tag, payload)))
    }
}

impl<C> Clone for Decoder<C> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{bincode_encode, DecodeFn, RawCodec, TagRegistry};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    fn chat_codec() -> Arc<TagRegistry<Chat>> {
        Arc::new(TagRegistry::new(|c: &Chat| bincode_encode(c)).register_bincode::<Chat>(1, |c| c))
    }

    /// Counts lookups and decode calls
    struct CountingCodec {
        lookups: AtomicUsize,
        decodes: Arc<AtomicUsize>,
        known_tag: u32,
        decode: DecodeFn<Bytes>,
    }

    impl CountingCodec {
        fn new(known_tag: u32) -> Self {
            let decodes = Arc::new(AtomicUsize::new(0));
            let counter = decodes.clone();
            Self {
                lookups: AtomicUsize::new(0),
                decodes,
                known_tag,
                decode: Box::new(move |bytes| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::copy_from_slice(bytes))
                }),
            }
        }
    }

    impl Codec for CountingCodec {
        type Payload = Bytes;

        fn decoder(&self, tag: u32) -> Option<&DecodeFn<Bytes>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            (tag == self.known_tag).then_some(&self.decode)
        }

        fn encode(&self, payload: &Bytes) -> Result<Vec<u8>, CodecError> {
            Ok(payload.to_vec())
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = chat_codec();
        let encoder = Encoder::new(codec.clone());
        let decoder = Decoder::new(codec);

        let original = Chat { text: "Hello there!".to_string() };
        let bytes = encoder.encode(1, &original).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);

        let frame = decoder.decode(&bytes).unwrap().unwrap();
        assert_eq!(frame, Frame::new(1, original));
    }

    #[test]
    fn test_tag_is_big_endian() {
        let encoder = Encoder::new(Arc::new(RawCodec::new()));
        let bytes = encoder.encode(0x0102_0304, &Bytes::from_static(b"x")).unwrap();
        assert_eq!(bytes.as_ref(), &[0x01, 0x02, 0x03, 0x04, b'x']);
    }

    #[test]
    fn test_payload_starts_after_tag() {
        let decoder = Decoder::new(Arc::new(RawCodec::new()));
        let record = [0x00, 0x00, 0x00, 0x07, 0xAA, 0xBB, 0xCC];

        let frame = decoder.decode(&record).unwrap().unwrap();
        assert_eq!(frame.tag, 7);
        assert_eq!(frame.payload.as_ref(), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_short_records_skip_lookup() {
        let codec = Arc::new(CountingCodec::new(1));
        let decoder = Decoder::new(codec.clone());

        for len in 0..=TAG_SIZE {
            let record = vec![0u8; len];
            assert!(decoder.decode(&record).unwrap().is_none());
        }
        assert_eq!(codec.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_tag_is_dropped_without_decoding() {
        let codec = Arc::new(CountingCodec::new(1));
        let decoder = Decoder::new(codec.clone());

        let record = [0, 0, 0, 2, 9, 9];
        assert!(decoder.decode(&record).unwrap().is_none());
        assert_eq!(codec.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 0);

        let record = [0, 0, 0, 1, 9, 9];
        assert!(decoder.decode(&record).unwrap().is_some());
        assert_eq!(codec.decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_payload_is_error() {
        let decoder = Decoder::new(chat_codec());
        // Length prefix claims far more bytes than present
        let record = [0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert!(matches!(decoder.decode(&record), Err(CodecError::Decoding(_))));
    }

    #[test]
    fn test_capacity_boundary() {
        let encoder = Encoder::new(Arc::new(RawCodec::new()));

        let fits = Bytes::from(vec![0u8; BUFFER_SIZE - TAG_SIZE - 1]);
        let bytes = encoder.encode(1, &fits).unwrap();
        assert_eq!(bytes.len(), BUFFER_SIZE - 1);

        let at_capacity = Bytes::from(vec![0u8; BUFFER_SIZE - TAG_SIZE]);
        match encoder.encode(1, &at_capacity) {
            Err(CodecError::MessageTooLarge(size, max)) => {
                assert_eq!(size, BUFFER_SIZE);
                assert_eq!(max, BUFFER_SIZE);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let over = Bytes::from(vec![0u8; BUFFER_SIZE]);
        assert!(matches!(
            encoder.encode(1, &over),
            Err(CodecError::MessageTooLarge(..))
        ));
    }
}
