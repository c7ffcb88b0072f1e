//! Value Codecs
//!
//! Every value that goes through the key-value store or the message queue is
//! turned into an opaque binary payload by a [`Codec`] before it reaches the
//! backing store, and turned back into a typed value after it is read.
//!
//! ```text
//!   T: Serialize ──encode──> Bytes ──> store ──> Bytes ──decode──> T: DeserializeOwned
//! ```
//!
//! The codec is picked at construction time as a type parameter of the store
//! or queue, so swapping the wire format never touches the calling code.
//! [`JsonCodec`] is the default.
//!
//! ## Example
//!
//! ```
//! use flashmq::codec::{Codec, JsonCodec};
//! use std::collections::HashMap;
//!
//! let codec = JsonCodec::new();
//! let bytes = codec.encode(&HashMap::from([("foo", "bar")])).unwrap();
//! assert_eq!(&bytes[..], br#"{"foo":"bar"}"#);
//!
//! let decoded: HashMap<String, String> = codec.decode(&bytes).unwrap();
//! assert_eq!(decoded["foo"], "bar");
//! ```

pub mod json;

pub use json::JsonCodec;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The value has no representation in the codec's wire format.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The bytes are not a well-formed payload for the requested type.
    #[error("decoding error: {0}")]
    Decoding(String),
}

impl CodecError {
    /// Returns true if this error was raised by `encode`.
    pub fn is_encoding(&self) -> bool {
        matches!(self, CodecError::Encoding(_))
    }

    /// Returns true if this error was raised by `decode`.
    pub fn is_decoding(&self) -> bool {
        matches!(self, CodecError::Decoding(_))
    }
}

/// Encodes structured values to binary payloads and back.
///
/// Implementations must be exact inverses: `decode(encode(v)) == v` for every
/// value the format can represent. Values that cannot be represented are
/// rejected with [`CodecError::Encoding`], never silently altered.
pub trait Codec: Send + Sync + 'static {
    /// Encodes a value into its binary payload.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Decodes a binary payload into a value.
    fn decode<T: DeserializeOwned>(&self, encoded: &[u8]) -> Result<T, CodecError>;
}
