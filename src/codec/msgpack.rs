//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map), so adding an
//! optional field to a callable does not break an older peer that decodes
//! it by name.
//!
//! # Example
//!
//! ```
//! use remoting::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Checkout {
        revision: String,
        depth: Option<u32>,
    }

    #[test]
    fn test_struct_encoded_as_map() {
        let encoded = MsgPackCodec::encode(&Checkout {
            revision: "abc".to_string(),
            depth: None,
        })
        .unwrap();

        // fixmap with two entries
        assert_eq!(encoded[0], 0x82);
    }

    #[test]
    fn test_decode_type_mismatch() {
        let encoded = MsgPackCodec::encode(&"not a struct").unwrap();
        let result: Result<Checkout> = MsgPackCodec::decode(&encoded);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = MsgPackCodec::encode(&Checkout {
            revision: "abcdef".to_string(),
            depth: Some(3),
        })
        .unwrap();
        let result: Result<Checkout> = MsgPackCodec::decode(&encoded[..encoded.len() - 2]);
        assert!(result.is_err());
    }
}
