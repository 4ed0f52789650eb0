// SPDX-License-Identifier: Apache-2.0

//! Item codec: typed scalar and vector payload encoding.
//!
//! A queue item is either a single typed scalar or an ordered vector of
//! typed sub-items. Vector payloads are encoded as a flat stream of
//! `[tag u32][len u32][bytes]` entries; scalars are stored raw with the
//! tag carried in the item descriptor. Every tag is validated against its
//! byte length before any shared state is touched, so malformed input can
//! never half-commit. Integrity is a CRC32 over the encoded stream,
//! verified on decode - a mismatch fails immediately, no fallback.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{ShqError, ShqResult};
use crate::shm::layout::ItemDesc;
use crate::types::TypeTag;

/// Maximum encoded payload size (16 MB). Arena capacity usually binds first.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Per-entry framing bytes in a vector payload.
const VEC_ENTRY_HEADER: usize = 8;

/// One typed sub-item of a decoded queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubItem {
    pub tag: TypeTag,
    pub bytes: Vec<u8>,
}

/// A decoded queue item, removed destructively from the queue.
///
/// Scalars carry exactly one value; vector items carry their sub-items in
/// insertion order. String values stay raw bytes - character-set decoding
/// belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// `TypeTag::Vector` for vector items, the scalar tag otherwise.
    pub tag: TypeTag,
    /// Sub-items; length 1 for scalars.
    pub values: Vec<SubItem>,
    /// When the item was enqueued.
    pub enqueued_at: SystemTime,
}

impl Item {
    /// Payload bytes of a scalar item.
    pub fn bytes(&self) -> &[u8] {
        &self.values[0].bytes
    }

    pub fn is_vector(&self) -> bool {
        self.tag == TypeTag::Vector
    }
}

/// A validated, fully encoded item ready to commit to the segment.
pub(crate) struct EncodedItem {
    pub tag: u32,
    pub vec_count: u32,
    pub bytes: Vec<u8>,
    pub checksum: u32,
}

/// Check a tag against its payload length.
///
/// Width rules follow the segment format: integers are 4 or 8 bytes,
/// floats are 8, UTF-16 needs an even byte count. `Vector` is a container
/// tag and never valid for a value.
pub(crate) fn validate_tag(tag: TypeTag, len: usize) -> ShqResult<()> {
    let ok = match tag {
        TypeTag::Vector => {
            return Err(ShqError::InvalidArgument {
                reason: "vector tag is not valid for a value".to_string(),
            })
        }
        TypeTag::Integer => len == 4 || len == 8,
        TypeTag::Float => len == 8,
        TypeTag::Utf16 => len % 2 == 0,
        _ => true,
    };
    if !ok {
        return Err(ShqError::InvalidArgument {
            reason: format!("{} bytes is not a valid length for {:?}", len, tag),
        });
    }
    Ok(())
}

/// Encode a scalar item.
pub(crate) fn encode_scalar(tag: TypeTag, bytes: &[u8]) -> ShqResult<EncodedItem> {
    if bytes.is_empty() {
        return Err(ShqError::InvalidArgument {
            reason: "cannot add an empty item".to_string(),
        });
    }
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(ShqError::InvalidArgument {
            reason: format!("payload of {} bytes exceeds {}", bytes.len(), MAX_PAYLOAD_SIZE),
        });
    }
    validate_tag(tag, bytes.len())?;

    Ok(EncodedItem {
        tag: tag as u32,
        vec_count: 1,
        checksum: crc32fast::hash(bytes),
        bytes: bytes.to_vec(),
    })
}

/// Encode a vector item. All-or-nothing: every pair is validated before
/// a single byte is produced.
pub(crate) fn encode_vector(items: &[(TypeTag, &[u8])]) -> ShqResult<EncodedItem> {
    if items.is_empty() {
        return Err(ShqError::InvalidArgument {
            reason: "cannot add an empty vector".to_string(),
        });
    }

    let mut total = 0usize;
    for (tag, bytes) in items {
        validate_tag(*tag, bytes.len())?;
        total += VEC_ENTRY_HEADER + bytes.len();
    }
    if total > MAX_PAYLOAD_SIZE {
        return Err(ShqError::InvalidArgument {
            reason: format!("encoded vector of {} bytes exceeds {}", total, MAX_PAYLOAD_SIZE),
        });
    }

    let mut out = Vec::with_capacity(total);
    for (tag, bytes) in items {
        out.extend_from_slice(&(*tag as u32).to_le_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }

    Ok(EncodedItem {
        tag: TypeTag::Vector as u32,
        vec_count: items.len() as u32,
        checksum: crc32fast::hash(&out),
        bytes: out,
    })
}

/// Decode an item from its descriptor and reassembled payload.
pub(crate) fn decode(desc: &ItemDesc, payload: Vec<u8>) -> ShqResult<Item> {
    let actual = crc32fast::hash(&payload);
    if actual != desc.checksum {
        return Err(ShqError::ChecksumMismatch {
            expected: desc.checksum,
            actual,
        });
    }

    let tag = TypeTag::try_from(desc.tag)?;
    let enqueued_at = UNIX_EPOCH + Duration::from_nanos(desc.enqueue_ns);

    if tag != TypeTag::Vector {
        return Ok(Item {
            tag,
            values: vec![SubItem {
                tag,
                bytes: payload,
            }],
            enqueued_at,
        });
    }

    let mut values = Vec::with_capacity(desc.vec_count as usize);
    let mut at = 0usize;
    for _ in 0..desc.vec_count {
        if at + VEC_ENTRY_HEADER > payload.len() {
            return Err(ShqError::InvalidState {
                reason: "vector payload truncated".to_string(),
            });
        }
        let sub_tag = u32::from_le_bytes(payload[at..at + 4].try_into().expect("4-byte slice"));
        let len =
            u32::from_le_bytes(payload[at + 4..at + 8].try_into().expect("4-byte slice")) as usize;
        at += VEC_ENTRY_HEADER;
        if at + len > payload.len() {
            return Err(ShqError::InvalidState {
                reason: "vector sub-item overruns payload".to_string(),
            });
        }
        values.push(SubItem {
            tag: TypeTag::try_from(sub_tag)?,
            bytes: payload[at..at + len].to_vec(),
        });
        at += len;
    }

    Ok(Item {
        tag,
        values,
        enqueued_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc_for(e: &EncodedItem) -> ItemDesc {
        ItemDesc::new(e.tag, e.vec_count, e.bytes.len() as u64, e.checksum)
    }

    #[test]
    fn test_scalar_round_trip() {
        let encoded = encode_scalar(TypeTag::Utf8, "héllo".as_bytes()).unwrap();
        let item = decode(&desc_for(&encoded), encoded.bytes.clone()).unwrap();
        assert_eq!(item.tag, TypeTag::Utf8);
        assert_eq!(item.bytes(), "héllo".as_bytes());
        assert!(!item.is_vector());
    }

    #[test]
    fn test_integer_width_validation() {
        assert!(encode_scalar(TypeTag::Integer, &42i32.to_le_bytes()).is_ok());
        assert!(encode_scalar(TypeTag::Integer, &42i64.to_le_bytes()).is_ok());
        assert!(encode_scalar(TypeTag::Integer, &[1, 2, 3]).is_err());
        assert!(encode_scalar(TypeTag::Float, &1.5f64.to_le_bytes()).is_ok());
        assert!(encode_scalar(TypeTag::Float, &[0u8; 4]).is_err());
        assert!(encode_scalar(TypeTag::Utf16, &[0u8; 3]).is_err());
    }

    #[test]
    fn test_empty_rejected() {
        assert!(encode_scalar(TypeTag::Stream, &[]).is_err());
        assert!(encode_vector(&[]).is_err());
    }

    #[test]
    fn test_vector_round_trip() {
        let n = 4i32.to_le_bytes();
        let pairs: Vec<(TypeTag, &[u8])> = vec![
            (TypeTag::Integer, &n),
            (TypeTag::Json, br#"{"test":"value"}"#),
            (TypeTag::Xml, b"<doc/>"),
        ];
        let encoded = encode_vector(&pairs).unwrap();
        assert_eq!(encoded.vec_count, 3);

        let item = decode(&desc_for(&encoded), encoded.bytes.clone()).unwrap();
        assert!(item.is_vector());
        assert_eq!(item.values.len(), 3);
        assert_eq!(item.values[0].tag, TypeTag::Integer);
        assert_eq!(item.values[0].bytes, n);
        assert_eq!(item.values[1].tag, TypeTag::Json);
        assert_eq!(item.values[2].bytes, b"<doc/>");
    }

    #[test]
    fn test_vector_all_or_nothing() {
        let n = 4i32.to_le_bytes();
        let bad: Vec<(TypeTag, &[u8])> = vec![
            (TypeTag::Integer, &n),
            (TypeTag::Integer, b"bad"), // 3 bytes is not an integer width
        ];
        assert!(matches!(
            encode_vector(&bad),
            Err(ShqError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let encoded = encode_scalar(TypeTag::Stream, b"payload").unwrap();
        let mut corrupted = encoded.bytes.clone();
        corrupted[0] ^= 0xFF;
        assert!(matches!(
            decode(&desc_for(&encoded), corrupted),
            Err(ShqError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_truncated_vector() {
        let pairs: Vec<(TypeTag, &[u8])> = vec![(TypeTag::Ascii, b"abc")];
        let encoded = encode_vector(&pairs).unwrap();
        let mut desc = desc_for(&encoded);
        desc.vec_count = 2; // claims more entries than the payload holds
        assert!(decode(&desc, encoded.bytes.clone()).is_err());
    }
}
