//! Table keys.

use crate::error::{CodecError, CodecResult};
use std::fmt::Debug;
use std::hash::Hash;

/// A record key.
///
/// `encode_key` must preserve order: for any `a < b`,
/// `a.encode_key() < b.encode_key()` bytewise. Storage walks rely on this.
pub trait TableKey: Clone + Eq + Ord + Hash + Debug + Send + Sync + 'static {
    /// Encodes the key for storage.
    fn encode_key(&self) -> Vec<u8>;

    /// Decodes a key produced by [`TableKey::encode_key`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid key encoding.
    fn decode_key(bytes: &[u8]) -> CodecResult<Self>;

    /// Stable 32-bit hash used to pick a lock slot.
    ///
    /// Must not depend on process state, so the same key maps to the same
    /// slot in every run.
    fn lock_hash(&self) -> u32 {
        self.encode_key()
            .iter()
            .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> CodecResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| CodecError::invalid_key(format!("expected {} bytes, got {}", N, bytes.len())))
}

impl TableKey for u64 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CodecResult<Self> {
        Ok(u64::from_be_bytes(fixed(bytes)?))
    }

    fn lock_hash(&self) -> u32 {
        (*self as u32) ^ ((*self >> 32) as u32)
    }
}

impl TableKey for u32 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CodecResult<Self> {
        Ok(u32::from_be_bytes(fixed(bytes)?))
    }

    fn lock_hash(&self) -> u32 {
        *self
    }
}

impl TableKey for i64 {
    fn encode_key(&self) -> Vec<u8> {
        // Flipping the sign bit makes negatives sort before positives.
        ((*self as u64) ^ (1 << 63)).to_be_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CodecResult<Self> {
        Ok((u64::from_be_bytes(fixed(bytes)?) ^ (1 << 63)) as i64)
    }

    fn lock_hash(&self) -> u32 {
        (*self as u64).lock_hash()
    }
}

impl TableKey for String {
    fn encode_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> CodecResult<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::invalid_key("key is not UTF-8"))
    }
}

impl TableKey for Vec<u8> {
    fn encode_key(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode_key(bytes: &[u8]) -> CodecResult<Self> {
        Ok(bytes.to_vec())
    }
}
