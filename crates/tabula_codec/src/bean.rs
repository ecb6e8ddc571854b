//! Record values.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A record value stored in a table.
///
/// Encoded bytes always start with a one-byte format tag. A type bumps its
/// [`Bean::FORMAT_TAG`] when its layout changes so old bytes are detected
/// instead of misread.
///
/// Most types implement this through [`impl_serde_bean!`](crate::impl_serde_bean),
/// which stores the value as CBOR after the tag.
pub trait Bean: Clone + Send + Sync + 'static {
    /// Layout version written before the payload.
    const FORMAT_TAG: u8 = 0;

    /// Encodes the value, tag included.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    fn marshal(&self) -> CodecResult<Vec<u8>>;

    /// Decodes a value produced by [`Bean::marshal`].
    ///
    /// # Errors
    ///
    /// Returns an error if the tag does not match or the payload is invalid.
    fn unmarshal(bytes: &[u8]) -> CodecResult<Self>;
}

/// Encodes `value` as `[tag][cbor]`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn marshal_serde<T: Serialize>(tag: u8, value: &T) -> CodecResult<Vec<u8>> {
    let mut buf = vec![tag];
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

/// Decodes bytes written by [`marshal_serde`], checking the tag.
///
/// # Errors
///
/// Returns an error for empty input, a tag mismatch, or an invalid payload.
pub fn unmarshal_serde<T: DeserializeOwned>(tag: u8, bytes: &[u8]) -> CodecResult<T> {
    let (&found, payload) = bytes.split_first().ok_or(CodecError::Empty)?;
    if found != tag {
        return Err(CodecError::UnknownFormat {
            expected: tag,
            found,
        });
    }
    ciborium::from_reader(payload).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

/// Implements [`Bean`] for serde types, storing them as tagged CBOR.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use tabula_codec::{impl_serde_bean, Bean};
///
/// #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// struct Player { name: String, level: u32 }
/// impl_serde_bean!(Player, tag = 2);
///
/// let p = Player { name: "ada".into(), level: 7 };
/// assert_eq!(Player::unmarshal(&p.marshal().unwrap()).unwrap(), p);
/// ```
#[macro_export]
macro_rules! impl_serde_bean {
    ($ty:ty) => {
        $crate::impl_serde_bean!($ty, tag = 0);
    };
    ($ty:ty, tag = $tag:expr) => {
        impl $crate::Bean for $ty {
            const FORMAT_TAG: u8 = $tag;

            fn marshal(&self) -> $crate::CodecResult<Vec<u8>> {
                $crate::marshal_serde(Self::FORMAT_TAG, self)
            }

            fn unmarshal(bytes: &[u8]) -> $crate::CodecResult<Self> {
                $crate::unmarshal_serde(Self::FORMAT_TAG, bytes)
            }
        }
    };
}

impl_serde_bean!(String);
impl_serde_bean!(Vec<u8>);
impl_serde_bean!(u64);
impl_serde_bean!(i64);
impl_serde_bean!(u32);
impl_serde_bean!(i32);
impl_serde_bean!(bool);
