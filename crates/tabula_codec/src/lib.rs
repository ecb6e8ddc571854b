//! # Tabula Codec
//!
//! Record and key encoding for Tabula.
//!
//! - [`Bean`] - a record value with a one-byte format tag, usually stored as CBOR
//! - [`TableKey`] - an order-preserving key encoding plus a stable lock hash
//!
//! ## Usage
//!
//! ```
//! use tabula_codec::{Bean, TableKey};
//!
//! let bytes = String::from("hello").marshal().unwrap();
//! assert_eq!(String::unmarshal(&bytes).unwrap(), "hello");
//!
//! assert!(3u64.encode_key() < 10u64.encode_key());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bean;
mod error;
mod key;

pub use bean::{marshal_serde, unmarshal_serde, Bean};
pub use error::{CodecError, CodecResult};
pub use key::TableKey;
