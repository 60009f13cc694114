//! ZIP-family size accounting for nestfs.
//!
//! Archive headers that carry a size field ahead of the payload need the
//! final stored size before the entry is written. This crate predicts it
//! for WinZip AES encrypted entries:
//!
//! - [`AesKeyStrength`]: the key strengths WinZip AES supports
//! - [`overhead`]: bytes added to each encrypted entry
//! - [`stored_size`]: payload size plus encryption overhead

pub mod aes;

pub use aes::{overhead, stored_size, AesKeyStrength};
