//! WinZip AES key strengths and per-entry overhead.

use serde::{Deserialize, Serialize};

/// Length of the password verification value in bytes.
pub const PASSWORD_VERIFIER_LEN: usize = 2;

/// Length of the authentication code in bytes.
pub const AUTH_CODE_LEN: usize = 10;

/// AES key strength used by a WinZip AES encrypted entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AesKeyStrength {
    /// 128 bit key
    Bits128,
    /// 192 bit key
    Bits192,
    /// 256 bit key
    Bits256,
}

impl AesKeyStrength {
    /// Key length in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Bits128 => 16,
            Self::Bits192 => 24,
            Self::Bits256 => 32,
        }
    }

    /// Key length in bits.
    pub const fn bits(self) -> usize {
        self.bytes() * 8
    }

    /// Strength code stored in the WinZip AES extra field.
    pub const fn code(self) -> u8 {
        match self {
            Self::Bits128 => 1,
            Self::Bits192 => 2,
            Self::Bits256 => 3,
        }
    }

    /// Parse a strength code from the WinZip AES extra field.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Bits128),
            2 => Some(Self::Bits192),
            3 => Some(Self::Bits256),
            _ => None,
        }
    }

    /// Length of the salt value in bytes.
    pub const fn salt_len(self) -> usize {
        self.bytes() / 2
    }
}

/// Bytes added to each WinZip AES encrypted entry: salt, password
/// verification value and authentication code.
pub const fn overhead(strength: AesKeyStrength) -> usize {
    strength.salt_len() + PASSWORD_VERIFIER_LEN + AUTH_CODE_LEN
}

/// Predicted stored size of an entry payload of `len` bytes.
pub fn stored_size(len: u64, encryption: Option<AesKeyStrength>) -> u64 {
    match encryption {
        Some(strength) => len + overhead(strength) as u64,
        None => len,
    }
}
