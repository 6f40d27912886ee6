use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 256-bit digest.
///
/// Used both as the Merkle commitment over trie nodes and as the key under
/// which encoded nodes are stored in the backing store.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash256 {
    data: [u8; Self::LENGTH],
}

impl Hash256 {
    /// The length of a digest in bytes.
    pub const LENGTH: usize = 32;

    /// The all-zero digest.
    pub const ZERO: Self = Self {
        data: [0; Self::LENGTH],
    };

    /// Creates a digest from a byte array.
    pub const fn new(data: [u8; Self::LENGTH]) -> Self {
        Self { data }
    }

    /// Creates a digest from a byte slice.
    ///
    /// Returns an error if the slice is not exactly [`Self::LENGTH`] bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ParseHashError> {
        if slice.len() != Self::LENGTH {
            return Err(ParseHashError::InvalidLength(slice.len()));
        }
        let mut data = [0u8; Self::LENGTH];
        data.copy_from_slice(slice);
        Ok(Self { data })
    }

    /// Returns the digest as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Converts the digest to a byte array.
    pub fn to_array(self) -> [u8; Self::LENGTH] {
        self.data
    }

    /// Converts the digest to an owned byte vector.
    pub fn to_vec(self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Whether this is the all-zero digest.
    pub fn is_zero(&self) -> bool {
        self.data == [0; Self::LENGTH]
    }
}

impl From<[u8; Hash256::LENGTH]> for Hash256 {
    fn from(data: [u8; Hash256::LENGTH]) -> Self {
        Self { data }
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.data))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl FromStr for Hash256 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != Self::LENGTH * 2 {
            return Err(ParseHashError::InvalidLength(s.len() / 2));
        }
        let bytes = hex::decode(s).map_err(|_| ParseHashError::InvalidHex)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error parsing a [`Hash256`] from bytes or hexadecimal text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseHashError {
    /// The input was not exactly 32 bytes long.
    #[error("invalid digest length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
    /// The input was not valid hexadecimal.
    #[error("invalid hexadecimal string")]
    InvalidHex,
}
