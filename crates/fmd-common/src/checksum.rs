//! Checksum type table
//!
//! The engine never computes digests itself. It only needs to know how long
//! a digest of a given algorithm is, how its hex form is truncated, and what
//! the digest of an empty file looks like.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Checksum algorithms encoded in the low nibble of a layout id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    None,
    Adler,
    Crc32,
    Md5,
    Sha1,
    Crc32c,
    Crc64,
    Sha256,
    Xxhash64,
}

impl ChecksumType {
    /// Decode the checksum code stored in a layout id nibble
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0x1 => Some(Self::None),
            0x2 => Some(Self::Adler),
            0x3 => Some(Self::Crc32),
            0x4 => Some(Self::Md5),
            0x5 => Some(Self::Sha1),
            0x6 => Some(Self::Crc32c),
            0x7 => Some(Self::Crc64),
            0x8 => Some(Self::Sha256),
            0x9 => Some(Self::Xxhash64),
            _ => None,
        }
    }

    /// Code stored in a layout id nibble
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::None => 0x1,
            Self::Adler => 0x2,
            Self::Crc32 => 0x3,
            Self::Md5 => 0x4,
            Self::Sha1 => 0x5,
            Self::Crc32c => 0x6,
            Self::Crc64 => 0x7,
            Self::Sha256 => 0x8,
            Self::Xxhash64 => 0x9,
        }
    }

    /// Name as written in the `user.eos.checksumtype` attribute
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Adler => "adler",
            Self::Crc32 => "crc32",
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Crc32c => "crc32c",
            Self::Crc64 => "crc64",
            Self::Sha256 => "sha256",
            Self::Xxhash64 => "xxhash64",
        }
    }

    /// Digest length in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Adler | Self::Crc32 | Self::Crc32c => 4,
            Self::Crc64 | Self::Xxhash64 => 8,
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Returns true for the pseudo-algorithm that produces no digest
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Digest length in hex characters
    #[must_use]
    pub const fn hex_len(&self) -> usize {
        self.len() * 2
    }

    /// Hex digest of a zero-length file, if the algorithm has one
    #[must_use]
    pub const fn empty_file_hex(&self) -> Option<&'static str> {
        match self {
            Self::Adler => Some("00000001"),
            Self::Crc32 | Self::Crc32c => Some("00000000"),
            Self::Crc64 => Some("0000000000000000"),
            Self::Md5 => Some("d41d8cd98f00b204e9800998ecf8427e"),
            Self::Sha1 => Some("da39a3ee5e6b4b0d3255bfef95601890afd80709"),
            Self::Sha256 => {
                Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
            }
            Self::Xxhash64 => Some("ef46db3751d8e999"),
            Self::None => None,
        }
    }

    /// Hex-encode a binary digest, keeping only the algorithm's length
    #[must_use]
    pub fn hex_from_binary(&self, digest: &[u8]) -> String {
        let len = self.len().min(digest.len());
        hex::encode(&digest[..len])
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ChecksumType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adler" | "adler32" => Ok(Self::Adler),
            "crc32" => Ok(Self::Crc32),
            "crc32c" => Ok(Self::Crc32c),
            "md5" => Ok(Self::Md5),
            "sha" | "sha1" => Ok(Self::Sha1),
            "crc64" => Ok(Self::Crc64),
            "sha256" => Ok(Self::Sha256),
            "xxhash64" => Ok(Self::Xxhash64),
            "none" => Ok(Self::None),
            _ => Err(format!("unknown checksum type: {s}")),
        }
    }
}

/// Truncate a hex digest to at most `hex_len` characters
#[must_use]
pub fn truncate_hex(hex: &str, hex_len: usize) -> String {
    hex.chars().take(hex_len).collect()
}
