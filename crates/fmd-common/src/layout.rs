//! Layout-id decoding and layout error flags
//!
//! A layout id packs the replication/erasure scheme of a file into 32 bits:
//!
//! | bits  | field                         |
//! |-------|-------------------------------|
//! | 0-3   | checksum type                 |
//! | 4-7   | layout type                   |
//! | 8-15  | stripe number (stripes - 1)   |
//! | 16-19 | block size                    |
//! | 20-23 | block checksum type           |
//! | 24-27 | excess replicas               |
//! | 28-30 | redundancy stripes            |

use crate::checksum::{truncate_hex, ChecksumType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// File layout types
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayoutType {
    Plain,
    Replica,
    Archive,
    RaidDp,
    Raid6,
    Qrain,
    Raid5,
}

impl LayoutType {
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(Self::Plain),
            0x1 => Some(Self::Replica),
            0x2 => Some(Self::Archive),
            0x3 => Some(Self::RaidDp),
            0x4 => Some(Self::Raid6),
            0x5 => Some(Self::Qrain),
            0x6 => Some(Self::Raid5),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Replica => "replica",
            Self::Archive => "archive",
            Self::RaidDp => "raiddp",
            Self::Raid6 => "raid6",
            Self::Qrain => "qrain",
            Self::Raid5 => "raid5",
        }
    }
}

impl fmt::Display for LayoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Block sizes addressable through the block size nibble
const BLOCK_SIZES: [u64; 8] = [
    4 * 1024,
    64 * 1024,
    128 * 1024,
    512 * 1024,
    1024 * 1024,
    4 * 1024 * 1024,
    16 * 1024 * 1024,
    64 * 1024 * 1024,
];

/// Decoded view over a raw layout id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutId(pub u32);

impl LayoutId {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Checksum algorithm of the whole file
    #[must_use]
    pub const fn checksum(&self) -> Option<ChecksumType> {
        ChecksumType::from_code(self.0 & 0xf)
    }

    /// Length of the file checksum in hex characters, 0 when unknown
    #[must_use]
    pub const fn checksum_hex_len(&self) -> usize {
        match self.checksum() {
            Some(xs) => xs.hex_len(),
            None => 0,
        }
    }

    /// Truncate a hex digest to the length implied by the checksum type
    #[must_use]
    pub fn truncate_checksum(&self, hex: &str) -> String {
        truncate_hex(hex, self.checksum_hex_len())
    }

    /// Hex digest of an empty file for this layout's checksum type
    #[must_use]
    pub fn empty_file_checksum(&self) -> Option<&'static str> {
        self.checksum().and_then(|xs| xs.empty_file_hex())
    }

    #[must_use]
    pub const fn layout_type_code(&self) -> u32 {
        (self.0 >> 4) & 0xf
    }

    #[must_use]
    pub const fn layout_type(&self) -> Option<LayoutType> {
        LayoutType::from_code(self.layout_type_code())
    }

    /// Stripe number as encoded, i.e. number of stripes minus one
    #[must_use]
    pub const fn stripe_number(&self) -> u32 {
        (self.0 >> 8) & 0xff
    }

    /// Total number of stripes (replicas) of the layout
    #[must_use]
    pub const fn stripes(&self) -> u32 {
        self.stripe_number() + 1
    }

    /// Number of redundancy stripes for erasure layouts
    #[must_use]
    pub const fn redundancy_stripes(&self) -> u32 {
        (self.0 >> 28) & 0x7
    }

    #[must_use]
    pub const fn excess_replicas(&self) -> u32 {
        (self.0 >> 24) & 0xf
    }

    /// Block size in bytes, 0 for an unknown encoding
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        let idx = ((self.0 >> 16) & 0xf) as usize;
        if idx < BLOCK_SIZES.len() {
            BLOCK_SIZES[idx]
        } else {
            0
        }
    }

    #[must_use]
    pub const fn block_checksum(&self) -> Option<ChecksumType> {
        ChecksumType::from_code((self.0 >> 20) & 0xf)
    }

    /// Erasure-coded layouts: everything above plain and replica
    #[must_use]
    pub const fn is_erasure(&self) -> bool {
        self.layout_type_code() > 0x1
    }

    /// Expected size of one stripe file for a logical file size
    ///
    /// Non-erasure layouts store the full file in every replica.
    #[must_use]
    pub fn stripe_file_size(&self, size: u64) -> u64 {
        if !self.is_erasure() {
            return size;
        }

        let all = u64::from(self.stripes());
        let parity = u64::from(self.redundancy_stripes());

        if parity >= all {
            return size;
        }

        let block = self.block_size();
        let data = all - parity;
        let group = block * data * data;

        if group == 0 {
            return size;
        }

        size.div_ceil(group) * data * block
    }
}

impl From<u32> for LayoutId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A single layout error condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayoutFlag {
    /// Replica on disk without a namespace entry
    Orphan,
    /// Replica on disk that the namespace does not list at this filesystem
    Unregistered,
    /// Number of registered locations differs from the layout's stripes
    ReplicaWrong,
    /// Namespace lists the replica here but nothing is on disk
    Missing,
}

impl LayoutFlag {
    pub const ALL: [Self; 4] = [
        Self::Orphan,
        Self::Unregistered,
        Self::ReplicaWrong,
        Self::Missing,
    ];

    /// Bit used in the persisted `layouterror` field
    #[must_use]
    pub const fn bit(&self) -> u32 {
        match self {
            Self::Orphan => 0x1,
            Self::Unregistered => 0x2,
            Self::ReplicaWrong => 0x4,
            Self::Missing => 0x8,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Orphan => "orphan",
            Self::Unregistered => "unregistered",
            Self::ReplicaWrong => "replica_wrong",
            Self::Missing => "missing",
        }
    }
}

/// Set of layout error flags
///
/// Resync protocols compute a fresh set from evidence and replace the stored
/// one; the only merge operation is [`LayoutErrors::with`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct LayoutErrors(u32);

impl LayoutErrors {
    pub const NONE: Self = Self(0);

    /// Interpret a persisted bitmask, dropping unknown bits
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0xf)
    }

    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn only(flag: LayoutFlag) -> Self {
        Self(flag.bit())
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(&self, flag: LayoutFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    /// True if any of the given flags is set
    #[must_use]
    pub fn intersects(&self, flags: &[LayoutFlag]) -> bool {
        flags.iter().any(|f| self.contains(*f))
    }

    /// Copy of the set with `flag` added
    #[must_use]
    pub const fn with(self, flag: LayoutFlag) -> Self {
        Self(self.0 | flag.bit())
    }

    /// Copy of the set with `flag` removed
    #[must_use]
    pub const fn without(self, flag: LayoutFlag) -> Self {
        Self(self.0 & !flag.bit())
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = LayoutFlag> + '_ {
        LayoutFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }

    /// Derive layout errors for a replica on `fsid` from the namespace view
    ///
    /// A zero layout id means the namespace has no such file.
    #[must_use]
    pub fn derive(lid: LayoutId, locations: &BTreeSet<u32>, fsid: u32) -> Self {
        if lid.raw() == 0 {
            return Self::only(LayoutFlag::Orphan);
        }

        let mut errors = Self::NONE;

        if lid.stripes() as usize != locations.len() {
            errors = errors.with(LayoutFlag::ReplicaWrong);
        }

        if !locations.contains(&fsid) {
            errors = errors.with(LayoutFlag::Unregistered);
        }

        errors
    }
}

impl FromIterator<LayoutFlag> for LayoutErrors {
    fn from_iter<I: IntoIterator<Item = LayoutFlag>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl fmt::Display for LayoutErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = self.iter().map(|flag| flag.name()).collect();
        write!(f, "{}", names.join("|"))
    }
}
