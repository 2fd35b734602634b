//! File fragmentation and placement variant derivation
//!
//! A file is cut into four contiguous fragments. Slots 1-3 hold exactly
//! `len / 4` bytes each; slot 4 also absorbs the `len % 4` remainder. The
//! placement variant comes from the last hex nybble of the MD5 digest of the
//! whole content, so identical bytes always land on the same nodes.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Number of fragments every file is split into
pub const FRAGMENT_COUNT: usize = 4;

/// Number of distinct placement variants
pub const VARIANT_COUNT: u8 = 4;

/// Granularity of digest updates (result is identical to a one-shot MD5)
pub const DIGEST_CHUNK_SIZE: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid part index: {0:?}")]
pub struct InvalidPartIndex(pub String);

/// 1-based fragment index, always within `1..=4`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartIndex(u8);

impl PartIndex {
    pub const ALL: [PartIndex; FRAGMENT_COUNT] =
        [PartIndex(1), PartIndex(2), PartIndex(3), PartIndex(4)];

    /// Wrap a wire-level (1-based) index
    pub fn new(index: u8) -> Option<Self> {
        (1..=FRAGMENT_COUNT as u8)
            .contains(&index)
            .then_some(Self(index))
    }

    /// Build from a 0-based slot number
    pub fn from_slot(slot: usize) -> Self {
        assert!(slot < FRAGMENT_COUNT, "slot must be less than {}", FRAGMENT_COUNT);
        Self(slot as u8 + 1)
    }

    /// 1-based value used on the wire and on disk
    pub fn get(self) -> u8 {
        self.0
    }

    /// 0-based slot number
    pub fn slot(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for PartIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PartIndex {
    type Err = InvalidPartIndex;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u8>()
            .ok()
            .and_then(PartIndex::new)
            .ok_or_else(|| InvalidPartIndex(s.to_string()))
    }
}

/// Placement variant `v` in `[0, 4)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variant(u8);

impl Variant {
    pub fn new(v: u8) -> Option<Self> {
        (v < VARIANT_COUNT).then_some(Self(v))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Derive the variant from a hex digest string: last nybble, mod 4
    pub fn from_digest_hex(digest_hex: &str) -> Option<Self> {
        let nybble = digest_hex.chars().last()?.to_digit(16)?;
        Some(Self((nybble % VARIANT_COUNT as u32) as u8))
    }

    /// Same as [`Variant::from_digest_hex`] on the raw digest bytes
    pub fn from_digest(digest: &[u8; 16]) -> Self {
        Self((digest[15] & 0x0f) % VARIANT_COUNT)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MD5 of `content`, fed to the hasher in [`DIGEST_CHUNK_SIZE`] updates
pub fn md5_digest(content: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for chunk in content.chunks(DIGEST_CHUNK_SIZE) {
        hasher.update(chunk);
    }

    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// `(offset, length)` of each slot for a file of `len` bytes
pub fn fragment_ranges(len: usize) -> [(usize, usize); FRAGMENT_COUNT] {
    let part_size = len / FRAGMENT_COUNT;
    let remainder = len % FRAGMENT_COUNT;

    std::array::from_fn(|slot| {
        let offset = slot * part_size;
        if slot == FRAGMENT_COUNT - 1 {
            (offset, part_size + remainder)
        } else {
            (offset, part_size)
        }
    })
}

/// A file split into its four fragments, plus its placement variant
#[derive(Debug, Clone)]
pub struct FragmentedFile {
    digest: [u8; 16],
    variant: Variant,
    parts: [Bytes; FRAGMENT_COUNT],
    len: usize,
}

impl FragmentedFile {
    /// Fragment in-memory content (fragments share the original buffer)
    pub fn new(content: impl Into<Bytes>) -> Self {
        let content: Bytes = content.into();
        let digest = md5_digest(&content);
        let variant = Variant::from_digest(&digest);
        let parts = fragment_ranges(content.len())
            .map(|(offset, length)| content.slice(offset..offset + length));

        Self {
            digest,
            variant,
            parts,
            len: content.len(),
        }
    }

    /// Read a whole file from disk and fragment it
    ///
    /// Fails without producing any fragment if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let content = tokio::fs::read(path.as_ref()).await?;
        Ok(Self::new(content))
    }

    pub fn digest(&self) -> &[u8; 16] {
        &self.digest
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn part(&self, part: PartIndex) -> &Bytes {
        &self.parts[part.slot()]
    }

    pub fn parts(&self) -> &[Bytes; FRAGMENT_COUNT] {
        &self.parts
    }

    /// Total size of the original content
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
