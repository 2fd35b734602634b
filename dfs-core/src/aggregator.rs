//! Client-side fragment catalog
//!
//! Directory entries from every responding node are merged by filename into
//! a [`Catalog`]. A file is complete once each of its four slots was reported
//! by at least one replica; assembly concatenates slots strictly in order.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{trace, warn};

use crate::fragmenter::{PartIndex, FRAGMENT_COUNT};
use crate::protocol::Entry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Parts of {filename} are missing: {missing:?}")]
    MissingParts {
        filename: String,
        missing: Vec<PartIndex>,
    },
}

/// Everything reported so far for one filename
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogEntry {
    parts: [Option<Bytes>; FRAGMENT_COUNT],
}

impl CatalogEntry {
    pub fn part(&self, part: PartIndex) -> Option<&Bytes> {
        self.parts[part.slot()].as_ref()
    }

    /// Size of a reported part, if any replica reported it
    pub fn part_size(&self, part: PartIndex) -> Option<usize> {
        self.part(part).map(Bytes::len)
    }

    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(Option::is_some)
    }

    pub fn missing(&self) -> Vec<PartIndex> {
        PartIndex::ALL
            .into_iter()
            .filter(|part| self.parts[part.slot()].is_none())
            .collect()
    }

    /// Concatenate slots 0..3, or `None` while any slot is empty
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let total = self.parts.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(part);
        }
        Some(out.freeze())
    }
}

/// One line of a `list` result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogListing {
    pub filename: String,
    pub complete: bool,
    pub missing: Vec<PartIndex>,
}

impl fmt::Display for CatalogListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.complete {
            write!(f, "{}", self.filename)
        } else {
            write!(f, "{}\t[incomplete]", self.filename)
        }
    }
}

/// Merged view of all nodes' directory streams for one command
#[derive(Debug, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
    conflicts: usize,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one announced fragment
    ///
    /// A later replica of the same slot replaces the earlier one. Replicas
    /// that disagree are counted as conflicts.
    pub fn ingest(&mut self, entry: Entry) {
        let Entry {
            filename,
            part,
            payload,
        } = entry;

        trace!(filename = %filename, part = %part, size = payload.len(), "Catalog ingest");

        let slot = &mut self.entries.entry(filename.clone()).or_default().parts[part.slot()];
        if let Some(existing) = slot.as_ref() {
            if *existing != payload {
                self.conflicts += 1;
                warn!(
                    filename = %filename,
                    part = %part,
                    existing = existing.len(),
                    incoming = payload.len(),
                    "Replicas disagree, keeping the later one"
                );
            }
        }
        *slot = Some(payload);
    }

    /// Merge a whole node's stream
    pub fn extend(&mut self, entries: impl IntoIterator<Item = Entry>) {
        for entry in entries {
            self.ingest(entry);
        }
    }

    pub fn entry(&self, filename: &str) -> Option<&CatalogEntry> {
        self.entries.get(filename)
    }

    /// Every known filename in order, with its completeness
    pub fn listing(&self) -> Vec<CatalogListing> {
        self.entries
            .iter()
            .map(|(filename, entry)| CatalogListing {
                filename: filename.clone(),
                complete: entry.is_complete(),
                missing: entry.missing(),
            })
            .collect()
    }

    /// Rebuild the original bytes of `filename`
    pub fn assemble(&self, filename: &str) -> Result<Bytes, AggregateError> {
        let entry = self
            .entries
            .get(filename)
            .ok_or_else(|| AggregateError::NotFound(filename.to_string()))?;

        entry.assemble().ok_or_else(|| AggregateError::MissingParts {
            filename: filename.to_string(),
            missing: entry.missing(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of slots where two replicas reported different bytes
    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragmenter::FragmentedFile;
    use crate::placement::{PlacementPlan, NODE_COUNT};

    fn entry(filename: &str, part: u8, payload: &'static [u8]) -> Entry {
        Entry {
            filename: filename.to_string(),
            part: PartIndex::new(part).unwrap(),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = Catalog::new();
        assert!(catalog.is_empty());
        assert!(catalog.listing().is_empty());
        assert_eq!(
            catalog.assemble("x"),
            Err(AggregateError::NotFound("x".to_string()))
        );
    }

    #[test]
    fn test_assembles_in_slot_order_regardless_of_arrival() {
        let mut catalog = Catalog::new();
        catalog.ingest(entry("f", 4, b"dd!"));
        catalog.ingest(entry("f", 2, b"bb"));
        catalog.ingest(entry("f", 1, b"aa"));
        catalog.ingest(entry("f", 3, b"cc"));

        assert_eq!(&catalog.assemble("f").unwrap()[..], b"aabbccdd!");
    }

    #[test]
    fn test_missing_parts_reported() {
        let mut catalog = Catalog::new();
        catalog.ingest(entry("f", 1, b"a"));
        catalog.ingest(entry("f", 3, b"c"));

        let expected = vec![PartIndex::new(2).unwrap(), PartIndex::new(4).unwrap()];
        assert_eq!(
            catalog.assemble("f"),
            Err(AggregateError::MissingParts {
                filename: "f".to_string(),
                missing: expected.clone(),
            })
        );
        assert_eq!(catalog.entry("f").unwrap().missing(), expected);
        assert_eq!(catalog.entry("f").unwrap().part_size(PartIndex::new(1).unwrap()), Some(1));
        assert_eq!(catalog.entry("f").unwrap().part_size(PartIndex::new(2).unwrap()), None);
    }

    #[test]
    fn test_listing_sorted_with_incomplete_marker() {
        let mut catalog = Catalog::new();
        for part in 1..=4 {
            catalog.ingest(entry("zeta", part, b"z"));
        }
        catalog.ingest(entry("alpha", 2, b"a"));

        let listing = catalog.listing();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].to_string(), "alpha\t[incomplete]");
        assert_eq!(listing[1].to_string(), "zeta");
        assert!(listing[1].missing.is_empty());
    }

    #[test]
    fn test_identical_replicas_are_not_conflicts() {
        let mut catalog = Catalog::new();
        catalog.ingest(entry("f", 1, b"same"));
        catalog.ingest(entry("f", 1, b"same"));
        assert_eq!(catalog.conflicts(), 0);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_disagreeing_replicas_last_writer_wins() {
        let mut catalog = Catalog::new();
        catalog.ingest(entry("f", 1, b"old"));
        catalog.ingest(entry("f", 1, b"new"));

        assert_eq!(catalog.conflicts(), 1);
        assert_eq!(
            &catalog.entry("f").unwrap().part(PartIndex::new(1).unwrap()).unwrap()[..],
            b"new"
        );
    }

    #[test]
    fn test_empty_fragments_still_count_as_present() {
        let mut catalog = Catalog::new();
        for part in 1..=4 {
            catalog.ingest(entry("empty", part, b""));
        }
        assert!(catalog.entry("empty").unwrap().is_complete());
        assert!(catalog.assemble("empty").unwrap().is_empty());
    }

    #[test]
    fn test_merge_of_placed_replicas_rebuilds_file() {
        let content: Vec<u8> = (0..1027u32).map(|i| (i * 31 % 256) as u8).collect();
        let file = FragmentedFile::new(content.clone());
        let plan = PlacementPlan::new(file.variant());

        let mut catalog = Catalog::new();
        for node in 0..NODE_COUNT {
            catalog.extend(plan.for_node(node).map(|part| Entry {
                filename: "data.bin".to_string(),
                part,
                payload: file.part(part).clone(),
            }));
        }

        assert_eq!(catalog.conflicts(), 0);
        assert_eq!(&catalog.assemble("data.bin").unwrap()[..], &content[..]);
    }
}
