//! Replica placement
//!
//! Node `i` stores slots `(4 + i - v) % 4` and `(5 + i - v) % 4` of a file
//! with variant `v`. Every slot ends up on exactly two distinct nodes and
//! every node holds exactly two distinct slots.

use crate::fragmenter::{PartIndex, Variant, FRAGMENT_COUNT};

/// Number of storage nodes in a cluster
pub const NODE_COUNT: usize = 4;

/// Number of nodes holding each slot
pub const REPLICATION_FACTOR: usize = 2;

/// Number of slots each node receives per file
pub const SLOTS_PER_NODE: usize = 2;

/// The two parts node `node_index` must store for a file with `variant`
pub fn assign(node_index: usize, variant: Variant) -> (PartIndex, PartIndex) {
    assert!(
        node_index < NODE_COUNT,
        "node index must be less than {}",
        NODE_COUNT
    );
    let v = variant.get() as usize;
    let p1 = (FRAGMENT_COUNT + node_index - v) % FRAGMENT_COUNT;
    let p2 = (FRAGMENT_COUNT + 1 + node_index - v) % FRAGMENT_COUNT;

    (PartIndex::from_slot(p1), PartIndex::from_slot(p2))
}

/// The two node indices that hold `part` for a file with `variant`
pub fn holders(part: PartIndex, variant: Variant) -> [usize; REPLICATION_FACTOR] {
    let s = part.slot();
    let v = variant.get() as usize;
    [(s + v) % NODE_COUNT, (s + v + NODE_COUNT - 1) % NODE_COUNT]
}

/// Per-node assignments for one variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementPlan {
    variant: Variant,
    assignments: [(PartIndex, PartIndex); NODE_COUNT],
}

impl PlacementPlan {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            assignments: std::array::from_fn(|node| assign(node, variant)),
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn for_node(&self, node_index: usize) -> [PartIndex; SLOTS_PER_NODE] {
        let (a, b) = self.assignments[node_index];
        [a, b]
    }

    pub fn holders(&self, part: PartIndex) -> [usize; REPLICATION_FACTOR] {
        holders(part, self.variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> impl Iterator<Item = Variant> {
        (0..4).filter_map(Variant::new)
    }

    #[test]
    fn test_reference_example() {
        // digest ending in '7' -> v = 3; node 0 gets slots 1 and 2 (parts 2 and 3)
        let v = Variant::from_digest_hex("7").unwrap();
        let (a, b) = assign(0, v);
        assert_eq!((a.slot(), b.slot()), (1, 2));
        assert_eq!((a.get(), b.get()), (2, 3));
    }

    #[test]
    fn test_each_node_holds_two_distinct_slots() {
        for v in all_variants() {
            for node in 0..NODE_COUNT {
                let (a, b) = assign(node, v);
                assert_ne!(a, b, "node {} variant {}", node, v);
            }
        }
    }

    #[test]
    fn test_every_slot_replicated_exactly_twice() {
        for v in all_variants() {
            let mut counts = [0usize; FRAGMENT_COUNT];
            for node in 0..NODE_COUNT {
                let (a, b) = assign(node, v);
                counts[a.slot()] += 1;
                counts[b.slot()] += 1;
            }
            assert_eq!(counts, [REPLICATION_FACTOR; FRAGMENT_COUNT], "variant {}", v);
        }
    }

    #[test]
    fn test_holders_match_assignments() {
        for v in all_variants() {
            let plan = PlacementPlan::new(v);
            for part in PartIndex::ALL {
                let [h1, h2] = plan.holders(part);
                assert_ne!(h1, h2);
                assert!(plan.for_node(h1).contains(&part));
                assert!(plan.for_node(h2).contains(&part));
            }
        }
    }

    #[test]
    fn test_variant_zero_layout() {
        let plan = PlacementPlan::new(Variant::new(0).unwrap());
        let slots: Vec<(usize, usize)> = (0..NODE_COUNT)
            .map(|n| {
                let [a, b] = plan.for_node(n);
                (a.slot(), b.slot())
            })
            .collect();
        assert_eq!(slots, vec![(0, 1), (1, 2), (2, 3), (3, 0)]);
    }

    #[test]
    #[should_panic(expected = "node index must be less than 4")]
    fn test_node_index_out_of_range() {
        assign(4, Variant::new(0).unwrap());
    }
}
