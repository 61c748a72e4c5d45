//! Consistent hash ring mapping series keys onto shard groups.
use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;

use crate::backend::Backend;

/// Virtual nodes inserted per shard group unless configured otherwise.
pub const DEFAULT_REPLICAS: usize = 128;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring has no shard groups")]
    Empty,

    #[error("no shard group has a backend")]
    NoBackends,

    #[error("replicas per node must be at least 1")]
    NoReplicas,
}

/// An ordered list of replicas holding the same partition.
pub type ShardGroup = Vec<Arc<dyn Backend>>;

/// One consistent hash ring, owning the shard groups of a measurement prefix.
///
/// Each group index `i` is inserted `replicas` times at `crc32("{j}{i}")` for `j` in
/// `0..replicas`. A key maps to the first position strictly after its own hash, wrapping
/// around to the lowest position. Construction is deterministic: the same group count and
/// replica factor always produce the same mapping.
///
/// A group left without backends keeps its index and its positions, so losing every backend
/// of one group never moves keys between the others.
#[derive(Debug, Clone)]
pub struct Ring {
    positions: BTreeMap<u32, usize>,
    groups: Vec<ShardGroup>,
}

impl Ring {
    pub fn new(groups: Vec<ShardGroup>, replicas: usize) -> Result<Self, RingError> {
        if groups.is_empty() {
            return Err(RingError::Empty);
        }
        if replicas == 0 {
            return Err(RingError::NoReplicas);
        }
        if groups.iter().all(Vec::is_empty) {
            return Err(RingError::NoBackends);
        }

        Ok(Self {
            positions: positions(groups.len(), replicas),
            groups,
        })
    }

    /// Index of the shard group owning `key`.
    pub fn resolve(&self, key: &str) -> usize {
        lookup(&self.positions, key)
    }

    /// Every shard group, in configuration order.
    pub fn shard_groups(&self) -> &[ShardGroup] {
        &self.groups
    }
}

fn positions(groups: usize, replicas: usize) -> BTreeMap<u32, usize> {
    let mut positions = BTreeMap::new();
    for group in 0..groups {
        for replica in 0..replicas {
            let hash = crc32fast::hash(format!("{replica}{group}").as_bytes());
            positions.insert(hash, group);
        }
    }
    positions
}

fn lookup(positions: &BTreeMap<u32, usize>, key: &str) -> usize {
    use std::ops::Bound::{Excluded, Unbounded};

    let hash = crc32fast::hash(key.as_bytes());
    positions
        .range((Excluded(hash), Unbounded))
        .next()
        .or_else(|| positions.iter().next())
        .map(|(_, group)| *group)
        // positions is never empty for a constructed ring
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn groups(n: usize) -> Vec<ShardGroup> {
        (0..n)
            .map(|i| vec![Arc::new(MockBackend::new(format!("b{i}"))) as Arc<dyn Backend>])
            .collect()
    }

    #[test]
    fn construction_errors() {
        assert_matches!(Ring::new(vec![], DEFAULT_REPLICAS), Err(RingError::Empty));
        assert_matches!(Ring::new(groups(2), 0), Err(RingError::NoReplicas));

        assert_matches!(
            Ring::new(vec![vec![], vec![]], DEFAULT_REPLICAS),
            Err(RingError::NoBackends)
        );

        let mut g = groups(2);
        g.push(vec![]);
        let ring = Ring::new(g, DEFAULT_REPLICAS).unwrap();
        assert_eq!(ring.shard_groups().len(), 3);
        assert!(ring.shard_groups()[2].is_empty());
    }

    #[test]
    fn single_group_owns_everything() {
        let ring = Ring::new(groups(1), DEFAULT_REPLICAS).unwrap();
        for key in ["", "cpu,host=a", "mem,host=b,region=eu", "\u{1F600}"] {
            assert_eq!(ring.resolve(key), 0);
        }
        assert_eq!(ring.shard_groups()[ring.resolve("x")][0].name(), "b0");
    }

    #[test]
    fn every_group_receives_keys() {
        let ring = Ring::new(groups(4), DEFAULT_REPLICAS).unwrap();
        let mut hits = [0usize; 4];
        for i in 0..4000 {
            hits[ring.resolve(&format!("cpu,host=server{i:04}"))] += 1;
        }
        assert!(hits.iter().all(|&h| h > 0), "{hits:?}");
    }

    #[test]
    fn growing_the_ring_moves_few_keys() {
        let before = Ring::new(groups(4), DEFAULT_REPLICAS).unwrap();
        let after = Ring::new(groups(5), DEFAULT_REPLICAS).unwrap();

        let total = 5000;
        let moved = (0..total)
            .map(|i| format!("disk,host=h{i},path=/var"))
            .filter(|k| {
                let (b, a) = (before.resolve(k), after.resolve(k));
                // keys only ever move onto the new group
                if b != a {
                    assert_eq!(a, 4, "{k} moved from {b} to {a}");
                }
                b != a
            })
            .count();

        assert!(moved > 0);
        assert!(moved < total / 2, "{moved} of {total} keys moved");
    }

    #[test]
    fn empty_group_keeps_its_keys() {
        let full = Ring::new(groups(3), DEFAULT_REPLICAS).unwrap();
        let mut g = groups(3);
        g[0].clear();
        let degraded = Ring::new(g, DEFAULT_REPLICAS).unwrap();

        let mut orphaned = 0;
        for i in 0..3000 {
            let key = format!("cpu,host=server{i:04}");
            let group = full.resolve(&key);
            assert_eq!(degraded.resolve(&key), group, "{key}");
            if group == 0 {
                orphaned += 1;
            }
        }
        assert!(orphaned > 0);
    }

    proptest! {
        #[test]
        fn resolve_is_deterministic(key in ".*", n in 1usize..8, replicas in 1usize..64) {
            let a = Ring::new(groups(n), replicas).unwrap();
            let b = Ring::new(groups(n), replicas).unwrap();
            let got = a.resolve(&key);
            prop_assert!(got < n);
            prop_assert_eq!(got, a.resolve(&key));
            prop_assert_eq!(got, b.resolve(&key));
        }
    }
}
