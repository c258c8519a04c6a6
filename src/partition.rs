//! Pattern partitions and the reordering that makes them contiguous.
//!
//! Clients may hand partition ids in any interleaving. All partitioned
//! kernels and reducers want `[start, end)` pattern spans, so a stable
//! counting-sort permutation is computed once and applied to every
//! per-pattern array set so far; the forward map is kept so site vectors
//! can be returned in the client's original order. Padding patterns stay
//! where they are and belong to no partition.

use crate::buffers::BufferLayout;
use crate::error::{EngineError, Result};
use std::ops::Range;

#[derive(Debug)]
pub struct PartitionSet {
    count: usize,
    /// Partition boundaries over real patterns; `count + 1` entries.
    starts: Vec<usize>,
    /// `forward[old] = new` position, present only when patterns moved.
    forward: Option<Vec<usize>>,
}

impl PartitionSet {
    /// Validate client ids and derive the partition spans. Returns the
    /// set plus, when ids are interleaved, the permutation
    /// (`perm[new] = old`, identity on padding) to apply to per-pattern
    /// storage.
    pub fn build(
        layout: &BufferLayout,
        partition_count: usize,
        ids: &[i32],
    ) -> Result<(Self, Option<Vec<usize>>)> {
        if partition_count == 0 {
            return Err(EngineError::InvalidConfiguration(
                "partition count must be at least one",
            ));
        }
        if ids.len() != layout.pattern_count {
            return Err(EngineError::InvalidDimension {
                what: "pattern partitions",
                expected: layout.pattern_count,
                got: ids.len(),
            });
        }
        let mut counts = vec![0usize; partition_count];
        for &id in ids {
            if id < 0 || id as usize >= partition_count {
                return Err(EngineError::OutOfRange {
                    what: "partition id",
                    index: if id < 0 { usize::MAX } else { id as usize },
                    count: partition_count,
                });
            }
            counts[id as usize] += 1;
        }
        let mut starts = vec![0usize; partition_count + 1];
        for q in 0..partition_count {
            starts[q + 1] = starts[q] + counts[q];
        }

        // stable counting sort: perm[new] = old
        let mut next = starts[..partition_count].to_vec();
        let mut perm = vec![0usize; layout.padded_pattern_count];
        let mut forward = vec![0usize; layout.padded_pattern_count];
        for (old, &id) in ids.iter().enumerate() {
            let new = next[id as usize];
            next[id as usize] += 1;
            perm[new] = old;
            forward[old] = new;
        }
        for p in layout.pattern_count..layout.padded_pattern_count {
            perm[p] = p;
            forward[p] = p;
        }
        let identity = perm.iter().enumerate().all(|(new, &old)| new == old);

        let set = PartitionSet {
            count: partition_count,
            starts,
            forward: if identity { None } else { Some(forward) },
        };
        Ok((set, if identity { None } else { Some(perm) }))
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Pattern span of one partition (over real patterns).
    pub fn range(&self, partition: usize) -> Result<Range<usize>> {
        if partition >= self.count {
            return Err(EngineError::OutOfRange {
                what: "partition",
                index: partition,
                count: self.count,
            });
        }
        Ok(self.starts[partition]..self.starts[partition + 1])
    }

    /// Where an original pattern index lives after reordering.
    #[inline]
    pub fn forward(&self, old_pattern: usize) -> usize {
        match &self.forward {
            Some(map) => map[old_pattern],
            None => old_pattern,
        }
    }

    pub fn reordered(&self) -> bool {
        self.forward.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferLayout;

    #[test]
    fn contiguous_ids_need_no_permutation() {
        let layout = BufferLayout::new::<f64>(4, 6, 1);
        let (set, perm) = PartitionSet::build(&layout, 2, &[0, 0, 0, 1, 1, 1]).unwrap();
        assert!(perm.is_none());
        assert!(!set.reordered());
        assert_eq!(set.range(0).unwrap(), 0..3);
        assert_eq!(set.range(1).unwrap(), 3..6);
    }

    #[test]
    fn interleaved_ids_sort_stably() {
        let layout = BufferLayout::new::<f64>(4, 6, 1);
        let (set, perm) = PartitionSet::build(&layout, 2, &[1, 0, 1, 0, 0, 1]).unwrap();
        let perm = perm.unwrap();
        // partition 0 keeps old order 1, 3, 4; partition 1 keeps 0, 2, 5
        assert_eq!(&perm[..6], &[1, 3, 4, 0, 2, 5]);
        assert_eq!(set.range(0).unwrap(), 0..3);
        assert_eq!(set.range(1).unwrap(), 3..6);
        assert_eq!(set.forward(0), 3);
        assert_eq!(set.forward(1), 0);
        assert_eq!(set.forward(5), 5);
    }

    #[test]
    fn bad_ids_are_rejected() {
        let layout = BufferLayout::new::<f64>(4, 4, 1);
        assert!(PartitionSet::build(&layout, 2, &[0, 1, 2, 0]).is_err());
        assert!(PartitionSet::build(&layout, 2, &[0, -1, 1, 0]).is_err());
        assert!(PartitionSet::build(&layout, 2, &[0, 1]).is_err());
        assert!(PartitionSet::build(&layout, 0, &[0, 0, 0, 0]).is_err());
    }
}
