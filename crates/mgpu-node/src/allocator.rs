//! Local GPU reservation bookkeeping: which of this node's GPUs are
//! currently claimed by a running job.

use std::collections::HashSet;

use crate::error::AllocatorError;

/// Tracks which of a node's GPUs are free, scoped to one node — the
/// single-node counterpart of the master's node-wide registry.
#[derive(Debug, Clone)]
pub struct GpuAllocator {
    total: HashSet<u32>,
    available: HashSet<u32>,
}

impl Default for GpuAllocator {
    fn default() -> Self {
        Self::all_free(std::iter::empty())
    }
}

impl GpuAllocator {
    /// Build an allocator from the node's full GPU set and the subset of
    /// it considered free at startup.
    #[must_use]
    pub fn new(total: impl IntoIterator<Item = u32>, available: impl IntoIterator<Item = u32>) -> Self {
        let total: HashSet<u32> = total.into_iter().collect();
        let available: HashSet<u32> = available
            .into_iter()
            .filter(|g| total.contains(g))
            .collect();
        Self { total, available }
    }

    /// An allocator with every GPU in `total` free.
    #[must_use]
    pub fn all_free(total: impl IntoIterator<Item = u32>) -> Self {
        let total: HashSet<u32> = total.into_iter().collect();
        let available = total.clone();
        Self { total, available }
    }

    /// Total GPU count on the node.
    #[must_use]
    pub fn total_count(&self) -> u32 {
        u32::try_from(self.total.len()).unwrap_or(u32::MAX)
    }

    /// Currently free GPU indices, in ascending order.
    #[must_use]
    pub fn available(&self) -> Vec<u32> {
        let mut gpus: Vec<u32> = self.available.iter().copied().collect();
        gpus.sort_unstable();
        gpus
    }

    /// Reserve a set of GPU indices for a job about to be spawned.
    ///
    /// # Errors
    ///
    /// Returns [`AllocatorError::Unavailable`] if any requested index is
    /// unknown or already reserved; no indices are reserved in that case.
    pub fn reserve(&mut self, gpus: &[u32]) -> Result<(), AllocatorError> {
        let missing: Vec<u32> = gpus
            .iter()
            .copied()
            .filter(|g| !self.available.contains(g))
            .collect();
        if !missing.is_empty() {
            return Err(AllocatorError::Unavailable(missing));
        }
        for g in gpus {
            self.available.remove(g);
        }
        Ok(())
    }

    /// Release a set of GPU indices back to the free pool.
    pub fn release(&mut self, gpus: &[u32]) {
        for g in gpus {
            if self.total.contains(g) {
                self.available.insert(*g);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_free_starts_with_everything_available() {
        let allocator = GpuAllocator::all_free([0, 1, 2]);
        assert_eq!(allocator.available(), vec![0, 1, 2]);
        assert_eq!(allocator.total_count(), 3);
    }

    #[test]
    fn new_restricts_availability_to_the_given_subset() {
        let allocator = GpuAllocator::new([0, 1, 2], [0, 2]);
        assert_eq!(allocator.available(), vec![0, 2]);
        assert_eq!(allocator.total_count(), 3);
    }

    #[test]
    fn reserve_removes_from_available() {
        let mut allocator = GpuAllocator::all_free([0, 1]);
        allocator.reserve(&[0]).expect("reserves");
        assert_eq!(allocator.available(), vec![1]);
    }

    #[test]
    fn reserve_rejects_unavailable_indices_without_partial_effect() {
        let mut allocator = GpuAllocator::all_free([0, 1]);
        allocator.reserve(&[0]).expect("reserves");
        let err = allocator.reserve(&[0, 1]).unwrap_err();
        assert!(matches!(err, AllocatorError::Unavailable(ref v) if v == &[0]));
        // GPU 1 was not consumed by the failed attempt.
        assert_eq!(allocator.available(), vec![1]);
    }

    #[test]
    fn release_returns_gpus_to_the_pool() {
        let mut allocator = GpuAllocator::all_free([0, 1]);
        allocator.reserve(&[0, 1]).expect("reserves");
        assert!(allocator.available().is_empty());
        allocator.release(&[0]);
        assert_eq!(allocator.available(), vec![0]);
    }

    #[test]
    fn release_ignores_unknown_indices() {
        let mut allocator = GpuAllocator::all_free([0]);
        allocator.release(&[7]);
        assert_eq!(allocator.available(), vec![0]);
    }
}
