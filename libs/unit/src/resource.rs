//! Resource tuples used for reservations and machine capacity.

use serde::{Deserialize, Serialize};

/// Resources kept back for the host itself on every machine.
pub const HOST_RESERVED: ResourceTuple = ResourceTuple {
    cores: 100,
    memory_mb: 256,
    disk_mb: 0,
};

/// `{cores, memory, disk}`; cores are counted in hundredths of a core.
///
/// The derived ordering is lexicographic (cores, memory, disk) and is only
/// used for deterministic tie-breaking, never to decide whether one tuple
/// fits in another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceTuple {
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl ResourceTuple {
    pub const fn new(cores: u32, memory_mb: u64, disk_mb: u64) -> Self {
        Self {
            cores,
            memory_mb,
            disk_mb,
        }
    }

    /// True when every dimension is zero.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// True when `self` is at least `other` on every dimension.
    pub fn dominates(&self, other: &ResourceTuple) -> bool {
        self.cores >= other.cores && self.memory_mb >= other.memory_mb && self.disk_mb >= other.disk_mb
    }

    /// Component-wise sum.
    pub fn saturating_add(&self, other: &ResourceTuple) -> Self {
        Self {
            cores: self.cores.saturating_add(other.cores),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
        }
    }

    /// Component-wise difference, floored at zero.
    pub fn saturating_sub(&self, other: &ResourceTuple) -> Self {
        Self {
            cores: self.cores.saturating_sub(other.cores),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
        }
    }
}

impl std::iter::Sum for ResourceTuple {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, r| acc.saturating_add(&r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dominates_requires_every_dimension() {
        let free = ResourceTuple::new(200, 1024, 0);
        assert!(free.dominates(&ResourceTuple::new(100, 512, 0)));
        assert!(!free.dominates(&ResourceTuple::new(100, 512, 1)));
        assert!(!free.dominates(&ResourceTuple::new(300, 0, 0)));
        assert!(free.dominates(&ResourceTuple::default()));
    }

    #[test]
    fn test_sub_saturates() {
        let a = ResourceTuple::new(100, 256, 10);
        let b = ResourceTuple::new(150, 100, 10);
        assert_eq!(a.saturating_sub(&b), ResourceTuple::new(0, 156, 0));
    }

    #[test]
    fn test_sum() {
        let total: ResourceTuple = [ResourceTuple::new(1, 2, 3), ResourceTuple::new(10, 20, 30)]
            .into_iter()
            .sum();
        assert_eq!(total, ResourceTuple::new(11, 22, 33));
        assert!(!total.is_empty());
        assert!(ResourceTuple::default().is_empty());
    }
}
