//! Number Pools
//!
//! Allocation of volume numbers within a resource definition and of
//! cluster-unique DRBD minor numbers.

use crate::error::{Error, Result};
use crate::model::{
    MinorNumber, ResourceName, VolumeNumber, MINOR_NR_MAX, MINOR_NR_MIN, VOLUME_NR_MAX,
    VOLUME_NR_MIN,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// First minor number handed out by automatic allocation
pub const MINOR_NR_AUTO_BASE: u32 = 1000;

/// Smallest volume number not in `used` and not in `reserved`
pub fn next_free_volume_number(
    resource: &ResourceName,
    used: &BTreeSet<VolumeNumber>,
    reserved: &BTreeSet<VolumeNumber>,
) -> Result<VolumeNumber> {
    (VOLUME_NR_MIN..=VOLUME_NR_MAX)
        .map(|nr| VolumeNumber::new(nr as i64))
        .filter_map(Result::ok)
        .find(|nr| !used.contains(nr) && !reserved.contains(nr))
        .ok_or_else(|| Error::VolumeNumberPoolExhausted {
            resource: resource.to_string(),
        })
}

/// Cluster-wide pool of minor numbers
///
/// Reservations are visible to every concurrent request as soon as they
/// are made; an aborted request gives its numbers back.
#[derive(Debug)]
pub struct MinorNumberPool {
    range_min: u32,
    range_max: u32,
    auto_base: u32,
    used: Mutex<BTreeSet<u32>>,
}

pub type MinorNumberPoolRef = Arc<MinorNumberPool>;

impl Default for MinorNumberPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MinorNumberPool {
    pub fn new() -> Self {
        Self::with_range(MINOR_NR_MIN, MINOR_NR_MAX, MINOR_NR_AUTO_BASE)
    }

    /// Pool limited to a sub-range, mainly for tests
    pub fn with_range(range_min: u32, range_max: u32, auto_base: u32) -> Self {
        Self {
            range_min,
            range_max,
            auto_base: auto_base.clamp(range_min, range_max),
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Mark numbers of already committed volume definitions as taken
    pub fn rebuild(&self, in_use: impl IntoIterator<Item = MinorNumber>) {
        let mut used = self.used.lock();
        used.clear();
        used.extend(in_use.into_iter().map(|nr| nr.value()));
        debug!(count = used.len(), "Rebuilt minor number pool");
    }

    /// Reserve a given number, or the smallest free one from the auto base
    pub fn reserve(&self, requested: Option<u32>) -> Result<MinorNumber> {
        let mut used = self.used.lock();
        match requested {
            Some(value) => {
                let nr = MinorNumber::new(value as i64)?;
                if value < self.range_min || value > self.range_max {
                    return Err(Error::InvalidMinorNumber {
                        value: value as i64,
                        reason: format!(
                            "must be in range {} - {}",
                            self.range_min, self.range_max
                        ),
                    });
                }
                if !used.insert(value) {
                    return Err(Error::InvalidMinorNumber {
                        value: value as i64,
                        reason: "already in use".to_string(),
                    });
                }
                Ok(nr)
            }
            None => {
                let free = (self.auto_base..=self.range_max)
                    .find(|nr| !used.contains(nr))
                    .ok_or(Error::MinorNumberPoolExhausted {
                        min: self.auto_base,
                        max: self.range_max,
                    })?;
                used.insert(free);
                MinorNumber::new(free as i64)
            }
        }
    }

    pub fn release(&self, nr: MinorNumber) {
        self.used.lock().remove(&nr.value());
    }

    pub fn is_reserved(&self, nr: MinorNumber) -> bool {
        self.used.lock().contains(&nr.value())
    }

    pub fn reserved_count(&self) -> usize {
        self.used.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn vnrs(values: &[i64]) -> BTreeSet<VolumeNumber> {
        values.iter().map(|v| VolumeNumber::new(*v).unwrap()).collect()
    }

    #[test]
    fn test_next_free_volume_number_fills_gaps() {
        let rsc = ResourceName::new("rsc1").unwrap();
        let nr = next_free_volume_number(&rsc, &vnrs(&[0, 2]), &BTreeSet::new()).unwrap();
        assert_eq!(nr.value(), 1);

        let nr = next_free_volume_number(&rsc, &vnrs(&[0, 2]), &vnrs(&[1])).unwrap();
        assert_eq!(nr.value(), 3);
    }

    #[test]
    fn test_volume_numbers_exhausted() {
        let rsc = ResourceName::new("rsc1").unwrap();
        let all: BTreeSet<VolumeNumber> = (VOLUME_NR_MIN..=VOLUME_NR_MAX)
            .map(|v| VolumeNumber::new(v as i64).unwrap())
            .collect();
        assert_matches!(
            next_free_volume_number(&rsc, &all, &BTreeSet::new()),
            Err(Error::VolumeNumberPoolExhausted { .. })
        );
    }

    #[test]
    fn test_auto_minor_starts_at_base() {
        let pool = MinorNumberPool::new();
        assert_eq!(pool.reserve(None).unwrap().value(), 1000);
        assert_eq!(pool.reserve(None).unwrap().value(), 1001);

        pool.release(MinorNumber::new(1000).unwrap());
        assert_eq!(pool.reserve(None).unwrap().value(), 1000);
    }

    #[test]
    fn test_explicit_minor_unique() {
        let pool = MinorNumberPool::new();
        assert_eq!(pool.reserve(Some(7)).unwrap().value(), 7);
        assert_matches!(pool.reserve(Some(7)), Err(Error::InvalidMinorNumber { .. }));
        assert_matches!(
            pool.reserve(Some(MINOR_NR_MAX + 1)),
            Err(Error::InvalidMinorNumber { .. })
        );
    }

    #[test]
    fn test_minor_pool_exhaustion() {
        let pool = MinorNumberPool::with_range(0, 1001, 1000);
        pool.reserve(None).unwrap();
        pool.reserve(None).unwrap();
        assert_matches!(
            pool.reserve(None),
            Err(Error::MinorNumberPoolExhausted { min: 1000, max: 1001 })
        );
        // explicit numbers below the auto base are still available
        assert!(pool.reserve(Some(5)).is_ok());
    }

    #[test]
    fn test_rebuild() {
        let pool = MinorNumberPool::new();
        pool.rebuild(vec![MinorNumber::new(1000).unwrap(), MinorNumber::new(1001).unwrap()]);
        assert_eq!(pool.reserve(None).unwrap().value(), 1002);
        assert_eq!(pool.reserved_count(), 3);
    }
}
