use std::sync::Arc;

use crate::col::{map_new, HashMap};
use crate::error::{Result, SimError};
use crate::primitives::{FVal, Time};
use crate::vehicle::{Fleet, VehIdx};

/// A V2G market-clearing strategy: given the eligible vehicles, the station's
/// available capacity, the current time and the demand ratio, produce one
/// allocation value per eligible vehicle.
pub type AllocFn =
    dyn Fn(&Fleet, &[VehIdx], FVal, Time, FVal) -> Result<Vec<FVal>> + Send + Sync;

/// Named pool of allocation strategies. Constructed once at config-load time
/// and handed to station construction by reference; resolving an unknown name
/// is a [SimError::NotFound].
pub struct AllocPool {
    by_name: HashMap<String, Arc<AllocFn>>,
}

impl AllocPool {
    pub fn with_defaults() -> Self {
        let mut pool = Self { by_name: map_new() };
        // The empty name is a placeholder for stations that never clear a
        // market (fast stations); invoking it is always an error.
        pool.add("", Arc::new(|_fleet, _vids, _cap, _t, _ratio| {
            Err(SimError::Allocation(
                "the placeholder strategy cannot clear a market".to_string(),
            ))
        }));
        pool.add("Average", Arc::new(|_fleet, vids, _cap, _t, ratio| {
            Ok(vec![ratio; vids.len()])
        }));
        pool
    }

    pub fn add(&mut self, name: &str, alloc: Arc<AllocFn>) {
        self.by_name.insert(name.to_string(), alloc);
    }

    pub fn get(&self, name: &str) -> Result<Arc<AllocFn>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| SimError::NotFound(format!("V2G allocation strategy '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_gives_equal_ratio_to_everyone() {
        let pool = AllocPool::with_defaults();
        let alloc = pool.get("Average").unwrap();
        let fleet = Fleet::new();
        let vids = vec![VehIdx(0), VehIdx(1), VehIdx(2)];
        let out = alloc(&fleet, &vids, 5.0, 0, 0.4).unwrap();
        assert_eq!(out, vec![0.4, 0.4, 0.4]);
        assert!(alloc(&fleet, &[], 5.0, 0, 0.4).unwrap().is_empty());
    }

    #[test]
    fn placeholder_always_fails() {
        let pool = AllocPool::with_defaults();
        let alloc = pool.get("").unwrap();
        let fleet = Fleet::new();
        assert!(matches!(
            alloc(&fleet, &[VehIdx(0)], 1.0, 0, 1.0),
            Err(SimError::Allocation(_))
        ));
    }

    #[test]
    fn unknown_strategy_is_not_found() {
        let pool = AllocPool::with_defaults();
        assert!(matches!(pool.get("Bogus"), Err(SimError::NotFound(_))));
    }
}
