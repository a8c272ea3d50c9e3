//! Timestep compaction: turns one entity's sparse observation history into a
//! dense, forward-filled grid.

use std::collections::BTreeMap;

/// A row that sits on the provider's timestep grid.
pub trait Timestepped: Clone {
    fn timestep(&self) -> i64;

    /// Copy of `self` relabelled to `timestep`; every other value is kept.
    fn with_timestep(&self, timestep: i64) -> Self;
}

/// Forward-fill `history` over timesteps `0..max_timesteps`.
///
/// A timestep with an observation emits that observation (the first one in
/// input order when several share a timestep). A timestep without one repeats
/// the last emitted row relabelled to the current timestep. Nothing is emitted
/// before the first real observation, so the output holds at most
/// `max_timesteps` rows. `history` must belong to a single entity.
pub fn compact<T: Timestepped>(history: &[T], max_timesteps: u32) -> Vec<T> {
    let mut by_timestep: BTreeMap<i64, &T> = BTreeMap::new();
    for row in history {
        by_timestep.entry(row.timestep()).or_insert(row);
    }

    let mut dense: Vec<T> = Vec::with_capacity(max_timesteps as usize);
    for timestep in 0..i64::from(max_timesteps) {
        let next = match by_timestep.get(&timestep) {
            Some(observed) => (*observed).clone(),
            None => match dense.last() {
                Some(last) => last.with_timestep(timestep),
                None => continue,
            },
        };
        dense.push(next);
    }
    dense
}
