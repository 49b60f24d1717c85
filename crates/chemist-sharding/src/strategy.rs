//! Placement strategies.
//!
//! A strategy chooses an Active flask for each not-yet-assigned target and
//! returns the resulting delta: the full replacement assignment for every
//! affected flask. Strategies never touch live state: they work on a
//! snapshot and the repository applies the delta atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use chemist_state::{Distribution, FlaskId, ShardSnapshot, Target};

/// Pluggable placement logic.
pub trait ShardingStrategy: Send + Sync {
    /// Name of the strategy for logging and identification.
    fn name(&self) -> &'static str;

    /// Choose a flask for each target in `new`.
    ///
    /// Targets already assigned in the snapshot are skipped; an empty Active
    /// set yields an empty delta and the targets stay in the unassigned pool.
    fn locate_and_assign(&self, new: &[Target], snapshot: &ShardSnapshot) -> Distribution;
}

/// Route each assignable target via `pick`, which receives the sorted Active
/// flask list and the current per-flask loads (existing + routed this call).
fn route(
    new: &[Target],
    snapshot: &ShardSnapshot,
    mut pick: impl FnMut(&[FlaskId], &BTreeMap<FlaskId, usize>) -> usize,
) -> Distribution {
    if snapshot.active.is_empty() {
        return Distribution::new();
    }

    let already_assigned = snapshot.assigned_ids();
    let mut loads: BTreeMap<FlaskId, usize> = snapshot
        .active
        .iter()
        .map(|flask_id| (flask_id.clone(), snapshot.load(flask_id)))
        .collect();

    let mut routed: BTreeMap<FlaskId, Vec<Target>> = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for target in new {
        if already_assigned.contains(&target.id) || !seen.insert(target.id.clone()) {
            continue;
        }
        let index = pick(&snapshot.active, &loads);
        let flask_id = snapshot.active[index].clone();
        *loads.entry(flask_id.clone()).or_insert(0) += 1;
        routed.entry(flask_id).or_default().push(target.clone());
    }

    // Expand to full replacement sets: what the flask holds now, plus the
    // targets routed to it in this call.
    routed
        .into_iter()
        .map(|(flask_id, mut added)| {
            let mut full = snapshot
                .assignments
                .get(&flask_id)
                .cloned()
                .unwrap_or_default();
            full.append(&mut added);
            (flask_id, full)
        })
        .collect()
}

/// Uniformly random placement. Seedable for deterministic tests.
pub struct RandomSharder {
    rng: Mutex<StdRng>,
}

impl RandomSharder {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomSharder {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardingStrategy for RandomSharder {
    fn name(&self) -> &'static str {
        "random"
    }

    fn locate_and_assign(&self, new: &[Target], snapshot: &ShardSnapshot) -> Distribution {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        route(new, snapshot, |active, _| rng.gen_range(0..active.len()))
    }
}

/// Placement onto the least loaded Active flask, counting targets routed
/// earlier in the same call. Ties break by ascending flask id.
pub struct LeastLoadedSharder;

impl ShardingStrategy for LeastLoadedSharder {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn locate_and_assign(&self, new: &[Target], snapshot: &ShardSnapshot) -> Distribution {
        route(new, snapshot, |active, loads| {
            // `active` is sorted ascending, so the first minimum wins ties.
            active
                .iter()
                .enumerate()
                .min_by_key(|(_, flask_id)| loads.get(*flask_id).copied().unwrap_or(0))
                .map(|(index, _)| index)
                .unwrap_or(0)
        })
    }
}
