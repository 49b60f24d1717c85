//! Repository — single authoritative source of fleet state.
//!
//! All mutations happen under one writer lock, so observers never see a
//! target assigned to two flasks. Assignment is held as a pair of maps
//! (flask → targets, target → owner) kept in sync inside the write section.
//! Every mutation emits a [`ChangeNotification`] on a broadcast channel.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::types::*;

const DEFAULT_EVENT_CAPACITY: usize = 100;
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct FleetState {
    flasks: HashMap<FlaskId, Flask>,
    targets: HashMap<TargetId, Target>,
    /// flask → targets it monitors.
    assignments: HashMap<FlaskId, BTreeSet<TargetId>>,
    /// target → the flask monitoring it.
    owners: HashMap<TargetId, FlaskId>,
    /// Targets waiting for capacity.
    unassigned: BTreeSet<TargetId>,
    /// Bounded ring of recent lifecycle events, newest last.
    events: VecDeque<LifecycleEvent>,
    /// Telemetry keys known per flask, keyed by key name.
    keys: HashMap<FlaskId, BTreeMap<String, Key>>,
}

/// In-memory store of flasks, targets, assignments, and recent events.
pub struct Repository {
    inner: RwLock<FleetState>,
    changes: broadcast::Sender<ChangeNotification>,
    event_capacity: usize,
}

impl Repository {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(event_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(FleetState::default()),
            changes,
            event_capacity,
        }
    }

    /// Subscribe to mutation notifications. Each call returns an independent
    /// receiver; the stream ends when the repository is dropped.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    fn notify(&self, notification: ChangeNotification) {
        // No receivers is fine; nobody is watching yet.
        let _ = self.changes.send(notification);
    }

    // ── Capacity ───────────────────────────────────────────────────

    /// Register a new Active flask.
    ///
    /// Re-registering a Terminated id revives it with a fresh key set; any
    /// other existing state is a conflict.
    pub async fn increase_capacity(&self, flask: Flask) -> StateResult<()> {
        let id = flask.id.clone();
        {
            let mut state = self.inner.write().await;
            if let Some(existing) = state.flasks.get(&id) {
                if existing.state != FlaskState::Terminated {
                    return Err(StateError::AlreadyKnown(id));
                }
            }
            state.keys.remove(&id);
            state.assignments.entry(id.clone()).or_default();
            state.flasks.insert(
                id.clone(),
                Flask {
                    state: FlaskState::Active,
                    ..flask
                },
            );
        }
        debug!(flask = %id, "flask registered");
        self.notify(ChangeNotification::FlaskRegistered(id));
        Ok(())
    }

    /// Transition a flask to Terminated and return the targets it held,
    /// which move to the unassigned pool pending repartition. Idempotent:
    /// a second call (or an unknown id) returns an empty set.
    pub async fn decrease_capacity(&self, id: &str) -> Vec<Target> {
        let freed = {
            let mut state = self.inner.write().await;
            let Some(flask) = state.flasks.get_mut(id) else {
                return Vec::new();
            };
            if flask.state == FlaskState::Terminated {
                return Vec::new();
            }
            flask.state = FlaskState::Terminated;

            let held = state.assignments.remove(id).unwrap_or_default();
            for target_id in &held {
                state.owners.remove(target_id);
                state.unassigned.insert(target_id.clone());
            }
            // Key emission is per flask lifetime; a revived flask starts over.
            state.keys.remove(id);

            held.iter()
                .filter_map(|target_id| state.targets.get(target_id).cloned())
                .collect()
        };
        self.notify(ChangeNotification::FlaskStateChanged(
            id.to_string(),
            FlaskState::Terminated,
        ));
        freed
    }

    pub async fn set_flask_state(&self, id: &str, flask_state: FlaskState) -> bool {
        let changed = {
            let mut state = self.inner.write().await;
            match state.flasks.get_mut(id) {
                Some(flask) if flask.state != flask_state => {
                    flask.state = flask_state;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(ChangeNotification::FlaskStateChanged(
                id.to_string(),
                flask_state,
            ));
        }
        changed
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Insert (or refresh) a target. An unowned target joins the unassigned
    /// pool; re-adding an already assigned target keeps its owner.
    pub async fn add_instance(&self, target: Target) {
        let id = target.id.clone();
        {
            let mut state = self.inner.write().await;
            if !state.owners.contains_key(&id) {
                state.unassigned.insert(id.clone());
            }
            state.targets.insert(id.clone(), target);
        }
        self.notify(ChangeNotification::TargetAdded(id));
    }

    /// Remove a target everywhere. Returns the flask that held it, if any,
    /// so the caller can instruct that flask to stop monitoring.
    pub async fn remove_instance(&self, id: &str) -> Option<FlaskId> {
        let owner = {
            let mut state = self.inner.write().await;
            state.targets.remove(id);
            state.unassigned.remove(id);
            let owner = state.owners.remove(id);
            if let Some(flask_id) = &owner {
                if let Some(held) = state.assignments.get_mut(flask_id) {
                    held.remove(id);
                }
            }
            owner
        };
        self.notify(ChangeNotification::TargetRemoved(id.to_string()));
        owner
    }

    // ── Assignment ─────────────────────────────────────────────────

    pub async fn assigned_targets(&self, flask_id: &str) -> Vec<Target> {
        let state = self.inner.read().await;
        state
            .assignments
            .get(flask_id)
            .map(|held| {
                held.iter()
                    .filter_map(|target_id| state.targets.get(target_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Atomically replace the assignment of every flask listed in the delta.
    ///
    /// A target moved between listed flasks changes owner in the same write
    /// section, so no observer sees it twice. A target dropped by a listed
    /// flask and not re-listed returns to the unassigned pool. Entries for
    /// flasks that are unknown or Terminated are skipped with a warning.
    /// Applying the same delta twice is a no-op.
    pub async fn merge_distribution(&self, delta: &Distribution) {
        {
            let mut state = self.inner.write().await;

            let accepted: Vec<&FlaskId> = delta
                .keys()
                .filter(|flask_id| {
                    let ok = state.flasks.get(*flask_id).is_some_and(|f| {
                        f.state == FlaskState::Active || f.state == FlaskState::Investigating
                    });
                    if !ok {
                        warn!(flask = %flask_id, "dropping delta entry for ineligible flask");
                    }
                    ok
                })
                .collect();

            // Detach current holdings of every listed flask first, so moves
            // between listed flasks cannot double-assign.
            for flask_id in &accepted {
                if let Some(held) = state.assignments.remove(*flask_id) {
                    for target_id in held {
                        state.owners.remove(&target_id);
                        state.unassigned.insert(target_id);
                    }
                }
            }

            for flask_id in &accepted {
                let mut held = BTreeSet::new();
                for target in &delta[*flask_id] {
                    // Steal from an unlisted owner if the strategy moved it.
                    if let Some(previous) = state.owners.get(&target.id).cloned() {
                        if previous != **flask_id {
                            if let Some(theirs) = state.assignments.get_mut(&previous) {
                                theirs.remove(&target.id);
                            }
                        }
                    }
                    state.targets.entry(target.id.clone()).or_insert_with(|| target.clone());
                    state.owners.insert(target.id.clone(), (*flask_id).clone());
                    state.unassigned.remove(&target.id);
                    held.insert(target.id.clone());
                }
                state.assignments.insert((*flask_id).clone(), held);
            }
        }
        self.notify(ChangeNotification::DistributionMerged);
    }

    // ── Events ─────────────────────────────────────────────────────

    pub async fn add_event(&self, event: LifecycleEvent) {
        {
            let mut state = self.inner.write().await;
            state.events.push_back(event);
            while state.events.len() > self.event_capacity {
                state.events.pop_front();
            }
        }
        self.notify(ChangeNotification::EventRecorded);
    }

    /// The retained event ring, oldest first.
    pub async fn recent_events(&self) -> Vec<LifecycleEvent> {
        let state = self.inner.read().await;
        state.events.iter().cloned().collect()
    }

    // ── Telemetry keys ─────────────────────────────────────────────

    /// Record a key reported by a flask. Returns true iff the key name is
    /// new for that flask, the basis of at-most-once NewKey emission.
    pub async fn record_key(&self, flask_id: &str, key: Key) -> bool {
        let name = key.name.clone();
        let is_new = {
            let mut state = self.inner.write().await;
            state
                .keys
                .entry(flask_id.to_string())
                .or_default()
                .insert(name.clone(), key)
                .is_none()
        };
        if is_new {
            self.notify(ChangeNotification::KeyRecorded(flask_id.to_string(), name));
        }
        is_new
    }

    pub async fn keys_for(&self, flask_id: &str) -> Vec<Key> {
        let state = self.inner.read().await;
        state
            .keys
            .get(flask_id)
            .map(|keys| keys.values().cloned().collect())
            .unwrap_or_default()
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn flask(&self, id: &str) -> Option<Flask> {
        self.inner.read().await.flasks.get(id).cloned()
    }

    pub async fn target(&self, id: &str) -> Option<Target> {
        self.inner.read().await.targets.get(id).cloned()
    }

    pub async fn flasks(&self) -> Vec<Flask> {
        let mut all: Vec<Flask> = self.inner.read().await.flasks.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn active_flasks(&self) -> Vec<Flask> {
        let mut active: Vec<Flask> = self
            .inner
            .read()
            .await
            .flasks
            .values()
            .filter(|f| f.eligible())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub async fn unassigned_targets(&self) -> Vec<Target> {
        let state = self.inner.read().await;
        state
            .unassigned
            .iter()
            .filter_map(|target_id| state.targets.get(target_id).cloned())
            .collect()
    }

    /// Immutable view for the sharding strategies: the Active flasks (sorted
    /// ascending) and their current holdings.
    pub async fn shard_snapshot(&self) -> ShardSnapshot {
        let state = self.inner.read().await;
        let mut active: Vec<FlaskId> = state
            .flasks
            .values()
            .filter(|f| f.eligible())
            .map(|f| f.id.clone())
            .collect();
        active.sort();

        let mut assignments = BTreeMap::new();
        for flask_id in &active {
            let held: Vec<Target> = state
                .assignments
                .get(flask_id)
                .map(|held| {
                    held.iter()
                        .filter_map(|target_id| state.targets.get(target_id).cloned())
                        .collect()
                })
                .unwrap_or_default();
            assignments.insert(flask_id.clone(), held);
        }

        ShardSnapshot { active, assignments }
    }

    /// Full assignment view for the admin API, including Investigating
    /// flasks still holding shards.
    pub async fn shard_view(&self) -> BTreeMap<FlaskId, Vec<Target>> {
        let state = self.inner.read().await;
        state
            .assignments
            .iter()
            .map(|(flask_id, held)| {
                let targets = held
                    .iter()
                    .filter_map(|target_id| state.targets.get(target_id).cloned())
                    .collect();
                (flask_id.clone(), targets)
            })
            .collect()
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}
