//! Domain types for the chemist fleet model.
//!
//! Flasks are monitoring agents, targets are the application instances they
//! scrape. Both are identified by their cloud instance id. All types are
//! JSON-serializable for the admin API.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Cloud instance id of a monitoring agent.
pub type FlaskId = String;

/// Cloud instance id of a monitored application instance.
pub type TargetId = String;

/// A full replacement assignment for each affected flask.
///
/// Produced by the sharding strategies and applied atomically by
/// [`crate::Repository::merge_distribution`].
pub type Distribution = BTreeMap<FlaskId, Vec<Target>>;

// ── Flasks ─────────────────────────────────────────────────────────

/// Where a flask lives and how to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub datacenter: String,
    pub intent: String,
    /// URI templates with `@host` / `@port` placeholders, expanded against a
    /// target's host and port to produce the URLs the flask scrapes.
    pub templates: Vec<String>,
}

impl Location {
    /// Root URL of the flask's admin endpoint.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Lifecycle state of a flask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlaskState {
    Unknown,
    Active,
    Investigating,
    Terminated,
}

/// A monitoring agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flask {
    pub id: FlaskId,
    pub location: Location,
    pub state: FlaskState,
}

impl Flask {
    /// Whether this flask may receive new assignments.
    pub fn eligible(&self) -> bool {
        self.state == FlaskState::Active
    }
}

// ── Targets ────────────────────────────────────────────────────────

/// An application instance whose metric streams are to be mirrored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub cluster: String,
    /// The target's fingerprint: the concrete URLs a flask scrapes.
    pub uris: BTreeSet<String>,
}

// ── Lifecycle events ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Launch,
    Terminate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Launch => "Launch",
            EventKind::Terminate => "Terminate",
        }
    }
}

/// One auto-scaling event, as retained in the repository's ring for
/// operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub asg: String,
    pub instance_id: String,
    pub time: String,
}

// ── Telemetry keys ─────────────────────────────────────────────────

/// How a metric key is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reportable {
    B,
    D,
    S,
    Stats,
}

/// SI-style magnitude prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Base {
    Zero,
    Kilo,
    Mega,
    Giga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Days,
    Hours,
    Micro,
    Milli,
    Min,
    Nano,
    Sec,
}

/// Units carried on a metric key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    Duration { base: Base, unit: TimeUnit },
    Bytes { base: Base },
    Count,
    Ratio,
    TrafficLight,
    Healthy,
    Load,
    None,
}

/// Metric metadata reported by a flask over telemetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Key {
    pub name: String,
    pub reportable: Reportable,
    pub units: Units,
    pub description: String,
    pub attributes: BTreeMap<String, String>,
}

/// A telemetry error record: which flask reports, what failed, about whom.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Names {
    pub mine: String,
    pub kind: String,
    pub theirs: String,
}

// ── Change notifications ───────────────────────────────────────────

/// Emitted on every repository mutation. Subscribers (notably the telemetry
/// fan-in) react to flask arrivals and departures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotification {
    FlaskRegistered(FlaskId),
    FlaskStateChanged(FlaskId, FlaskState),
    TargetAdded(TargetId),
    TargetRemoved(TargetId),
    DistributionMerged,
    KeyRecorded(FlaskId, String),
    EventRecorded,
}

// ── Shard snapshot ─────────────────────────────────────────────────

/// An immutable view of the assignable fleet, taken under the repository
/// lock and handed to the sharding strategies. `active` is sorted ascending
/// so strategy tie-breaks are deterministic.
#[derive(Debug, Clone, Default)]
pub struct ShardSnapshot {
    pub active: Vec<FlaskId>,
    pub assignments: BTreeMap<FlaskId, Vec<Target>>,
}

impl ShardSnapshot {
    /// Number of targets currently held by a flask.
    pub fn load(&self, id: &str) -> usize {
        self.assignments.get(id).map_or(0, Vec::len)
    }

    /// Ids of every target assigned to any flask in this snapshot.
    pub fn assigned_ids(&self) -> BTreeSet<TargetId> {
        self.assignments
            .values()
            .flat_map(|targets| targets.iter().map(|t| t.id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_target(id: &str) -> Target {
        Target {
            id: id.to_string(),
            cluster: "web".to_string(),
            uris: BTreeSet::from(["http://10.0.0.2:1234/stream/previous".to_string()]),
        }
    }

    #[test]
    fn location_base_url() {
        let location = Location {
            host: "10.0.0.1".to_string(),
            port: 5775,
            protocol: "http".to_string(),
            datacenter: "us-east-1a".to_string(),
            intent: "mirroring".to_string(),
            templates: vec![],
        };
        assert_eq!(location.base_url(), "http://10.0.0.1:5775");
    }

    #[test]
    fn only_active_flasks_are_eligible() {
        let mut flask = Flask {
            id: "f1".to_string(),
            location: Location {
                host: "10.0.0.1".to_string(),
                port: 5775,
                protocol: "http".to_string(),
                datacenter: "dc".to_string(),
                intent: "mirroring".to_string(),
                templates: vec![],
            },
            state: FlaskState::Active,
        };
        assert!(flask.eligible());

        for state in [FlaskState::Unknown, FlaskState::Investigating, FlaskState::Terminated] {
            flask.state = state;
            assert!(!flask.eligible());
        }
    }

    #[test]
    fn snapshot_load_and_assigned_ids() {
        let mut snapshot = ShardSnapshot::default();
        snapshot.active = vec!["f1".to_string(), "f2".to_string()];
        snapshot
            .assignments
            .insert("f1".to_string(), vec![test_target("t1"), test_target("t2")]);

        assert_eq!(snapshot.load("f1"), 2);
        assert_eq!(snapshot.load("f2"), 0);
        assert_eq!(snapshot.load("nope"), 0);

        let assigned = snapshot.assigned_ids();
        assert!(assigned.contains("t1"));
        assert!(assigned.contains("t2"));
        assert_eq!(assigned.len(), 2);
    }

    #[test]
    fn key_serializes_roundtrip() {
        let key = Key {
            name: "jvm.memory".to_string(),
            reportable: Reportable::Stats,
            units: Units::Bytes { base: Base::Mega },
            description: "heap usage".to_string(),
            attributes: BTreeMap::from([("source".to_string(), "jvm".to_string())]),
        };
        let json = serde_json::to_string(&key).unwrap();
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
