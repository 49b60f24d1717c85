//! The lifecycle state machine.
//!
//! Interpretation is split in two: [`Interpreter::plan`] classifies a
//! message into a [`Mutation`] descriptor without touching state, and
//! [`Interpreter::apply`] performs the repository mutation and derives the
//! resulting [`Action`]. The run loop applies both and routes actions to
//! the distribute sink.

use std::sync::Arc;

use tracing::{debug, warn};

use chemist_discovery::{target_from_instance, Discovery, DiscoveryError, Instance};
use chemist_sharding::ShardingStrategy;
use chemist_state::{
    Distribution, Flask, FlaskId, FlaskState, Location, Repository, StateError, Target, TargetId,
};

use crate::error::LifecycleResult;
use crate::message::CloudMessage;

/// What the interpreter tells the outside world to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NoOp,
    /// Push this delta to the affected flasks. An empty delta means the
    /// fleet had no capacity and the targets wait in the unassigned pool.
    Redistributed(Distribution),
}

/// The repository mutation a message calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    RegisterFlask(Flask),
    AddTarget(Target),
    RetireFlask(FlaskId),
    RemoveTarget(TargetId),
    Ignore,
}

/// Result of applying a mutation.
#[derive(Debug)]
pub struct Outcome {
    pub action: Action,
    /// A terminated target's former owner, which must be told to stop.
    pub released: Option<(Flask, Target)>,
}

impl Outcome {
    fn noop() -> Self {
        Self {
            action: Action::NoOp,
            released: None,
        }
    }

    fn redistributed(delta: Distribution) -> Self {
        Self {
            action: Action::Redistributed(delta),
            released: None,
        }
    }
}

/// Translates lifecycle messages into repository mutations and actions.
pub struct Interpreter {
    repo: Arc<Repository>,
    discovery: Arc<dyn Discovery>,
    strategy: Arc<dyn ShardingStrategy>,
    /// Telemetry port assumed for flasks discovered from the cloud.
    funnel_port: u16,
    /// Templates expanded against discovered target instances.
    templates: Vec<String>,
}

impl Interpreter {
    pub fn new(
        repo: Arc<Repository>,
        discovery: Arc<dyn Discovery>,
        strategy: Arc<dyn ShardingStrategy>,
        funnel_port: u16,
        templates: Vec<String>,
    ) -> Self {
        Self {
            repo,
            discovery,
            strategy,
            funnel_port,
            templates,
        }
    }

    pub async fn interpret(&self, message: &CloudMessage) -> LifecycleResult<Outcome> {
        let mutation = self.plan(message).await?;
        self.apply(mutation).await
    }

    /// Classify a message into the mutation it calls for.
    pub async fn plan(&self, message: &CloudMessage) -> LifecycleResult<Mutation> {
        match message.kind.as_str() {
            "Launch" => match self.discovery.lookup_one(&message.instance_id).await {
                Ok(instance) if instance.is_flask() => {
                    Ok(Mutation::RegisterFlask(self.flask_from_instance(&instance)))
                }
                Ok(instance) => Ok(Mutation::AddTarget(target_from_instance(
                    &instance,
                    &self.templates,
                ))),
                Err(DiscoveryError::NotFound(id)) => {
                    // The machine is already gone: a race with Terminate.
                    warn!(instance = %id, "launched instance vanished before lookup");
                    Ok(Mutation::Ignore)
                }
                Err(e) => Err(e.into()),
            },
            "Terminate" => {
                let id = &message.instance_id;
                if self.repo.flask(id).await.is_some() {
                    Ok(Mutation::RetireFlask(id.clone()))
                } else if self.repo.target(id).await.is_some() {
                    Ok(Mutation::RemoveTarget(id.clone()))
                } else {
                    debug!(instance = %id, "terminate for unknown instance");
                    Ok(Mutation::Ignore)
                }
            }
            other => {
                debug!(kind = %other, "ignoring lifecycle message kind");
                Ok(Mutation::Ignore)
            }
        }
    }

    /// Apply a mutation to the repository and derive the action.
    pub async fn apply(&self, mutation: Mutation) -> LifecycleResult<Outcome> {
        match mutation {
            Mutation::RegisterFlask(flask) => {
                let id = flask.id.clone();
                match self.repo.increase_capacity(flask).await {
                    Ok(()) => {
                        // New capacity: drain whatever is waiting.
                        let unassigned = self.repo.unassigned_targets().await;
                        if unassigned.is_empty() {
                            return Ok(Outcome::noop());
                        }
                        Ok(Outcome::redistributed(self.assign(&unassigned).await))
                    }
                    Err(StateError::AlreadyKnown(id)) => {
                        warn!(flask = %id, "duplicate flask launch ignored");
                        Ok(Outcome::noop())
                    }
                    Err(e) => {
                        warn!(flask = %id, error = %e, "flask registration failed");
                        Err(e.into())
                    }
                }
            }
            Mutation::AddTarget(target) => {
                self.repo.add_instance(target.clone()).await;
                Ok(Outcome::redistributed(self.assign(&[target]).await))
            }
            Mutation::RetireFlask(id) => {
                let freed = self.repo.decrease_capacity(&id).await;
                debug!(flask = %id, freed = freed.len(), "flask retired");
                Ok(Outcome::redistributed(self.assign(&freed).await))
            }
            Mutation::RemoveTarget(id) => {
                let target = self.repo.target(&id).await;
                let owner = self.repo.remove_instance(&id).await;
                let released = match (owner, target) {
                    (Some(flask_id), Some(target)) => self
                        .repo
                        .flask(&flask_id)
                        .await
                        .map(|flask| (flask, target)),
                    _ => None,
                };
                Ok(Outcome {
                    action: Action::NoOp,
                    released,
                })
            }
            Mutation::Ignore => Ok(Outcome::noop()),
        }
    }

    /// Run the strategy over `new` and write the delta through.
    async fn assign(&self, new: &[Target]) -> Distribution {
        let snapshot = self.repo.shard_snapshot().await;
        let delta = self.strategy.locate_and_assign(new, &snapshot);
        if delta.is_empty() && !new.is_empty() {
            warn!(
                targets = new.len(),
                "no active flasks, targets stay unassigned"
            );
        }
        self.repo.merge_distribution(&delta).await;
        delta
    }

    fn flask_from_instance(&self, instance: &Instance) -> Flask {
        Flask {
            id: instance.id.clone(),
            location: Location {
                host: instance.host.clone(),
                port: self.funnel_port,
                protocol: "http".to_string(),
                datacenter: instance.asg.clone(),
                intent: "mirroring".to_string(),
                templates: self.templates.clone(),
            },
            state: FlaskState::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemist_discovery::StaticDiscovery;
    use chemist_sharding::LeastLoadedSharder;
    use std::collections::HashMap;

    const TEMPLATE: &str = "http://@host:@port/stream/previous";

    struct Fixture {
        repo: Arc<Repository>,
        discovery: Arc<StaticDiscovery>,
        interpreter: Interpreter,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(Repository::new());
        let discovery = Arc::new(StaticDiscovery::new());
        let interpreter = Interpreter::new(
            repo.clone(),
            discovery.clone(),
            Arc::new(LeastLoadedSharder),
            5775,
            vec![TEMPLATE.to_string()],
        );
        Fixture {
            repo,
            discovery,
            interpreter,
        }
    }

    fn instance(id: &str, type_tag: Option<&str>, host: &str) -> Instance {
        let mut tags = HashMap::new();
        if let Some(t) = type_tag {
            tags.insert("type".to_string(), t.to_string());
        }
        Instance {
            id: id.to_string(),
            tags,
            host: host.to_string(),
            port: 1234,
            asg: "web-asg".to_string(),
        }
    }

    fn launch(id: &str) -> CloudMessage {
        CloudMessage {
            kind: "Launch".to_string(),
            asg: "web-asg".to_string(),
            instance_id: id.to_string(),
            time: "2020-01-01T00:00:00Z".to_string(),
        }
    }

    fn terminate(id: &str) -> CloudMessage {
        CloudMessage {
            kind: "Terminate".to_string(),
            ..launch(id)
        }
    }

    #[tokio::test]
    async fn launch_flask_registers_capacity() {
        let f = fixture();
        f.discovery
            .insert(instance("f1", Some("flask"), "10.0.0.1"))
            .await;

        let outcome = f.interpreter.interpret(&launch("f1")).await.unwrap();

        assert_eq!(outcome.action, Action::NoOp);
        let flask = f.repo.flask("f1").await.unwrap();
        assert_eq!(flask.state, FlaskState::Active);
        assert_eq!(flask.location.port, 5775);
        assert_eq!(flask.location.host, "10.0.0.1");
    }

    #[tokio::test]
    async fn launch_flask_drains_unassigned_pool() {
        let f = fixture();
        f.discovery
            .insert(instance("t1", None, "10.0.0.2"))
            .await;
        f.discovery
            .insert(instance("f1", Some("flask"), "10.0.0.1"))
            .await;

        // Target first: nobody to hold it.
        let outcome = f.interpreter.interpret(&launch("t1")).await.unwrap();
        assert_eq!(outcome.action, Action::Redistributed(Distribution::new()));
        assert_eq!(f.repo.unassigned_targets().await.len(), 1);

        // Flask arrives and picks it up.
        let outcome = f.interpreter.interpret(&launch("f1")).await.unwrap();
        match outcome.action {
            Action::Redistributed(delta) => assert_eq!(delta["f1"].len(), 1),
            other => panic!("expected redistribution, got {other:?}"),
        }
        assert_eq!(f.repo.assigned_targets("f1").await.len(), 1);
        assert!(f.repo.unassigned_targets().await.is_empty());
    }

    #[tokio::test]
    async fn launch_target_assigns_to_active_flask() {
        let f = fixture();
        f.discovery
            .insert(instance("f1", Some("flask"), "10.0.0.1"))
            .await;
        f.discovery
            .insert(instance("t1", None, "10.0.0.2"))
            .await;
        f.interpreter.interpret(&launch("f1")).await.unwrap();

        let outcome = f.interpreter.interpret(&launch("t1")).await.unwrap();

        match outcome.action {
            Action::Redistributed(delta) => {
                let uris = &delta["f1"][0].uris;
                assert!(uris.contains("http://10.0.0.2:1234/stream/previous"));
            }
            other => panic!("expected redistribution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_flask_launch_is_a_noop() {
        let f = fixture();
        f.discovery
            .insert(instance("f1", Some("flask"), "10.0.0.1"))
            .await;

        f.interpreter.interpret(&launch("f1")).await.unwrap();
        let outcome = f.interpreter.interpret(&launch("f1")).await.unwrap();

        assert_eq!(outcome.action, Action::NoOp);
        assert_eq!(f.repo.active_flasks().await.len(), 1);
    }

    #[tokio::test]
    async fn terminate_flask_repartitions_its_targets() {
        let f = fixture();
        for (id, tag, host) in [
            ("f1", Some("flask"), "10.0.0.1"),
            ("f2", Some("flask"), "10.0.0.3"),
            ("t1", None, "10.0.0.2"),
        ] {
            f.discovery.insert(instance(id, tag, host)).await;
        }
        f.interpreter.interpret(&launch("f1")).await.unwrap();
        f.interpreter.interpret(&launch("t1")).await.unwrap();
        f.interpreter.interpret(&launch("f2")).await.unwrap();

        let holder = if f.repo.assigned_targets("f1").await.len() == 1 {
            "f1"
        } else {
            "f2"
        };
        let survivor = if holder == "f1" { "f2" } else { "f1" };

        let outcome = f.interpreter.interpret(&terminate(holder)).await.unwrap();

        assert!(matches!(outcome.action, Action::Redistributed(_)));
        assert_eq!(f.repo.assigned_targets(survivor).await.len(), 1);
        assert_eq!(
            f.repo.flask(holder).await.unwrap().state,
            FlaskState::Terminated
        );
    }

    #[tokio::test]
    async fn terminate_last_flask_parks_targets() {
        let f = fixture();
        f.discovery
            .insert(instance("f1", Some("flask"), "10.0.0.1"))
            .await;
        f.discovery
            .insert(instance("t1", None, "10.0.0.2"))
            .await;
        f.interpreter.interpret(&launch("f1")).await.unwrap();
        f.interpreter.interpret(&launch("t1")).await.unwrap();

        let outcome = f.interpreter.interpret(&terminate("f1")).await.unwrap();

        assert_eq!(outcome.action, Action::Redistributed(Distribution::new()));
        assert_eq!(f.repo.unassigned_targets().await.len(), 1);
    }

    #[tokio::test]
    async fn terminate_target_releases_its_owner() {
        let f = fixture();
        f.discovery
            .insert(instance("f1", Some("flask"), "10.0.0.1"))
            .await;
        f.discovery
            .insert(instance("t1", None, "10.0.0.2"))
            .await;
        f.interpreter.interpret(&launch("f1")).await.unwrap();
        f.interpreter.interpret(&launch("t1")).await.unwrap();

        let outcome = f.interpreter.interpret(&terminate("t1")).await.unwrap();

        assert_eq!(outcome.action, Action::NoOp);
        let (flask, target) = outcome.released.expect("owner should be released");
        assert_eq!(flask.id, "f1");
        assert_eq!(target.id, "t1");
        assert!(f.repo.target("t1").await.is_none());
    }

    #[tokio::test]
    async fn terminate_unknown_instance_is_a_noop() {
        let f = fixture();
        let outcome = f.interpreter.interpret(&terminate("ghost")).await.unwrap();
        assert_eq!(outcome.action, Action::NoOp);
        assert!(outcome.released.is_none());
    }

    #[tokio::test]
    async fn launch_of_vanished_instance_is_a_noop() {
        let f = fixture();
        // Nothing in discovery: the instance raced a Terminate.
        let outcome = f.interpreter.interpret(&launch("i-gone")).await.unwrap();
        assert_eq!(outcome.action, Action::NoOp);
    }

    #[tokio::test]
    async fn unrelated_kinds_are_noops() {
        let f = fixture();
        let msg = CloudMessage {
            kind: "TestNotification".to_string(),
            ..launch("i-1")
        };
        let outcome = f.interpreter.interpret(&msg).await.unwrap();
        assert_eq!(outcome.action, Action::NoOp);
    }

    #[tokio::test]
    async fn plan_is_pure_classification() {
        let f = fixture();
        f.discovery
            .insert(instance("t1", None, "10.0.0.2"))
            .await;

        let mutation = f.interpreter.plan(&launch("t1")).await.unwrap();
        assert!(matches!(mutation, Mutation::AddTarget(_)));
        // Planning alone must not touch the repository.
        assert!(f.repo.target("t1").await.is_none());
    }
}
