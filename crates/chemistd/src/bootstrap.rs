//! Seeding the fleet model from configuration.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use chemist_core::{ChemistConfig, FlaskSeed, InstanceSeed, StrategyKind};
use chemist_discovery::{Instance, StaticDiscovery};
use chemist_sharding::{LeastLoadedSharder, RandomSharder, ShardingStrategy};
use chemist_state::{Distribution, Flask, FlaskState, Location, Repository, Target};

pub fn flask_from_seed(id: &str, seed: &FlaskSeed) -> Flask {
    Flask {
        id: id.to_string(),
        location: Location {
            host: seed.location.host.clone(),
            port: seed.location.port,
            protocol: seed.location.protocol.clone(),
            datacenter: seed.location.datacenter.clone(),
            intent: seed.location.intent.clone(),
            templates: seed.location.target_resource_templates.clone(),
        },
        state: FlaskState::Active,
    }
}

pub fn target_from_seed(id: &str, seed: &InstanceSeed) -> Target {
    Target {
        id: id.to_string(),
        cluster: seed.cluster_name.clone(),
        uris: seed.uris.iter().cloned().collect::<BTreeSet<String>>(),
    }
}

/// Instantiate the configured placement strategy.
pub fn build_strategy(kind: StrategyKind) -> Arc<dyn ShardingStrategy> {
    match kind {
        StrategyKind::Random => Arc::new(RandomSharder::new()),
        StrategyKind::LeastLoaded => Arc::new(LeastLoadedSharder),
    }
}

/// Register the configured flasks and targets. The flasks also land in the
/// discovery map so lifecycle events about them resolve without a cloud
/// lookup.
pub async fn seed_repository(
    repo: &Repository,
    discovery: &StaticDiscovery,
    config: &ChemistConfig,
) -> anyhow::Result<()> {
    for (id, seed) in &config.flasks {
        repo.increase_capacity(flask_from_seed(id, seed)).await?;
        discovery
            .insert(Instance {
                id: id.clone(),
                tags: HashMap::from([("type".to_string(), "flask".to_string())]),
                host: seed.location.host.clone(),
                port: seed.location.port,
                asg: seed.location.datacenter.clone(),
            })
            .await;
    }
    for (id, seed) in &config.instances {
        repo.add_instance(target_from_seed(id, seed)).await;
    }
    info!(
        flasks = config.flasks.len(),
        targets = config.instances.len(),
        "configuration seeds loaded"
    );
    Ok(())
}

/// Assign everything waiting in the unassigned pool and write it through.
pub async fn initial_distribution(
    repo: &Repository,
    strategy: &dyn ShardingStrategy,
) -> Distribution {
    let unassigned = repo.unassigned_targets().await;
    let snapshot = repo.shard_snapshot().await;
    let delta = strategy.locate_and_assign(&unassigned, &snapshot);
    repo.merge_distribution(&delta).await;
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemist_discovery::Discovery;

    const CONFIG: &str = r#"
sharding-strategy = "least-loaded"
target-resource-templates = ["http://@host:@port/stream/previous"]

[instances.t1]
cluster-name = "web"
uris = ["http://10.0.0.2:1234/stream/previous"]

[flasks.f1.location]
host = "10.0.0.1"
port = 5775
protocol = "http"
datacenter = "us-east-1a"
intent = "mirroring"
"#;

    #[tokio::test]
    async fn seeds_register_flasks_and_targets() {
        let config = ChemistConfig::from_str(CONFIG).unwrap();
        let repo = Repository::new();
        let discovery = StaticDiscovery::new();

        seed_repository(&repo, &discovery, &config).await.unwrap();

        assert_eq!(repo.active_flasks().await.len(), 1);
        assert_eq!(repo.unassigned_targets().await.len(), 1);
        let looked_up = discovery.lookup_one("f1").await.unwrap();
        assert!(looked_up.is_flask());
    }

    #[tokio::test]
    async fn initial_distribution_covers_the_seeds() {
        let config = ChemistConfig::from_str(CONFIG).unwrap();
        let repo = Repository::new();
        let discovery = StaticDiscovery::new();
        seed_repository(&repo, &discovery, &config).await.unwrap();

        let strategy = build_strategy(config.sharding_strategy);
        let delta = initial_distribution(&repo, strategy.as_ref()).await;

        assert_eq!(delta["f1"].len(), 1);
        assert_eq!(repo.assigned_targets("f1").await.len(), 1);
        assert!(repo.unassigned_targets().await.is_empty());
    }

    #[test]
    fn strategy_factory_matches_config() {
        assert_eq!(build_strategy(StrategyKind::Random).name(), "random");
        assert_eq!(
            build_strategy(StrategyKind::LeastLoaded).name(),
            "least-loaded"
        );
    }
}
