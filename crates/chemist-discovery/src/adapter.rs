//! Instance lookup, flask/target classification, template expansion.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use chemist_state::Target;

use crate::error::{DiscoveryError, DiscoveryResult};

/// Cloud metadata for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub tags: HashMap<String, String>,
    pub host: String,
    pub port: u16,
    pub asg: String,
}

impl Instance {
    /// A machine is a flask iff its `type` tag begins with `"flask"`.
    pub fn is_flask(&self) -> bool {
        self.tags
            .get("type")
            .is_some_and(|t| t.starts_with("flask"))
    }

    /// Cluster name for target grouping: the `cluster` tag, or the ASG name.
    pub fn cluster(&self) -> String {
        self.tags
            .get("cluster")
            .cloned()
            .unwrap_or_else(|| self.asg.clone())
    }
}

/// Looks up one instance by id from the cloud.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn lookup_one(&self, id: &str) -> DiscoveryResult<Instance>;
}

/// Substitute `@host` and `@port` in each template.
pub fn expand_templates(templates: &[String], host: &str, port: u16) -> BTreeSet<String> {
    let port = port.to_string();
    templates
        .iter()
        .map(|template| template.replace("@host", host).replace("@port", &port))
        .collect()
}

/// Build a target from an instance by expanding the resource templates
/// against its host and port.
pub fn target_from_instance(instance: &Instance, templates: &[String]) -> Target {
    Target {
        id: instance.id.clone(),
        cluster: instance.cluster(),
        uris: expand_templates(templates, &instance.host, instance.port),
    }
}

/// A discovery backed by a fixed map: config seeds, local mode, tests.
#[derive(Default)]
pub struct StaticDiscovery {
    instances: RwLock<HashMap<String, Instance>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, instance: Instance) {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance);
    }

    pub async fn remove(&self, id: &str) {
        self.instances.write().await.remove(id);
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn lookup_one(&self, id: &str) -> DiscoveryResult<Instance> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, type_tag: Option<&str>) -> Instance {
        let mut tags = HashMap::new();
        if let Some(t) = type_tag {
            tags.insert("type".to_string(), t.to_string());
        }
        Instance {
            id: id.to_string(),
            tags,
            host: "10.0.0.2".to_string(),
            port: 1234,
            asg: "web-asg".to_string(),
        }
    }

    #[test]
    fn type_tag_classifies_flasks() {
        assert!(instance("i-1", Some("flask")).is_flask());
        assert!(instance("i-2", Some("flask-mirror")).is_flask());
        assert!(!instance("i-3", Some("app")).is_flask());
        assert!(!instance("i-4", None).is_flask());
    }

    #[test]
    fn cluster_falls_back_to_asg() {
        let mut tagged = instance("i-1", None);
        tagged
            .tags
            .insert("cluster".to_string(), "web".to_string());
        assert_eq!(tagged.cluster(), "web");

        assert_eq!(instance("i-2", None).cluster(), "web-asg");
    }

    #[test]
    fn templates_expand_host_and_port() {
        let templates = vec![
            "http://@host:@port/stream/previous".to_string(),
            "http://@host:@port/stream/now?kind=traffic".to_string(),
        ];
        let uris = expand_templates(&templates, "10.0.0.2", 1234);
        assert!(uris.contains("http://10.0.0.2:1234/stream/previous"));
        assert!(uris.contains("http://10.0.0.2:1234/stream/now?kind=traffic"));
        assert_eq!(uris.len(), 2);
    }

    #[test]
    fn duplicate_templates_collapse() {
        let templates = vec![
            "http://@host:@port/stream".to_string(),
            "http://@host:@port/stream".to_string(),
        ];
        assert_eq!(expand_templates(&templates, "h", 1).len(), 1);
    }

    #[test]
    fn target_built_from_instance() {
        let templates = vec!["http://@host:@port/stream/previous".to_string()];
        let target = target_from_instance(&instance("i-9", None), &templates);
        assert_eq!(target.id, "i-9");
        assert_eq!(target.cluster, "web-asg");
        assert!(target.uris.contains("http://10.0.0.2:1234/stream/previous"));
    }

    #[tokio::test]
    async fn static_discovery_lookup() {
        let discovery = StaticDiscovery::new();
        discovery.insert(instance("i-1", Some("flask"))).await;

        let found = discovery.lookup_one("i-1").await.unwrap();
        assert!(found.is_flask());

        let missing = discovery.lookup_one("i-2").await;
        assert!(matches!(missing, Err(DiscoveryError::NotFound(_))));
    }

    #[tokio::test]
    async fn static_discovery_remove_races_terminate() {
        let discovery = StaticDiscovery::new();
        discovery.insert(instance("i-1", None)).await;
        discovery.remove("i-1").await;

        assert!(matches!(
            discovery.lookup_one("i-1").await,
            Err(DiscoveryError::NotFound(_))
        ));
    }
}
