//! Fleet-shard kubehub: typed access to ManagedConnector and Secret resources
//! scoped to one cluster id and one connectors namespace.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result as AnyResult};
use fleetshard_core::labels::{
    LABEL_CLUSTER_ID, LABEL_CONNECTOR_ID, LABEL_CONTEXT, LABEL_DEPLOYMENT_ID,
    LABEL_DEPLOYMENT_RESOURCE_VERSION,
};
use fleetshard_core::{Error, LabelSelector, ManagedConnector, Result, CONTEXT_DEPLOYMENT};
use k8s_openapi::api::core::v1::Secret;
use tokio::sync::mpsc;

mod kube_client;
mod memory;

pub use kube_client::KubeFleetShardClient;
pub use memory::InMemoryFleetShardClient;

pub const DEFAULT_FIELD_MANAGER: &str = "cos-fleetshard-sync";
pub const DEFAULT_EDIT_RETRIES: usize = 5;

/// In-place transformation applied by [`FleetShardClient::edit_connector`].
/// May run more than once when the store reports a write conflict.
pub type ConnectorEditor<'a> = &'a (dyn Fn(&mut ManagedConnector) + Send + Sync);

/// Change notification for managed connectors.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Applied(ManagedConnector),
    Deleted(ManagedConnector),
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub cluster_id: String,
    pub connectors_namespace: String,
    /// Field manager used for server-side apply.
    pub field_manager: String,
    /// Read-modify-write attempts before giving up on conflicts.
    pub edit_retries: usize,
}

impl ClientConfig {
    pub fn new(cluster_id: impl Into<String>, connectors_namespace: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            connectors_namespace: connectors_namespace.into(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            edit_retries: DEFAULT_EDIT_RETRIES,
        }
    }

    /// Read `FLEETSHARD_CLUSTER_ID`, `FLEETSHARD_CONNECTORS_NAMESPACE`,
    /// `FLEETSHARD_FIELD_MANAGER` and `FLEETSHARD_EDIT_RETRIES`.
    pub fn from_env() -> AnyResult<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`ClientConfig::from_env`] but reading through `get`, so callers
    /// can layer flags over the environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> AnyResult<Self> {
        let cluster_id = get("FLEETSHARD_CLUSTER_ID")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("FLEETSHARD_CLUSTER_ID is not set"))?;
        let namespace = get("FLEETSHARD_CONNECTORS_NAMESPACE")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("FLEETSHARD_CONNECTORS_NAMESPACE is not set"))?;
        let mut cfg = Self::new(cluster_id, namespace);
        if let Some(fm) = get("FLEETSHARD_FIELD_MANAGER").filter(|s| !s.is_empty()) {
            cfg.field_manager = fm;
        }
        if let Some(raw) = get("FLEETSHARD_EDIT_RETRIES").filter(|s| !s.is_empty()) {
            let retries = raw
                .parse::<usize>()
                .map_err(|e| anyhow!("FLEETSHARD_EDIT_RETRIES={:?} is not a count: {}", raw, e))?;
            cfg.edit_retries = retries.max(1);
        }
        Ok(cfg)
    }

    /// Composite key of a deployment's managed connector.
    pub fn connector_selector(&self, connector_id: &str, deployment_id: &str) -> LabelSelector {
        self.deployment_selector()
            .with(LABEL_CONNECTOR_ID, connector_id)
            .with(LABEL_DEPLOYMENT_ID, deployment_id)
    }

    /// Composite key of a deployment's secret for one resource version.
    pub fn secret_selector(&self, connector_id: &str, deployment_id: &str, resource_version: i64) -> LabelSelector {
        self.connector_selector(connector_id, deployment_id)
            .with(LABEL_DEPLOYMENT_RESOURCE_VERSION, resource_version.to_string())
    }

    fn deployment_selector(&self) -> LabelSelector {
        LabelSelector::new()
            .with(LABEL_CONTEXT, CONTEXT_DEPLOYMENT)
            .with(LABEL_CLUSTER_ID, self.cluster_id.as_str())
    }

    fn cluster_selector(&self) -> LabelSelector {
        LabelSelector::new().with(LABEL_CLUSTER_ID, self.cluster_id.as_str())
    }
}

/// Access to the cluster resource store for one cluster id and namespace.
#[async_trait::async_trait]
pub trait FleetShardClient: Send + Sync {
    fn cluster_id(&self) -> &str;
    fn connectors_namespace(&self) -> &str;

    /// Connector for (cluster, connector id, deployment id); more than one match is a constraint violation.
    async fn get_connector(&self, connector_id: &str, deployment_id: &str) -> Result<Option<ManagedConnector>>;
    async fn get_connector_by_name(&self, name: &str) -> Result<Option<ManagedConnector>>;
    async fn get_connector_by_deployment_id(&self, deployment_id: &str) -> Result<Option<ManagedConnector>>;
    async fn get_all_connectors(&self) -> Result<Vec<ManagedConnector>>;

    /// Highest deployment resource version among this cluster's connectors, 0 when none.
    async fn max_deployment_resource_revision(&self) -> Result<i64> {
        let all = self.get_all_connectors().await?;
        Ok(all.iter().map(|c| c.spec.deployment.deployment_resource_version).max().unwrap_or(0))
    }

    /// Secret for (cluster, connector id, deployment id, resource version); more than one match is a constraint violation.
    async fn get_secret(&self, connector_id: &str, deployment_id: &str, resource_version: i64) -> Result<Option<Secret>>;
    async fn get_secret_by_deployment_id_and_revision(&self, deployment_id: &str, revision: i64) -> Result<Option<Secret>>;

    /// Create or replace by name.
    async fn create_connector(&self, connector: ManagedConnector) -> Result<ManagedConnector>;
    /// Create or replace by name.
    async fn create_secret(&self, secret: Secret) -> Result<Secret>;

    /// Read-modify-write of one connector. Not-found is an error.
    async fn edit_connector(&self, name: &str, editor: ConnectorEditor<'_>) -> Result<ManagedConnector>;

    /// Delete with foreground propagation. Returns false when nothing was there.
    async fn delete_connector(&self, name: &str) -> Result<bool>;

    /// List+watch this cluster's connectors, forwarding events until the receiver is dropped.
    async fn watch_connectors(&self, tx: mpsc::Sender<ConnectorEvent>) -> Result<()>;
}

/// Collapse a label query result, failing when the composite key matched several objects.
pub(crate) fn at_most_one<T>(kind: &'static str, selector: &LabelSelector, mut items: Vec<T>) -> Result<Option<T>> {
    match items.len() {
        0 => Ok(None),
        1 => Ok(items.pop()),
        count => Err(Error::ConstraintViolation { kind, selector: selector.to_string(), count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_from_env_requires_cluster_and_namespace() {
        let env: HashMap<&str, &str> = HashMap::from([("FLEETSHARD_CLUSTER_ID", "k1")]);
        let err = ClientConfig::from_lookup(|k| env.get(k).map(|s| s.to_string())).unwrap_err();
        assert!(err.to_string().contains("FLEETSHARD_CONNECTORS_NAMESPACE"));

        let env: HashMap<&str, &str> = HashMap::from([
            ("FLEETSHARD_CLUSTER_ID", "k1"),
            ("FLEETSHARD_CONNECTORS_NAMESPACE", "connectors"),
            ("FLEETSHARD_EDIT_RETRIES", "0"),
        ]);
        let cfg = ClientConfig::from_lookup(|k| env.get(k).map(|s| s.to_string())).unwrap();
        assert_eq!(cfg.cluster_id, "k1");
        assert_eq!(cfg.field_manager, DEFAULT_FIELD_MANAGER);
        assert_eq!(cfg.edit_retries, 1);
    }

    #[test]
    fn config_rejects_unparseable_edit_retries() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("FLEETSHARD_CLUSTER_ID", "k1"),
            ("FLEETSHARD_CONNECTORS_NAMESPACE", "connectors"),
            ("FLEETSHARD_EDIT_RETRIES", "abc"),
        ]);
        let err = ClientConfig::from_lookup(|k| env.get(k).map(|s| s.to_string())).unwrap_err();
        assert!(err.to_string().contains("FLEETSHARD_EDIT_RETRIES"), "err={}", err);

        let env: HashMap<&str, &str> = HashMap::from([
            ("FLEETSHARD_CLUSTER_ID", "k1"),
            ("FLEETSHARD_CONNECTORS_NAMESPACE", "connectors"),
        ]);
        let cfg = ClientConfig::from_lookup(|k| env.get(k).map(|s| s.to_string())).unwrap();
        assert_eq!(cfg.edit_retries, DEFAULT_EDIT_RETRIES);
    }

    #[test]
    fn selectors_cover_composite_keys() {
        let cfg = ClientConfig::new("k1", "ns");
        assert_eq!(
            cfg.connector_selector("c1", "d1").to_string(),
            "cos.bf2.org/cluster.id=k1,cos.bf2.org/connector.id=c1,cos.bf2.org/context=deployment,cos.bf2.org/deployment.id=d1"
        );
        assert!(cfg
            .secret_selector("c1", "d1", 3)
            .to_string()
            .ends_with("cos.bf2.org/deployment.id=d1,cos.bf2.org/deployment.resource.version=3"));
    }

    #[test]
    fn at_most_one_rejects_duplicates() {
        let sel = LabelSelector::new().with("a", "b");
        assert_eq!(at_most_one("Secret", &sel, Vec::<u8>::new()).unwrap(), None);
        assert_eq!(at_most_one("Secret", &sel, vec![7u8]).unwrap(), Some(7));
        let err = at_most_one("Secret", &sel, vec![1u8, 2u8]).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation { count: 2, kind: "Secret", .. }));
    }
}
