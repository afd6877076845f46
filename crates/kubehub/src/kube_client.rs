//! kube-rs backed gateway.

use fleetshard_core::labels::{LABEL_DEPLOYMENT_ID, LABEL_DEPLOYMENT_RESOURCE_VERSION};
use fleetshard_core::{Error, LabelSelector, ManagedConnector, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{at_most_one, ClientConfig, ConnectorEditor, ConnectorEvent, FleetShardClient};

const CONFLICT: u16 = 409;
const NOT_FOUND: u16 = 404;

pub struct KubeFleetShardClient {
    client: Client,
    config: ClientConfig,
}

impl KubeFleetShardClient {
    pub fn new(client: Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    /// Connect using the ambient kubeconfig / in-cluster configuration.
    pub async fn try_default(config: ClientConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    fn connectors(&self) -> Api<ManagedConnector> {
        Api::namespaced(self.client.clone(), &self.config.connectors_namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.config.connectors_namespace)
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.config.field_manager).force()
    }

    async fn list_connectors(&self, selector: &LabelSelector) -> Result<Vec<ManagedConnector>> {
        let lp = ListParams::default().labels(&selector.to_string());
        let list = self.connectors().list(&lp).await?;
        debug!(selector = %selector, count = list.items.len(), "listed connectors");
        Ok(list.items)
    }

    async fn list_secrets(&self, selector: &LabelSelector) -> Result<Vec<Secret>> {
        let lp = ListParams::default().labels(&selector.to_string());
        let list = self.secrets().list(&lp).await?;
        debug!(selector = %selector, count = list.items.len(), "listed secrets");
        Ok(list.items)
    }
}

/// Server-populated bookkeeping must not be part of an apply body. Finalizers
/// belong to whoever added them (the garbage collector for foreground deletion).
fn strip_server_fields(meta: &mut ObjectMeta) {
    meta.managed_fields = None;
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.finalizers = None;
}

#[async_trait::async_trait]
impl FleetShardClient for KubeFleetShardClient {
    fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    fn connectors_namespace(&self) -> &str {
        &self.config.connectors_namespace
    }

    async fn get_connector(&self, connector_id: &str, deployment_id: &str) -> Result<Option<ManagedConnector>> {
        let selector = self.config.connector_selector(connector_id, deployment_id);
        let items = self.list_connectors(&selector).await?;
        at_most_one("ManagedConnector", &selector, items)
    }

    async fn get_connector_by_name(&self, name: &str) -> Result<Option<ManagedConnector>> {
        Ok(self.connectors().get_opt(name).await?)
    }

    async fn get_connector_by_deployment_id(&self, deployment_id: &str) -> Result<Option<ManagedConnector>> {
        let selector = self.config.deployment_selector().with(LABEL_DEPLOYMENT_ID, deployment_id);
        let items = self.list_connectors(&selector).await?;
        at_most_one("ManagedConnector", &selector, items)
    }

    async fn get_all_connectors(&self) -> Result<Vec<ManagedConnector>> {
        self.list_connectors(&self.config.cluster_selector()).await
    }

    async fn get_secret(&self, connector_id: &str, deployment_id: &str, resource_version: i64) -> Result<Option<Secret>> {
        let selector = self.config.secret_selector(connector_id, deployment_id, resource_version);
        let items = self.list_secrets(&selector).await?;
        at_most_one("Secret", &selector, items)
    }

    async fn get_secret_by_deployment_id_and_revision(&self, deployment_id: &str, revision: i64) -> Result<Option<Secret>> {
        let selector = self
            .config
            .deployment_selector()
            .with(LABEL_DEPLOYMENT_ID, deployment_id)
            .with(LABEL_DEPLOYMENT_RESOURCE_VERSION, revision.to_string());
        let items = self.list_secrets(&selector).await?;
        at_most_one("Secret", &selector, items)
    }

    async fn create_connector(&self, mut connector: ManagedConnector) -> Result<ManagedConnector> {
        let name = connector.name_any();
        strip_server_fields(&mut connector.metadata);
        let applied = self.connectors().patch(&name, &self.apply_params(), &Patch::Apply(&connector)).await?;
        debug!(name = %name, rv = ?applied.metadata.resource_version, "connector applied");
        Ok(applied)
    }

    async fn create_secret(&self, mut secret: Secret) -> Result<Secret> {
        let name = secret.name_any();
        strip_server_fields(&mut secret.metadata);
        let applied = self.secrets().patch(&name, &self.apply_params(), &Patch::Apply(&secret)).await?;
        debug!(name = %name, rv = ?applied.metadata.resource_version, "secret applied");
        Ok(applied)
    }

    async fn edit_connector(&self, name: &str, editor: ConnectorEditor<'_>) -> Result<ManagedConnector> {
        let api = self.connectors();
        let attempts = self.config.edit_retries.max(1);
        for attempt in 1..=attempts {
            let mut current = api.get_opt(name).await?.ok_or_else(|| Error::NotFound {
                kind: "ManagedConnector",
                name: name.to_string(),
            })?;
            editor(&mut current);
            // replace carries the resourceVersion we read, so a concurrent writer yields 409
            match api.replace(name, &PostParams::default(), &current).await {
                Ok(updated) => return Ok(updated),
                Err(kube::Error::Api(ae)) if ae.code == CONFLICT => {
                    warn!(name = %name, attempt, "connector changed during edit; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict { kind: "ManagedConnector", name: name.to_string(), attempts })
    }

    async fn delete_connector(&self, name: &str) -> Result<bool> {
        match self.connectors().delete(name, &DeleteParams::foreground()).await {
            Ok(_) => {
                info!(name = %name, "connector deletion requested");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == NOT_FOUND => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn watch_connectors(&self, tx: mpsc::Sender<ConnectorEvent>) -> Result<()> {
        let cfg = watcher::Config::default().labels(&self.config.cluster_selector().to_string());
        let stream = watcher::watcher(self.connectors(), cfg);
        futures::pin_mut!(stream);
        info!(cluster_id = %self.config.cluster_id, ns = %self.config.connectors_namespace, "connector watcher started");
        while let Some(ev) = stream.try_next().await.map_err(|e| Error::Watch(e.to_string()))? {
            let events = match ev {
                Event::Applied(o) => vec![ConnectorEvent::Applied(o)],
                Event::Deleted(o) => vec![ConnectorEvent::Deleted(o)],
                Event::Restarted(list) => {
                    debug!(count = list.len(), "watch restart");
                    list.into_iter().map(ConnectorEvent::Applied).collect()
                }
            };
            for e in events {
                if tx.send(e).await.is_err() {
                    debug!("connector event receiver dropped; stopping watcher");
                    return Ok(());
                }
            }
        }
        warn!("connector watcher stream ended");
        Ok(())
    }
}
