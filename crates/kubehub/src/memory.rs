//! Process-local gateway with the same semantics as the kube-backed one.
//!
//! Used by tests and by dry runs. Objects are keyed by name, get a uid on
//! first write and a fresh resource version on every write. Label queries go
//! through the same selectors as the API server path, so duplicate composite
//! keys seeded through `create_*` surface exactly as they would on a cluster.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleetshard_core::labels::{LABEL_DEPLOYMENT_ID, LABEL_DEPLOYMENT_RESOURCE_VERSION};
use fleetshard_core::{Error, LabelSelector, ManagedConnector, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{at_most_one, ClientConfig, ConnectorEditor, ConnectorEvent, FleetShardClient};

#[derive(Default)]
struct State {
    connectors: BTreeMap<String, ManagedConnector>,
    secrets: BTreeMap<String, Secret>,
    revision: u64,
    writes: u64,
    fail_secret_writes: bool,
    edit_conflicts: usize,
}

impl State {
    fn stamp(&mut self, namespace: &str, meta: &mut ObjectMeta, previous: Option<&ObjectMeta>) {
        self.revision += 1;
        self.writes += 1;
        meta.namespace = Some(namespace.to_string());
        let own = meta.uid.take();
        meta.uid = previous
            .and_then(|p| p.uid.clone())
            .or(own)
            .or_else(|| Some(Uuid::new_v4().to_string()));
        meta.resource_version = Some(self.revision.to_string());
        meta.managed_fields = None;
    }

    /// Simulate another writer touching `name` between an edit's read and its write.
    fn interleave_foreign_write(&mut self, name: &str) {
        if self.edit_conflicts == 0 {
            return;
        }
        self.edit_conflicts -= 1;
        self.revision += 1;
        let rv = self.revision.to_string();
        if let Some(c) = self.connectors.get_mut(name) {
            c.metadata.resource_version = Some(rv);
        }
    }
}

pub struct InMemoryFleetShardClient {
    config: ClientConfig,
    state: Mutex<State>,
    events: broadcast::Sender<ConnectorEvent>,
}

impl InMemoryFleetShardClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { config, state: Mutex::new(State::default()), events }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, ev: ConnectorEvent) {
        // no subscribers is fine
        let _ = self.events.send(ev);
    }

    /// All stored connectors, ordered by name.
    pub fn connectors(&self) -> Vec<ManagedConnector> {
        self.state().connectors.values().cloned().collect()
    }

    /// All stored secrets, ordered by name.
    pub fn secrets(&self) -> Vec<Secret> {
        self.state().secrets.values().cloned().collect()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.state().secrets.get(name).cloned()
    }

    /// Number of successful mutating calls so far.
    pub fn writes(&self) -> u64 {
        self.state().writes
    }

    /// Make secret upserts fail with a 503 until switched off again.
    pub fn fail_secret_writes(&self, on: bool) {
        self.state().fail_secret_writes = on;
    }

    /// Make the next `n` connector edit attempts lose a version race.
    pub fn fail_connector_edits(&self, n: usize) {
        self.state().edit_conflicts = n;
    }

    fn select_connectors(&self, selector: &LabelSelector) -> Vec<ManagedConnector> {
        self.state()
            .connectors
            .values()
            .filter(|c| selector.matches(c.labels()))
            .cloned()
            .collect()
    }

    fn select_secrets(&self, selector: &LabelSelector) -> Vec<Secret> {
        self.state()
            .secrets
            .values()
            .filter(|s| selector.matches(s.labels()))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl FleetShardClient for InMemoryFleetShardClient {
    fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    fn connectors_namespace(&self) -> &str {
        &self.config.connectors_namespace
    }

    async fn get_connector(&self, connector_id: &str, deployment_id: &str) -> Result<Option<ManagedConnector>> {
        let selector = self.config.connector_selector(connector_id, deployment_id);
        at_most_one("ManagedConnector", &selector, self.select_connectors(&selector))
    }

    async fn get_connector_by_name(&self, name: &str) -> Result<Option<ManagedConnector>> {
        Ok(self.state().connectors.get(name).cloned())
    }

    async fn get_connector_by_deployment_id(&self, deployment_id: &str) -> Result<Option<ManagedConnector>> {
        let selector = self.config.deployment_selector().with(LABEL_DEPLOYMENT_ID, deployment_id);
        at_most_one("ManagedConnector", &selector, self.select_connectors(&selector))
    }

    async fn get_all_connectors(&self) -> Result<Vec<ManagedConnector>> {
        Ok(self.select_connectors(&self.config.cluster_selector()))
    }

    async fn get_secret(&self, connector_id: &str, deployment_id: &str, resource_version: i64) -> Result<Option<Secret>> {
        let selector = self.config.secret_selector(connector_id, deployment_id, resource_version);
        at_most_one("Secret", &selector, self.select_secrets(&selector))
    }

    async fn get_secret_by_deployment_id_and_revision(&self, deployment_id: &str, revision: i64) -> Result<Option<Secret>> {
        let selector = self
            .config
            .deployment_selector()
            .with(LABEL_DEPLOYMENT_ID, deployment_id)
            .with(LABEL_DEPLOYMENT_RESOURCE_VERSION, revision.to_string());
        at_most_one("Secret", &selector, self.select_secrets(&selector))
    }

    async fn create_connector(&self, mut connector: ManagedConnector) -> Result<ManagedConnector> {
        let name = connector.name_any();
        let stored = {
            let mut st = self.state();
            let previous = st.connectors.get(&name).map(|c| c.metadata.clone());
            st.stamp(&self.config.connectors_namespace, &mut connector.metadata, previous.as_ref());
            st.connectors.insert(name.clone(), connector.clone());
            connector
        };
        debug!(name = %name, rv = ?stored.metadata.resource_version, "connector stored");
        self.notify(ConnectorEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn create_secret(&self, mut secret: Secret) -> Result<Secret> {
        let name = secret.name_any();
        let mut st = self.state();
        if st.fail_secret_writes {
            return Err(Error::Kube(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("secret {} write rejected", name),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })));
        }
        let previous = st.secrets.get(&name).map(|s| s.metadata.clone());
        st.stamp(&self.config.connectors_namespace, &mut secret.metadata, previous.as_ref());
        st.secrets.insert(name, secret.clone());
        Ok(secret)
    }

    async fn edit_connector(&self, name: &str, editor: ConnectorEditor<'_>) -> Result<ManagedConnector> {
        let not_found = || Error::NotFound { kind: "ManagedConnector", name: name.to_string() };
        let attempts = self.config.edit_retries.max(1);
        for attempt in 1..=attempts {
            let mut current = self.state().connectors.get(name).cloned().ok_or_else(not_found)?;
            let read_version = current.metadata.resource_version.clone();
            editor(&mut current);
            let stored = {
                let mut st = self.state();
                st.interleave_foreign_write(name);
                let latest = st.connectors.get(name).map(|c| c.metadata.clone()).ok_or_else(not_found)?;
                // same precondition the API server applies to a replace
                if latest.resource_version != read_version {
                    None
                } else {
                    st.stamp(&self.config.connectors_namespace, &mut current.metadata, Some(&latest));
                    st.connectors.insert(name.to_string(), current.clone());
                    Some(current)
                }
            };
            match stored {
                Some(c) => {
                    self.notify(ConnectorEvent::Applied(c.clone()));
                    return Ok(c);
                }
                None => warn!(name = %name, attempt, "connector changed during edit; retrying"),
            }
        }
        Err(Error::Conflict { kind: "ManagedConnector", name: name.to_string(), attempts })
    }

    async fn delete_connector(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut st = self.state();
            let removed = st.connectors.remove(name);
            if let Some(owner_uid) = removed.as_ref().and_then(|c| c.metadata.uid.clone()) {
                // cascade like the garbage collector would for owned secrets
                st.secrets.retain(|_, s| !s.owner_references().iter().any(|o| o.uid == owner_uid));
                st.writes += 1;
            }
            removed
        };
        match removed {
            Some(c) => {
                self.notify(ConnectorEvent::Deleted(c));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn watch_connectors(&self, tx: mpsc::Sender<ConnectorEvent>) -> Result<()> {
        let mut rx = self.events.subscribe();
        let selector = self.config.cluster_selector();
        for c in self.select_connectors(&selector) {
            if tx.send(ConnectorEvent::Applied(c)).await.is_err() {
                return Ok(());
            }
        }
        loop {
            let ev = match rx.recv().await {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "connector watcher lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            };
            let relevant = match &ev {
                ConnectorEvent::Applied(c) | ConnectorEvent::Deleted(c) => selector.matches(c.labels()),
            };
            if relevant && tx.send(ev).await.is_err() {
                return Ok(());
            }
        }
    }
}
