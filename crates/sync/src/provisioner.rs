use std::sync::Arc;
use std::time::Instant;

use fleetshard_core::secret::{new_secret, set_entry};
use fleetshard_core::{
    compute_checksum, ConnectorDeployment, Error, ManagedConnector, Result, SECRET_ENTRY_CONNECTOR,
    SECRET_ENTRY_KAFKA, SECRET_ENTRY_META,
};
use fleetshard_kubehub::FleetShardClient;
use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

/// Result of a successful [`ConnectorDeploymentProvisioner::provision`] call.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub connector: ManagedConnector,
    /// The linked secret; `None` for stopped and deleted deployments.
    pub secret: Option<Secret>,
}

impl Provisioned {
    pub fn is_linked(&self) -> bool {
        self.secret
            .as_ref()
            .is_some_and(|s| fleetshard_core::is_secret_linked(&self.connector, s))
    }
}

pub struct ConnectorDeploymentProvisioner {
    fleet_shard: Arc<dyn FleetShardClient>,
}

impl ConnectorDeploymentProvisioner {
    pub fn new(fleet_shard: Arc<dyn FleetShardClient>) -> Self {
        Self { fleet_shard }
    }

    /// Reconcile one deployment descriptor into cluster resources.
    ///
    /// Fatal errors (duplicate composite keys, unsupported operator
    /// selectors) abort without rolling back what was already written.
    pub async fn provision(&self, deployment: &ConnectorDeployment) -> Result<Provisioned> {
        let t0 = Instant::now();
        let res = self.provision_deployment(deployment).await;
        histogram!("fleetshard_provision_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("fleetshard_provision_total", 1u64);
        if let Err(e) = &res {
            counter!("fleetshard_provision_failures_total", 1u64, "kind" => e.kind());
            warn!(
                connector_id = %deployment.connector_id(),
                deployment_id = %deployment.id,
                resource_version = deployment.resource_version(),
                retryable = e.is_retryable(),
                error = %e,
                "provisioning failed"
            );
        }
        res
    }

    async fn provision_deployment(&self, deployment: &ConnectorDeployment) -> Result<Provisioned> {
        info!(
            cluster_id = %self.fleet_shard.cluster_id(),
            connector_id = %deployment.connector_id(),
            deployment_id = %deployment.id,
            resource_version = deployment.resource_version(),
            "provisioning deployment"
        );

        let base = self.create_managed_connector(deployment).await?;

        // Stopped or deleted connectors keep whatever secret they had; the
        // operator can still read the previous one through the existing link.
        if deployment.desired_state().is_destructive() {
            info!(
                ns = ?base.namespace(),
                name = %base.name_any(),
                desired_state = %deployment.desired_state(),
                "connector updated without secret"
            );
            return Ok(Provisioned { connector: base, secret: None });
        }

        let secret = self.create_managed_connector_secret(deployment, &base).await?;
        let secret_name = secret.name_any();
        let checksum = compute_checksum(&secret);
        let connector = self
            .fleet_shard
            .edit_connector(&base.name_any(), &|c: &mut ManagedConnector| {
                c.spec.deployment.secret = Some(secret_name.clone());
                c.spec.deployment.secret_checksum = Some(checksum.clone());
            })
            .await?;

        info!(
            ns = ?connector.namespace(),
            name = %connector.name_any(),
            secret = %secret_name,
            "connector linked to secret"
        );
        Ok(Provisioned { connector, secret: Some(secret) })
    }

    async fn create_managed_connector(&self, deployment: &ConnectorDeployment) -> Result<ManagedConnector> {
        let connector_id = deployment.connector_id();
        let existing = self.fleet_shard.get_connector(connector_id, &deployment.id).await?;

        // Validate before any write so a rejected descriptor leaves the store untouched.
        let operator_selector = deployment.operator_selector()?;

        let mut connector = match existing {
            Some(c) => c,
            None => {
                info!(
                    cluster_id = %self.fleet_shard.cluster_id(),
                    connector_id = %connector_id,
                    deployment_id = %deployment.id,
                    resource_version = deployment.resource_version(),
                    "connector not found, creating a new one"
                );
                ManagedConnector::for_deployment(self.fleet_shard.cluster_id(), connector_id, &deployment.id)
            }
        };

        let d = &mut connector.spec.deployment;
        d.deployment_resource_version = deployment.resource_version();
        d.desired_state = Some(deployment.desired_state().clone());
        d.connector_type_id = Some(deployment.spec.connector_type_id.clone());
        d.connector_resource_version = deployment.spec.connector_resource_version;
        connector.spec.operator_selector = Some(operator_selector);

        debug!(
            name = %connector.name_any(),
            ns = %self.fleet_shard.connectors_namespace(),
            spec = ?connector.spec,
            "applying connector"
        );
        self.fleet_shard.create_connector(connector).await
    }

    async fn create_managed_connector_secret(
        &self,
        deployment: &ConnectorDeployment,
        owner: &ManagedConnector,
    ) -> Result<Secret> {
        let connector_id = deployment.connector_id();
        let rv = deployment.resource_version();

        let mut secret = match self.fleet_shard.get_secret(connector_id, &deployment.id, rv).await? {
            Some(s) => s,
            None => {
                info!(
                    cluster_id = %self.fleet_shard.cluster_id(),
                    connector_id = %connector_id,
                    deployment_id = %deployment.id,
                    resource_version = rv,
                    "secret not found, creating a new one"
                );
                new_secret(
                    &owner.secret_name_for(rv),
                    self.fleet_shard.cluster_id(),
                    connector_id,
                    &deployment.id,
                    rv,
                )
            }
        };

        set_entry(&mut secret, SECRET_ENTRY_CONNECTOR, &deployment.spec.connector_spec)?;
        set_entry(&mut secret, SECRET_ENTRY_KAFKA, &deployment.spec.kafka)?;
        set_entry(&mut secret, SECRET_ENTRY_META, &deployment.spec.shard_metadata)?;

        let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| Error::MissingOwner {
            kind: "ManagedConnector",
            name: owner.name_any(),
        })?;
        let refs = secret.metadata.owner_references.get_or_insert_with(Vec::new);
        // a secret has at most one controller
        refs.retain(|r| r.uid != owner_ref.uid && r.controller != Some(true));
        refs.push(owner_ref);

        self.fleet_shard.create_secret(secret).await
    }
}
