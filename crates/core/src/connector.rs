//! ManagedConnector custom resource.
//!
//! One ManagedConnector exists per (cluster, connector, deployment). The sync
//! side writes the spec; the operator on the cluster reifies it once
//! `deployment.secret` and `deployment.secretChecksum` point at a matching
//! secret.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::DesiredState;
use crate::labels::{LABEL_CLUSTER_ID, LABEL_CONNECTOR_ID, LABEL_CONTEXT, LABEL_DEPLOYMENT_ID};
use crate::CONTEXT_DEPLOYMENT;

pub const CONNECTOR_PREFIX: &str = "mctr-";

/// Separator between the owning connector name and the resource version in secret names.
pub const SECRET_NAME_INFIX: &str = "-s-";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cos.bf2.org",
    version = "v1alpha1",
    kind = "ManagedConnector",
    namespaced,
    shortname = "mctr",
    printcolumn = r#"{"name":"Connector","type":"string","jsonPath":".spec.connectorId"}"#,
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentId"}"#,
    printcolumn = r#"{"name":"Revision","type":"integer","jsonPath":".spec.deployment.deploymentResourceVersion"}"#,
    printcolumn = r#"{"name":"Desired","type":"string","jsonPath":".spec.deployment.desiredState"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedConnectorSpec {
    pub cluster_id: String,
    pub connector_id: String,
    pub deployment_id: String,

    #[serde(default)]
    pub deployment: DeploymentSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_selector: Option<OperatorSelector>,
}

/// Deployment-derived part of the spec, overwritten on every provisioning.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default)]
    pub deployment_resource_version: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<DesiredState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_type_id: Option<String>,

    #[serde(default)]
    pub connector_resource_version: i64,

    /// Name of the companion secret; unset until linked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Checksum of the companion secret's data at link time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_checksum: Option<String>,
}

/// Selects the operator responsible for reifying a connector.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct OperatorSelector {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub version: String,
}

impl ManagedConnector {
    /// Build a fresh, not yet persisted connector with a generated name and
    /// the composite-key labels.
    pub fn for_deployment(cluster_id: &str, connector_id: &str, deployment_id: &str) -> Self {
        let name = format!("{}{}", CONNECTOR_PREFIX, Uuid::new_v4().simple());
        let labels = BTreeMap::from([
            (LABEL_CLUSTER_ID.to_string(), cluster_id.to_string()),
            (LABEL_CONNECTOR_ID.to_string(), connector_id.to_string()),
            (LABEL_DEPLOYMENT_ID.to_string(), deployment_id.to_string()),
            (LABEL_CONTEXT.to_string(), CONTEXT_DEPLOYMENT.to_string()),
        ]);
        let mut mc = ManagedConnector::new(
            &name,
            ManagedConnectorSpec {
                cluster_id: cluster_id.to_string(),
                connector_id: connector_id.to_string(),
                deployment_id: deployment_id.to_string(),
                deployment: DeploymentSpec::default(),
                operator_selector: None,
            },
        );
        mc.metadata.labels = Some(labels);
        mc
    }

    /// Name of the companion secret for a given deployment resource version.
    pub fn secret_name_for(&self, resource_version: i64) -> String {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        format!("{}{}{}", name, SECRET_NAME_INFIX, resource_version)
    }

    /// Whether a secret name and checksum have been recorded.
    pub fn has_secret_reference(&self) -> bool {
        let d = &self.spec.deployment;
        d.secret.as_deref().is_some_and(|s| !s.is_empty())
            && d.secret_checksum.as_deref().is_some_and(|s| !s.is_empty())
    }
}
