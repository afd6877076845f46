//! Deployment descriptors as delivered by the fleet manager.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::connector::OperatorSelector;
use crate::error::{Error, Result};

/// Desired lifecycle state requested by the fleet manager.
///
/// Only `stopped` and `deleted` change how a deployment is provisioned; any
/// other operational state is carried through verbatim as [`DesiredState::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DesiredState {
    /// Also accepted as `running` on the wire.
    Ready,
    Stopped,
    Deleted,
    Unassigned,
    Other(String),
}

impl DesiredState {
    pub fn as_str(&self) -> &str {
        match self {
            DesiredState::Ready => "ready",
            DesiredState::Stopped => "stopped",
            DesiredState::Deleted => "deleted",
            DesiredState::Unassigned => "unassigned",
            DesiredState::Other(s) => s,
        }
    }

    /// Stopped and deleted deployments get no fresh secret.
    pub fn is_destructive(&self) -> bool {
        matches!(self, DesiredState::Stopped | DesiredState::Deleted)
    }
}

impl From<String> for DesiredState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ready" | "running" => DesiredState::Ready,
            "stopped" => DesiredState::Stopped,
            "deleted" => DesiredState::Deleted,
            "unassigned" => DesiredState::Unassigned,
            _ => DesiredState::Other(s),
        }
    }
}

impl From<DesiredState> for String {
    fn from(s: DesiredState) -> Self {
        match s {
            DesiredState::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Open set of values, so the CRD schema is a plain string.
impl JsonSchema for DesiredState {
    fn schema_name() -> String {
        "DesiredState".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMeta {
    /// Monotonically increasing per deployment.
    pub resource_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDeploymentSpec {
    pub connector_id: String,
    pub connector_type_id: String,
    pub connector_resource_version: i64,
    pub operator_id: String,
    pub desired_state: DesiredState,
    /// Opaque connector configuration, copied verbatim into the secret.
    #[serde(default)]
    pub connector_spec: Json,
    /// Opaque Kafka connection settings, copied verbatim into the secret.
    #[serde(default)]
    pub kafka: Json,
    /// Shard metadata; must carry `operators: [{type, version}]`.
    #[serde(default)]
    pub shard_metadata: Json,
}

/// A connector deployment descriptor. Immutable from the provisioner's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorDeployment {
    pub id: String,
    pub metadata: DeploymentMeta,
    pub spec: ConnectorDeploymentSpec,
}

impl ConnectorDeployment {
    pub fn resource_version(&self) -> i64 {
        self.metadata.resource_version
    }

    pub fn connector_id(&self) -> &str {
        &self.spec.connector_id
    }

    pub fn desired_state(&self) -> &DesiredState {
        &self.spec.desired_state
    }

    /// Derive the operator selector from the shard metadata.
    ///
    /// Exactly one operator is supported; zero or several entries fail with
    /// [`Error::UnsupportedOperatorCount`] rather than picking one.
    pub fn operator_selector(&self) -> Result<OperatorSelector> {
        let operators = match self.spec.shard_metadata.get("operators") {
            None | Some(Json::Null) => return Err(Error::UnsupportedOperatorCount(0)),
            Some(Json::Array(items)) => items,
            Some(other) => {
                return Err(Error::InvalidShardMetadata(format!(
                    "operators must be an array, got {}",
                    other
                )))
            }
        };
        if operators.len() != 1 {
            return Err(Error::UnsupportedOperatorCount(operators.len()));
        }

        let op = &operators[0];
        let required = |field: &str| {
            op.get(field)
                .and_then(Json::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidShardMetadata(format!("operators[0].{} is required", field)))
        };
        Ok(OperatorSelector {
            id: self.spec.operator_id.clone(),
            type_: required("type")?,
            version: required("version")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(shard_metadata: Json) -> ConnectorDeployment {
        ConnectorDeployment {
            id: "d1".into(),
            metadata: DeploymentMeta { resource_version: 1 },
            spec: ConnectorDeploymentSpec {
                connector_id: "c1".into(),
                connector_type_id: "log_sink_0.1".into(),
                connector_resource_version: 1,
                operator_id: "camel-op".into(),
                desired_state: DesiredState::Ready,
                connector_spec: Json::Null,
                kafka: Json::Null,
                shard_metadata,
            },
        }
    }

    #[test]
    fn parses_fleet_manager_payload() {
        let raw = serde_json::json!({
            "id": "d1",
            "metadata": { "resource_version": 7 },
            "spec": {
                "connector_id": "c1",
                "connector_type_id": "aws-sqs-source-v1alpha1",
                "connector_resource_version": 3,
                "operator_id": "cos-fleetshard-operator-camel",
                "desired_state": "running",
                "kafka": { "bootstrap_server": "kafka:9092" },
                "shard_metadata": { "operators": [ { "type": "camel-connector-operator", "version": "[1.0.0,2.0.0)" } ] }
            }
        });
        let d: ConnectorDeployment = serde_json::from_value(raw).expect("valid descriptor");
        assert_eq!(d.resource_version(), 7);
        assert_eq!(d.desired_state(), &DesiredState::Ready);
        assert!(d.spec.connector_spec.is_null());
        let sel = d.operator_selector().expect("one operator");
        assert_eq!(sel.id, "cos-fleetshard-operator-camel");
        assert_eq!(sel.type_, "camel-connector-operator");
        assert_eq!(sel.version, "[1.0.0,2.0.0)");
    }

    #[test]
    fn destructive_states() {
        assert!(DesiredState::Stopped.is_destructive());
        assert!(DesiredState::Deleted.is_destructive());
        assert!(!DesiredState::Ready.is_destructive());
        assert!(!DesiredState::Unassigned.is_destructive());
        assert!(!DesiredState::Other("provisioning".into()).is_destructive());
    }

    #[test]
    fn unlisted_states_are_carried_through() {
        let state: DesiredState = serde_json::from_value(serde_json::json!("provisioning")).unwrap();
        assert_eq!(state, DesiredState::Other("provisioning".into()));
        assert_eq!(serde_json::to_value(&state).unwrap(), "provisioning");

        let running: DesiredState = serde_json::from_value(serde_json::json!("running")).unwrap();
        assert_eq!(running, DesiredState::Ready);
        assert_eq!(serde_json::to_value(&running).unwrap(), "ready");
        assert_eq!(serde_json::to_value(DesiredState::Stopped).unwrap(), "stopped");
    }

    #[test]
    fn rejects_zero_or_many_operators() {
        let none = deployment(serde_json::json!({}));
        assert!(matches!(none.operator_selector(), Err(Error::UnsupportedOperatorCount(0))));

        let two = deployment(serde_json::json!({ "operators": [
            { "type": "camel", "version": "1.0" },
            { "type": "debezium", "version": "1.0" }
        ]}));
        assert!(matches!(two.operator_selector(), Err(Error::UnsupportedOperatorCount(2))));
    }

    #[test]
    fn rejects_incomplete_operator_entry() {
        let d = deployment(serde_json::json!({ "operators": [ { "type": "camel" } ] }));
        let err = d.operator_selector().unwrap_err();
        assert!(matches!(err, Error::InvalidShardMetadata(_)), "err={}", err);
        assert!(err.to_string().contains("operators[0].version"));

        let d = deployment(serde_json::json!({ "operators": "camel" }));
        assert!(matches!(d.operator_selector(), Err(Error::InvalidShardMetadata(_))));
    }
}
