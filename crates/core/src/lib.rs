//! Fleet-shard core types: deployment descriptors, the ManagedConnector CRD,
//! label selectors and secret checksums.

#![forbid(unsafe_code)]

pub mod checksum;
pub mod connector;
pub mod deployment;
pub mod error;
pub mod labels;
pub mod secret;

pub use checksum::{checksum_entries, compute_checksum, is_secret_linked};
pub use connector::{
    DeploymentSpec, ManagedConnector, ManagedConnectorSpec, OperatorSelector, CONNECTOR_PREFIX,
};
pub use deployment::{ConnectorDeployment, ConnectorDeploymentSpec, DeploymentMeta, DesiredState};
pub use error::{Error, Result};
pub use labels::LabelSelector;

/// Context marker stored under [`labels::LABEL_CONTEXT`] for deployment-owned resources.
pub const CONTEXT_DEPLOYMENT: &str = "deployment";

/// Secret data entry holding the connector configuration.
pub const SECRET_ENTRY_CONNECTOR: &str = "connector";
/// Secret data entry holding the Kafka connection settings.
pub const SECRET_ENTRY_KAFKA: &str = "kafka";
/// Secret data entry holding the shard metadata.
pub const SECRET_ENTRY_META: &str = "meta";
