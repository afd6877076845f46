//! Fleet-shard sync: turns connector deployment descriptors into a
//! ManagedConnector plus an owned companion Secret.
//!
//! Provisioning runs in two phases because the secret can only be owned by a
//! connector that already exists:
//!
//! 1. create or update the ManagedConnector from the descriptor;
//! 2. unless the desired state is `stopped`/`deleted`, write the Secret with
//!    the connector as owner and record its name and checksum on the
//!    connector.
//!
//! The operator must not act on a connector until step 2 has completed,
//! see [`fleetshard_core::is_secret_linked`]. Both phases are idempotent, so a
//! failed call is healed by calling again with the same descriptor.

#![forbid(unsafe_code)]

mod provisioner;

pub use provisioner::{ConnectorDeploymentProvisioner, Provisioned};
