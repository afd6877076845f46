//! Content checksums of secret payloads, used for change detection only.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::connector::ManagedConnector;

/// Order-independent SHA-256 over `(key, value)` entries, hex encoded.
///
/// Entries are sorted before hashing and every field is length-prefixed, so
/// the same set of entries always yields the same digest.
pub fn checksum_entries<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut sorted: Vec<(&str, &[u8])> = entries.into_iter().collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for (k, v) in sorted {
        hasher.update((k.len() as u64).to_le_bytes());
        hasher.update(k.as_bytes());
        hasher.update((v.len() as u64).to_le_bytes());
        hasher.update(v);
    }
    hex::encode(hasher.finalize())
}

/// Checksum of a secret's `data` entries.
pub fn compute_checksum(secret: &Secret) -> String {
    let entries = secret.data.iter().flatten().map(|(k, v)| (k.as_str(), v.0.as_slice()));
    checksum_entries(entries)
}

/// True when `connector` references `secret` by name and the recorded
/// checksum matches the secret's current content. Anything else means the
/// connector is not yet ready to act on.
pub fn is_secret_linked(connector: &ManagedConnector, secret: &Secret) -> bool {
    let d = &connector.spec.deployment;
    match (d.secret.as_deref(), d.secret_checksum.as_deref()) {
        (Some(name), Some(sum)) => name == secret.name_any() && sum == compute_checksum(secret),
        _ => false,
    }
}
