//! Companion secret construction and data entries.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde_json::Value as Json;

use crate::error::Result;
use crate::labels::{
    LABEL_CLUSTER_ID, LABEL_CONNECTOR_ID, LABEL_CONTEXT, LABEL_DEPLOYMENT_ID,
    LABEL_DEPLOYMENT_RESOURCE_VERSION, LABEL_WATCH,
};
use crate::CONTEXT_DEPLOYMENT;

/// Build an empty, unowned secret labelled with the deployment's composite key.
pub fn new_secret(
    name: &str,
    cluster_id: &str,
    connector_id: &str,
    deployment_id: &str,
    resource_version: i64,
) -> Secret {
    let labels = BTreeMap::from([
        (LABEL_CLUSTER_ID.to_string(), cluster_id.to_string()),
        (LABEL_CONNECTOR_ID.to_string(), connector_id.to_string()),
        (LABEL_DEPLOYMENT_ID.to_string(), deployment_id.to_string()),
        (LABEL_DEPLOYMENT_RESOURCE_VERSION.to_string(), resource_version.to_string()),
        (LABEL_CONTEXT.to_string(), CONTEXT_DEPLOYMENT.to_string()),
        (LABEL_WATCH.to_string(), "true".to_string()),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Store `value` as compact JSON under `key`, replacing any previous content.
pub fn set_entry(secret: &mut Secret, key: &str, value: &Json) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    secret.data.get_or_insert_with(BTreeMap::new).insert(key.to_string(), ByteString(bytes));
    Ok(())
}

/// Decode the JSON stored under `key`, if any.
pub fn get_entry(secret: &Secret, key: &str) -> Result<Option<Json>> {
    match secret.data.as_ref().and_then(|d| d.get(key)) {
        Some(ByteString(bytes)) => Ok(Some(serde_json::from_slice(bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn new_secret_labels_include_revision_and_watch() {
        let s = new_secret("mctr-x-s-4", "k", "c1", "d1", 4);
        assert_eq!(s.name_any(), "mctr-x-s-4");
        let labels = s.labels();
        assert_eq!(labels.get(LABEL_DEPLOYMENT_RESOURCE_VERSION).map(String::as_str), Some("4"));
        assert_eq!(labels.get(LABEL_WATCH).map(String::as_str), Some("true"));
        assert_eq!(labels.get(LABEL_CONTEXT).map(String::as_str), Some("deployment"));
        assert!(s.data.is_none());
        assert!(s.owner_references().is_empty());
    }

    #[test]
    fn entries_overwrite_in_place() {
        let mut s = new_secret("n", "k", "c", "d", 1);
        set_entry(&mut s, "connector", &serde_json::json!({"a": 1})).unwrap();
        set_entry(&mut s, "connector", &serde_json::json!({"a": 2})).unwrap();
        assert_eq!(s.data.as_ref().map(|d| d.len()), Some(1));
        assert_eq!(get_entry(&s, "connector").unwrap(), Some(serde_json::json!({"a": 2})));
        assert_eq!(get_entry(&s, "kafka").unwrap(), None);
    }
}
