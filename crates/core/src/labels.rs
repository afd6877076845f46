//! Label keys and equality-based selectors.
//!
//! The composite keys identifying managed connectors and their secrets are
//! plain label sets; [`LabelSelector`] renders them for the API server list
//! call and evaluates them locally for the in-memory store.

use std::collections::BTreeMap;
use std::fmt;

pub const LABEL_CLUSTER_ID: &str = "cos.bf2.org/cluster.id";
pub const LABEL_CONNECTOR_ID: &str = "cos.bf2.org/connector.id";
pub const LABEL_DEPLOYMENT_ID: &str = "cos.bf2.org/deployment.id";
pub const LABEL_DEPLOYMENT_RESOURCE_VERSION: &str = "cos.bf2.org/deployment.resource.version";
pub const LABEL_CONTEXT: &str = "cos.bf2.org/context";
pub const LABEL_WATCH: &str = "cos.bf2.org/watch";

/// Conjunction of `key=value` terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an equality term.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.terms.insert(key.to_string(), value.into());
        self
    }

    /// True when every term is present in `labels` with the same value.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.terms {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn renders_sorted_kube_selector() {
        let sel = LabelSelector::new()
            .with(LABEL_DEPLOYMENT_ID, "d1")
            .with(LABEL_CLUSTER_ID, "c0");
        assert_eq!(sel.to_string(), "cos.bf2.org/cluster.id=c0,cos.bf2.org/deployment.id=d1");
        assert_eq!(LabelSelector::new().to_string(), "");
    }

    #[test]
    fn matches_requires_all_terms() {
        let sel = LabelSelector::new().with("a", "1").with("b", "2");
        assert!(sel.matches(&labels(&[("a", "1"), ("b", "2"), ("c", "3")])));
        assert!(!sel.matches(&labels(&[("a", "1")])));
        assert!(!sel.matches(&labels(&[("a", "1"), ("b", "3")])));
        assert!(LabelSelector::new().matches(&BTreeMap::new()));
    }
}
