//! Filter criteria and their canonical query form.
//!
//! The canonical form doubles as the REST query for `/api/builds` and as the
//! key the scheduler compares to detect no-op filter changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw filter input as the UI holds it. Empty strings mean "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub provider: Option<String>,
    pub status: Option<String>,
    pub q: Option<String>,
}

impl FilterCriteria {
    /// Builds criteria from the three select/input values of the filter bar.
    pub fn from_inputs(provider: &str, status: &str, q: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            status: Some(status.to_string()),
            q: Some(q.to_string()),
        }
    }
}

/// Key-ordered mapping holding only the fields that actually filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalQuery(BTreeMap<String, String>);

impl CanonicalQuery {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Query pairs in key order, ready for `RequestBuilder::query`.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    pub fn to_criteria(&self) -> FilterCriteria {
        FilterCriteria {
            provider: self.get("provider").map(str::to_string),
            status: self.get("status").map(str::to_string),
            q: self.get("q").map(str::to_string),
        }
    }
}

pub fn normalize(criteria: &FilterCriteria) -> CanonicalQuery {
    let mut out = BTreeMap::new();
    for (key, value) in [
        ("provider", &criteria.provider),
        ("status", &criteria.status),
        ("q", &criteria.q),
    ] {
        // Whitespace-only means unset; anything else goes through verbatim.
        if let Some(v) = value.as_deref() {
            if !v.trim().is_empty() {
                out.insert(key.to_string(), v.to_string());
            }
        }
    }
    CanonicalQuery(out)
}
