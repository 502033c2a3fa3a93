use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Immutable configuration of one connector instance.
///
/// `connector_type` selects the implementation from the type registry;
/// `params` is handed to that implementation untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(rename = "type")]
    pub connector_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ConnectorConfig {
    pub fn new(connector_type: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}
