//! Kernel specification as consumed by connection and provisioning code.
//!
//! Only `display_name` and `metadata` are interpreted here; the rest is
//! carried through untouched for whoever launches the kernel.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the `{provisioner_name, config}` stanza.
pub const PROVISIONER_METADATA_KEY: &str = "kernel_provisioner";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    #[serde(default)]
    pub argv: Vec<String>,
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,
}

impl KernelSpec {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    /// Adds a provisioner stanza to the metadata. A `None` config leaves the
    /// `config` sub-mapping out entirely.
    pub fn with_provisioner(
        mut self,
        provisioner_name: impl Into<String>,
        config: Option<Map<String, Value>>,
    ) -> Self {
        let mut stanza = Map::new();
        stanza.insert(
            "provisioner_name".to_owned(),
            Value::String(provisioner_name.into()),
        );
        if let Some(config) = config {
            stanza.insert("config".to_owned(), Value::Object(config));
        }
        self.metadata
            .insert(PROVISIONER_METADATA_KEY.to_owned(), Value::Object(stanza));
        self
    }

    pub fn provisioner_stanza(&self) -> Option<&Map<String, Value>> {
        self.metadata
            .get(PROVISIONER_METADATA_KEY)
            .and_then(Value::as_object)
    }
}

/// Provisioner selection derived from one kernel specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ProvisionerConfig {
    /// Reads the spec's stanza. Without a usable `provisioner_name` the
    /// default name is substituted with empty options; with a name but no
    /// `config` object an empty mapping is synthesized.
    pub fn from_spec(spec: &KernelSpec, default_name: &str) -> Self {
        let Some(stanza) = spec.provisioner_stanza() else {
            return Self::named(default_name);
        };
        let Some(name) = stanza.get("provisioner_name").and_then(Value::as_str) else {
            return Self::named(default_name);
        };
        let config = stanza
            .get("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self {
            name: name.to_owned(),
            config,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Map::new(),
        }
    }
}
