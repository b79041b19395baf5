use std::fmt;
use std::sync::Arc;

use kconnect_protocol::ConnectResult;

use crate::local::LocalProvisioner;
use crate::provisioner::{KernelProvisioner, ProvisionerArgs};

/// Extension group provisioners are advertised under.
pub const PROVISIONER_GROUP: &str = "kconnect.kernel_provisioners";

/// Name of the built-in [`LocalProvisioner`].
pub const LOCAL_PROVISIONER_NAME: &str = "local-provisioner";

pub type ProvisionerConstructor =
    Arc<dyn Fn(ProvisionerArgs) -> ConnectResult<Box<dyn KernelProvisioner>> + Send + Sync>;

/// A named provisioner and how to construct it.
#[derive(Clone)]
pub struct ProvisionerEntry {
    pub name: String,
    pub module: String,
    pub object: String,
    constructor: ProvisionerConstructor,
}

impl ProvisionerEntry {
    pub fn new<F>(
        name: impl Into<String>,
        module: impl Into<String>,
        object: impl Into<String>,
        constructor: F,
    ) -> Self
    where
        F: Fn(ProvisionerArgs) -> ConnectResult<Box<dyn KernelProvisioner>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            module: module.into(),
            object: object.into(),
            constructor: Arc::new(constructor),
        }
    }

    /// Entry for the built-in local provisioner.
    pub fn local() -> Self {
        Self::new(
            LOCAL_PROVISIONER_NAME,
            "kconnect_provisioning",
            "LocalProvisioner",
            |args| Ok(Box::new(LocalProvisioner::new(args))),
        )
    }

    /// `module:object`.
    pub fn locator(&self) -> String {
        format!("{}:{}", self.module, self.object)
    }

    pub fn load(&self) -> ProvisionerConstructor {
        Arc::clone(&self.constructor)
    }
}

impl fmt::Debug for ProvisionerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionerEntry")
            .field("name", &self.name)
            .field("locator", &self.locator())
            .finish_non_exhaustive()
    }
}

/// The host environment's view of which provisioners are installed.
pub trait ProvisionerDiscovery: Send + Sync {
    /// Every entry advertised under [`PROVISIONER_GROUP`].
    fn all(&self) -> Vec<ProvisionerEntry>;

    fn single(&self, name: &str) -> Option<ProvisionerEntry>;

    /// Installations that could be shadowing the built-in entries, for
    /// diagnostics.
    fn candidate_sources(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Advertises only the built-in provisioners.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinDiscovery;

impl ProvisionerDiscovery for BuiltinDiscovery {
    fn all(&self) -> Vec<ProvisionerEntry> {
        vec![ProvisionerEntry::local()]
    }

    fn single(&self, name: &str) -> Option<ProvisionerEntry> {
        (name == LOCAL_PROVISIONER_NAME).then(ProvisionerEntry::local)
    }
}

/// A fixed list of entries, e.g. plugins registered by the embedding
/// application.
#[derive(Debug, Default, Clone)]
pub struct StaticDiscovery {
    entries: Vec<ProvisionerEntry>,
    candidate_sources: Vec<String>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the built-in entries.
    pub fn with_builtins() -> Self {
        Self::new().with_entry(ProvisionerEntry::local())
    }

    pub fn with_entry(mut self, entry: ProvisionerEntry) -> Self {
        self.entries.retain(|existing| existing.name != entry.name);
        self.entries.push(entry);
        self
    }

    pub fn with_candidate_source(mut self, source: impl Into<String>) -> Self {
        self.candidate_sources.push(source.into());
        self
    }
}

impl ProvisionerDiscovery for StaticDiscovery {
    fn all(&self) -> Vec<ProvisionerEntry> {
        self.entries.clone()
    }

    fn single(&self, name: &str) -> Option<ProvisionerEntry> {
        self.entries.iter().find(|entry| entry.name == name).cloned()
    }

    fn candidate_sources(&self) -> Vec<String> {
        self.candidate_sources.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_discovery_knows_only_local() {
        let discovery = BuiltinDiscovery;
        let all = discovery.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, LOCAL_PROVISIONER_NAME);
        assert_eq!(all[0].locator(), "kconnect_provisioning:LocalProvisioner");
        assert!(discovery.single(LOCAL_PROVISIONER_NAME).is_some());
        assert!(discovery.single("docker-provisioner").is_none());
    }

    #[test]
    fn static_discovery_replaces_entries_by_name() {
        let discovery = StaticDiscovery::with_builtins()
            .with_entry(ProvisionerEntry::new(
                LOCAL_PROVISIONER_NAME,
                "custom",
                "Local",
                |args| Ok(Box::new(LocalProvisioner::new(args))),
            ))
            .with_candidate_source("/opt/old-install");

        let all = discovery.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].locator(), "custom:Local");
        assert_eq!(discovery.candidate_sources(), vec!["/opt/old-install"]);
    }
}
