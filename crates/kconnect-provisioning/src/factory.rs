use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kconnect_protocol::{ConnectError, ConnectResult, KernelId, KernelSpec, ProvisionerConfig};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::discovery::{
    BuiltinDiscovery, LOCAL_PROVISIONER_NAME, PROVISIONER_GROUP, ProvisionerDiscovery,
    ProvisionerEntry,
};
use crate::provisioner::{KernelProvisioner, ProvisionerArgs, ProvisionerContext};

/// Selects the provisioner used for specs that do not name one.
pub const DEFAULT_PROVISIONER_ENV: &str = "KCONNECT_DEFAULT_PROVISIONER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerFactoryConfig {
    /// Used when a kernel spec has no provisioner stanza.
    pub default_provisioner_name: String,
}

impl Default for ProvisionerFactoryConfig {
    fn default() -> Self {
        Self {
            default_provisioner_name: LOCAL_PROVISIONER_NAME.to_owned(),
        }
    }
}

impl ProvisionerFactoryConfig {
    /// Defaults, overridden by [`DEFAULT_PROVISIONER_ENV`].
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(DEFAULT_PROVISIONER_ENV).ok())
    }

    pub fn from_env_value(value: Option<String>) -> Self {
        match value.filter(|name| !name.trim().is_empty()) {
            Some(name) => Self {
                default_provisioner_name: name.trim().to_owned(),
            },
            None => Self::default(),
        }
    }

    pub fn with_default_provisioner(mut self, name: impl Into<String>) -> Self {
        self.default_provisioner_name = name.into();
        self
    }
}

/// Registry of provisioners by name.
///
/// Populated from discovery at construction; names missing from the
/// registry are looked up individually and cached on success. A failed
/// lookup is not cached.
pub struct ProvisionerFactory {
    config: ProvisionerFactoryConfig,
    discovery: Arc<dyn ProvisionerDiscovery>,
    provisioners: Mutex<HashMap<String, ProvisionerEntry>>,
}

impl ProvisionerFactory {
    pub fn new(config: ProvisionerFactoryConfig, discovery: Arc<dyn ProvisionerDiscovery>) -> Self {
        let provisioners = discovery
            .all()
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect::<HashMap<_, _>>();
        debug!(
            group = PROVISIONER_GROUP,
            count = provisioners.len(),
            "discovered kernel provisioners"
        );
        Self {
            config,
            discovery,
            provisioners: Mutex::new(provisioners),
        }
    }

    /// Built-in provisioners, default name from the environment.
    pub fn with_builtins() -> Self {
        Self::new(ProvisionerFactoryConfig::from_env(), Arc::new(BuiltinDiscovery))
    }

    pub fn config(&self) -> &ProvisionerFactoryConfig {
        &self.config
    }

    pub fn default_provisioner_name(&self) -> &str {
        &self.config.default_provisioner_name
    }

    pub fn provisioner_config(&self, spec: &KernelSpec) -> ProvisionerConfig {
        ProvisionerConfig::from_spec(spec, self.default_provisioner_name())
    }

    /// Whether the provisioner `spec` asks for can be created. Logs a
    /// warning instead of failing when it cannot.
    #[instrument(skip(self, spec), fields(kernel = %spec.display_name))]
    pub fn is_available(&self, spec: &KernelSpec) -> bool {
        let name = self.provisioner_config(spec).name;
        if self.resolve(&name).is_some() {
            return true;
        }
        warn!(
            provisioner = %name,
            installed = ?self.provisioner_entries().keys().collect::<Vec<_>>(),
            "kernel '{}' references a kernel provisioner that is not available; \
             install the package providing it and retry",
            spec.display_name
        );
        false
    }

    /// Creates the provisioner `spec` asks for, passing it the spec's
    /// options (empty if it has none).
    #[instrument(skip(self, spec, context), fields(kernel = %spec.display_name))]
    pub fn create_instance(
        &self,
        kernel_id: &KernelId,
        spec: &KernelSpec,
        context: ProvisionerContext,
    ) -> ConnectResult<Box<dyn KernelProvisioner>> {
        let ProvisionerConfig { name, config } = self.provisioner_config(spec);
        let entry = self
            .resolve(&name)
            .ok_or_else(|| ConnectError::ProvisionerNotFound(name.clone()))?;

        debug!(provisioner = %name, locator = %entry.locator(), "instantiating kernel provisioner");
        let constructor = entry.load();
        constructor(ProvisionerArgs {
            name: name.clone(),
            kernel_id: kernel_id.clone(),
            kernel_spec: spec.clone(),
            context,
            config,
        })
        .map_err(|error| ConnectError::ProvisionerLoad {
            name,
            reason: error.to_string(),
        })
    }

    /// `name → "module:object"` for every registered provisioner.
    pub fn provisioner_entries(&self) -> BTreeMap<String, String> {
        self.provisioners
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.locator()))
            .collect()
    }

    fn resolve(&self, name: &str) -> Option<ProvisionerEntry> {
        if let Some(entry) = self.provisioners.lock().get(name) {
            return Some(entry.clone());
        }
        let entry = self.lookup(name)?;
        Some(
            self.provisioners
                .lock()
                .entry(name.to_owned())
                .or_insert(entry)
                .clone(),
        )
    }

    /// Asks discovery for `name`. The built-in local provisioner is
    /// synthesized when discovery has lost it, which happens when an older
    /// installation shadows this one.
    fn lookup(&self, name: &str) -> Option<ProvisionerEntry> {
        if let Some(entry) = self.discovery.single(name) {
            return Some(entry);
        }
        if name != LOCAL_PROVISIONER_NAME {
            return None;
        }
        warn!(
            group = PROVISIONER_GROUP,
            candidate_sources = ?self.discovery.candidate_sources(),
            "the '{LOCAL_PROVISIONER_NAME}' provisioner was not found; another installation \
             is probably shadowing this one and should be removed. Using the built-in \
             local provisioner until then"
        );
        Some(ProvisionerEntry::local())
    }
}

impl std::fmt::Debug for ProvisionerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerFactory")
            .field("config", &self.config)
            .field("provisioners", &self.provisioner_entries())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use kconnect_connection::{ConnectionSnapshot, KernelConnection};
    use kconnect_ports::LocalPortCache;
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::discovery::StaticDiscovery;

    #[derive(Debug)]
    struct RecordingProvisioner {
        args: ProvisionerArgs,
    }

    #[async_trait]
    impl KernelProvisioner for RecordingProvisioner {
        fn name(&self) -> &str {
            &self.args.name
        }

        fn kernel_id(&self) -> &KernelId {
            &self.args.kernel_id
        }

        fn kernel_spec(&self) -> &KernelSpec {
            &self.args.kernel_spec
        }

        fn config(&self) -> &Map<String, Value> {
            &self.args.config
        }

        async fn pre_launch(&mut self, _connection: &mut KernelConnection) -> ConnectResult<()> {
            Ok(())
        }

        async fn cleanup(
            &mut self,
            _connection: &mut KernelConnection,
            _restart: bool,
        ) -> ConnectResult<()> {
            Ok(())
        }

        fn connection_info(&self) -> Option<&ConnectionSnapshot> {
            None
        }
    }

    fn recording_entry(name: &str) -> ProvisionerEntry {
        ProvisionerEntry::new(name, "tests", "RecordingProvisioner", |args| {
            Ok(Box::new(RecordingProvisioner { args }))
        })
    }

    fn context() -> ProvisionerContext {
        ProvisionerContext::new(Arc::new(LocalPortCache::new()))
    }

    fn factory(discovery: StaticDiscovery) -> ProvisionerFactory {
        ProvisionerFactory::new(ProvisionerFactoryConfig::default(), Arc::new(discovery))
    }

    #[test]
    fn default_name_comes_from_environment_value() {
        assert_eq!(
            ProvisionerFactoryConfig::from_env_value(None).default_provisioner_name,
            LOCAL_PROVISIONER_NAME
        );
        assert_eq!(
            ProvisionerFactoryConfig::from_env_value(Some("  ".to_owned()))
                .default_provisioner_name,
            LOCAL_PROVISIONER_NAME
        );
        let config = ProvisionerFactoryConfig::from_env_value(Some("docker".to_owned()));
        assert_eq!(config.default_provisioner_name, "docker");
        let config = config.with_default_provisioner("k8s");
        assert_eq!(config.default_provisioner_name, "k8s");
    }

    #[test]
    fn availability_follows_registry() {
        let factory = factory(StaticDiscovery::with_builtins());
        assert!(factory.is_available(&KernelSpec::new("Python 3")));
        assert!(!factory.is_available(
            &KernelSpec::new("Remote").with_provisioner("docker-provisioner", None)
        ));
    }

    #[test]
    fn missing_stanza_creates_default_with_empty_config() -> anyhow::Result<()> {
        let factory = factory(StaticDiscovery::with_builtins());
        let provisioner =
            factory.create_instance(&KernelId::from("k1"), &KernelSpec::new("Python 3"), context())?;
        assert_eq!(provisioner.name(), LOCAL_PROVISIONER_NAME);
        assert_eq!(provisioner.kernel_id().as_str(), "k1");
        assert!(provisioner.config().is_empty());
        Ok(())
    }

    #[test]
    fn stanza_options_reach_the_provisioner() -> anyhow::Result<()> {
        let factory = factory(StaticDiscovery::with_builtins().with_entry(recording_entry("docker")));
        let options = json!({ "image": "jupyter/base", "cpus": 2 });
        let spec = KernelSpec::new("Docker")
            .with_provisioner("docker", options.as_object().cloned());

        let provisioner = factory.create_instance(&KernelId::new_uuid(), &spec, context())?;
        assert_eq!(provisioner.name(), "docker");
        assert_eq!(provisioner.config().get("image"), Some(&json!("jupyter/base")));
        assert_eq!(provisioner.kernel_spec().display_name, "Docker");
        Ok(())
    }

    #[test]
    fn unknown_provisioner_is_not_found() {
        let factory = factory(StaticDiscovery::with_builtins());
        let spec = KernelSpec::new("Remote").with_provisioner("missing", None);
        let err = factory
            .create_instance(&KernelId::new_uuid(), &spec, context())
            .unwrap_err();
        assert!(matches!(err, ConnectError::ProvisionerNotFound(name) if name == "missing"));
    }

    #[test]
    fn missing_builtin_is_recovered() -> anyhow::Result<()> {
        let factory = factory(
            StaticDiscovery::new()
                .with_entry(recording_entry("docker"))
                .with_candidate_source("/usr/lib/kconnect-0.0.9"),
        );
        assert!(!factory.provisioner_entries().contains_key(LOCAL_PROVISIONER_NAME));

        let provisioner =
            factory.create_instance(&KernelId::new_uuid(), &KernelSpec::new("Py"), context())?;
        assert_eq!(provisioner.name(), LOCAL_PROVISIONER_NAME);
        assert_eq!(
            factory.provisioner_entries().get(LOCAL_PROVISIONER_NAME),
            Some(&"kconnect_provisioning:LocalProvisioner".to_owned())
        );
        Ok(())
    }

    #[test]
    fn individual_lookups_are_cached() {
        #[derive(Default)]
        struct LateDiscovery;

        impl ProvisionerDiscovery for LateDiscovery {
            fn all(&self) -> Vec<ProvisionerEntry> {
                Vec::new()
            }

            fn single(&self, name: &str) -> Option<ProvisionerEntry> {
                (name == "late").then(|| recording_entry("late"))
            }
        }

        let factory = ProvisionerFactory::new(
            ProvisionerFactoryConfig::default(),
            Arc::new(LateDiscovery),
        );
        assert!(factory.provisioner_entries().is_empty());
        assert!(factory.is_available(&KernelSpec::new("Late").with_provisioner("late", None)));
        assert!(factory.provisioner_entries().contains_key("late"));
        assert!(!factory.is_available(&KernelSpec::new("X").with_provisioner("nope", None)));
        assert!(!factory.provisioner_entries().contains_key("nope"));
    }

    #[test]
    fn entries_report_locators() {
        let factory = factory(StaticDiscovery::with_builtins().with_entry(recording_entry("docker")));
        let entries = factory.provisioner_entries();
        assert_eq!(entries["docker"], "tests:RecordingProvisioner");
        assert_eq!(entries[LOCAL_PROVISIONER_NAME], "kconnect_provisioning:LocalProvisioner");
    }
}
