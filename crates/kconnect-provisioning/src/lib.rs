//! Kernel provisioners: the pluggable strategies that prepare the
//! environment a kernel runs in, and the registry that resolves them by
//! name from a kernel spec's `kernel_provisioner` stanza.

mod discovery;
mod factory;
mod local;
mod provisioner;

pub use discovery::{
    BuiltinDiscovery, LOCAL_PROVISIONER_NAME, PROVISIONER_GROUP, ProvisionerConstructor,
    ProvisionerDiscovery, ProvisionerEntry, StaticDiscovery,
};
pub use factory::{DEFAULT_PROVISIONER_ENV, ProvisionerFactory, ProvisionerFactoryConfig};
pub use local::LocalProvisioner;
pub use provisioner::{KernelProvisioner, ProvisionerArgs, ProvisionerContext};
