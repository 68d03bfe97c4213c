// src/service/mod.rs

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::{AgentConfig, ConfigManager};
use crate::error::Result;
use crate::guest::{Customizer, GuestToolkit};
use crate::host::{IprouteInterfaces, IptablesFilter};
use crate::image::{ImageCache, ImageConverter, ImageTemplate, QemuImg};
use crate::lock::{FileLockBackend, LockBackend, LockManager};
use crate::network::{InterfaceConfig, NetworkPolicyEngine, PacketFilter};
use crate::provision::ProvisioningPipeline;
use crate::vm::{Coordinator, Hypervisor};

/// Compute-node agent: configuration, template cache, host-wide lock and
/// network policy engine.
///
/// Lifecycle coordinators are built on demand around a hypervisor binding
/// with [`Agent::coordinator`].
pub struct Agent {
    config: AgentConfig,
    cache: Arc<ImageCache>,
    locks: LockManager,
    network: NetworkPolicyEngine,
}

impl Agent {
    /// Agent with the lock state kept in `firewall.state_file`
    pub fn new(config: AgentConfig, filter: Arc<dyn PacketFilter>, interfaces: Arc<dyn InterfaceConfig>) -> Self {
        let backend = Arc::new(FileLockBackend::new(config.firewall.state_file.clone()));
        Self::with_lock_backend(config, backend, filter, interfaces)
    }

    pub fn with_lock_backend(
        config: AgentConfig,
        backend: Arc<dyn LockBackend>,
        filter: Arc<dyn PacketFilter>,
        interfaces: Arc<dyn InterfaceConfig>,
    ) -> Self {
        let locks = LockManager::new(backend, config.firewall.poll_interval());
        let network = NetworkPolicyEngine::new(
            filter,
            interfaces,
            locks.clone(),
            config.firewall.clone(),
            config.network.external_bridge.clone(),
        );
        let cache = Arc::new(ImageCache::new(config.cache.directory.clone()));
        info!(
            cache = %config.cache.directory.display(),
            bridge = %config.network.external_bridge,
            "Agent initialized"
        );
        Self {
            config,
            cache,
            locks,
            network,
        }
    }

    /// Agent driving the host's `iptables`, `firewall-cmd`, `ip` and `nmcli`
    pub fn with_host_tools(config: AgentConfig) -> Self {
        Self::new(config, Arc::new(IptablesFilter::new()), Arc::new(IprouteInterfaces::new()))
    }

    /// Loads and validates the configuration file, then wires host tools
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let manager = ConfigManager::load_from_file(path)?;
        Ok(Self::with_host_tools(manager.get_config().clone()))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn network(&self) -> &NetworkPolicyEngine {
        &self.network
    }

    /// Downloads a template into the cache unless a verified copy is present
    pub async fn fetch_image(&self, url: &str, checksum: &str) -> Result<std::path::PathBuf> {
        self.cache.resolve(&ImageTemplate::new(url, checksum)).await
    }

    /// Coordinator converting images with `qemu-img`
    pub fn coordinator(&self, hypervisor: Arc<dyn Hypervisor>, toolkit: Arc<dyn GuestToolkit>) -> Coordinator {
        self.coordinator_with_converter(hypervisor, toolkit, Arc::new(QemuImg::new()))
    }

    pub fn coordinator_with_converter(
        &self,
        hypervisor: Arc<dyn Hypervisor>,
        toolkit: Arc<dyn GuestToolkit>,
        converter: Arc<dyn ImageConverter>,
    ) -> Coordinator {
        let pipeline = ProvisioningPipeline::new(hypervisor.clone(), converter, Customizer::new(toolkit));
        Coordinator::new(
            hypervisor,
            self.cache.clone(),
            Arc::new(pipeline),
            self.config.network.clone(),
            self.config.storage.backup_pool_pattern.clone(),
        )
    }
}
