// src/network/floating_ip.rs

//! Floating IP redirection.
//!
//! A floating address is an alias on the external bridge plus a DNAT rule
//! towards the virtance's fixed address. The alias is changed outside the
//! host-wide lock; when the lock cannot be obtained afterwards, the alias
//! change is undone so the host is left as it was.

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::FirewallConfig;
use crate::error::{Error, Result};
use crate::execution::Saga;
use crate::lock::LockManager;
use crate::network::filter::{PacketFilter, PersistedRule, Table};
use crate::network::interface::InterfaceConfig;
use crate::network::rules::ACCEPT_PRIORITY;
use crate::network::{acquire, commit_and_release, ensure_rule, remove_rule, Context, Position};

const PREROUTING: &str = "PREROUTING";

fn default_prefix() -> u8 {
    32
}

/// Floating address redirected to a fixed address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIpBinding {
    pub floating: Ipv4Addr,

    #[serde(default = "default_prefix")]
    pub prefix: u8,

    /// Upstream gateway told about the address by gratuitous ARP
    pub gateway: Ipv4Addr,

    pub fixed: Ipv4Addr,
}

/// Attaches and detaches floating IPs on the external bridge
pub struct FloatingIpManager {
    filter: Arc<dyn PacketFilter>,
    interfaces: Arc<dyn InterfaceConfig>,
    locks: LockManager,
    config: FirewallConfig,
    bridge: String,
}

impl FloatingIpManager {
    pub fn new(
        filter: Arc<dyn PacketFilter>,
        interfaces: Arc<dyn InterfaceConfig>,
        locks: LockManager,
        config: FirewallConfig,
        bridge: impl Into<String>,
    ) -> Self {
        Self {
            filter,
            interfaces,
            locks,
            config,
            bridge: bridge.into(),
        }
    }

    fn live_prerouting(&self) -> String {
        format!("{}{}", PREROUTING, self.config.chain_suffix)
    }

    fn dnat(&self, binding: &FloatingIpBinding) -> PersistedRule {
        let args = vec![
            "-d".to_string(),
            binding.floating.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            binding.fixed.to_string(),
        ];
        PersistedRule::new(Table::Nat, self.live_prerouting(), ACCEPT_PRIORITY, args)
    }

    async fn has_alias(&self, address: Ipv4Addr, cx: Context<'_>) -> Result<bool> {
        let addresses = self
            .interfaces
            .addresses(&self.bridge)
            .await
            .map_err(|e| cx.interface(e))?;
        Ok(addresses.contains(&address))
    }

    /// Adds the alias, then installs the DNAT rule and announces the
    /// address under the lock
    pub async fn attach(&self, binding: &FloatingIpBinding) -> Result<()> {
        let entity = binding.floating.to_string();
        let cx = Context {
            operation: "attach floating ip",
            entity: &entity,
        };

        let mut saga = Saga::new(cx.operation);
        if self.has_alias(binding.floating, cx).await? {
            debug!(address = %binding.floating, bridge = %self.bridge, "Alias already present");
        } else {
            self.interfaces
                .add_address(&self.bridge, binding.floating, binding.prefix)
                .await
                .map_err(|e| cx.interface(e))?;
            let (interfaces, bridge) = (self.interfaces.clone(), self.bridge.clone());
            let (address, prefix) = (binding.floating, binding.prefix);
            saga.record(
                "add alias",
                Some(Box::new(move || {
                    async move {
                        interfaces
                            .remove_address(&bridge, address, prefix)
                            .await
                            .map_err(|e| interface_error("remove alias", address, e))
                    }
                    .boxed()
                })),
            );
        }

        let guard = match acquire(&self.locks, self.config.state_timeout(), cx).await {
            Ok(guard) => guard,
            Err(e) => {
                rollback(saga, &entity).await;
                return Err(e);
            }
        };

        let filter = self.filter.as_ref();
        let outcome = async {
            let rule = self.dnat(binding);
            ensure_rule(filter, &rule.chain, Position::Tail, &rule, cx).await?;
            self.interfaces
                .announce(&self.bridge, binding.floating, binding.gateway)
                .await
                .map_err(|e| cx.interface(e))
        }
        .await;
        commit_and_release(filter, guard, cx, outcome).await?;

        metrics::increment_counter!("virtance_agent_floating_ip_attaches_total");
        info!(floating = %binding.floating, fixed = %binding.fixed, "Floating IP attached");
        Ok(())
    }

    /// Removes the alias, then the DNAT rule under the lock
    pub async fn detach(&self, binding: &FloatingIpBinding) -> Result<()> {
        let entity = binding.floating.to_string();
        let cx = Context {
            operation: "detach floating ip",
            entity: &entity,
        };

        let mut saga = Saga::new(cx.operation);
        if self.has_alias(binding.floating, cx).await? {
            self.interfaces
                .remove_address(&self.bridge, binding.floating, binding.prefix)
                .await
                .map_err(|e| cx.interface(e))?;
            let (interfaces, bridge) = (self.interfaces.clone(), self.bridge.clone());
            let (address, prefix) = (binding.floating, binding.prefix);
            saga.record(
                "remove alias",
                Some(Box::new(move || {
                    async move {
                        interfaces
                            .add_address(&bridge, address, prefix)
                            .await
                            .map_err(|e| interface_error("restore alias", address, e))
                    }
                    .boxed()
                })),
            );
        }

        let guard = match acquire(&self.locks, self.config.state_timeout(), cx).await {
            Ok(guard) => guard,
            Err(e) => {
                rollback(saga, &entity).await;
                return Err(e);
            }
        };

        let filter = self.filter.as_ref();
        let rule = self.dnat(binding);
        let outcome = remove_rule(filter, &rule.chain, &rule, cx).await;
        commit_and_release(filter, guard, cx, outcome).await?;

        info!(floating = %binding.floating, fixed = %binding.fixed, "Floating IP detached");
        Ok(())
    }
}

async fn rollback(saga: Saga<'_>, entity: &str) {
    for (step, e) in saga.compensate().await {
        warn!(%entity, %step, "Alias rollback failed: {}", e);
    }
}

fn interface_error(operation: &str, address: Ipv4Addr, fault: crate::network::InterfaceFault) -> Error {
    Error::Interface {
        operation: operation.to_string(),
        entity: address.to_string(),
        message: fault.0,
    }
}
