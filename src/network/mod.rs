// src/network/mod.rs

//! Network policy engine: per-entity firewall chains and floating IP
//! redirection, serialized host-wide by the [`LockManager`].

pub mod filter;
pub mod firewall;
pub mod floating_ip;
pub mod interface;
pub mod rules;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::FirewallConfig;
use crate::error::{Error, Result};
use crate::lock::{LockError, LockGuard, LockManager};

pub use filter::{FilterFault, PacketFilter, PersistedRule, Table};
pub use firewall::{FirewallManager, FirewallPolicy};
pub use floating_ip::{FloatingIpBinding, FloatingIpManager};
pub use interface::{InterfaceConfig, InterfaceFault};
pub use rules::{Action, Direction, Protocol, Rule};

/// Firewall and floating IP managers sharing one packet filter and lock
pub struct NetworkPolicyEngine {
    firewall: FirewallManager,
    floating_ips: FloatingIpManager,
}

impl NetworkPolicyEngine {
    pub fn new(
        filter: Arc<dyn PacketFilter>,
        interfaces: Arc<dyn InterfaceConfig>,
        locks: LockManager,
        config: FirewallConfig,
        external_bridge: impl Into<String>,
    ) -> Self {
        Self {
            firewall: FirewallManager::new(filter.clone(), locks.clone(), config.clone()),
            floating_ips: FloatingIpManager::new(filter, interfaces, locks, config, external_bridge),
        }
    }

    pub fn firewall(&self) -> &FirewallManager {
        &self.firewall
    }

    pub fn floating_ips(&self) -> &FloatingIpManager {
        &self.floating_ips
    }
}

/// Where a live rule is placed when it is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Position {
    /// Inserted at a 1-based line
    At(u32),
    Head,
    Tail,
}

/// Error context of one packet-filter mutation
#[derive(Debug, Clone, Copy)]
pub(crate) struct Context<'a> {
    pub operation: &'a str,
    pub entity: &'a str,
}

impl Context<'_> {
    pub fn filter(&self, fault: FilterFault) -> Error {
        Error::PacketFilter {
            operation: self.operation.to_string(),
            entity: self.entity.to_string(),
            message: fault.0,
        }
    }

    pub fn interface(&self, fault: InterfaceFault) -> Error {
        Error::Interface {
            operation: self.operation.to_string(),
            entity: self.entity.to_string(),
            message: fault.0,
        }
    }

    pub fn lock(&self, error: LockError) -> Error {
        match error {
            LockError::Timeout(timeout) => Error::LockTimeout {
                operation: self.operation.to_string(),
                entity: self.entity.to_string(),
                timeout,
            },
            LockError::Backend { path, error } => Error::Io {
                path: path.into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, error),
            },
        }
    }
}

pub(crate) async fn acquire(locks: &LockManager, timeout: Duration, cx: Context<'_>) -> Result<LockGuard> {
    locks.acquire(timeout).await.map_err(|e| cx.lock(e))
}

/// Commits persisted edits and releases the lock, whatever `outcome` was.
///
/// The first failure wins: the mutation, then the commit, then the release.
pub(crate) async fn commit_and_release<T>(
    filter: &dyn PacketFilter,
    guard: LockGuard,
    cx: Context<'_>,
    outcome: Result<T>,
) -> Result<T> {
    let committed = filter.commit().await.map_err(|e| cx.filter(e));
    let released = guard.release().map_err(|e| cx.lock(e));
    match (outcome, committed, released) {
        (Ok(value), Ok(()), Ok(())) => Ok(value),
        (Err(e), committed, released) => {
            if let Err(c) = committed {
                warn!(operation = cx.operation, entity = cx.entity, "Commit after failure also failed: {}", c);
            }
            if let Err(r) = released {
                warn!(operation = cx.operation, entity = cx.entity, "Lock release failed: {}", r);
            }
            Err(e)
        }
        (Ok(_), Err(e), _) | (Ok(_), Ok(()), Err(e)) => Err(e),
    }
}

/// Runs `work` under the host-wide lock
pub(crate) async fn under_lock<T, F>(
    filter: &dyn PacketFilter,
    locks: &LockManager,
    timeout: Duration,
    cx: Context<'_>,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guard = acquire(locks, timeout, cx).await?;
    let outcome = work.await;
    commit_and_release(filter, guard, cx, outcome).await
}

/// Creates a chain in each layer where it is missing
pub(crate) async fn ensure_chain(filter: &dyn PacketFilter, table: Table, chain: &str, cx: Context<'_>) -> Result<()> {
    if !filter.chain_exists(table, chain).await.map_err(|e| cx.filter(e))? {
        filter.create_chain(table, chain).await.map_err(|e| cx.filter(e))?;
        debug!(entity = cx.entity, %table, chain, "Live chain created");
    }
    if !filter
        .persisted_chain_exists(table, chain)
        .await
        .map_err(|e| cx.filter(e))?
    {
        filter.persist_chain(table, chain).await.map_err(|e| cx.filter(e))?;
        debug!(entity = cx.entity, %table, chain, "Chain persisted");
    }
    Ok(())
}

/// Deletes a chain from each layer where it is present
pub(crate) async fn remove_chain(filter: &dyn PacketFilter, table: Table, chain: &str, cx: Context<'_>) -> Result<()> {
    if filter.chain_exists(table, chain).await.map_err(|e| cx.filter(e))? {
        filter.flush_chain(table, chain).await.map_err(|e| cx.filter(e))?;
        filter.delete_chain(table, chain).await.map_err(|e| cx.filter(e))?;
        debug!(entity = cx.entity, %table, chain, "Live chain deleted");
    }
    if filter
        .persisted_chain_exists(table, chain)
        .await
        .map_err(|e| cx.filter(e))?
    {
        filter.unpersist_chain(table, chain).await.map_err(|e| cx.filter(e))?;
        debug!(entity = cx.entity, %table, chain, "Chain unpersisted");
    }
    Ok(())
}

/// Installs a rule in each layer where it is missing.
///
/// `live_chain` may differ from the persisted chain name.
pub(crate) async fn ensure_rule(
    filter: &dyn PacketFilter,
    live_chain: &str,
    position: Position,
    rule: &PersistedRule,
    cx: Context<'_>,
) -> Result<()> {
    let table = rule.table;
    if !filter
        .rule_exists(table, live_chain, &rule.args)
        .await
        .map_err(|e| cx.filter(e))?
    {
        let installed = match position {
            Position::At(line) => filter.insert_rule(table, live_chain, Some(line), &rule.args).await,
            Position::Head => filter.insert_rule(table, live_chain, None, &rule.args).await,
            Position::Tail => filter.append_rule(table, live_chain, &rule.args).await,
        };
        installed.map_err(|e| cx.filter(e))?;
        debug!(entity = cx.entity, chain = live_chain, args = ?rule.args, "Live rule installed");
    }
    if !filter
        .persisted_rule_exists(rule)
        .await
        .map_err(|e| cx.filter(e))?
    {
        filter.persist_rule(rule).await.map_err(|e| cx.filter(e))?;
    }
    Ok(())
}

/// Removes a rule from each layer where it is present
pub(crate) async fn remove_rule(
    filter: &dyn PacketFilter,
    live_chain: &str,
    rule: &PersistedRule,
    cx: Context<'_>,
) -> Result<()> {
    let table = rule.table;
    if filter
        .rule_exists(table, live_chain, &rule.args)
        .await
        .map_err(|e| cx.filter(e))?
    {
        filter
            .delete_rule(table, live_chain, &rule.args)
            .await
            .map_err(|e| cx.filter(e))?;
        debug!(entity = cx.entity, chain = live_chain, args = ?rule.args, "Live rule removed");
    }
    if filter
        .persisted_rule_exists(rule)
        .await
        .map_err(|e| cx.filter(e))?
    {
        filter.unpersist_rule(rule).await.map_err(|e| cx.filter(e))?;
    }
    Ok(())
}
