// src/network/firewall.rs

//! Per-entity firewall policies.
//!
//! Each entity owns an inbound and an outbound chain. The forward chain
//! jumps to them once per owned address, and the compiled rules live
//! inside them. Every step queries each layer before mutating it, so
//! repeating an operation converges instead of duplicating state.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::FirewallConfig;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::network::filter::{PacketFilter, PersistedRule, Table};
use crate::network::rules::{compile, CompiledRule, Direction, Placement, Rule, ACCEPT_PRIORITY};
use crate::network::{ensure_chain, ensure_rule, remove_chain, remove_rule, under_lock, Context, Position};

const FORWARD: &str = "FORWARD";

/// Firewall policy of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    pub entity_id: String,

    #[serde(default)]
    pub public_address: Option<Ipv4Addr>,

    #[serde(default)]
    pub private_address: Option<Ipv4Addr>,

    #[serde(default)]
    pub inbound: Vec<Rule>,

    #[serde(default)]
    pub outbound: Vec<Rule>,
}

impl FirewallPolicy {
    /// Addresses whose traffic is steered into the entity's chains
    pub fn owned_addresses(&self) -> Vec<Ipv4Addr> {
        owned(self.public_address, self.private_address)
    }
}

fn owned(public: Option<Ipv4Addr>, private: Option<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let mut addresses: Vec<Ipv4Addr> = public.into_iter().chain(private).collect();
    addresses.dedup();
    addresses
}

/// Attaches and detaches firewall policies
pub struct FirewallManager {
    filter: Arc<dyn PacketFilter>,
    locks: LockManager,
    config: FirewallConfig,
}

impl FirewallManager {
    pub fn new(filter: Arc<dyn PacketFilter>, locks: LockManager, config: FirewallConfig) -> Self {
        Self {
            filter,
            locks,
            config,
        }
    }

    /// Name of the entity's chain for `direction`
    pub fn chain(&self, entity_id: &str, direction: Direction) -> String {
        match direction {
            Direction::Inbound => format!("{}{}", self.config.in_chain_prefix, entity_id),
            Direction::Outbound => format!("{}{}", self.config.out_chain_prefix, entity_id),
        }
    }

    fn live_forward(&self) -> String {
        format!("{}{}", FORWARD, self.config.chain_suffix)
    }

    fn jump(&self, entity_id: &str, direction: Direction, address: Ipv4Addr) -> PersistedRule {
        let flag = match direction {
            Direction::Inbound => "-d",
            Direction::Outbound => "-s",
        };
        let args = vec![
            flag.to_string(),
            address.to_string(),
            "-j".to_string(),
            self.chain(entity_id, direction),
        ];
        PersistedRule::new(Table::Filter, FORWARD, ACCEPT_PRIORITY, args)
    }

    /// Creates the entity's chains and jumps and installs its rules.
    ///
    /// Rules are compiled before the lock is taken, so an invalid rule
    /// leaves the packet filter untouched.
    pub async fn attach(&self, policy: &FirewallPolicy) -> Result<()> {
        let entity = policy.entity_id.as_str();
        let compiled = compile_all(entity, &policy.inbound, &policy.outbound)?;
        let cx = Context {
            operation: "attach firewall",
            entity,
        };
        let filter = self.filter.as_ref();

        let work = async {
            for direction in [Direction::Inbound, Direction::Outbound] {
                ensure_chain(filter, Table::Filter, &self.chain(entity, direction), cx).await?;
            }
            let live_forward = self.live_forward();
            for address in policy.owned_addresses() {
                for direction in [Direction::Inbound, Direction::Outbound] {
                    let jump = self.jump(entity, direction, address);
                    ensure_rule(filter, &live_forward, Position::At(self.config.insert_line), &jump, cx)
                        .await?;
                }
            }
            self.install(entity, &compiled, cx).await
        };
        under_lock(filter, &self.locks, self.config.state_timeout(), cx, work).await?;

        metrics::increment_counter!("virtance_agent_policy_attaches_total");
        info!(
            entity = %entity,
            inbound = policy.inbound.len(),
            outbound = policy.outbound.len(),
            "Firewall policy attached"
        );
        Ok(())
    }

    /// Removes the entity's jumps, rules and chains.
    ///
    /// Detaching an entity that was never attached changes nothing.
    pub async fn detach(
        &self,
        entity_id: &str,
        public_address: Option<Ipv4Addr>,
        private_address: Option<Ipv4Addr>,
    ) -> Result<()> {
        let cx = Context {
            operation: "detach firewall",
            entity: entity_id,
        };
        let filter = self.filter.as_ref();

        let work = async {
            let live_forward = self.live_forward();
            for address in owned(public_address, private_address) {
                for direction in [Direction::Inbound, Direction::Outbound] {
                    let jump = self.jump(entity_id, direction, address);
                    remove_rule(filter, &live_forward, &jump, cx).await?;
                }
            }
            for direction in [Direction::Inbound, Direction::Outbound] {
                let chain = self.chain(entity_id, direction);
                let persisted = filter
                    .persisted_rules(Table::Filter, &chain)
                    .await
                    .map_err(|e| cx.filter(e))?;
                for rule in &persisted {
                    remove_rule(filter, &chain, rule, cx).await?;
                }
                remove_chain(filter, Table::Filter, &chain, cx).await?;
            }
            Ok::<_, Error>(())
        };
        under_lock(filter, &self.locks, self.config.state_timeout(), cx, work).await?;

        metrics::increment_counter!("virtance_agent_policy_detaches_total");
        info!(entity = %entity_id, "Firewall policy detached");
        Ok(())
    }

    /// Adds rules to an attached policy
    pub async fn attach_rules(&self, entity_id: &str, inbound: &[Rule], outbound: &[Rule]) -> Result<()> {
        let compiled = compile_all(entity_id, inbound, outbound)?;
        let cx = Context {
            operation: "attach rules",
            entity: entity_id,
        };
        let filter = self.filter.as_ref();

        let work = async {
            for (direction, _) in &compiled {
                let chain = self.chain(entity_id, *direction);
                if !filter
                    .chain_exists(Table::Filter, &chain)
                    .await
                    .map_err(|e| cx.filter(e))?
                {
                    return Err(Error::NotFound {
                        operation: cx.operation.to_string(),
                        entity: chain,
                        message: "policy is not attached".to_string(),
                    });
                }
            }
            self.install(entity_id, &compiled, cx).await
        };
        under_lock(filter, &self.locks, self.config.state_timeout(), cx, work).await?;
        info!(entity = %entity_id, rules = compiled.len(), "Firewall rules attached");
        Ok(())
    }

    /// Removes rules from a policy; absent rules are skipped
    pub async fn detach_rules(&self, entity_id: &str, inbound: &[Rule], outbound: &[Rule]) -> Result<()> {
        let compiled = compile_all(entity_id, inbound, outbound)?;
        let cx = Context {
            operation: "detach rules",
            entity: entity_id,
        };
        let filter = self.filter.as_ref();

        let work = async {
            for (direction, rule) in &compiled {
                let chain = self.chain(entity_id, *direction);
                let persisted = PersistedRule::new(Table::Filter, chain.as_str(), rule.priority, rule.args.clone());
                remove_rule(filter, &chain, &persisted, cx).await?;
            }
            Ok::<_, Error>(())
        };
        under_lock(filter, &self.locks, self.config.state_timeout(), cx, work).await?;
        info!(entity = %entity_id, rules = compiled.len(), "Firewall rules detached");
        Ok(())
    }

    async fn install(&self, entity_id: &str, compiled: &[(Direction, CompiledRule)], cx: Context<'_>) -> Result<()> {
        for (direction, rule) in compiled {
            let chain = self.chain(entity_id, *direction);
            let persisted = PersistedRule::new(Table::Filter, chain.as_str(), rule.priority, rule.args.clone());
            let position = match rule.placement {
                Placement::Head => Position::Head,
                Placement::Tail => Position::Tail,
            };
            ensure_rule(self.filter.as_ref(), &chain, position, &persisted, cx).await?;
        }
        Ok(())
    }
}

fn compile_all(entity_id: &str, inbound: &[Rule], outbound: &[Rule]) -> Result<Vec<(Direction, CompiledRule)>> {
    let inbound = inbound.iter().map(|r| (Direction::Inbound, r));
    let outbound = outbound.iter().map(|r| (Direction::Outbound, r));
    inbound
        .chain(outbound)
        .map(|(direction, rule)| Ok((direction, compile(entity_id, direction, rule)?)))
        .collect()
}
