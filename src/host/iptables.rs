// src/host/iptables.rs

//! Packet filter backed by `iptables` for live rules and `firewall-cmd`
//! direct rules for the persisted configuration.

use async_trait::async_trait;
use tracing::debug;

use super::{args, run, CommandOutput};
use crate::network::{FilterFault, PacketFilter, PersistedRule, Table};

const FAMILY: &str = "ipv4";

/// `iptables` and `firewall-cmd --permanent --direct`
#[derive(Debug, Clone)]
pub struct IptablesFilter {
    iptables: String,
    firewall_cmd: String,
}

impl IptablesFilter {
    pub fn new() -> Self {
        Self::with_binaries("iptables", "firewall-cmd")
    }

    pub fn with_binaries(iptables: impl Into<String>, firewall_cmd: impl Into<String>) -> Self {
        Self {
            iptables: iptables.into(),
            firewall_cmd: firewall_cmd.into(),
        }
    }

    fn live_args(table: Table, flag: &str, chain: &str, position: Option<u32>, rule: &[String]) -> Vec<String> {
        let mut out = args(["-w", "-t", table.as_str(), flag, chain]);
        if let Some(position) = position {
            out.push(position.to_string());
        }
        out.extend(rule.iter().cloned());
        out
    }

    fn direct_chain_args(command: &str, table: Table, chain: &str) -> Vec<String> {
        args(["--permanent", "--direct", command, FAMILY, table.as_str(), chain])
    }

    fn direct_rule_args(command: &str, rule: &PersistedRule) -> Vec<String> {
        let mut out = args(["--permanent", "--direct", command, FAMILY, rule.table.as_str()]);
        out.push(rule.chain.clone());
        out.push(rule.priority.to_string());
        out.extend(rule.args.iter().cloned());
        out
    }

    async fn exec(&self, program: &str, args: Vec<String>) -> Result<CommandOutput, FilterFault> {
        debug!(program, ?args, "Packet filter command");
        run(program, &args)
            .await
            .map_err(|e| FilterFault(format!("{}: {}", program, e)))
    }

    /// Runs a mutating command; any non-zero exit is a fault
    async fn change(&self, program: &str, args: Vec<String>) -> Result<(), FilterFault> {
        let output = self.exec(program, args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(FilterFault(output.failure_message(program)))
        }
    }

    /// Runs a query: exit 0 is yes, exit 1 is no
    async fn query(&self, program: &str, args: Vec<String>) -> Result<bool, FilterFault> {
        let output = self.exec(program, args).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(FilterFault(output.failure_message(program))),
        }
    }
}

impl Default for IptablesFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `firewall-cmd --direct --get-rules` output: `priority args...` per line
pub(crate) fn parse_direct_rules(table: Table, chain: &str, output: &str) -> Result<Vec<PersistedRule>, FilterFault> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut words = line.split_whitespace();
            let priority = words
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| FilterFault(format!("unparsable direct rule: {}", line)))?;
            Ok(PersistedRule::new(table, chain, priority, args(words)))
        })
        .collect()
}

#[async_trait]
impl PacketFilter for IptablesFilter {
    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool, FilterFault> {
        let output = self
            .exec(&self.iptables, args(["-w", "-t", table.as_str(), "-n", "-L", chain]))
            .await?;
        Ok(output.success())
    }

    async fn create_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        self.change(&self.iptables, Self::live_args(table, "-N", chain, None, &[]))
            .await
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        self.change(&self.iptables, Self::live_args(table, "-F", chain, None, &[]))
            .await
    }

    async fn delete_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        self.change(&self.iptables, Self::live_args(table, "-X", chain, None, &[]))
            .await
    }

    async fn rule_exists(&self, table: Table, chain: &str, rule: &[String]) -> Result<bool, FilterFault> {
        self.query(&self.iptables, Self::live_args(table, "-C", chain, None, rule))
            .await
    }

    async fn insert_rule(
        &self,
        table: Table,
        chain: &str,
        position: Option<u32>,
        rule: &[String],
    ) -> Result<(), FilterFault> {
        self.change(&self.iptables, Self::live_args(table, "-I", chain, position, rule))
            .await
    }

    async fn append_rule(&self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterFault> {
        self.change(&self.iptables, Self::live_args(table, "-A", chain, None, rule))
            .await
    }

    async fn delete_rule(&self, table: Table, chain: &str, rule: &[String]) -> Result<(), FilterFault> {
        self.change(&self.iptables, Self::live_args(table, "-D", chain, None, rule))
            .await
    }

    async fn persisted_chain_exists(&self, table: Table, chain: &str) -> Result<bool, FilterFault> {
        self.query(&self.firewall_cmd, Self::direct_chain_args("--query-chain", table, chain))
            .await
    }

    async fn persist_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        self.change(&self.firewall_cmd, Self::direct_chain_args("--add-chain", table, chain))
            .await
    }

    async fn unpersist_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        self.change(&self.firewall_cmd, Self::direct_chain_args("--remove-chain", table, chain))
            .await
    }

    async fn persisted_rule_exists(&self, rule: &PersistedRule) -> Result<bool, FilterFault> {
        self.query(&self.firewall_cmd, Self::direct_rule_args("--query-rule", rule))
            .await
    }

    async fn persist_rule(&self, rule: &PersistedRule) -> Result<(), FilterFault> {
        self.change(&self.firewall_cmd, Self::direct_rule_args("--add-rule", rule))
            .await
    }

    async fn unpersist_rule(&self, rule: &PersistedRule) -> Result<(), FilterFault> {
        self.change(&self.firewall_cmd, Self::direct_rule_args("--remove-rule", rule))
            .await
    }

    async fn persisted_rules(&self, table: Table, chain: &str) -> Result<Vec<PersistedRule>, FilterFault> {
        let output = self
            .exec(&self.firewall_cmd, Self::direct_chain_args("--get-rules", table, chain))
            .await?;
        if !output.success() {
            return Err(FilterFault(output.failure_message(&self.firewall_cmd)));
        }
        parse_direct_rules(table, chain, &output.stdout)
    }

    // Permanent direct edits are written as they are made; this validates them.
    async fn commit(&self) -> Result<(), FilterFault> {
        self.change(&self.firewall_cmd, args(["--check-config"])).await
    }
}
