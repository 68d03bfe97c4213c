// src/network/filter.rs

//! Packet filter service collaborator.
//!
//! The service keeps two layers: live rules with immediate effect and a
//! persisted configuration that survives restarts. They are independent,
//! and the engines keep them in step.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the packet filter service
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct FilterFault(pub String);

/// Packet filter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule in the persisted configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistedRule {
    pub table: Table,
    pub chain: String,
    pub priority: u32,
    pub args: Vec<String>,
}

impl PersistedRule {
    pub fn new(table: Table, chain: impl Into<String>, priority: u32, args: Vec<String>) -> Self {
        Self {
            table,
            chain: chain.into(),
            priority,
            args,
        }
    }
}

/// Live and persisted rule operations of the packet filter service
#[async_trait]
pub trait PacketFilter: Send + Sync {
    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool, FilterFault>;

    async fn create_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault>;

    /// Removes every rule of a live chain
    async fn flush_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault>;

    /// Deletes an empty, unreferenced live chain
    async fn delete_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault>;

    async fn rule_exists(&self, table: Table, chain: &str, args: &[String])
        -> Result<bool, FilterFault>;

    /// Inserts a live rule at `position` (1-based), or at the head
    async fn insert_rule(
        &self,
        table: Table,
        chain: &str,
        position: Option<u32>,
        args: &[String],
    ) -> Result<(), FilterFault>;

    async fn append_rule(&self, table: Table, chain: &str, args: &[String])
        -> Result<(), FilterFault>;

    async fn delete_rule(&self, table: Table, chain: &str, args: &[String])
        -> Result<(), FilterFault>;

    async fn persisted_chain_exists(&self, table: Table, chain: &str) -> Result<bool, FilterFault>;

    async fn persist_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault>;

    async fn unpersist_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault>;

    async fn persisted_rule_exists(&self, rule: &PersistedRule) -> Result<bool, FilterFault>;

    async fn persist_rule(&self, rule: &PersistedRule) -> Result<(), FilterFault>;

    async fn unpersist_rule(&self, rule: &PersistedRule) -> Result<(), FilterFault>;

    /// Persisted rules of one chain
    async fn persisted_rules(&self, table: Table, chain: &str)
        -> Result<Vec<PersistedRule>, FilterFault>;

    /// Makes pending persisted edits durable
    async fn commit(&self) -> Result<(), FilterFault>;
}
