// virtance-agent - Compute-node agent for virtual machines and network policy
//
// Licensed under the GNU General Public License v3.0

//! Compute-node agent that provisions virtual machines ("virtances") from
//! cached templates, customizes their guest disks, drives their lifecycle
//! through a hypervisor, and attaches firewall and floating IP policy on
//! the host packet filter.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

/// Configuration subsystem
pub mod config;

/// Crate-wide errors
pub mod error;

/// Host-wide packet filter lock
pub mod lock;

/// Step journal with compensations
pub mod execution;

/// Template image cache and format conversion
pub mod image;

/// Guest disk customization
pub mod guest;

/// Provisioning pipeline
pub mod provision;

/// Virtance model and lifecycle coordinator
pub mod vm;

/// Network policy engine
pub mod network;

/// Host command collaborators
pub mod host;

/// Service facade
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use network::NetworkPolicyEngine;
pub use service::Agent;
pub use vm::{Coordinator, Virtance};
