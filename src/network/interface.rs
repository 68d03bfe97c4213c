// src/network/interface.rs

//! Interface address collaborator.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by the interface configuration service
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct InterfaceFault(pub String);

/// Address management on host interfaces
#[async_trait]
pub trait InterfaceConfig: Send + Sync {
    /// IPv4 addresses currently assigned to `interface`
    async fn addresses(&self, interface: &str) -> Result<Vec<Ipv4Addr>, InterfaceFault>;

    async fn add_address(&self, interface: &str, address: Ipv4Addr, prefix: u8)
        -> Result<(), InterfaceFault>;

    async fn remove_address(&self, interface: &str, address: Ipv4Addr, prefix: u8)
        -> Result<(), InterfaceFault>;

    /// Broadcasts a gratuitous ARP so upstream caches learn the address
    async fn announce(&self, interface: &str, address: Ipv4Addr, gateway: Ipv4Addr)
        -> Result<(), InterfaceFault>;
}
