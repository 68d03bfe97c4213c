// src/host/iproute.rs

//! Interface addresses through `ip`, persisted in the NetworkManager profile
//! of the device when one is active, announced with `arping`.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{args, run};
use crate::network::{InterfaceConfig, InterfaceFault};

const ARP_COUNT: &str = "3";

#[derive(Debug, Clone)]
pub struct IprouteInterfaces {
    ip: String,
    nmcli: String,
    arping: String,
}

impl IprouteInterfaces {
    pub fn new() -> Self {
        Self {
            ip: "ip".to_string(),
            nmcli: "nmcli".to_string(),
            arping: "arping".to_string(),
        }
    }

    async fn exec(&self, program: &str, args: Vec<String>) -> Result<String, InterfaceFault> {
        debug!(program, ?args, "Interface command");
        let output = run(program, &args)
            .await
            .map_err(|e| InterfaceFault(format!("{}: {}", program, e)))?;
        if !output.success() {
            return Err(InterfaceFault(output.failure_message(program)));
        }
        Ok(output.stdout)
    }

    /// Active NetworkManager connection of `interface`, if any
    async fn connection(&self, interface: &str) -> Option<String> {
        let out = self
            .exec(&self.nmcli, args(["-g", "GENERAL.CONNECTION", "device", "show", interface]))
            .await
            .ok()?;
        let name = out.trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    async fn persist(&self, interface: &str, change: &str, cidr: &str) -> Result<(), InterfaceFault> {
        let Some(connection) = self.connection(interface).await else {
            warn!(interface, "No active connection, address change not persisted");
            return Ok(());
        };
        let setting = format!("{}ipv4.addresses", change);
        self.exec(&self.nmcli, args(["connection", "modify", connection.as_str(), setting.as_str(), cidr]))
            .await
            .map(|_| ())
    }
}

impl Default for IprouteInterfaces {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts addresses from `ip -o -4 addr show` output
pub(crate) fn parse_addresses(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "inet")?;
            let cidr = words.next()?;
            cidr.split('/').next()?.parse().ok()
        })
        .collect()
}

#[async_trait]
impl InterfaceConfig for IprouteInterfaces {
    async fn addresses(&self, interface: &str) -> Result<Vec<Ipv4Addr>, InterfaceFault> {
        let out = self
            .exec(&self.ip, args(["-o", "-4", "addr", "show", "dev", interface]))
            .await?;
        Ok(parse_addresses(&out))
    }

    async fn add_address(&self, interface: &str, address: Ipv4Addr, prefix: u8) -> Result<(), InterfaceFault> {
        let cidr = format!("{}/{}", address, prefix);
        self.exec(&self.ip, args(["addr", "add", cidr.as_str(), "dev", interface]))
            .await?;
        self.persist(interface, "+", &cidr).await
    }

    async fn remove_address(&self, interface: &str, address: Ipv4Addr, prefix: u8) -> Result<(), InterfaceFault> {
        let cidr = format!("{}/{}", address, prefix);
        self.exec(&self.ip, args(["addr", "del", cidr.as_str(), "dev", interface]))
            .await?;
        self.persist(interface, "-", &cidr).await
    }

    async fn announce(&self, interface: &str, address: Ipv4Addr, gateway: Ipv4Addr) -> Result<(), InterfaceFault> {
        let (address, gateway) = (address.to_string(), gateway.to_string());
        self.exec(
            &self.arping,
            args(["-c", ARP_COUNT, "-s", address.as_str(), "-I", interface, "-U", gateway.as_str()]),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        let output = "\
5: br-ext    inet 198.51.100.2/24 brd 198.51.100.255 scope global br-ext\\       valid_lft forever preferred_lft forever
5: br-ext    inet 203.0.113.9/32 scope global br-ext\\       valid_lft forever preferred_lft forever
";
        assert_eq!(
            parse_addresses(output),
            vec![Ipv4Addr::new(198, 51, 100, 2), Ipv4Addr::new(203, 0, 113, 9)]
        );
        assert!(parse_addresses("").is_empty());
    }
}
