// src/network/rules.rs

//! Firewall rule model and compiler.
//!
//! A [`Rule`] compiles into packet-filter arguments for one per-entity
//! chain. DROP rules only match new connections so return traffic of
//! accepted flows keeps working, and they always sort after every ACCEPT
//! exception of the same chain.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Persisted priority of ACCEPT rules
pub const ACCEPT_PRIORITY: u32 = 0;

/// Persisted priority of DROP rules, evaluated after every ACCEPT
pub const DROP_PRIORITY: u32 = 1;

/// Traffic direction relative to the entity's owned addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// Match flag for the peer address of a rule
    fn peer_flag(self) -> &'static str {
        match self {
            Direction::Inbound => "-s",
            Direction::Outbound => "-d",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Icmp => "icmp",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Accept,
    Drop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
        }
    }
}

/// One firewall rule as supplied by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: Action,

    #[serde(default)]
    pub protocol: Option<Protocol>,

    /// Port, comma list or `a-b` range; `0` means no port
    #[serde(default, deserialize_with = "ports_from_any")]
    pub ports: Option<String>,

    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Rule {
    pub fn accept(protocol: Option<Protocol>, ports: Option<&str>, address: &str) -> Self {
        Self {
            action: Action::Accept,
            protocol,
            ports: ports.map(str::to_string),
            addresses: vec![address.to_string()],
        }
    }

    pub fn drop(protocol: Option<Protocol>) -> Self {
        Self {
            action: Action::Drop,
            protocol,
            ports: None,
            addresses: Vec::new(),
        }
    }
}

/// Ports arrive either as a number or a string
fn ports_from_any<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Ports {
        Number(u64),
        Text(String),
    }

    Ok(Option::<Ports>::deserialize(deserializer)?.map(|p| match p {
        Ports::Number(n) => n.to_string(),
        Ports::Text(s) => s,
    }))
}

/// Where a compiled rule goes in its live chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Inserted at the chain head
    Head,

    /// Appended at the chain tail
    Tail,
}

/// Packet-filter arguments for one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub args: Vec<String>,
    pub priority: u32,
    pub placement: Placement,
}

/// Compiles `rule` for the `direction` chain of `entity`
pub fn compile(entity: &str, direction: Direction, rule: &Rule) -> Result<CompiledRule> {
    let invalid = |reason: &str| Error::InvalidRule {
        entity: entity.to_string(),
        direction: direction.to_string(),
        reason: reason.to_string(),
    };

    match rule.action {
        Action::Drop => {
            let mut args = Vec::new();
            if let Some(protocol) = rule.protocol {
                args.extend(["-p", protocol.as_str()].map(String::from));
            }
            args.extend(["-m", "conntrack", "--ctstate", "NEW", "-j", "DROP"].map(String::from));
            Ok(CompiledRule {
                args,
                priority: DROP_PRIORITY,
                placement: Placement::Tail,
            })
        }
        Action::Accept => {
            let address = match rule.addresses.as_slice() {
                [] => return Err(invalid("ACCEPT requires an address")),
                [address] => address.trim(),
                _ => return Err(invalid("ACCEPT matches a single address")),
            };
            if address.is_empty() {
                return Err(invalid("ACCEPT requires an address"));
            }
            let ports = normalize_ports(rule.ports.as_deref()).map_err(|r| invalid(&r))?;

            let flag = direction.peer_flag();
            let args: Vec<String> = match (rule.protocol, ports) {
                (Some(Protocol::Icmp), _) => ["-p", "icmp", flag, address, "-j", "ACCEPT"]
                    .map(String::from)
                    .to_vec(),
                (Some(protocol), Some(ports)) => [
                    "-p",
                    protocol.as_str(),
                    flag,
                    address,
                    "--match",
                    "multiport",
                    "--dports",
                    ports.as_str(),
                    "-j",
                    "ACCEPT",
                ]
                .map(String::from)
                .to_vec(),
                (Some(protocol), None) => ["-p", protocol.as_str(), flag, address, "-j", "ACCEPT"]
                    .map(String::from)
                    .to_vec(),
                (None, Some(_)) => return Err(invalid("ports require tcp or udp")),
                (None, None) => [flag, address, "-j", "ACCEPT"].map(String::from).to_vec(),
            };
            Ok(CompiledRule {
                args,
                priority: ACCEPT_PRIORITY,
                placement: Placement::Head,
            })
        }
    }
}

/// Maps `a-b` ranges to the multiport `a:b` form. `0` and empty mean none.
fn normalize_ports(ports: Option<&str>) -> std::result::Result<Option<String>, String> {
    let ports = match ports.map(str::trim) {
        None | Some("") | Some("0") => return Ok(None),
        Some(p) => p,
    };
    if !ports
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ',' | '-' | ':'))
    {
        return Err(format!("malformed ports '{}'", ports));
    }
    Ok(Some(ports.replace('-', ":")))
}
