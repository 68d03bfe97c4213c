// src/vm/spec.rs

//! Declarative description of a virtance and its network.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a virtance as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Absent,
    Creating,
    Shutoff,
    Running,
    Suspended,
    Resizing,
    Snapshotting,
    Restoring,
    Resetting,
    Deleting,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Absent => "absent",
            State::Creating => "creating",
            State::Shutoff => "shutoff",
            State::Running => "running",
            State::Suspended => "suspended",
            State::Resizing => "resizing",
            State::Snapshotting => "snapshotting",
            State::Restoring => "restoring",
            State::Resetting => "resetting",
            State::Deleting => "deleting",
        };
        f.write_str(name)
    }
}

/// Role of the cloud the virtance lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudRole {
    /// Internet-facing: public, secondary and optional private/VPC interfaces
    #[default]
    Public,

    /// VPC-only: the VPC address is the primary interface
    Private,
}

/// On-disk volume format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Raw,
    Qcow2,
}

impl VolumeFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeFormat::Raw => "raw",
            VolumeFormat::Qcow2 => "qcow2",
        }
    }
}

/// A volume inside a storage pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub pool: String,
    pub path: PathBuf,
    pub format: VolumeFormat,
    /// Guest-visible size in bytes
    pub capacity: u64,
    /// Bytes allocated on the host
    pub allocation: u64,
}

/// Where a disk's initial content comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiskSource {
    /// Distribution image downloaded into the template cache
    DistributionTemplate { url: String, checksum: String },

    /// Application image downloaded into the template cache
    ApplicationTemplate { url: String, checksum: String },

    /// Volume in a backup pool created by a snapshot
    Snapshot { name: String },

    /// Volume in a backup pool created by a backup
    Backup { name: String },

    /// Empty raw volume
    Blank,
}

/// One disk of a virtance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Volume name inside `pool`
    pub name: String,

    /// Size in bytes
    pub size: u64,

    /// Storage pool name
    pub pool: String,

    /// Boot disk flag
    #[serde(default)]
    pub primary: bool,

    pub source: DiskSource,
}

/// IPv4 netmask held as a validated prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Ipv4Addr", into = "Ipv4Addr")]
pub struct Netmask(u8);

impl Netmask {
    pub fn from_prefix(prefix: u8) -> Option<Self> {
        (prefix <= 32).then_some(Netmask(prefix))
    }

    pub fn prefix(self) -> u8 {
        self.0
    }

    pub fn addr(self) -> Ipv4Addr {
        let bits = u32::MAX.checked_shl(32 - u32::from(self.0)).unwrap_or(0);
        Ipv4Addr::from(bits)
    }
}

impl TryFrom<Ipv4Addr> for Netmask {
    type Error = String;

    fn try_from(mask: Ipv4Addr) -> Result<Self, Self::Error> {
        let bits = u32::from(mask);
        let prefix = bits.leading_ones();
        if bits.checked_shl(prefix).unwrap_or(0) != 0 {
            return Err(format!("non-contiguous netmask {}", mask));
        }
        Ok(Netmask(prefix as u8))
    }
}

impl From<Netmask> for Ipv4Addr {
    fn from(mask: Netmask) -> Self {
        mask.addr()
    }
}

impl fmt::Display for Netmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// An IPv4 address assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Assignment {
    pub address: Ipv4Addr,
    pub netmask: Netmask,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns1: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns2: Option<Ipv4Addr>,
}

impl Ipv4Assignment {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Self {
        Self {
            address,
            netmask: Netmask::from_prefix(prefix.min(32)).unwrap_or(Netmask(32)),
            gateway: None,
            dns1: None,
            dns2: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_dns(mut self, dns1: Ipv4Addr, dns2: Option<Ipv4Addr>) -> Self {
        self.dns1 = Some(dns1);
        self.dns2 = dns2;
        self
    }

    pub fn prefix(&self) -> u8 {
        self.netmask.prefix()
    }
}

/// An IPv6 address assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6Assignment {
    pub address: Ipv6Addr,
    pub prefix: u8,
    #[serde(default)]
    pub gateway: Option<Ipv6Addr>,
    #[serde(default)]
    pub dns1: Option<Ipv6Addr>,
    #[serde(default)]
    pub dns2: Option<Ipv6Addr>,
}

/// Public addressing: the routable address and its host-internal anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicV4 {
    pub primary: Ipv4Assignment,
    /// Compute address paired 1:1 with `primary`
    #[serde(default)]
    pub secondary: Option<Ipv4Assignment>,
}

/// IPv4 assignments of a virtance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Networks {
    pub public: Option<PublicV4>,
    pub private: Option<Ipv4Assignment>,
    pub vpc: Option<Ipv4Assignment>,
}

/// Complete network description of a virtance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    pub v4: Ipv4Networks,
    pub v6: Option<Ipv6Assignment>,
}

impl NetworkSpec {
    pub fn public_primary(&self) -> Option<&Ipv4Assignment> {
        self.v4.public.as_ref().map(|p| &p.primary)
    }

    pub fn public_secondary(&self) -> Option<&Ipv4Assignment> {
        self.v4.public.as_ref().and_then(|p| p.secondary.as_ref())
    }
}

/// Guest-level settings applied by customization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub hostname: String,
    pub network: NetworkSpec,
    #[serde(default)]
    pub public_keys: Vec<String>,
    /// Hash written into the root credential entry
    pub root_password_hash: String,
    #[serde(default)]
    pub cloud: CloudRole,
}

/// A managed virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Virtance {
    pub name: String,
    pub uuid: Uuid,
    pub vcpu: u32,
    /// Memory in bytes
    pub memory: u64,
    pub disks: Vec<DiskSpec>,
    pub guest: GuestConfig,
}

impl Virtance {
    /// The boot disk, if one is flagged
    pub fn primary_disk(&self) -> Option<&DiskSpec> {
        self.disks.iter().find(|d| d.primary)
    }
}
