// src/vm/hypervisor.rs

//! Hypervisor control plane collaborator.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::vm::spec::{State, Volume, VolumeFormat};

/// Failure reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HypervisorFault {
    /// The named domain, pool or volume does not exist
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

/// Power state reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Shutoff,
    Suspended,
}

impl From<DomainState> for State {
    fn from(state: DomainState) -> Self {
        match state {
            DomainState::Running => State::Running,
            DomainState::Shutoff => State::Shutoff,
            DomainState::Suspended => State::Suspended,
        }
    }
}

/// Kind of a domain block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

/// Block device attached to a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDisk {
    /// Guest device name such as `vda`
    pub target: String,
    pub device: DiskDevice,
    /// Backing file, empty for an ejected cdrom
    pub source: Option<PathBuf>,
    pub format: VolumeFormat,
}

/// Network interface of a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInterface {
    pub bridge: String,
}

/// Everything needed to define a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDefinition {
    pub name: String,
    pub uuid: Uuid,
    pub vcpu: u32,
    /// Memory in bytes
    pub memory: u64,
    pub disks: Vec<DomainDisk>,
    pub interfaces: Vec<DomainInterface>,
}

/// Observed description of a defined domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: Uuid,
    pub state: DomainState,
    pub vcpu: u32,
    pub memory: u64,
    pub disks: Vec<DomainDisk>,
}

impl DomainInfo {
    /// The boot disk: the first disk on a `vda`/`sda`/`hda` target, else the
    /// first disk device
    pub fn primary_disk(&self) -> Option<&DomainDisk> {
        let disks = || self.disks.iter().filter(|d| d.device == DiskDevice::Disk);
        disks()
            .find(|d| is_boot_target(&d.target))
            .or_else(|| disks().next())
    }
}

/// Whether a device target is a conventional boot slot
pub fn is_boot_target(target: &str) -> bool {
    matches!(target, "vda" | "sda" | "hda")
}

/// Domain and storage operations of the hypervisor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn define_domain(&self, definition: &DomainDefinition) -> Result<(), HypervisorFault>;

    async fn describe_domain(&self, name: &str) -> Result<DomainInfo, HypervisorFault>;

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorFault>;

    /// Asks the guest to power off
    async fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorFault>;

    /// Powers off immediately
    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorFault>;

    async fn suspend_domain(&self, name: &str) -> Result<(), HypervisorFault>;

    async fn resume_domain(&self, name: &str) -> Result<(), HypervisorFault>;

    async fn reboot_domain(&self, name: &str) -> Result<(), HypervisorFault>;

    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorFault>;

    /// Applies vCPU count and memory (bytes) to the persistent definition
    async fn set_resources(&self, name: &str, vcpu: u32, memory: u64)
        -> Result<(), HypervisorFault>;

    /// Inserts an ISO into a cdrom device
    async fn attach_media(&self, name: &str, device: &str, iso: &Path)
        -> Result<(), HypervisorFault>;

    /// Ejects the medium from a cdrom device
    async fn detach_media(&self, name: &str, device: &str) -> Result<(), HypervisorFault>;

    async fn list_pools(&self) -> Result<Vec<String>, HypervisorFault>;

    /// Target directory of a pool
    async fn pool_path(&self, pool: &str) -> Result<PathBuf, HypervisorFault>;

    /// Rescans a pool so volumes written behind its back become visible
    async fn refresh_pool(&self, pool: &str) -> Result<(), HypervisorFault>;

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>, HypervisorFault>;

    async fn describe_volume(&self, pool: &str, name: &str) -> Result<Volume, HypervisorFault>;

    async fn volume_by_path(&self, path: &Path) -> Result<Volume, HypervisorFault>;

    /// Creates a volume of `capacity` bytes
    async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        capacity: u64,
        format: VolumeFormat,
    ) -> Result<Volume, HypervisorFault>;

    /// Grows a volume to `capacity` bytes
    async fn resize_volume(&self, pool: &str, name: &str, capacity: u64)
        -> Result<(), HypervisorFault>;

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorFault>;
}
