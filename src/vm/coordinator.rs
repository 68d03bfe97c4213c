// src/vm/coordinator.rs

//! Lifecycle coordinator.
//!
//! Sequences storage, provisioning and hypervisor calls for each virtance
//! operation and enforces the state preconditions between them. Operations
//! are not atomic across collaborators: when a step fails, the resources
//! created by earlier steps are left for the caller to inspect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::execution::Saga;
use crate::image::{ImageCache, ImageTemplate};
use crate::provision::ProvisioningPipeline;
use crate::vm::hypervisor::{
    is_boot_target, DiskDevice, DomainDefinition, DomainDisk, DomainInfo, DomainInterface,
    DomainState, Hypervisor, HypervisorFault,
};
use crate::vm::hypervisor_error;
use crate::vm::spec::{
    CloudRole, DiskSource, DiskSpec, GuestConfig, Ipv4Assignment, State, Virtance, Volume,
    VolumeFormat,
};

/// Metadata of a snapshot, returned for external bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub pool: String,
    pub size: u64,
    pub allocation: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Transient states of virtances with an operation in flight
type TransientStates = RwLock<HashMap<String, State>>;

/// Marks a virtance as busy for the lifetime of the guard
struct TransientGuard<'a> {
    states: &'a TransientStates,
    name: String,
}

impl Drop for TransientGuard<'_> {
    fn drop(&mut self) {
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        states.remove(&self.name);
    }
}

/// Orchestrates virtance operations
pub struct Coordinator {
    hypervisor: Arc<dyn Hypervisor>,
    cache: Arc<ImageCache>,
    pipeline: Arc<ProvisioningPipeline>,
    bridges: NetworkConfig,
    backup_pool_pattern: String,
    transient: TransientStates,
}

impl Coordinator {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        cache: Arc<ImageCache>,
        pipeline: Arc<ProvisioningPipeline>,
        bridges: NetworkConfig,
        backup_pool_pattern: impl Into<String>,
    ) -> Self {
        Self {
            hypervisor,
            cache,
            pipeline,
            bridges,
            backup_pool_pattern: backup_pool_pattern.into(),
            transient: RwLock::new(HashMap::new()),
        }
    }

    /// Current state: the transient state of an in-flight operation, else
    /// the hypervisor-observed power state
    pub async fn state(&self, name: &str) -> Result<State> {
        if let Some(state) = self.transient_state(name) {
            return Ok(state);
        }
        match self.hypervisor.describe_domain(name).await {
            Ok(info) => Ok(info.state.into()),
            Err(HypervisorFault::NotFound(_)) => Ok(State::Absent),
            Err(e) => Err(hypervisor_error("query state", name, e)),
        }
    }

    /// Provisions every disk, defines the domain and powers it on
    pub async fn create(&self, virtance: &Virtance) -> Result<()> {
        let name = virtance.name.as_str();
        match self.hypervisor.describe_domain(name).await {
            Ok(existing) => {
                return Err(precondition("create", name, existing.state.into(), "absent"));
            }
            Err(HypervisorFault::NotFound(_)) => {}
            Err(e) => return Err(hypervisor_error("create", name, e)),
        }

        let _busy = self.enter("create", name, State::Creating)?;
        info!(virtance = %name, disks = virtance.disks.len(), "Creating virtance");

        let mut saga = Saga::new(format!("create {}", name));
        match self.create_steps(virtance, &mut saga).await {
            Ok(()) => {
                info!(virtance = %name, "Virtance created and running");
                Ok(())
            }
            Err(e) => {
                saga.abandon();
                Err(e)
            }
        }
    }

    async fn create_steps(&self, virtance: &Virtance, saga: &mut Saga<'_>) -> Result<()> {
        let name = virtance.name.as_str();

        // boot disk first so it lands on vda
        let mut disks: Vec<&DiskSpec> = virtance.disks.iter().collect();
        disks.sort_by_key(|d| !d.primary);

        let mut domain_disks = Vec::with_capacity(disks.len());
        for (index, disk) in disks.into_iter().enumerate() {
            let volume = if disk.primary {
                self.provision_primary(virtance, disk).await?
            } else {
                if disk.source != DiskSource::Blank {
                    warn!(virtance = %name, disk = %disk.name, "Ignoring source of data disk");
                }
                self.blank_volume(disk).await?
            };

            let hypervisor = self.hypervisor.clone();
            let (pool, volume_name) = (volume.pool.clone(), volume.name.clone());
            saga.record(
                format!("volume {}/{}", volume.pool, volume.name),
                Some(Box::new(move || {
                    async move {
                        let entity = format!("{}/{}", pool, volume_name);
                        hypervisor
                            .delete_volume(&pool, &volume_name)
                            .await
                            .map_err(|e| hypervisor_error("delete volume", &entity, e))
                    }
                    .boxed()
                })),
            );

            domain_disks.push(DomainDisk {
                target: disk_target(index),
                device: DiskDevice::Disk,
                source: Some(volume.path.clone()),
                format: volume.format,
            });
        }

        let definition = DomainDefinition {
            name: name.to_string(),
            uuid: virtance.uuid,
            vcpu: virtance.vcpu,
            memory: virtance.memory,
            disks: domain_disks,
            interfaces: self.interfaces(&virtance.guest),
        };
        self.hypervisor
            .define_domain(&definition)
            .await
            .map_err(|e| hypervisor_error("define domain", name, e))?;
        saga.record("define domain", None);

        self.hypervisor
            .start_domain(name)
            .await
            .map_err(|e| hypervisor_error("start domain", name, e))?;
        saga.record("start domain", None);
        Ok(())
    }

    async fn provision_primary(&self, virtance: &Virtance, disk: &DiskSpec) -> Result<Volume> {
        match &disk.source {
            DiskSource::DistributionTemplate { url, checksum }
            | DiskSource::ApplicationTemplate { url, checksum } => {
                let template = self
                    .cache
                    .resolve(&ImageTemplate::new(url.as_str(), checksum.as_str()))
                    .await?;
                self.pipeline
                    .deploy_template(&template, &disk.pool, &disk.name, disk.size, &virtance.guest)
                    .await
            }
            DiskSource::Snapshot { name } | DiskSource::Backup { name } => {
                let source = self.locate_backup("create", name).await?;
                let volume = self
                    .pipeline
                    .restore_copy(&source, &disk.name, &disk.pool, disk.size)
                    .await?;
                self.pipeline.customize(&volume, &virtance.guest).await?;
                Ok(volume)
            }
            DiskSource::Blank => self.blank_volume(disk).await,
        }
    }

    async fn blank_volume(&self, disk: &DiskSpec) -> Result<Volume> {
        self.hypervisor
            .create_volume(&disk.pool, &disk.name, disk.size, VolumeFormat::Raw)
            .await
            .map_err(|e| hypervisor_error("create volume", &format!("{}/{}", disk.pool, disk.name), e))
    }

    fn interfaces(&self, guest: &GuestConfig) -> Vec<DomainInterface> {
        let v4 = &guest.network.v4;
        let bridges: Vec<&str> = match guest.cloud {
            CloudRole::Public => [
                v4.public.as_ref().map(|_| self.bridges.public_bridge.as_str()),
                v4.private.as_ref().map(|_| self.bridges.private_bridge.as_str()),
                v4.vpc.as_ref().map(|_| self.bridges.vpc_bridge.as_str()),
            ]
            .into_iter()
            .flatten()
            .collect(),
            CloudRole::Private => v4
                .vpc
                .as_ref()
                .map(|_| vec![self.bridges.vpc_bridge.as_str()])
                .unwrap_or_default(),
        };
        bridges
            .into_iter()
            .map(|bridge| DomainInterface {
                bridge: bridge.to_string(),
            })
            .collect()
    }

    /// Redeploys the boot disk from a template, leaving other disks alone
    pub async fn rebuild(&self, name: &str, template: &ImageTemplate, guest: &GuestConfig) -> Result<()> {
        let domain = self.describe("rebuild", name).await?;
        let volume = self.primary_volume("rebuild", &domain).await?;
        let cached = self.cache.resolve(template).await?;

        let _busy = self.enter("rebuild", name, State::Creating)?;
        self.stop_if_active("rebuild", &domain).await?;
        self.pipeline
            .deploy_template(&cached, &volume.pool, &volume.name, volume.capacity, guest)
            .await?;
        self.power(name, "start domain", |h, n| h.start_domain(n)).await?;
        info!(virtance = %name, "Virtance rebuilt");
        Ok(())
    }

    /// Applies new vCPU and memory, and grows the boot disk when
    /// `disk_size` is larger than it
    pub async fn resize(&self, name: &str, vcpu: u32, memory: u64, disk_size: Option<u64>) -> Result<()> {
        let domain = self.describe("resize", name).await?;
        require(&domain, "resize", &[DomainState::Shutoff])?;

        let _busy = self.enter("resize", name, State::Resizing)?;
        self.hypervisor
            .set_resources(name, vcpu, memory)
            .await
            .map_err(|e| hypervisor_error("resize", name, e))?;

        if let Some(size) = disk_size {
            let volume = self.primary_volume("resize", &domain).await?;
            if size > volume.capacity {
                self.pipeline.resize_only(&volume, size).await?;
            } else {
                debug!(virtance = %name, size, capacity = volume.capacity, "Disk already large enough");
            }
        }
        info!(virtance = %name, vcpu, memory, "Virtance resized");
        Ok(())
    }

    /// Writes a compressed copy of the boot disk into a backup pool
    pub async fn snapshot(&self, name: &str, snapshot_name: &str) -> Result<SnapshotInfo> {
        let domain = self.describe("snapshot", name).await?;
        let volume = self.primary_volume("snapshot", &domain).await?;
        let pools = self.backup_pools("snapshot").await?;
        let pool = {
            let mut rng = rand::thread_rng();
            pools.choose(&mut rng).cloned()
        };
        let pool = pool.ok_or_else(|| Error::NotFound {
            operation: "snapshot".to_string(),
            entity: snapshot_name.to_string(),
            message: format!("no storage pool matches '{}'", self.backup_pool_pattern),
        })?;

        let _busy = self.enter("snapshot", name, State::Snapshotting)?;
        let copy = self
            .pipeline
            .create_copy(&volume, snapshot_name, &pool, true)
            .await?;
        info!(virtance = %name, snapshot = %snapshot_name, %pool, "Snapshot created");
        Ok(SnapshotInfo {
            name: snapshot_name.to_string(),
            pool,
            size: copy.size,
            allocation: copy.allocation,
            checksum: copy.checksum,
            created_at: Utc::now(),
        })
    }

    /// Restores a snapshot or backup onto the boot disk and powers on
    pub async fn restore(&self, name: &str, snapshot_name: &str, disk_size: Option<u64>) -> Result<()> {
        let source = self.locate_backup("restore", snapshot_name).await?;
        let domain = self.describe("restore", name).await?;
        let volume = self.primary_volume("restore", &domain).await?;

        let _busy = self.enter("restore", name, State::Restoring)?;
        self.stop_if_active("restore", &domain).await?;
        self.pipeline
            .restore_copy(
                &source,
                &volume.name,
                &volume.pool,
                disk_size.unwrap_or(volume.capacity),
            )
            .await?;
        self.power(name, "start domain", |h, n| h.start_domain(n)).await?;
        info!(virtance = %name, snapshot = %snapshot_name, "Virtance restored");
        Ok(())
    }

    pub async fn mount_media(&self, name: &str, device: &str, iso: &Path) -> Result<()> {
        self.describe("mount media", name).await?;
        self.hypervisor
            .attach_media(name, device, iso)
            .await
            .map_err(|e| hypervisor_error("mount media", name, e))
    }

    pub async fn unmount_media(&self, name: &str, device: &str) -> Result<()> {
        self.describe("unmount media", name).await?;
        self.hypervisor
            .detach_media(name, device)
            .await
            .map_err(|e| hypervisor_error("unmount media", name, e))
    }

    /// Rewrites the root credential and powers back on.
    ///
    /// A failed rewrite leaves the virtance stopped.
    pub async fn reset_password(&self, name: &str, hash: &str) -> Result<()> {
        let _busy = self.enter("reset password", name, State::Resetting)?;
        let domain = self.describe("reset password", name).await?;
        let volume = self.primary_volume("reset password", &domain).await?;

        self.stop_if_active("reset password", &domain).await?;
        self.pipeline.reset_credential(&volume, hash).await?;
        self.power(name, "start domain", |h, n| h.start_domain(n)).await?;
        info!(virtance = %name, "Root credential reset");
        Ok(())
    }

    /// Rewrites the anchor address inside a stopped guest
    pub async fn change_fixed_address(&self, name: &str, anchor: &Ipv4Assignment) -> Result<()> {
        let domain = self.describe("change fixed address", name).await?;
        require(&domain, "change fixed address", &[DomainState::Shutoff])?;
        let volume = self.primary_volume("change fixed address", &domain).await?;
        self.pipeline.change_fixed_address(&volume, anchor).await
    }

    /// Stops the virtance, deletes its boot volumes and undefines it
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _busy = self.enter("delete", name, State::Deleting)?;
        let domain = self.describe("delete", name).await?;
        self.stop_if_active("delete", &domain).await?;

        let primary = domain.primary_disk().map(|d| d.target.clone());
        let mut deleted: Vec<PathBuf> = Vec::new();
        for disk in domain.disks.iter().filter(|d| d.device == DiskDevice::Disk) {
            let owned = Some(&disk.target) == primary.as_ref() || is_boot_target(&disk.target);
            let Some(path) = disk.source.as_deref().filter(|_| owned) else {
                continue;
            };
            if deleted.iter().any(|p: &PathBuf| p == path) {
                continue;
            }
            let volume = self
                .hypervisor
                .volume_by_path(path)
                .await
                .map_err(|e| hypervisor_error("delete", name, e))?;
            self.hypervisor
                .delete_volume(&volume.pool, &volume.name)
                .await
                .map_err(|e| hypervisor_error("delete volume", &format!("{}/{}", volume.pool, volume.name), e))?;
            deleted.push(path.to_path_buf());
        }

        self.hypervisor
            .undefine_domain(name)
            .await
            .map_err(|e| hypervisor_error("undefine domain", name, e))?;
        info!(virtance = %name, volumes = deleted.len(), "Virtance deleted");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let domain = self.describe("start", name).await?;
        require(&domain, "start", &[DomainState::Shutoff])?;
        self.power(name, "start", |h, n| h.start_domain(n)).await
    }

    /// Asks the guest to power off
    pub async fn shutdown(&self, name: &str) -> Result<()> {
        let domain = self.describe("shutdown", name).await?;
        require(&domain, "shutdown", &[DomainState::Running])?;
        self.power(name, "shutdown", |h, n| h.shutdown_domain(n)).await
    }

    pub async fn force_stop(&self, name: &str) -> Result<()> {
        let domain = self.describe("force stop", name).await?;
        require(&domain, "force stop", &[DomainState::Running, DomainState::Suspended])?;
        self.power(name, "force stop", |h, n| h.destroy_domain(n)).await
    }

    pub async fn suspend(&self, name: &str) -> Result<()> {
        let domain = self.describe("suspend", name).await?;
        require(&domain, "suspend", &[DomainState::Running])?;
        self.power(name, "suspend", |h, n| h.suspend_domain(n)).await
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        let domain = self.describe("resume", name).await?;
        require(&domain, "resume", &[DomainState::Suspended])?;
        self.power(name, "resume", |h, n| h.resume_domain(n)).await
    }

    pub async fn reboot(&self, name: &str) -> Result<()> {
        let domain = self.describe("reboot", name).await?;
        require(&domain, "reboot", &[DomainState::Running])?;
        self.power(name, "reboot", |h, n| h.reboot_domain(n)).await
    }

    async fn power<'a, F>(&'a self, name: &'a str, operation: &str, call: F) -> Result<()>
    where
        F: FnOnce(
            &'a dyn Hypervisor,
            &'a str,
        ) -> futures::future::BoxFuture<'a, std::result::Result<(), HypervisorFault>>,
    {
        call(self.hypervisor.as_ref(), name)
            .await
            .map_err(|e| hypervisor_error(operation, name, e))?;
        debug!(virtance = %name, operation, "Power action applied");
        Ok(())
    }

    async fn stop_if_active(&self, operation: &str, domain: &DomainInfo) -> Result<()> {
        if domain.state == DomainState::Shutoff {
            return Ok(());
        }
        debug!(virtance = %domain.name, operation, "Forcing virtance off");
        self.hypervisor
            .destroy_domain(&domain.name)
            .await
            .map_err(|e| hypervisor_error(operation, &domain.name, e))
    }

    async fn describe(&self, operation: &str, name: &str) -> Result<DomainInfo> {
        self.hypervisor
            .describe_domain(name)
            .await
            .map_err(|e| hypervisor_error(operation, name, e))
    }

    async fn primary_volume(&self, operation: &str, domain: &DomainInfo) -> Result<Volume> {
        let path = domain
            .primary_disk()
            .and_then(|d| d.source.as_deref())
            .ok_or_else(|| Error::Hypervisor {
                operation: operation.to_string(),
                entity: domain.name.clone(),
                message: "domain has no boot disk".to_string(),
            })?;
        self.hypervisor
            .volume_by_path(path)
            .await
            .map_err(|e| hypervisor_error(operation, &domain.name, e))
    }

    /// Pools whose name contains the backup pattern, case-insensitively
    async fn backup_pools(&self, operation: &str) -> Result<Vec<String>> {
        let pattern = self.backup_pool_pattern.to_lowercase();
        let pools = self
            .hypervisor
            .list_pools()
            .await
            .map_err(|e| hypervisor_error(operation, "storage pools", e))?;
        Ok(pools
            .into_iter()
            .filter(|p| p.to_lowercase().contains(&pattern))
            .collect())
    }

    /// Finds a snapshot or backup volume in the backup pools
    async fn locate_backup(&self, operation: &str, name: &str) -> Result<Volume> {
        for pool in self.backup_pools(operation).await? {
            let volumes = self
                .hypervisor
                .list_volumes(&pool)
                .await
                .map_err(|e| hypervisor_error(operation, &pool, e))?;
            if volumes.iter().any(|v| v == name) {
                debug!(%pool, volume = %name, "Backup located");
                return self
                    .hypervisor
                    .describe_volume(&pool, name)
                    .await
                    .map_err(|e| hypervisor_error(operation, name, e));
            }
        }
        Err(Error::NotFound {
            operation: operation.to_string(),
            entity: name.to_string(),
            message: format!("not present in any pool matching '{}'", self.backup_pool_pattern),
        })
    }

    fn transient_state(&self, name: &str) -> Option<State> {
        let states = self.transient.read().unwrap_or_else(|e| e.into_inner());
        states.get(name).copied()
    }

    fn enter(&self, operation: &str, name: &str, state: State) -> Result<TransientGuard<'_>> {
        let mut states = self.transient.write().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = states.get(name) {
            return Err(precondition(operation, name, *current, "idle"));
        }
        states.insert(name.to_string(), state);
        Ok(TransientGuard {
            states: &self.transient,
            name: name.to_string(),
        })
    }
}

/// `vda`..`vdz`, then `vdaa`, `vdab`.. as libvirt names them
fn disk_target(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        letters.push((b'a' + (n % 26) as u8) as char);
        n /= 26;
    }
    letters.iter().rev().fold(String::from("vd"), |mut target, c| {
        target.push(*c);
        target
    })
}

fn require(domain: &DomainInfo, operation: &str, allowed: &[DomainState]) -> Result<()> {
    if allowed.contains(&domain.state) {
        return Ok(());
    }
    let expected = allowed
        .iter()
        .map(|s| State::from(*s).to_string())
        .collect::<Vec<_>>()
        .join(" or ");
    Err(precondition(operation, &domain.name, domain.state.into(), &expected))
}

fn precondition(operation: &str, name: &str, state: State, expected: &str) -> Error {
    Error::Precondition {
        operation: operation.to_string(),
        entity: name.to_string(),
        state: state.to_string(),
        expected: expected.to_string(),
    }
}
