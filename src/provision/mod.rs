// src/provision/mod.rs

//! Provisioning pipeline: template deployment, copies and guest rewrites
//! on individual volumes.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::guest::{full_sequence, CustomizationStep, Customizer, OsFamily};
use crate::image::{self, ChecksumAlgorithm, ConvertFault, ImageConverter};
use crate::vm::hypervisor::Hypervisor;
use crate::vm::hypervisor_error;
use crate::vm::spec::{GuestConfig, Ipv4Assignment, Volume, VolumeFormat};

/// Metadata of a snapshot or backup copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInfo {
    pub volume: Volume,

    /// Guest-visible size in bytes
    pub size: u64,

    /// Bytes allocated on the host
    pub allocation: u64,

    /// Lowercase hex SHA-256 of the copy, whatever the template digest was
    pub checksum: String,
}

/// Volume-level provisioning steps
pub struct ProvisioningPipeline {
    hypervisor: Arc<dyn Hypervisor>,
    converter: Arc<dyn ImageConverter>,
    customizer: Customizer,
}

impl ProvisioningPipeline {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        converter: Arc<dyn ImageConverter>,
        customizer: Customizer,
    ) -> Self {
        Self {
            hypervisor,
            converter,
            customizer,
        }
    }

    /// Converts a cached template into a raw boot volume, grows it to
    /// `disk_size` and runs the full guest customization.
    ///
    /// The volume is left in place when a later step fails.
    pub async fn deploy_template(
        &self,
        template: &Path,
        pool: &str,
        name: &str,
        disk_size: u64,
        guest: &GuestConfig,
    ) -> Result<Volume> {
        let entity = format!("{}/{}", pool, name);
        let target = self.target_path(pool, name).await?;

        self.convert(template, VolumeFormat::Qcow2, &target, VolumeFormat::Raw, false, &entity)
            .await?;
        self.refresh(pool).await?;
        self.hypervisor
            .resize_volume(pool, name, disk_size)
            .await
            .map_err(|e| hypervisor_error("resize volume", &entity, e))?;

        let volume = self.describe(pool, name).await?;
        self.customize(&volume, guest).await?;
        info!(volume = %entity, size = disk_size, "Template deployed");
        Ok(volume)
    }

    /// Runs the full customization sequence on a boot volume
    pub async fn customize(&self, volume: &Volume, guest: &GuestConfig) -> Result<OsFamily> {
        self.customizer
            .customize(&volume.path, &full_sequence(guest))
            .await
    }

    /// Writes a qcow2 copy of `source` into `target_pool` for a snapshot or
    /// backup
    pub async fn create_copy(
        &self,
        source: &Volume,
        target_name: &str,
        target_pool: &str,
        compress: bool,
    ) -> Result<CopyInfo> {
        let entity = format!("{}/{}", target_pool, target_name);
        let target = self.target_path(target_pool, target_name).await?;

        self.convert(
            &source.path,
            source.format,
            &target,
            VolumeFormat::Qcow2,
            compress,
            &entity,
        )
        .await?;
        self.refresh(target_pool).await?;

        let volume = self.describe(target_pool, target_name).await?;
        let checksum = image::file_checksum(&volume.path, ChecksumAlgorithm::Sha256).await?;
        info!(source = %source.name, copy = %entity, "Copy created");
        Ok(CopyInfo {
            size: volume.capacity,
            allocation: volume.allocation,
            checksum,
            volume,
        })
    }

    /// Converts a copy back into a raw boot volume, growing it to
    /// `desired_size` when the restored volume is smaller
    pub async fn restore_copy(
        &self,
        source: &Volume,
        target_name: &str,
        target_pool: &str,
        desired_size: u64,
    ) -> Result<Volume> {
        let entity = format!("{}/{}", target_pool, target_name);
        let target = self.target_path(target_pool, target_name).await?;

        self.convert(
            &source.path,
            source.format,
            &target,
            VolumeFormat::Raw,
            false,
            &entity,
        )
        .await?;
        self.refresh(target_pool).await?;

        let mut volume = self.describe(target_pool, target_name).await?;
        if volume.capacity < desired_size {
            debug!(volume = %entity, from = volume.capacity, to = desired_size, "Growing restored volume");
            self.hypervisor
                .resize_volume(target_pool, target_name, desired_size)
                .await
                .map_err(|e| hypervisor_error("resize volume", &entity, e))?;
            volume = self.describe(target_pool, target_name).await?;
        }
        info!(source = %source.name, volume = %entity, "Copy restored");
        Ok(volume)
    }

    /// Rewrites the root credential without queueing a reboot
    pub async fn reset_credential(&self, volume: &Volume, hash: &str) -> Result<()> {
        self.customizer
            .customize(
                &volume.path,
                &[
                    CustomizationStep::RootCredential(hash.to_string()),
                    CustomizationStep::FirstBootCleanup { first_boot: false },
                ],
            )
            .await
            .map(|_| ())
    }

    /// Grows a volume and its root filesystem
    pub async fn resize_only(&self, volume: &Volume, new_size: u64) -> Result<Volume> {
        let entity = format!("{}/{}", volume.pool, volume.name);
        self.hypervisor
            .resize_volume(&volume.pool, &volume.name, new_size)
            .await
            .map_err(|e| hypervisor_error("resize volume", &entity, e))?;
        self.customizer
            .customize(
                &volume.path,
                &[
                    CustomizationStep::GrowFilesystem,
                    CustomizationStep::FirstBootCleanup { first_boot: false },
                ],
            )
            .await?;
        self.describe(&volume.pool, &volume.name).await
    }

    /// Rewrites the anchor address in the guest network configuration
    pub async fn change_fixed_address(&self, volume: &Volume, anchor: &Ipv4Assignment) -> Result<()> {
        self.customizer
            .customize(&volume.path, &[CustomizationStep::FixedAddress(anchor.clone())])
            .await
            .map(|_| ())
    }

    async fn target_path(&self, pool: &str, name: &str) -> Result<std::path::PathBuf> {
        let dir = self
            .hypervisor
            .pool_path(pool)
            .await
            .map_err(|e| hypervisor_error("locate pool", pool, e))?;
        Ok(dir.join(name))
    }

    async fn refresh(&self, pool: &str) -> Result<()> {
        self.hypervisor
            .refresh_pool(pool)
            .await
            .map_err(|e| hypervisor_error("refresh pool", pool, e))
    }

    async fn describe(&self, pool: &str, name: &str) -> Result<Volume> {
        self.hypervisor
            .describe_volume(pool, name)
            .await
            .map_err(|e| hypervisor_error("describe volume", &format!("{}/{}", pool, name), e))
    }

    async fn convert(
        &self,
        source: &Path,
        source_format: VolumeFormat,
        target: &Path,
        target_format: VolumeFormat,
        compress: bool,
        entity: &str,
    ) -> Result<()> {
        debug!(
            source = %source.display(),
            target = %target.display(),
            from = source_format.as_str(),
            to = target_format.as_str(),
            compress,
            "Converting image"
        );
        self.converter
            .convert(source, source_format, target, target_format, compress)
            .await
            .map_err(|ConvertFault(message)| Error::Conversion {
                operation: "convert image".to_string(),
                entity: entity.to_string(),
                message,
            })
    }
}
