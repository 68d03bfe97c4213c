// src/guest/mod.rs

//! Offline guest customization.
//!
//! A [`Customizer`] opens a disk image through the [`GuestToolkit`],
//! detects the guest OS family, mounts its root filesystem and applies a
//! list of [`CustomizationStep`]s using the family's [`GuestCustomizer`].
//! The image is always closed again, also when a step fails.

pub mod families;
pub mod templates;
pub mod toolkit;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::vm::spec::{CloudRole, GuestConfig, Ipv4Assignment, NetworkSpec};

pub use families::{customizer_for, GuestCustomizer};
pub use toolkit::{GuestDisk, GuestToolkit, ToolkitFault};

/// Configuration dialect of a guest OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Debian,
    RedHat,
    Fedora,
    Windows,
    Alpine,
    Unknown,
}

impl OsFamily {
    /// Maps an inspected distribution name to its family
    pub fn from_distro(distro: &str) -> Self {
        let distro = distro.to_ascii_lowercase();
        if distro.contains("redhat-based") || distro.contains("rhel") || distro.contains("centos")
        {
            OsFamily::RedHat
        } else if distro.contains("fedora") {
            OsFamily::Fedora
        } else if distro.contains("debian") || distro.contains("ubuntu") {
            OsFamily::Debian
        } else if distro.contains("alpine") {
            OsFamily::Alpine
        } else if distro.contains("windows") {
            OsFamily::Windows
        } else {
            OsFamily::Unknown
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsFamily::Debian => "debian",
            OsFamily::RedHat => "redhat",
            OsFamily::Fedora => "fedora",
            OsFamily::Windows => "windows",
            OsFamily::Alpine => "alpine",
            OsFamily::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One configuration call applied inside a customization session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomizationStep {
    Networking { spec: NetworkSpec, role: CloudRole },
    AuthorizedKeys(Vec<String>),
    Hostname(String),
    RootCredential(String),
    GrowFilesystem,
    FirstBootCleanup { first_boot: bool },
    FixedAddress(Ipv4Assignment),
}

impl CustomizationStep {
    fn name(&self) -> &'static str {
        match self {
            CustomizationStep::Networking { .. } => "configure networking",
            CustomizationStep::AuthorizedKeys(_) => "install authorized keys",
            CustomizationStep::Hostname(_) => "set hostname",
            CustomizationStep::RootCredential(_) => "reset root credential",
            CustomizationStep::GrowFilesystem => "grow filesystem",
            CustomizationStep::FirstBootCleanup { .. } => "first boot cleanup",
            CustomizationStep::FixedAddress(_) => "change fixed address",
        }
    }

    async fn apply(
        &self,
        customizer: &dyn GuestCustomizer,
        disk: &mut dyn GuestDisk,
    ) -> std::result::Result<(), ToolkitFault> {
        match self {
            CustomizationStep::Networking { spec, role } => {
                customizer.configure_networking(disk, spec, *role).await
            }
            CustomizationStep::AuthorizedKeys(keys) => {
                customizer.install_authorized_keys(disk, keys).await
            }
            CustomizationStep::Hostname(name) => customizer.set_hostname(disk, name).await,
            CustomizationStep::RootCredential(hash) => {
                customizer.reset_root_credential(disk, hash).await
            }
            CustomizationStep::GrowFilesystem => customizer.grow_filesystem(disk).await,
            CustomizationStep::FirstBootCleanup { first_boot } => {
                customizer.first_boot_cleanup(disk, *first_boot).await
            }
            CustomizationStep::FixedAddress(anchor) => {
                customizer.change_fixed_address(disk, anchor).await
            }
        }
    }
}

/// Full sequence for a freshly deployed or restored boot volume
pub fn full_sequence(guest: &GuestConfig) -> Vec<CustomizationStep> {
    vec![
        CustomizationStep::Networking {
            spec: guest.network.clone(),
            role: guest.cloud,
        },
        CustomizationStep::AuthorizedKeys(guest.public_keys.clone()),
        CustomizationStep::Hostname(guest.hostname.clone()),
        CustomizationStep::RootCredential(guest.root_password_hash.clone()),
        CustomizationStep::GrowFilesystem,
        CustomizationStep::FirstBootCleanup { first_boot: true },
    ]
}

/// Runs customization sessions against disk images
#[derive(Clone)]
pub struct Customizer {
    toolkit: Arc<dyn GuestToolkit>,
}

impl Customizer {
    pub fn new(toolkit: Arc<dyn GuestToolkit>) -> Self {
        Self { toolkit }
    }

    /// Opens `image`, applies `steps` in order and closes the image.
    ///
    /// Returns the detected OS family.
    pub async fn customize(&self, image: &Path, steps: &[CustomizationStep]) -> Result<OsFamily> {
        let entity = image.display().to_string();
        let mut disk = self
            .toolkit
            .open(image)
            .await
            .map_err(|e| customization_error("open image", &entity, e))?;

        let outcome = self.run_session(disk.as_mut(), &entity, steps).await;
        let closed = close(disk.as_mut()).await;

        match (outcome, closed) {
            (Ok(family), Ok(())) => {
                info!(image = %entity, %family, steps = steps.len(), "Guest customized");
                Ok(family)
            }
            (Ok(_), Err(e)) => Err(customization_error("close image", &entity, e)),
            (Err(e), closed) => {
                if let Err(close_error) = closed {
                    warn!(image = %entity, "Failed to close image after error: {}", close_error);
                }
                Err(e)
            }
        }
    }

    async fn run_session(
        &self,
        disk: &mut dyn GuestDisk,
        entity: &str,
        steps: &[CustomizationStep],
    ) -> Result<OsFamily> {
        let distro = disk
            .inspect_distro()
            .await
            .map_err(|e| customization_error("inspect guest", entity, e))?
            .unwrap_or_default();
        let family = OsFamily::from_distro(&distro);
        let customizer = customizer_for(family).ok_or_else(|| Error::UnsupportedGuest {
            operation: "inspect guest".to_string(),
            entity: entity.to_string(),
            distro: if distro.is_empty() {
                "undetected".to_string()
            } else {
                distro.clone()
            },
        })?;
        debug!(image = %entity, %distro, %family, "Guest detected");

        customizer
            .mount_root(disk)
            .await
            .map_err(|e| customization_error("mount root", entity, e))?;

        for step in steps {
            debug!(image = %entity, step = step.name(), "Applying customization");
            step.apply(customizer.as_ref(), disk)
                .await
                .map_err(|e| customization_error(step.name(), entity, e))?;
        }
        Ok(family)
    }
}

/// Unmounts everything, then releases the image.
///
/// Every unmount is attempted and the image is released even when one of
/// them fails. The first fault is returned.
async fn close(disk: &mut dyn GuestDisk) -> std::result::Result<(), ToolkitFault> {
    let mut first_fault = None;
    match disk.mountpoints().await {
        Ok(mut mountpoints) => {
            // deepest first
            mountpoints.sort_by(|a, b| b.len().cmp(&a.len()));
            for mountpoint in mountpoints {
                if let Err(fault) = disk.umount(&mountpoint).await {
                    warn!(%mountpoint, "Unmount failed: {}", fault);
                    first_fault.get_or_insert(fault);
                }
            }
        }
        Err(fault) => {
            first_fault.get_or_insert(fault);
        }
    }
    let released = disk.close().await;
    match first_fault {
        Some(fault) => Err(fault),
        None => released,
    }
}

fn customization_error(operation: &str, entity: &str, fault: ToolkitFault) -> Error {
    Error::Customization {
        operation: operation.to_string(),
        entity: entity.to_string(),
        message: fault.0,
    }
}
