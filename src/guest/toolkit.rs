// src/guest/toolkit.rs

//! Guest disk toolkit collaborator.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by the guest disk toolkit
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ToolkitFault(pub String);

impl ToolkitFault {
    pub fn new(message: impl Into<String>) -> Self {
        ToolkitFault(message.into())
    }
}

/// Opens disk images for offline inspection and modification
#[async_trait]
pub trait GuestToolkit: Send + Sync {
    /// Opens the image and launches the appliance
    async fn open(&self, image: &Path) -> Result<Box<dyn GuestDisk>, ToolkitFault>;
}

/// An open disk image.
///
/// Paths are absolute paths inside the guest filesystem.
#[async_trait]
pub trait GuestDisk: Send {
    /// Distribution name of the installed OS, if one is detected
    async fn inspect_distro(&mut self) -> Result<Option<String>, ToolkitFault>;

    async fn mount(&mut self, device: &str, mountpoint: &str) -> Result<(), ToolkitFault>;

    /// Repairs an NTFS filesystem so it can be mounted read-write
    async fn ntfsfix(&mut self, device: &str) -> Result<(), ToolkitFault>;

    /// Current mountpoints
    async fn mountpoints(&mut self) -> Result<Vec<String>, ToolkitFault>;

    async fn umount(&mut self, mountpoint: &str) -> Result<(), ToolkitFault>;

    async fn read_file(&mut self, path: &str) -> Result<String, ToolkitFault>;

    async fn write_file(&mut self, path: &str, contents: &str) -> Result<(), ToolkitFault>;

    async fn chmod(&mut self, mode: u32, path: &str) -> Result<(), ToolkitFault>;

    async fn mkdir(&mut self, path: &str) -> Result<(), ToolkitFault>;

    async fn is_dir(&mut self, path: &str) -> Result<bool, ToolkitFault>;

    async fn exists(&mut self, path: &str) -> Result<bool, ToolkitFault>;

    async fn touch(&mut self, path: &str) -> Result<(), ToolkitFault>;

    /// Grows the filesystem on `device` to fill its partition
    async fn resize_filesystem(&mut self, device: &str) -> Result<(), ToolkitFault>;

    /// Shuts the appliance down and releases the image
    async fn close(&mut self) -> Result<(), ToolkitFault>;
}
