// src/guest/families.rs

//! Per-family customization behaviour.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::guest::templates::{self, WINDOWS_FIRST_BOOT};
use crate::guest::toolkit::{GuestDisk, ToolkitFault};
use crate::guest::OsFamily;
use crate::vm::spec::{CloudRole, Ipv4Assignment, NetworkSpec};

const SHADOW: &str = "/etc/shadow";
const HOSTNAME: &str = "/etc/hostname";
const ROOT_SSH_DIR: &str = "/root/.ssh";
const ROOT_AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";
const SELINUX_RELABEL: &str = "/.autorelabel";

const WIN_DISK_EXTEND: &str = "diskpart /s %~dp0\\diskpart.txt\r\n";
const WIN_REBOOT: &str = "shutdown /r /t 1\r\n";
const WIN_CLEAR_SCRIPT: &str = "type NUL > %~dp0\\cloudinit.cmd\r\n";

/// Customization operations of one OS family
#[async_trait]
pub trait GuestCustomizer: Send + Sync {
    fn family(&self) -> OsFamily;

    /// Device holding the root filesystem
    fn root_device(&self) -> &'static str {
        "/dev/sda1"
    }

    async fn mount_root(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault> {
        disk.mount(self.root_device(), "/").await
    }

    async fn configure_networking(
        &self,
        disk: &mut dyn GuestDisk,
        spec: &NetworkSpec,
        role: CloudRole,
    ) -> Result<(), ToolkitFault> {
        let files = templates::render_network(self.family(), role, spec);
        if files.is_empty() {
            warn!(family = ?self.family(), ?role, "No network configuration to write");
        }
        for file in files {
            debug!(path = file.path, "Writing network configuration");
            disk.write_file(file.path, &file.contents).await?;
            if let Some(mode) = file.mode {
                disk.chmod(mode, file.path).await?;
            }
        }
        Ok(())
    }

    async fn install_authorized_keys(
        &self,
        disk: &mut dyn GuestDisk,
        keys: &[String],
    ) -> Result<(), ToolkitFault>;

    async fn set_hostname(&self, disk: &mut dyn GuestDisk, hostname: &str)
        -> Result<(), ToolkitFault>;

    async fn reset_root_credential(
        &self,
        disk: &mut dyn GuestDisk,
        hash: &str,
    ) -> Result<(), ToolkitFault>;

    async fn grow_filesystem(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault>;

    async fn first_boot_cleanup(
        &self,
        disk: &mut dyn GuestDisk,
        first_boot: bool,
    ) -> Result<(), ToolkitFault>;

    /// Rewrites the anchor address in the primary network file
    async fn change_fixed_address(
        &self,
        disk: &mut dyn GuestDisk,
        anchor: &Ipv4Assignment,
    ) -> Result<(), ToolkitFault> {
        let path = match self.family() {
            OsFamily::Debian | OsFamily::Alpine => templates::DEBIAN_INTERFACES,
            OsFamily::RedHat => templates::REDHAT_ETH0,
            OsFamily::Fedora => templates::FEDORA_ETH0,
            OsFamily::Windows | OsFamily::Unknown => return Ok(()),
        };
        let current = disk.read_file(path).await?;
        match templates::replace_anchor(self.family(), &current, anchor) {
            Some(updated) => disk.write_file(path, &updated).await,
            None => Err(ToolkitFault::new(format!("no anchor address in {}", path))),
        }
    }
}

/// Selects the customizer for a detected family
pub fn customizer_for(family: OsFamily) -> Option<Box<dyn GuestCustomizer>> {
    match family {
        OsFamily::Debian => Some(Box::new(Debian)),
        OsFamily::RedHat => Some(Box::new(RedHat)),
        OsFamily::Fedora => Some(Box::new(Fedora)),
        OsFamily::Windows => Some(Box::new(Windows)),
        OsFamily::Alpine => Some(Box::new(Alpine)),
        OsFamily::Unknown => None,
    }
}

async fn linux_authorized_keys(disk: &mut dyn GuestDisk, keys: &[String]) -> Result<(), ToolkitFault> {
    if keys.is_empty() {
        return Ok(());
    }
    if !disk.is_dir(ROOT_SSH_DIR).await? {
        disk.mkdir(ROOT_SSH_DIR).await?;
        disk.chmod(0o700, ROOT_SSH_DIR).await?;
    }
    disk.write_file(ROOT_AUTHORIZED_KEYS, &keys.join("\n")).await?;
    disk.chmod(0o600, ROOT_AUTHORIZED_KEYS).await
}

async fn linux_hostname(disk: &mut dyn GuestDisk, hostname: &str) -> Result<(), ToolkitFault> {
    disk.write_file(HOSTNAME, hostname).await
}

/// Replaces the credential field of the root entry
fn rewrite_shadow(shadow: &str, hash: &str) -> Option<String> {
    let mut found = false;
    let lines: Vec<String> = shadow
        .lines()
        .map(|line| match line.strip_prefix("root:") {
            Some(rest) if !found => {
                found = true;
                let tail = rest.split_once(':').map(|(_, tail)| tail).unwrap_or("");
                format!("root:{}:{}", hash, tail)
            }
            _ => line.to_string(),
        })
        .collect();
    if !found {
        return None;
    }
    let mut out = lines.join("\n");
    if shadow.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

async fn linux_root_credential(disk: &mut dyn GuestDisk, hash: &str) -> Result<(), ToolkitFault> {
    let shadow = disk.read_file(SHADOW).await?;
    let updated = rewrite_shadow(&shadow, hash)
        .ok_or_else(|| ToolkitFault::new(format!("no root entry in {}", SHADOW)))?;
    disk.write_file(SHADOW, &updated).await?;
    disk.chmod(0o640, SHADOW).await
}

async fn append_first_boot(disk: &mut dyn GuestDisk, command: &str) -> Result<(), ToolkitFault> {
    let mut script = if disk.exists(WINDOWS_FIRST_BOOT).await? {
        disk.read_file(WINDOWS_FIRST_BOOT).await?
    } else {
        String::new()
    };
    if !script.is_empty() && !script.ends_with('\n') {
        script.push_str("\r\n");
    }
    script.push_str(command);
    disk.write_file(WINDOWS_FIRST_BOOT, &script).await
}

/// Debian and Ubuntu
pub struct Debian;

#[async_trait]
impl GuestCustomizer for Debian {
    fn family(&self) -> OsFamily {
        OsFamily::Debian
    }

    async fn install_authorized_keys(&self, disk: &mut dyn GuestDisk, keys: &[String]) -> Result<(), ToolkitFault> {
        linux_authorized_keys(disk, keys).await
    }

    async fn set_hostname(&self, disk: &mut dyn GuestDisk, hostname: &str) -> Result<(), ToolkitFault> {
        linux_hostname(disk, hostname).await
    }

    async fn reset_root_credential(&self, disk: &mut dyn GuestDisk, hash: &str) -> Result<(), ToolkitFault> {
        linux_root_credential(disk, hash).await
    }

    async fn grow_filesystem(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault> {
        disk.resize_filesystem(self.root_device()).await
    }

    async fn first_boot_cleanup(&self, _disk: &mut dyn GuestDisk, _first_boot: bool) -> Result<(), ToolkitFault> {
        Ok(())
    }
}

/// Alpine: Debian-style networking, root on the second partition
pub struct Alpine;

#[async_trait]
impl GuestCustomizer for Alpine {
    fn family(&self) -> OsFamily {
        OsFamily::Alpine
    }

    fn root_device(&self) -> &'static str {
        "/dev/sda2"
    }

    async fn install_authorized_keys(&self, disk: &mut dyn GuestDisk, keys: &[String]) -> Result<(), ToolkitFault> {
        linux_authorized_keys(disk, keys).await
    }

    async fn set_hostname(&self, disk: &mut dyn GuestDisk, hostname: &str) -> Result<(), ToolkitFault> {
        linux_hostname(disk, hostname).await
    }

    async fn reset_root_credential(&self, disk: &mut dyn GuestDisk, hash: &str) -> Result<(), ToolkitFault> {
        linux_root_credential(disk, hash).await
    }

    async fn grow_filesystem(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault> {
        disk.resize_filesystem(self.root_device()).await
    }

    async fn first_boot_cleanup(&self, _disk: &mut dyn GuestDisk, _first_boot: bool) -> Result<(), ToolkitFault> {
        Ok(())
    }
}

/// RHEL, CentOS, Rocky and other network-scripts distributions
pub struct RedHat;

#[async_trait]
impl GuestCustomizer for RedHat {
    fn family(&self) -> OsFamily {
        OsFamily::RedHat
    }

    async fn install_authorized_keys(&self, disk: &mut dyn GuestDisk, keys: &[String]) -> Result<(), ToolkitFault> {
        linux_authorized_keys(disk, keys).await
    }

    async fn set_hostname(&self, disk: &mut dyn GuestDisk, hostname: &str) -> Result<(), ToolkitFault> {
        linux_hostname(disk, hostname).await
    }

    async fn reset_root_credential(&self, disk: &mut dyn GuestDisk, hash: &str) -> Result<(), ToolkitFault> {
        linux_root_credential(disk, hash).await
    }

    async fn grow_filesystem(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault> {
        disk.resize_filesystem(self.root_device()).await
    }

    async fn first_boot_cleanup(&self, disk: &mut dyn GuestDisk, first_boot: bool) -> Result<(), ToolkitFault> {
        if first_boot {
            // rewritten files carry no SELinux labels
            disk.touch(SELINUX_RELABEL).await?;
        }
        Ok(())
    }
}

/// Fedora and NetworkManager keyfile distributions
pub struct Fedora;

#[async_trait]
impl GuestCustomizer for Fedora {
    fn family(&self) -> OsFamily {
        OsFamily::Fedora
    }

    async fn install_authorized_keys(&self, disk: &mut dyn GuestDisk, keys: &[String]) -> Result<(), ToolkitFault> {
        linux_authorized_keys(disk, keys).await
    }

    async fn set_hostname(&self, disk: &mut dyn GuestDisk, hostname: &str) -> Result<(), ToolkitFault> {
        linux_hostname(disk, hostname).await
    }

    async fn reset_root_credential(&self, disk: &mut dyn GuestDisk, hash: &str) -> Result<(), ToolkitFault> {
        linux_root_credential(disk, hash).await
    }

    async fn grow_filesystem(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault> {
        disk.resize_filesystem(self.root_device()).await
    }

    async fn first_boot_cleanup(&self, _disk: &mut dyn GuestDisk, _first_boot: bool) -> Result<(), ToolkitFault> {
        Ok(())
    }
}

/// Windows: changes are queued in the first-boot startup script
pub struct Windows;

#[async_trait]
impl GuestCustomizer for Windows {
    fn family(&self) -> OsFamily {
        OsFamily::Windows
    }

    async fn mount_root(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault> {
        let device = self.root_device();
        match disk.mount(device, "/").await {
            Ok(()) => Ok(()),
            Err(first) => {
                // hibernated or dirty NTFS refuses a read-write mount
                warn!(device, "Mount failed ({}), repairing NTFS", first);
                disk.ntfsfix(device).await?;
                disk.mount(device, "/").await
            }
        }
    }

    async fn install_authorized_keys(&self, _disk: &mut dyn GuestDisk, _keys: &[String]) -> Result<(), ToolkitFault> {
        Ok(())
    }

    async fn set_hostname(&self, disk: &mut dyn GuestDisk, hostname: &str) -> Result<(), ToolkitFault> {
        let command = format!(
            "wmic computersystem where name='%COMPUTERNAME%' call rename name='{}'\r\n",
            hostname
        );
        append_first_boot(disk, &command).await
    }

    async fn reset_root_credential(&self, disk: &mut dyn GuestDisk, hash: &str) -> Result<(), ToolkitFault> {
        append_first_boot(disk, &format!("net user Administrator {}\r\n", hash)).await
    }

    async fn grow_filesystem(&self, disk: &mut dyn GuestDisk) -> Result<(), ToolkitFault> {
        append_first_boot(disk, WIN_DISK_EXTEND).await
    }

    async fn first_boot_cleanup(&self, disk: &mut dyn GuestDisk, first_boot: bool) -> Result<(), ToolkitFault> {
        if first_boot {
            append_first_boot(disk, WIN_REBOOT).await?;
        }
        append_first_boot(disk, WIN_CLEAR_SCRIPT).await
    }
}
