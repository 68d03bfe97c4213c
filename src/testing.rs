// src/testing.rs

//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::NetworkConfig;
use crate::guest::{Customizer, GuestDisk, GuestToolkit, ToolkitFault};
use crate::image::{ConvertFault, ImageCache, ImageConverter};
use crate::network::{FilterFault, InterfaceConfig, InterfaceFault, PacketFilter, PersistedRule, Table};
use crate::provision::ProvisioningPipeline;
use crate::vm::hypervisor::{
    DiskDevice, DomainDefinition, DomainDisk, DomainInfo, DomainState, Hypervisor, HypervisorFault,
};
use crate::vm::spec::{
    CloudRole, GuestConfig, Ipv4Assignment, Ipv4Networks, NetworkSpec, PublicV4, Volume, VolumeFormat,
};
use crate::vm::Coordinator;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Guest disk toolkit
// =============================================================================

/// Filesystem and session state of one fake disk image
#[derive(Debug, Clone, Default)]
pub struct FakeGuestImage {
    pub distro: Option<String>,
    pub files: BTreeMap<String, String>,
    pub modes: BTreeMap<String, u32>,
    pub dirs: BTreeSet<String>,
    /// (device, mountpoint)
    pub mounts: Vec<(String, String)>,
    /// Mount attempts that fail before one succeeds
    pub mount_failures: usize,
    /// Mountpoints whose unmount fails
    pub busy_mounts: BTreeSet<String>,
    pub ntfsfixed: usize,
    pub resized: Vec<String>,
    pub closed: bool,
}

impl FakeGuestImage {
    pub fn linux(distro: &str) -> Self {
        let mut image = Self {
            distro: Some(distro.to_string()),
            ..Self::default()
        };
        for dir in ["/", "/etc", "/root", "/etc/network"] {
            image.dirs.insert(dir.to_string());
        }
        image.files.insert(
            "/etc/shadow".to_string(),
            "root:*:19000:0:99999:7:::\ndaemon:*:19000:0:99999:7:::\n".to_string(),
        );
        image.files.insert("/etc/hostname".to_string(), "localhost".to_string());
        image
    }

    pub fn windows() -> Self {
        let mut image = Self {
            distro: Some("windows".to_string()),
            ..Self::default()
        };
        for dir in ["/", "/Windows", "/Windows/System32"] {
            image.dirs.insert(dir.to_string());
        }
        image
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.get(path).cloned()
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.modes.get(path).copied()
    }
}

#[derive(Default)]
struct ToolkitState {
    images: HashMap<PathBuf, Arc<Mutex<FakeGuestImage>>>,
    default_image: Option<FakeGuestImage>,
    opened: usize,
}

/// Toolkit serving registered images by path
#[derive(Clone, Default)]
pub struct FakeToolkit {
    state: Arc<Mutex<ToolkitState>>,
}

impl FakeToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unregistered paths open as a copy of `image`
    pub fn with_default_image(image: FakeGuestImage) -> Self {
        let toolkit = Self::new();
        locked(&toolkit.state).default_image = Some(image);
        toolkit
    }

    pub fn add_image(&self, path: impl AsRef<Path>, image: FakeGuestImage) -> Arc<Mutex<FakeGuestImage>> {
        let image = Arc::new(Mutex::new(image));
        locked(&self.state)
            .images
            .insert(path.as_ref().to_path_buf(), image.clone());
        image
    }

    pub fn image(&self, path: impl AsRef<Path>) -> Option<Arc<Mutex<FakeGuestImage>>> {
        locked(&self.state).images.get(path.as_ref()).cloned()
    }

    pub fn opened(&self) -> usize {
        locked(&self.state).opened
    }
}

#[async_trait]
impl GuestToolkit for FakeToolkit {
    async fn open(&self, image: &Path) -> Result<Box<dyn GuestDisk>, ToolkitFault> {
        let mut state = locked(&self.state);
        state.opened += 1;
        let entry = match state.images.get(image) {
            Some(entry) => entry.clone(),
            None => {
                let Some(default) = state.default_image.clone() else {
                    return Err(ToolkitFault::new(format!("{}: no such image", image.display())));
                };
                let entry = Arc::new(Mutex::new(default));
                state.images.insert(image.to_path_buf(), entry.clone());
                entry
            }
        };
        locked(&entry).closed = false;
        Ok(Box::new(FakeDisk { image: entry }))
    }
}

struct FakeDisk {
    image: Arc<Mutex<FakeGuestImage>>,
}

impl FakeDisk {
    fn mounted(&self) -> Result<MutexGuard<'_, FakeGuestImage>, ToolkitFault> {
        let image = locked(&self.image);
        if image.mounts.is_empty() {
            return Err(ToolkitFault::new("no filesystem mounted"));
        }
        Ok(image)
    }
}

#[async_trait]
impl GuestDisk for FakeDisk {
    async fn inspect_distro(&mut self) -> Result<Option<String>, ToolkitFault> {
        Ok(locked(&self.image).distro.clone())
    }

    async fn mount(&mut self, device: &str, mountpoint: &str) -> Result<(), ToolkitFault> {
        let mut image = locked(&self.image);
        if image.mount_failures > 0 {
            image.mount_failures -= 1;
            return Err(ToolkitFault::new(format!("mount: {}: unclean file system", device)));
        }
        image.mounts.push((device.to_string(), mountpoint.to_string()));
        Ok(())
    }

    async fn ntfsfix(&mut self, _device: &str) -> Result<(), ToolkitFault> {
        locked(&self.image).ntfsfixed += 1;
        Ok(())
    }

    async fn mountpoints(&mut self) -> Result<Vec<String>, ToolkitFault> {
        Ok(locked(&self.image).mounts.iter().map(|(_, m)| m.clone()).collect())
    }

    async fn umount(&mut self, mountpoint: &str) -> Result<(), ToolkitFault> {
        let mut image = locked(&self.image);
        if image.busy_mounts.contains(mountpoint) {
            return Err(ToolkitFault::new(format!("umount: {}: target is busy", mountpoint)));
        }
        let index = image
            .mounts
            .iter()
            .position(|(_, m)| m == mountpoint)
            .ok_or_else(|| ToolkitFault::new(format!("umount: {}: not mounted", mountpoint)))?;
        image.mounts.remove(index);
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> Result<String, ToolkitFault> {
        self.mounted()?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ToolkitFault::new(format!("{}: No such file or directory", path)))
    }

    async fn write_file(&mut self, path: &str, contents: &str) -> Result<(), ToolkitFault> {
        self.mounted()?.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn chmod(&mut self, mode: u32, path: &str) -> Result<(), ToolkitFault> {
        let mut image = self.mounted()?;
        if !image.files.contains_key(path) && !image.dirs.contains(path) {
            return Err(ToolkitFault::new(format!("chmod: {}: No such file or directory", path)));
        }
        image.modes.insert(path.to_string(), mode);
        Ok(())
    }

    async fn mkdir(&mut self, path: &str) -> Result<(), ToolkitFault> {
        self.mounted()?.dirs.insert(path.to_string());
        Ok(())
    }

    async fn is_dir(&mut self, path: &str) -> Result<bool, ToolkitFault> {
        Ok(self.mounted()?.dirs.contains(path))
    }

    async fn exists(&mut self, path: &str) -> Result<bool, ToolkitFault> {
        let image = self.mounted()?;
        Ok(image.files.contains_key(path) || image.dirs.contains(path))
    }

    async fn touch(&mut self, path: &str) -> Result<(), ToolkitFault> {
        self.mounted()?.files.entry(path.to_string()).or_default();
        Ok(())
    }

    async fn resize_filesystem(&mut self, device: &str) -> Result<(), ToolkitFault> {
        self.mounted()?.resized.push(device.to_string());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ToolkitFault> {
        locked(&self.image).closed = true;
        Ok(())
    }
}

// =============================================================================
// Hypervisor and storage
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct StoredVolume {
    format: VolumeFormat,
    capacity: u64,
}

type VolumeRegistry = Arc<Mutex<HashMap<PathBuf, StoredVolume>>>;

#[derive(Default)]
struct HypervisorState {
    pools: BTreeSet<String>,
    domains: BTreeMap<String, (DomainDefinition, DomainState)>,
    calls: HashMap<String, usize>,
    failures: HashMap<String, HypervisorFault>,
}

/// Hypervisor whose pools are directories under a temporary root
pub struct FakeHypervisor {
    root: TempDir,
    state: Mutex<HypervisorState>,
    volumes: VolumeRegistry,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            state: Mutex::new(HypervisorState::default()),
            volumes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pool_dir(&self, pool: &str) -> PathBuf {
        self.root.path().join("pools").join(pool)
    }

    pub fn add_pool(&self, name: &str) {
        std::fs::create_dir_all(self.pool_dir(name)).unwrap();
        locked(&self.state).pools.insert(name.to_string());
    }

    /// Makes every later call of `method` fail with `fault`
    pub fn fail_on(&self, method: &str, fault: HypervisorFault) {
        locked(&self.state).failures.insert(method.to_string(), fault);
    }

    pub fn calls(&self, method: &str) -> usize {
        locked(&self.state).calls.get(method).copied().unwrap_or(0)
    }

    /// Writes a volume file behind the hypervisor's back and registers it
    pub fn seed_volume(&self, pool: &str, name: &str, bytes: &[u8], capacity: u64, format: VolumeFormat) -> Volume {
        let path = self.pool_dir(pool).join(name);
        std::fs::write(&path, bytes).unwrap();
        locked(&self.volumes).insert(path, StoredVolume { format, capacity });
        self.lookup(pool, name).unwrap()
    }

    pub fn domain(&self, name: &str) -> Option<DomainDefinition> {
        locked(&self.state).domains.get(name).map(|(d, _)| d.clone())
    }

    pub fn volume(&self, pool: &str, name: &str) -> Option<Volume> {
        self.lookup(pool, name).ok()
    }

    /// Converter writing into this hypervisor's pools
    pub fn converter(&self) -> FakeConverter {
        FakeConverter {
            volumes: self.volumes.clone(),
        }
    }

    fn enter(&self, method: &str) -> Result<(), HypervisorFault> {
        let mut state = locked(&self.state);
        *state.calls.entry(method.to_string()).or_default() += 1;
        match state.failures.get(method) {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    fn require_pool(&self, pool: &str) -> Result<PathBuf, HypervisorFault> {
        if locked(&self.state).pools.contains(pool) {
            Ok(self.pool_dir(pool))
        } else {
            Err(HypervisorFault::NotFound(format!("storage pool '{}'", pool)))
        }
    }

    fn lookup(&self, pool: &str, name: &str) -> Result<Volume, HypervisorFault> {
        let path = self.require_pool(pool)?.join(name);
        let stored = locked(&self.volumes)
            .get(&path)
            .copied()
            .ok_or_else(|| HypervisorFault::NotFound(format!("storage volume '{}/{}'", pool, name)))?;
        let allocation = std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|_| HypervisorFault::NotFound(format!("storage volume '{}/{}'", pool, name)))?;
        Ok(Volume {
            name: name.to_string(),
            pool: pool.to_string(),
            path,
            format: stored.format,
            capacity: stored.capacity,
            allocation,
        })
    }

    fn with_domain<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut DomainDefinition, &mut DomainState) -> Result<T, HypervisorFault>,
    ) -> Result<T, HypervisorFault> {
        let mut state = locked(&self.state);
        let (definition, power) = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorFault::NotFound(format!("domain '{}'", name)))?;
        f(definition, power)
    }

    fn transition(&self, name: &str, from: &[DomainState], to: DomainState) -> Result<(), HypervisorFault> {
        self.with_domain(name, |_, power| {
            if !from.contains(power) {
                return Err(HypervisorFault::Failed(format!(
                    "requested operation is not valid: domain is {:?}",
                    power
                )));
            }
            *power = to;
            Ok(())
        })
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn define_domain(&self, definition: &DomainDefinition) -> Result<(), HypervisorFault> {
        self.enter("define_domain")?;
        let mut state = locked(&self.state);
        let power = state
            .domains
            .get(&definition.name)
            .map(|(_, p)| *p)
            .unwrap_or(DomainState::Shutoff);
        state
            .domains
            .insert(definition.name.clone(), (definition.clone(), power));
        Ok(())
    }

    async fn describe_domain(&self, name: &str) -> Result<DomainInfo, HypervisorFault> {
        self.enter("describe_domain")?;
        self.with_domain(name, |d, power| {
            Ok(DomainInfo {
                name: d.name.clone(),
                uuid: d.uuid,
                state: *power,
                vcpu: d.vcpu,
                memory: d.memory,
                disks: d.disks.clone(),
            })
        })
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorFault> {
        self.enter("start_domain")?;
        self.transition(name, &[DomainState::Shutoff], DomainState::Running)
    }

    async fn shutdown_domain(&self, name: &str) -> Result<(), HypervisorFault> {
        self.enter("shutdown_domain")?;
        self.transition(name, &[DomainState::Running], DomainState::Shutoff)
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorFault> {
        self.enter("destroy_domain")?;
        self.transition(
            name,
            &[DomainState::Running, DomainState::Suspended],
            DomainState::Shutoff,
        )
    }

    async fn suspend_domain(&self, name: &str) -> Result<(), HypervisorFault> {
        self.enter("suspend_domain")?;
        self.transition(name, &[DomainState::Running], DomainState::Suspended)
    }

    async fn resume_domain(&self, name: &str) -> Result<(), HypervisorFault> {
        self.enter("resume_domain")?;
        self.transition(name, &[DomainState::Suspended], DomainState::Running)
    }

    async fn reboot_domain(&self, name: &str) -> Result<(), HypervisorFault> {
        self.enter("reboot_domain")?;
        self.transition(name, &[DomainState::Running], DomainState::Running)
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorFault> {
        self.enter("undefine_domain")?;
        locked(&self.state)
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorFault::NotFound(format!("domain '{}'", name)))
    }

    async fn set_resources(&self, name: &str, vcpu: u32, memory: u64) -> Result<(), HypervisorFault> {
        self.enter("set_resources")?;
        self.with_domain(name, |d, _| {
            d.vcpu = vcpu;
            d.memory = memory;
            Ok(())
        })
    }

    async fn attach_media(&self, name: &str, device: &str, iso: &Path) -> Result<(), HypervisorFault> {
        self.enter("attach_media")?;
        self.with_domain(name, |d, _| {
            match d.disks.iter_mut().find(|disk| disk.target == device) {
                Some(disk) => disk.source = Some(iso.to_path_buf()),
                None => d.disks.push(DomainDisk {
                    target: device.to_string(),
                    device: DiskDevice::Cdrom,
                    source: Some(iso.to_path_buf()),
                    format: VolumeFormat::Raw,
                }),
            }
            Ok(())
        })
    }

    async fn detach_media(&self, name: &str, device: &str) -> Result<(), HypervisorFault> {
        self.enter("detach_media")?;
        self.with_domain(name, |d, _| {
            let disk = d
                .disks
                .iter_mut()
                .find(|disk| disk.target == device)
                .ok_or_else(|| HypervisorFault::Failed(format!("no device '{}'", device)))?;
            disk.source = None;
            Ok(())
        })
    }

    async fn list_pools(&self) -> Result<Vec<String>, HypervisorFault> {
        self.enter("list_pools")?;
        Ok(locked(&self.state).pools.iter().cloned().collect())
    }

    async fn pool_path(&self, pool: &str) -> Result<PathBuf, HypervisorFault> {
        self.enter("pool_path")?;
        self.require_pool(pool)
    }

    async fn refresh_pool(&self, pool: &str) -> Result<(), HypervisorFault> {
        self.enter("refresh_pool")?;
        let dir = self.require_pool(pool)?;
        let entries = std::fs::read_dir(&dir).map_err(|e| HypervisorFault::Failed(e.to_string()))?;
        let mut volumes = locked(&self.volumes);
        for entry in entries.flatten() {
            let path = entry.path();
            if !volumes.contains_key(&path) {
                let capacity = entry.metadata().map(|m| m.len()).unwrap_or(0);
                volumes.insert(
                    path,
                    StoredVolume {
                        format: VolumeFormat::Raw,
                        capacity,
                    },
                );
            }
        }
        Ok(())
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>, HypervisorFault> {
        self.enter("list_volumes")?;
        let dir = self.require_pool(pool)?;
        let mut names: Vec<String> = locked(&self.volumes)
            .keys()
            .filter(|path| path.parent() == Some(dir.as_path()) && path.exists())
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn describe_volume(&self, pool: &str, name: &str) -> Result<Volume, HypervisorFault> {
        self.enter("describe_volume")?;
        self.lookup(pool, name)
    }

    async fn volume_by_path(&self, path: &Path) -> Result<Volume, HypervisorFault> {
        self.enter("volume_by_path")?;
        let pool = locked(&self.state)
            .pools
            .iter()
            .find(|p| path.parent() == Some(self.pool_dir(p).as_path()))
            .cloned()
            .ok_or_else(|| HypervisorFault::NotFound(format!("storage volume '{}'", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.lookup(&pool, &name)
    }

    async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        capacity: u64,
        format: VolumeFormat,
    ) -> Result<Volume, HypervisorFault> {
        self.enter("create_volume")?;
        let path = self.require_pool(pool)?.join(name);
        if path.exists() {
            return Err(HypervisorFault::Failed(format!("storage volume '{}' exists already", name)));
        }
        std::fs::write(&path, b"").map_err(|e| HypervisorFault::Failed(e.to_string()))?;
        locked(&self.volumes).insert(path, StoredVolume { format, capacity });
        self.lookup(pool, name)
    }

    async fn resize_volume(&self, pool: &str, name: &str, capacity: u64) -> Result<(), HypervisorFault> {
        self.enter("resize_volume")?;
        let path = self.require_pool(pool)?.join(name);
        let mut volumes = locked(&self.volumes);
        let stored = volumes
            .get_mut(&path)
            .ok_or_else(|| HypervisorFault::NotFound(format!("storage volume '{}/{}'", pool, name)))?;
        if capacity < stored.capacity {
            return Err(HypervisorFault::Failed("cannot shrink storage volume".to_string()));
        }
        stored.capacity = capacity;
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<(), HypervisorFault> {
        self.enter("delete_volume")?;
        let path = self.require_pool(pool)?.join(name);
        locked(&self.volumes)
            .remove(&path)
            .ok_or_else(|| HypervisorFault::NotFound(format!("storage volume '{}/{}'", pool, name)))?;
        std::fs::remove_file(&path).map_err(|e| HypervisorFault::Failed(e.to_string()))
    }
}

/// Converter that copies bytes and records the target format
pub struct FakeConverter {
    volumes: VolumeRegistry,
}

#[async_trait]
impl ImageConverter for FakeConverter {
    async fn convert(
        &self,
        source: &Path,
        _source_format: VolumeFormat,
        target: &Path,
        target_format: VolumeFormat,
        _compress: bool,
    ) -> Result<(), ConvertFault> {
        let bytes = std::fs::read(source)
            .map_err(|e| ConvertFault(format!("could not open '{}': {}", source.display(), e)))?;
        std::fs::write(target, &bytes).map_err(|e| ConvertFault(e.to_string()))?;
        let mut volumes = locked(&self.volumes);
        let capacity = volumes
            .get(source)
            .map(|v| v.capacity)
            .unwrap_or(bytes.len() as u64);
        volumes.insert(
            target.to_path_buf(),
            StoredVolume {
                format: target_format,
                capacity,
            },
        );
        Ok(())
    }
}

// =============================================================================
// Packet filter
// =============================================================================

#[derive(Default)]
struct FilterState {
    live: BTreeMap<(Table, String), Vec<Vec<String>>>,
    persisted_chains: BTreeSet<(Table, String)>,
    persisted_rules: Vec<PersistedRule>,
    log: Vec<String>,
    commits: usize,
    failing: HashSet<String>,
}

impl FilterState {
    fn record(&mut self, method: &str, table: Table, chain: &str, args: &[String]) {
        let mut entry = format!("{} {} {}", method, table, chain);
        if !args.is_empty() {
            entry.push(' ');
            entry.push_str(&args.join(" "));
        }
        self.log.push(entry);
    }

    fn live_chain(&mut self, table: Table, chain: &str) -> Result<&mut Vec<Vec<String>>, FilterFault> {
        self.live
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| FilterFault(format!("No chain/target/match by that name: {}", chain)))
    }
}

/// Packet filter with separate live and persisted layers.
///
/// Built-in chains `filter/FORWARD` and `nat/PREROUTING` exist from the
/// start. Positional inserts past the end of a chain are clamped to it.
pub struct FakePacketFilter {
    state: Mutex<FilterState>,
}

impl FakePacketFilter {
    pub fn new() -> Self {
        let mut state = FilterState::default();
        state.live.insert((Table::Filter, "FORWARD".to_string()), Vec::new());
        state.live.insert((Table::Nat, "PREROUTING".to_string()), Vec::new());
        Self {
            state: Mutex::new(state),
        }
    }

    /// Makes every later call of `method` fail
    pub fn fail_on(&self, method: &str) {
        locked(&self.state).failing.insert(method.to_string());
    }

    pub fn has_live_chain(&self, table: Table, chain: &str) -> bool {
        locked(&self.state).live.contains_key(&(table, chain.to_string()))
    }

    pub fn has_persisted_chain(&self, table: Table, chain: &str) -> bool {
        locked(&self.state)
            .persisted_chains
            .contains(&(table, chain.to_string()))
    }

    /// Live rules of a chain in evaluation order
    pub fn live_rules(&self, table: Table, chain: &str) -> Vec<String> {
        locked(&self.state)
            .live
            .get(&(table, chain.to_string()))
            .map(|rules| rules.iter().map(|r| r.join(" ")).collect())
            .unwrap_or_default()
    }

    pub fn persisted_rules_in(&self, table: Table, chain: &str) -> Vec<PersistedRule> {
        locked(&self.state)
            .persisted_rules
            .iter()
            .filter(|r| r.table == table && r.chain == chain)
            .cloned()
            .collect()
    }

    /// Every live chain and rule, one line each
    pub fn live_snapshot(&self) -> Vec<String> {
        let state = locked(&self.state);
        let mut lines = Vec::new();
        for ((table, chain), rules) in &state.live {
            lines.push(format!("{} {}", table, chain));
            lines.extend(rules.iter().map(|r| format!("{} {}: {}", table, chain, r.join(" "))));
        }
        lines
    }

    /// Every persisted chain and rule, one line each
    pub fn persisted_snapshot(&self) -> Vec<String> {
        let state = locked(&self.state);
        let chains = state
            .persisted_chains
            .iter()
            .map(|(table, chain)| format!("chain {} {}", table, chain));
        let rules = state.persisted_rules.iter().map(|r| {
            format!("rule {} {} {} {}", r.table, r.chain, r.priority, r.args.join(" "))
        });
        let mut lines: Vec<String> = chains.chain(rules).collect();
        lines.sort();
        lines
    }

    /// Mutations applied to either layer, in order
    pub fn mutation_log(&self) -> Vec<String> {
        locked(&self.state).log.clone()
    }

    pub fn mutations(&self) -> usize {
        locked(&self.state).log.len()
    }

    pub fn commits(&self) -> usize {
        locked(&self.state).commits
    }

    // Yields first so concurrent callers interleave at every call.
    async fn enter(&self, method: &str) -> Result<MutexGuard<'_, FilterState>, FilterFault> {
        tokio::task::yield_now().await;
        let state = locked(&self.state);
        if state.failing.contains(method) {
            return Err(FilterFault(format!("{} failed", method)));
        }
        Ok(state)
    }
}

#[async_trait]
impl PacketFilter for FakePacketFilter {
    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool, FilterFault> {
        let state = self.enter("chain_exists").await?;
        Ok(state.live.contains_key(&(table, chain.to_string())))
    }

    async fn create_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        let mut state = self.enter("create_chain").await?;
        let key = (table, chain.to_string());
        if state.live.contains_key(&key) {
            return Err(FilterFault("Chain already exists".to_string()));
        }
        state.live.insert(key, Vec::new());
        state.record("create_chain", table, chain, &[]);
        Ok(())
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        let mut state = self.enter("flush_chain").await?;
        state.live_chain(table, chain)?.clear();
        state.record("flush_chain", table, chain, &[]);
        Ok(())
    }

    async fn delete_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        let mut state = self.enter("delete_chain").await?;
        if !state.live_chain(table, chain)?.is_empty() {
            return Err(FilterFault("Directory not empty".to_string()));
        }
        let referenced = state
            .live
            .values()
            .flatten()
            .any(|rule| rule.windows(2).any(|w| w[0] == "-j" && w[1] == chain));
        if referenced {
            return Err(FilterFault("Too many links".to_string()));
        }
        state.live.remove(&(table, chain.to_string()));
        state.record("delete_chain", table, chain, &[]);
        Ok(())
    }

    async fn rule_exists(&self, table: Table, chain: &str, args: &[String]) -> Result<bool, FilterFault> {
        let state = self.enter("rule_exists").await?;
        Ok(state
            .live
            .get(&(table, chain.to_string()))
            .map(|rules| rules.iter().any(|r| r == args))
            .unwrap_or(false))
    }

    async fn insert_rule(
        &self,
        table: Table,
        chain: &str,
        position: Option<u32>,
        args: &[String],
    ) -> Result<(), FilterFault> {
        let mut state = self.enter("insert_rule").await?;
        let rules = state.live_chain(table, chain)?;
        let index = position.map(|p| p.saturating_sub(1) as usize).unwrap_or(0).min(rules.len());
        rules.insert(index, args.to_vec());
        state.record("insert_rule", table, chain, args);
        Ok(())
    }

    async fn append_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<(), FilterFault> {
        let mut state = self.enter("append_rule").await?;
        state.live_chain(table, chain)?.push(args.to_vec());
        state.record("append_rule", table, chain, args);
        Ok(())
    }

    async fn delete_rule(&self, table: Table, chain: &str, args: &[String]) -> Result<(), FilterFault> {
        let mut state = self.enter("delete_rule").await?;
        let rules = state.live_chain(table, chain)?;
        let index = rules
            .iter()
            .position(|r| r == args)
            .ok_or_else(|| FilterFault("Bad rule (does a matching rule exist in that chain?)".to_string()))?;
        rules.remove(index);
        state.record("delete_rule", table, chain, args);
        Ok(())
    }

    async fn persisted_chain_exists(&self, table: Table, chain: &str) -> Result<bool, FilterFault> {
        let state = self.enter("persisted_chain_exists").await?;
        Ok(state.persisted_chains.contains(&(table, chain.to_string())))
    }

    async fn persist_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        let mut state = self.enter("persist_chain").await?;
        if !state.persisted_chains.insert((table, chain.to_string())) {
            return Err(FilterFault("ALREADY_ENABLED".to_string()));
        }
        state.record("persist_chain", table, chain, &[]);
        Ok(())
    }

    async fn unpersist_chain(&self, table: Table, chain: &str) -> Result<(), FilterFault> {
        let mut state = self.enter("unpersist_chain").await?;
        if !state.persisted_chains.remove(&(table, chain.to_string())) {
            return Err(FilterFault("NOT_ENABLED".to_string()));
        }
        state.record("unpersist_chain", table, chain, &[]);
        Ok(())
    }

    async fn persisted_rule_exists(&self, rule: &PersistedRule) -> Result<bool, FilterFault> {
        let state = self.enter("persisted_rule_exists").await?;
        Ok(state.persisted_rules.contains(rule))
    }

    async fn persist_rule(&self, rule: &PersistedRule) -> Result<(), FilterFault> {
        let mut state = self.enter("persist_rule").await?;
        if state.persisted_rules.contains(rule) {
            return Err(FilterFault("ALREADY_ENABLED".to_string()));
        }
        state.persisted_rules.push(rule.clone());
        state.record("persist_rule", rule.table, &rule.chain, &rule.args);
        Ok(())
    }

    async fn unpersist_rule(&self, rule: &PersistedRule) -> Result<(), FilterFault> {
        let mut state = self.enter("unpersist_rule").await?;
        let index = state
            .persisted_rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| FilterFault("NOT_ENABLED".to_string()))?;
        state.persisted_rules.remove(index);
        state.record("unpersist_rule", rule.table, &rule.chain, &rule.args);
        Ok(())
    }

    async fn persisted_rules(&self, table: Table, chain: &str) -> Result<Vec<PersistedRule>, FilterFault> {
        let state = self.enter("persisted_rules").await?;
        Ok(state
            .persisted_rules
            .iter()
            .filter(|r| r.table == table && r.chain == chain)
            .cloned()
            .collect())
    }

    async fn commit(&self) -> Result<(), FilterFault> {
        let mut state = self.enter("commit").await?;
        state.commits += 1;
        Ok(())
    }
}

// =============================================================================
// Interfaces
// =============================================================================

#[derive(Default)]
struct InterfaceState {
    addresses: BTreeMap<String, Vec<Ipv4Addr>>,
    history: Vec<String>,
    announcements: Vec<(String, Ipv4Addr, Ipv4Addr)>,
    fail_adds: bool,
}

/// Interface addresses kept in memory
#[derive(Default)]
pub struct FakeInterfaces {
    state: Mutex<InterfaceState>,
}

impl FakeInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns an address without recording it in the history
    pub fn assign(&self, interface: &str, address: Ipv4Addr) {
        locked(&self.state)
            .addresses
            .entry(interface.to_string())
            .or_default()
            .push(address);
    }

    pub fn fail_adds(&self) {
        locked(&self.state).fail_adds = true;
    }

    pub fn addresses_of(&self, interface: &str) -> Vec<Ipv4Addr> {
        locked(&self.state)
            .addresses
            .get(interface)
            .cloned()
            .unwrap_or_default()
    }

    /// Address changes, as `add a/p` and `remove a/p`
    pub fn history(&self) -> Vec<String> {
        locked(&self.state).history.clone()
    }

    pub fn announcements(&self) -> Vec<(String, Ipv4Addr, Ipv4Addr)> {
        locked(&self.state).announcements.clone()
    }
}

#[async_trait]
impl InterfaceConfig for FakeInterfaces {
    async fn addresses(&self, interface: &str) -> Result<Vec<Ipv4Addr>, InterfaceFault> {
        Ok(self.addresses_of(interface))
    }

    async fn add_address(&self, interface: &str, address: Ipv4Addr, prefix: u8) -> Result<(), InterfaceFault> {
        let mut state = locked(&self.state);
        if state.fail_adds {
            return Err(InterfaceFault(format!("{}: Operation not permitted", interface)));
        }
        let assigned = state.addresses.entry(interface.to_string()).or_default();
        if assigned.contains(&address) {
            return Err(InterfaceFault("RTNETLINK answers: File exists".to_string()));
        }
        assigned.push(address);
        state.history.push(format!("add {}/{}", address, prefix));
        Ok(())
    }

    async fn remove_address(&self, interface: &str, address: Ipv4Addr, prefix: u8) -> Result<(), InterfaceFault> {
        let mut state = locked(&self.state);
        let assigned = state.addresses.entry(interface.to_string()).or_default();
        let index = assigned
            .iter()
            .position(|a| *a == address)
            .ok_or_else(|| InterfaceFault("RTNETLINK answers: Cannot assign requested address".to_string()))?;
        assigned.remove(index);
        state.history.push(format!("remove {}/{}", address, prefix));
        Ok(())
    }

    async fn announce(&self, interface: &str, address: Ipv4Addr, gateway: Ipv4Addr) -> Result<(), InterfaceFault> {
        locked(&self.state)
            .announcements
            .push((interface.to_string(), address, gateway));
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Debian guest with a public primary and secondary address
pub fn debian_guest() -> GuestConfig {
    GuestConfig {
        hostname: "web1".to_string(),
        network: NetworkSpec {
            v4: Ipv4Networks {
                public: Some(PublicV4 {
                    primary: Ipv4Assignment::new(Ipv4Addr::new(10, 0, 0, 5), 24)
                        .with_gateway(Ipv4Addr::new(10, 0, 0, 1))
                        .with_dns(Ipv4Addr::new(10, 0, 0, 2), None),
                    secondary: Some(Ipv4Assignment::new(Ipv4Addr::new(10, 0, 0, 6), 24)),
                }),
                ..Default::default()
            },
            v6: None,
        },
        public_keys: vec!["ssh-ed25519 AAAA web1".to_string()],
        root_password_hash: "h1".to_string(),
        cloud: CloudRole::Public,
    }
}

/// Pipeline over fakes with a `default` pool and a template cache directory
pub struct Harness {
    pub hypervisor: Arc<FakeHypervisor>,
    pub toolkit: FakeToolkit,
    pub pipeline: Arc<ProvisioningPipeline>,
    cache: TempDir,
}

impl Harness {
    /// Every image the toolkit opens starts as a copy of `image`
    pub fn new(image: FakeGuestImage) -> Self {
        let hypervisor = Arc::new(FakeHypervisor::new());
        hypervisor.add_pool("default");
        let toolkit = FakeToolkit::with_default_image(image);
        let pipeline = Arc::new(ProvisioningPipeline::new(
            hypervisor.clone(),
            Arc::new(hypervisor.converter()),
            Customizer::new(Arc::new(toolkit.clone())),
        ));
        Self {
            hypervisor,
            toolkit,
            pipeline,
            cache: TempDir::new().unwrap(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.path()
    }

    pub fn write_template(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.cache.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(
            self.hypervisor.clone(),
            Arc::new(ImageCache::new(self.cache.path())),
            self.pipeline.clone(),
            NetworkConfig::default(),
            "backup",
        )
    }

    /// Coordinator over another hypervisor, sharing toolkit and cache
    pub fn coordinator_with(&self, hypervisor: Arc<dyn Hypervisor>) -> Coordinator {
        let pipeline = ProvisioningPipeline::new(
            hypervisor.clone(),
            Arc::new(self.hypervisor.converter()),
            Customizer::new(Arc::new(self.toolkit.clone())),
        );
        Coordinator::new(
            hypervisor,
            Arc::new(ImageCache::new(self.cache.path())),
            Arc::new(pipeline),
            NetworkConfig::default(),
            "backup",
        )
    }
}
