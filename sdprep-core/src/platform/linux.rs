use async_trait::async_trait;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::device::{BlockDevice, Partition, dev_path};
use crate::error::{GuardError, InventoryError};
use crate::guard::{RootGuard, resolve_parent_disk};
use crate::inventory::{InventorySource, LSBLK_COLUMNS, parse_lsblk};
use crate::orchestrator::Collaborators;
use crate::runner::{Elevation, ProcessRunner};
use crate::settle::DeviceNodes;
use crate::unmount::MountControl;

/// Reads the inventory and mount state with `lsblk`.
#[derive(Clone, Debug, Default)]
pub struct Lsblk;

impl Lsblk {
    async fn run(&self, target: Option<&Path>) -> Result<Vec<BlockDevice>, InventoryError> {
        let mut cmd = Command::new("lsblk");
        cmd.args(["-J", "-b", "-o", LSBLK_COLUMNS]);
        if let Some(target) = target {
            cmd.arg(target);
        }

        let output = cmd.output().await.map_err(|source| InventoryError::Spawn {
            program: "lsblk".into(),
            source,
        })?;
        if !output.status.success() {
            return Err(InventoryError::Command {
                program: "lsblk".into(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_lsblk(&output.stdout)
    }
}

#[async_trait]
impl InventorySource for Lsblk {
    async fn snapshot(&self) -> Result<Vec<BlockDevice>, InventoryError> {
        self.run(None).await
    }
}

#[async_trait]
impl MountControl for Lsblk {
    async fn mounted_partitions(&self, disk: &Path) -> Result<Vec<Partition>, InventoryError> {
        Ok(mounted_partitions(self.run(Some(disk)).await?))
    }

    async fn unmount_userspace(&self, partition: &Path) -> io::Result<()> {
        let output = Command::new("udisksctl")
            .arg("unmount")
            .arg("--no-user-interaction")
            .arg("-b")
            .arg(partition)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        Err(io::Error::other(format!(
            "udisksctl exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    fn unmount_kernel(&self, mountpoint: &Path) -> io::Result<()> {
        nix::mount::umount2(mountpoint, nix::mount::MntFlags::empty()).map_err(io::Error::from)
    }
}

/// Mounted partitions of the listed disks. A disk formatted without a
/// partition table counts as its own partition.
fn mounted_partitions(disks: Vec<BlockDevice>) -> Vec<Partition> {
    let mut mounted = Vec::new();
    for disk in disks {
        if disk.partitions.is_empty() {
            if disk.is_mounted() {
                mounted.push(Partition {
                    name: disk.name,
                    path: disk.path,
                    mountpoints: disk.mountpoints,
                });
            }
            continue;
        }
        mounted.extend(disk.partitions.into_iter().filter(Partition::is_mounted));
    }
    mounted
}

/// Finds the root disk through `sysinfo` and sysfs.
#[derive(Clone, Debug)]
pub struct SystemRootGuard {
    sysfs: PathBuf,
}

impl Default for SystemRootGuard {
    fn default() -> Self {
        Self {
            sysfs: PathBuf::from("/sys"),
        }
    }
}

impl SystemRootGuard {
    /// Kernel name of the block device mounted at `/`, e.g. `nvme0n1p2` or `dm-0`.
    fn root_source(&self) -> Result<String, GuardError> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        if let Some(disk) = disks.iter().find(|d| d.mount_point() == Path::new("/")) {
            let source = PathBuf::from("/dev/").join(disk.name());
            // Resolves /dev/mapper and /dev/disk/by-* links to the kernel node.
            match fs::canonicalize(&source) {
                Ok(node) if is_block_device(&node) => {
                    if let Some(name) = node.file_name() {
                        return Ok(name.to_string_lossy().into_owned());
                    }
                }
                _ => debug!(source = %source.display(), "root source is not a device node"),
            }
        }
        self.root_source_from_stat()
    }

    /// Falls back to the device number of `/` for sources like `/dev/root`.
    fn root_source_from_stat(&self) -> Result<String, GuardError> {
        use nix::sys::stat::{major, minor, stat};

        let st = stat("/").map_err(|_| GuardError::RootMountNotFound)?;
        let number = format!("{}:{}", major(st.st_dev), minor(st.st_dev));
        let node = fs::canonicalize(self.sysfs.join("dev/block").join(&number))
            .map_err(|_| GuardError::UnknownSource(number.clone()))?;
        node.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or(GuardError::UnknownSource(number))
    }
}

impl RootGuard for SystemRootGuard {
    fn root_parent_device(&self) -> Result<PathBuf, GuardError> {
        let source = self.root_source()?;
        let parent = resolve_parent_disk(&self.sysfs.join("class/block"), &source)?;
        let path = dev_path(&parent);
        debug!(%source, root = %path.display(), "resolved root disk");
        Ok(path)
    }
}

/// Probes real device nodes under `/dev`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemNodes;

impl DeviceNodes for SystemNodes {
    fn is_block_device(&self, path: &Path) -> bool {
        is_block_device(path)
    }
}

fn is_block_device(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false)
}

/// Wires up the real system, running destructive steps with `elevation`.
///
/// # Errors
///
/// Fails if the elevation helper is requested but cannot be found.
pub fn collaborators(elevation: Elevation) -> io::Result<Collaborators> {
    let lsblk = Arc::new(Lsblk);
    Ok(Collaborators {
        inventory: lsblk.clone(),
        guard: Arc::new(SystemRootGuard::default()),
        mounts: lsblk,
        runner: Arc::new(ProcessRunner::new(elevation)?),
        nodes: Arc::new(SystemNodes),
    })
}
