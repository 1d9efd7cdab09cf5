//! Best-effort, retrying unmount of every partition on a disk.
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::device::Partition;
use crate::error::{InventoryError, UnmountError};

/// What the coordinator needs from the system to find and release mounts.
#[async_trait]
pub trait MountControl: Send + Sync {
    /// Partitions of `disk` that currently have at least one mount point.
    async fn mounted_partitions(&self, disk: &Path) -> Result<Vec<Partition>, InventoryError>;

    /// Unmounts through the desktop disk manager (udisks).
    async fn unmount_userspace(&self, partition: &Path) -> io::Result<()>;

    /// Unmounts a single mount point with `umount2(2)`.
    fn unmount_kernel(&self, mountpoint: &Path) -> io::Result<()>;
}

/// Unmounts every partition of `disk`, retrying up to `max_attempts` rounds.
///
/// Each round lists the mounted partitions, returns early if there are none,
/// and otherwise tries the userspace unmount first and falls back to the
/// kernel call per mount point. Individual failures are ignored; the result
/// only depends on whether anything is still mounted at the end. `on_unmount`
/// is called for each partition an unmount is attempted on.
///
/// # Errors
///
/// [`UnmountError::StillMounted`] if partitions are still mounted after the
/// last round, or [`UnmountError::Enumerate`] if the mounts cannot be listed.
/// Either one must stop the job before anything destructive happens.
pub async fn unmount_all<F>(
    control: &dyn MountControl,
    disk: &Path,
    max_attempts: u32,
    inter_delay: Duration,
    mut on_unmount: F,
) -> Result<(), UnmountError>
where
    F: FnMut(&Partition) + Send,
{
    let list = |disk: &Path| {
        let disk = disk.to_path_buf();
        async move {
            control
                .mounted_partitions(&disk)
                .await
                .map_err(|source| UnmountError::Enumerate { disk, source })
        }
    };

    for attempt in 1..=max_attempts {
        let mounted = list(disk).await?;
        if mounted.is_empty() {
            debug!(disk = %disk.display(), attempt, "nothing mounted");
            return Ok(());
        }

        for partition in &mounted {
            on_unmount(partition);
            release(control, partition).await;
        }

        tokio::time::sleep(inter_delay).await;
    }

    let remaining = list(disk).await?;
    if remaining.is_empty() {
        return Ok(());
    }

    Err(UnmountError::StillMounted {
        disk: disk.to_path_buf(),
        partitions: remaining.into_iter().map(|p| p.path).collect::<Vec<PathBuf>>(),
    })
}

async fn release(control: &dyn MountControl, partition: &Partition) {
    info!(partition = %partition.path.display(), "unmounting");

    match control.unmount_userspace(&partition.path).await {
        Ok(()) => return,
        Err(err) => debug!(partition = %partition.path.display(), error = %err, "udisks unmount failed"),
    }

    for mountpoint in &partition.mountpoints {
        if let Err(err) = control.unmount_kernel(mountpoint) {
            debug!(mountpoint = %mountpoint.display(), error = %err, "umount2 failed");
        }
    }
}
