//! Argument vectors for each external operation.
//!
//! Commands are built as program + argument lists and handed to the runner
//! as-is; nothing here is ever interpolated into a shell string.
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;

use crate::label::VolumeLabel;
use crate::layout::LayoutPlan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl StepCommand {
    pub fn new<I, S>(program: impl AsRef<OsStr>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self {
            program: program.as_ref().to_os_string(),
            args: args.into_iter().map(|a| a.as_ref().to_os_string()).collect(),
        }
    }
}

/// Renders the command for logs. Arguments containing spaces are quoted for
/// readability only.
impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.contains(' ') {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Erases every filesystem, RAID and partition-table signature.
pub fn wipe_signatures(disk: &Path) -> StepCommand {
    StepCommand::new("wipefs", [OsStr::new("-a"), disk.as_os_str()])
}

/// Writes a fresh, empty MBR partition table.
pub fn make_partition_table(disk: &Path) -> StepCommand {
    StepCommand::new(
        "parted",
        [
            OsStr::new("-s"),
            disk.as_os_str(),
            OsStr::new("mklabel"),
            OsStr::new("msdos"),
        ],
    )
}

/// The data partition and the reserved trailing partition, in creation order.
pub fn make_partitions(disk: &Path, plan: &LayoutPlan) -> [StepCommand; 2] {
    let start = format!("{}MiB", plan.partition1_start_mib);
    let end = format!("{}MiB", plan.partition1_end_mib);
    let reserved_start = format!("{}MiB", plan.partition2_start_mib);

    [
        StepCommand::new(
            "parted",
            [
                OsStr::new("-s"),
                disk.as_os_str(),
                OsStr::new("mkpart"),
                OsStr::new("primary"),
                OsStr::new("fat32"),
                OsStr::new(&start),
                OsStr::new(&end),
            ],
        ),
        StepCommand::new(
            "parted",
            [
                OsStr::new("-s"),
                disk.as_os_str(),
                OsStr::new("mkpart"),
                OsStr::new("primary"),
                OsStr::new(&reserved_start),
                OsStr::new(LayoutPlan::PARTITION2_END),
            ],
        ),
    ]
}

/// Asks the kernel to re-read the partition table.
pub fn reread_partitions(disk: &Path) -> StepCommand {
    StepCommand::new("partprobe", [disk.as_os_str()])
}

/// Waits for udev to finish processing queued events.
pub fn settle() -> StepCommand {
    StepCommand::new("udevadm", ["settle"])
}

/// Creates a FAT32 filesystem on `partition`.
pub fn make_filesystem(partition: &Path, label: &VolumeLabel) -> StepCommand {
    StepCommand::new(
        "mkfs.fat",
        [
            OsStr::new("-F32"),
            OsStr::new("-v"),
            OsStr::new("-I"),
            OsStr::new("-n"),
            OsStr::new(label.as_str()),
            partition.as_os_str(),
        ],
    )
}

pub fn sync() -> StepCommand {
    StepCommand::new("sync", std::iter::empty::<&OsStr>())
}
