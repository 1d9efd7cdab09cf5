use std::fmt;
use std::path::{Path, PathBuf};

/// The kind of a block device as reported by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Disk,
    Partition,
    Rom,
    Other,
}

impl DeviceKind {
    /// Maps an `lsblk` `TYPE` column value onto a [`DeviceKind`].
    pub fn from_lsblk(value: &str) -> Self {
        match value.trim() {
            "disk" => DeviceKind::Disk,
            "part" => DeviceKind::Partition,
            "rom" => DeviceKind::Rom,
            _ => DeviceKind::Other,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Disk => "disk",
            DeviceKind::Partition => "part",
            DeviceKind::Rom => "rom",
            DeviceKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// The bus a device is attached through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Usb,
    Mmc,
    Nvme,
    Ata,
    Unknown,
}

impl Transport {
    /// Maps an `lsblk` `TRAN` column value onto a [`Transport`].
    pub fn from_lsblk(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "usb" => Transport::Usb,
            "mmc" => Transport::Mmc,
            "nvme" => Transport::Nvme,
            "sata" | "ata" | "pata" => Transport::Ata,
            _ => Transport::Unknown,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Usb => "usb",
            Transport::Mmc => "mmc",
            Transport::Nvme => "nvme",
            Transport::Ata => "ata",
            Transport::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A child of a disk (normally a partition) together with everything mounted from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// The kernel-provided name (e.g. "mmcblk0p1").
    pub name: String,
    /// The device node (e.g. `/dev/mmcblk0p1`).
    pub path: PathBuf,
    /// Mount points of this partition and of anything stacked on top of it.
    pub mountpoints: Vec<PathBuf>,
}

impl Partition {
    pub fn is_mounted(&self) -> bool {
        !self.mountpoints.is_empty()
    }
}

/// A read-only snapshot of one block device.
///
/// Snapshots are rebuilt from scratch on every inventory read and never mutated
/// afterwards. `size_bytes` is the only size that may drive arithmetic; the
/// human-readable size from [`BlockDevice::human_size`] is for display only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDevice {
    /// The kernel-provided name of the device (e.g. "mmcblk0").
    pub name: String,
    /// The system path to the device, always `/dev/<name>`.
    pub path: PathBuf,
    pub kind: DeviceKind,
    /// Capacity in bytes. Zero when no media is present.
    pub size_bytes: u64,
    pub removable: bool,
    pub read_only: bool,
    pub transport: Transport,
    /// Vendor model string, possibly empty.
    pub model: String,
    /// Mount points of the device itself and of all of its children, in inventory order.
    pub mountpoints: Vec<PathBuf>,
    pub partitions: Vec<Partition>,
}

impl BlockDevice {
    /// Creates a device record with neutral attributes: not removable, writable,
    /// unknown transport, no model, nothing mounted.
    pub fn new(name: impl Into<String>, kind: DeviceKind, size_bytes: u64) -> Self {
        let name = name.into();
        Self {
            path: dev_path(&name),
            name,
            kind,
            size_bytes,
            removable: false,
            read_only: false,
            transport: Transport::Unknown,
            model: String::new(),
            mountpoints: Vec::new(),
            partitions: Vec::new(),
        }
    }

    pub fn is_mounted(&self) -> bool {
        !self.mountpoints.is_empty()
    }

    /// The device node the kernel creates for partition `number` of this disk.
    pub fn partition_node(&self, number: u32) -> PathBuf {
        partition_node(&self.path, number)
    }

    pub fn human_size(&self) -> String {
        human_size(self.size_bytes)
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = if self.model.is_empty() {
            "Removable"
        } else {
            self.model.as_str()
        };

        write!(
            f,
            "{}  {}  [{}]  (tran={} rm={})",
            self.path.display(),
            model,
            self.human_size(),
            self.transport,
            u8::from(self.removable),
        )?;

        if self.is_mounted() {
            f.write_str("  [mounted]")?;
        }
        Ok(())
    }
}

/// Builds `/dev/<name>`.
pub fn dev_path(name: &str) -> PathBuf {
    PathBuf::from("/dev").join(name)
}

/// Derives the node of partition `number` on `disk`.
///
/// Disks whose name ends in a digit (`mmcblk0`, `nvme0n1`) separate the partition
/// number with a `p`; others (`sdb`) append it directly.
pub fn partition_node(disk: &Path, number: u32) -> PathBuf {
    let mut node = disk.as_os_str().to_os_string();
    let ends_with_digit = disk
        .to_string_lossy()
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_digit());
    if ends_with_digit {
        node.push("p");
    }
    node.push(number.to_string());
    PathBuf::from(node)
}

/// Formats a byte count the way `lsblk` does (binary units, one decimal).
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "K", "M", "G", "T", "P"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        return format!("{bytes}B");
    }

    let text = format!("{value:.1}");
    let text = text.strip_suffix(".0").unwrap_or(&text);
    format!("{text}{}", UNITS[unit])
}
