//! Root-device guard: finds the disk behind `/` so it is never offered or touched.
//!
//! The answer is recomputed on every call. Live-USB systems boot from
//! removable media, and hotplug can renumber disks between two checks.
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::GuardError;

/// Device-mapper and md stacks deeper than this are not followed.
const MAX_STACK_DEPTH: usize = 8;

pub trait RootGuard: Send + Sync {
    /// Canonical path of the disk backing the root filesystem, e.g. `/dev/nvme0n1`.
    fn root_parent_device(&self) -> Result<PathBuf, GuardError>;
}

/// Returns `Ok(true)` if `device` is the root disk. Guard failures propagate;
/// callers must treat them as "not safe".
pub fn is_root_parent(guard: &dyn RootGuard, device: &Path) -> Result<bool, GuardError> {
    Ok(guard.root_parent_device()? == device)
}

/// Resolves the whole disk under the block device `name` by walking sysfs.
///
/// `sys_class_block` is normally `/sys/class/block`. A partition resolves to
/// its parent disk, a device-mapper or md device to the disk under its
/// `slaves`, and a whole disk to itself. A stack that ends on more than one
/// disk is reported as [`GuardError::Ambiguous`].
pub fn resolve_parent_disk(sys_class_block: &Path, name: &str) -> Result<String, GuardError> {
    resolve(sys_class_block, name, 0)
}

fn resolve(sys_class_block: &Path, name: &str, depth: usize) -> Result<String, GuardError> {
    if depth > MAX_STACK_DEPTH {
        return Err(GuardError::TooDeep(name.to_string()));
    }

    let sysfs_err = |source: io::Error| GuardError::Sysfs {
        name: name.to_string(),
        source,
    };

    let node = fs::canonicalize(sys_class_block.join(name)).map_err(sysfs_err)?;

    if node.join("partition").exists() {
        return node
            .parent()
            .and_then(Path::file_name)
            .map(|parent| parent.to_string_lossy().into_owned())
            .ok_or_else(|| {
                sysfs_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "partition has no parent in sysfs",
                ))
            });
    }

    let slaves = match fs::read_dir(node.join("slaves")) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<BTreeSet<_>>(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
        Err(err) => return Err(sysfs_err(err)),
    };

    if slaves.is_empty() {
        return Ok(name.to_string());
    }

    let mut disks = BTreeSet::new();
    for slave in &slaves {
        disks.insert(resolve(sys_class_block, slave, depth + 1)?);
    }

    if disks.len() == 1 {
        Ok(disks.into_iter().next().unwrap_or_default())
    } else {
        Err(GuardError::Ambiguous(disks.into_iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// A miniature `/sys` with `class/block` symlinks into `devices`.
    struct FakeSysfs {
        dir: TempDir,
    }

    impl FakeSysfs {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("class/block")).unwrap();
            Self { dir }
        }

        fn class_block(&self) -> PathBuf {
            self.dir.path().join("class/block")
        }

        fn add_disk(&self, disk: &str) {
            let dev = self.dir.path().join("devices").join(disk);
            fs::create_dir_all(&dev).unwrap();
            symlink(&dev, self.class_block().join(disk)).unwrap();
        }

        fn add_partition(&self, disk: &str, part: &str) {
            let dev = self.dir.path().join("devices").join(disk).join(part);
            fs::create_dir_all(&dev).unwrap();
            fs::write(dev.join("partition"), "1\n").unwrap();
            symlink(&dev, self.class_block().join(part)).unwrap();
        }

        fn add_mapper(&self, name: &str, slaves: &[&str]) {
            let dev = self.dir.path().join("devices/virtual").join(name);
            fs::create_dir_all(dev.join("slaves")).unwrap();
            for slave in slaves {
                fs::create_dir_all(dev.join("slaves").join(slave)).unwrap();
            }
            symlink(&dev, self.class_block().join(name)).unwrap();
        }
    }

    struct FixedGuard(Result<PathBuf, ()>);

    impl RootGuard for FixedGuard {
        fn root_parent_device(&self) -> Result<PathBuf, GuardError> {
            self.0.clone().map_err(|_| GuardError::RootMountNotFound)
        }
    }

    #[test]
    fn partition_resolves_to_its_disk() {
        let sys = FakeSysfs::new();
        sys.add_disk("nvme0n1");
        sys.add_partition("nvme0n1", "nvme0n1p2");
        assert_eq!(
            resolve_parent_disk(&sys.class_block(), "nvme0n1p2").unwrap(),
            "nvme0n1"
        );
    }

    #[test]
    fn whole_disk_resolves_to_itself() {
        let sys = FakeSysfs::new();
        sys.add_disk("sda");
        assert_eq!(resolve_parent_disk(&sys.class_block(), "sda").unwrap(), "sda");
    }

    #[test]
    fn mapper_stacks_are_followed() {
        let sys = FakeSysfs::new();
        sys.add_disk("sda");
        sys.add_partition("sda", "sda3");
        sys.add_mapper("dm-1", &["sda3"]);
        sys.add_mapper("dm-2", &["dm-1"]);
        assert_eq!(resolve_parent_disk(&sys.class_block(), "dm-2").unwrap(), "sda");
    }

    #[test]
    fn stacks_over_several_disks_are_ambiguous() {
        let sys = FakeSysfs::new();
        sys.add_disk("sda");
        sys.add_disk("sdb");
        sys.add_partition("sda", "sda1");
        sys.add_partition("sdb", "sdb1");
        sys.add_mapper("md0", &["sda1", "sdb1"]);
        match resolve_parent_disk(&sys.class_block(), "md0") {
            Err(GuardError::Ambiguous(disks)) => assert_eq!(disks, ["sda", "sdb"]),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn unknown_device_is_an_error() {
        let sys = FakeSysfs::new();
        assert!(matches!(
            resolve_parent_disk(&sys.class_block(), "sdz1"),
            Err(GuardError::Sysfs { .. })
        ));
    }

    #[test]
    fn guard_failure_propagates() {
        let ok = FixedGuard(Ok(PathBuf::from("/dev/sda")));
        assert!(is_root_parent(&ok, Path::new("/dev/sda")).unwrap());
        assert!(!is_root_parent(&ok, Path::new("/dev/sdb")).unwrap());

        let broken = FixedGuard(Err(()));
        assert!(is_root_parent(&broken, Path::new("/dev/sdb")).is_err());
    }
}
