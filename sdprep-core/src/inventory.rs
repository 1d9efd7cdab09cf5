//! Block device inventory: parsing `lsblk --json` into [`BlockDevice`] snapshots.
//!
//! `lsblk` has changed its JSON over the years: older releases print every
//! value as a string (`"rm": "1"`, `"size": "4000000000"`), newer ones use
//! booleans and numbers, and the mount point column may arrive as either
//! `mountpoint` or `mountpoints`. All of these are accepted. A value that
//! cannot be interpreted is treated as absent rather than failing the whole
//! read, but output that is not the expected JSON shape at all is an error.
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::device::{BlockDevice, DeviceKind, Partition, Transport, dev_path};
use crate::error::InventoryError;

/// Columns requested from `lsblk`.
pub const LSBLK_COLUMNS: &str = "NAME,TYPE,SIZE,RM,RO,TRAN,MODEL,MOUNTPOINT";

/// Produces fresh snapshots of the attached block devices.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Reads every top-level block device.
    async fn snapshot(&self) -> Result<Vec<BlockDevice>, InventoryError>;

    /// Reads a single device by path; `Ok(None)` if it is not attached.
    async fn device(&self, path: &Path) -> Result<Option<BlockDevice>, InventoryError> {
        Ok(self
            .snapshot()
            .await?
            .into_iter()
            .find(|device| device.path == path))
    }
}

/// Keeps the last good snapshot so a failed refresh never empties the list.
#[derive(Debug, Default)]
pub struct InventoryCache {
    devices: Vec<BlockDevice>,
    last_error: Option<String>,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cached list with a fresh snapshot. On failure the previous
    /// list is kept and the error is returned.
    pub async fn refresh(
        &mut self,
        source: &dyn InventorySource,
    ) -> Result<&[BlockDevice], InventoryError> {
        match source.snapshot().await {
            Ok(devices) => {
                self.devices = devices;
                self.last_error = None;
                Ok(&self.devices)
            }
            Err(err) => {
                warn!(error = %err, "inventory refresh failed, keeping previous list");
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn devices(&self) -> &[BlockDevice] {
        &self.devices
    }

    /// The error from the most recent refresh, if it failed.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<LsblkValue>,
    #[serde(default)]
    size: Option<LsblkValue>,
    #[serde(default)]
    rm: Option<LsblkValue>,
    #[serde(default)]
    ro: Option<LsblkValue>,
    #[serde(default)]
    tran: Option<LsblkValue>,
    #[serde(default)]
    model: Option<LsblkValue>,
    #[serde(default)]
    mountpoint: Option<LsblkValue>,
    #[serde(default)]
    mountpoints: Vec<Option<LsblkValue>>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

#[derive(Debug)]
enum LsblkValue {
    Flag(bool),
    Number(u64),
    Text(String),
    /// Present, but of a shape no column uses.
    Unreadable,
}

impl<'de> Deserialize<'de> for LsblkValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match serde_json::Value::deserialize(deserializer)? {
            Value::Bool(b) => LsblkValue::Flag(b),
            Value::Number(n) => n.as_u64().map_or(LsblkValue::Unreadable, LsblkValue::Number),
            Value::String(s) => LsblkValue::Text(s),
            _ => LsblkValue::Unreadable,
        })
    }
}

impl LsblkValue {
    fn as_flag(&self) -> Option<bool> {
        match self {
            LsblkValue::Flag(b) => Some(*b),
            LsblkValue::Number(n) => Some(*n != 0),
            LsblkValue::Text(s) => match s.trim() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
            LsblkValue::Unreadable => None,
        }
    }

    fn as_bytes(&self) -> Option<u64> {
        match self {
            LsblkValue::Number(n) => Some(*n),
            LsblkValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            LsblkValue::Text(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }
}

impl LsblkDevice {
    /// Mount points of this node and everything below it.
    fn all_mountpoints(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .mountpoint
            .iter()
            .chain(self.mountpoints.iter().flatten())
            .filter_map(LsblkValue::as_text)
            .map(PathBuf::from)
            .collect();
        out.dedup();

        for child in &self.children {
            for mp in child.all_mountpoints() {
                if !out.contains(&mp) {
                    out.push(mp);
                }
            }
        }
        out
    }

    fn into_block_device(self) -> Result<BlockDevice, InventoryError> {
        validate_name(&self.name)?;

        let mountpoints = self.all_mountpoints();
        let partitions = self
            .children
            .iter()
            .map(|child| {
                validate_name(&child.name)?;
                Ok(Partition {
                    name: child.name.clone(),
                    path: dev_path(&child.name),
                    mountpoints: child.all_mountpoints(),
                })
            })
            .collect::<Result<Vec<_>, InventoryError>>()?;

        let kind = self
            .kind
            .as_ref()
            .and_then(LsblkValue::as_text)
            .map(DeviceKind::from_lsblk)
            .unwrap_or(DeviceKind::Other);
        let transport = self
            .tran
            .as_ref()
            .and_then(LsblkValue::as_text)
            .map(Transport::from_lsblk)
            .unwrap_or(Transport::Unknown);
        let model = self
            .model
            .as_ref()
            .and_then(LsblkValue::as_text)
            .unwrap_or_default()
            .to_string();

        let mut device = BlockDevice::new(
            self.name,
            kind,
            self.size.as_ref().and_then(LsblkValue::as_bytes).unwrap_or(0),
        );
        device.removable = self.rm.as_ref().and_then(LsblkValue::as_flag).unwrap_or(false);
        device.read_only = self.ro.as_ref().and_then(LsblkValue::as_flag).unwrap_or(false);
        device.transport = transport;
        device.model = model;
        device.mountpoints = mountpoints;
        device.partitions = partitions;
        Ok(device)
    }
}

fn validate_name(name: &str) -> Result<(), InventoryError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(InventoryError::Malformed(format!(
            "invalid device name {name:?}"
        )));
    }
    Ok(())
}

/// Parses the output of `lsblk -J -b -o` [`LSBLK_COLUMNS`].
pub fn parse_lsblk(json: &[u8]) -> Result<Vec<BlockDevice>, InventoryError> {
    let output: LsblkOutput = serde_json::from_slice(json)?;
    output
        .blockdevices
        .into_iter()
        .map(LsblkDevice::into_block_device)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const MODERN: &str = r#"{
       "blockdevices": [
          {"name":"nvme0n1", "type":"disk", "size":512110190592, "rm":false, "ro":false, "tran":"nvme", "model":"Samsung SSD 980", "mountpoint":null,
             "children": [
                {"name":"nvme0n1p1", "type":"part", "size":536870912, "rm":false, "ro":false, "tran":"nvme", "model":null, "mountpoint":"/boot/efi"},
                {"name":"nvme0n1p2", "type":"part", "size":511571189760, "rm":false, "ro":false, "tran":"nvme", "model":null, "mountpoint":"/"}
             ]
          },
          {"name":"mmcblk0", "type":"disk", "size":31914983424, "rm":true, "ro":false, "tran":null, "model":null, "mountpoint":null,
             "children": [
                {"name":"mmcblk0p1", "type":"part", "size":31913934848, "rm":true, "ro":false, "tran":null, "model":null, "mountpoint":"/media/user/CARD"}
             ]
          },
          {"name":"sdb", "type":"disk", "size":0, "rm":true, "ro":false, "tran":"usb", "model":"Card  Reader ", "mountpoint":null}
       ]
    }"#;

    const LEGACY: &str = r#"{
       "blockdevices": [
          {"name": "sdb", "type": "disk", "size": "4000000000", "rm": "1", "ro": "0", "tran": "usb", "model": "Cruzer", "mountpoint": null,
             "children": [
                {"name": "sdb1", "type": "part", "size": "3999000000", "rm": "1", "ro": "0", "tran": null, "model": null, "mountpoint": "/media/stick"}
             ]
          }
       ]
    }"#;

    #[test]
    fn parses_modern_output() {
        let devices = parse_lsblk(MODERN.as_bytes()).unwrap();
        assert_eq!(devices.len(), 3);

        let nvme = &devices[0];
        assert_eq!(nvme.path, PathBuf::from("/dev/nvme0n1"));
        assert_eq!(nvme.kind, DeviceKind::Disk);
        assert_eq!(nvme.transport, Transport::Nvme);
        assert_eq!(
            nvme.mountpoints,
            vec![PathBuf::from("/boot/efi"), PathBuf::from("/")]
        );
        assert_eq!(nvme.partitions.len(), 2);
        assert_eq!(nvme.partitions[1].path, PathBuf::from("/dev/nvme0n1p2"));

        let card = &devices[1];
        assert!(card.removable);
        assert_eq!(card.size_bytes, 31_914_983_424);
        assert_eq!(card.transport, Transport::Unknown);
        assert!(card.model.is_empty());
        assert!(card.partitions[0].is_mounted());

        let reader = &devices[2];
        assert_eq!(reader.size_bytes, 0);
        assert_eq!(reader.model, "Card  Reader");
    }

    #[test]
    fn parses_legacy_string_values() {
        let devices = parse_lsblk(LEGACY.as_bytes()).unwrap();
        let stick = &devices[0];
        assert_eq!(stick.size_bytes, 4_000_000_000);
        assert!(stick.removable);
        assert!(!stick.read_only);
        assert_eq!(stick.mountpoints, vec![PathBuf::from("/media/stick")]);
    }

    #[test]
    fn accepts_mountpoints_arrays() {
        let json = r#"{"blockdevices":[{"name":"sdc","type":"disk","size":8000000000,"rm":true,"ro":false,
            "mountpoints":[null],
            "children":[{"name":"sdc1","type":"part","mountpoints":["/mnt/a","/mnt/b"]}]}]}"#;
        let devices = parse_lsblk(json.as_bytes()).unwrap();
        assert_eq!(
            devices[0].mountpoints,
            vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/b")]
        );
    }

    #[test]
    fn unreadable_fields_are_neutral() {
        let json = r#"{"blockdevices":[{"name":"sdd","type":"disk","size":{"weird":1},"rm":"maybe","ro":[1]}]}"#;
        let device = &parse_lsblk(json.as_bytes()).unwrap()[0];
        assert_eq!(device.size_bytes, 0);
        assert!(!device.removable);
        assert!(!device.read_only);
    }

    #[test]
    fn rejects_malformed_output() {
        assert!(matches!(
            parse_lsblk(b"not json"),
            Err(InventoryError::Parse(_))
        ));
        assert!(matches!(
            parse_lsblk(br#"{"devices":[]}"#),
            Err(InventoryError::Parse(_))
        ));
        assert!(matches!(
            parse_lsblk(br#"{"blockdevices":[{"name":"../sda","type":"disk"}]}"#),
            Err(InventoryError::Malformed(_))
        ));
    }

    struct Scripted(Mutex<Vec<Result<Vec<BlockDevice>, InventoryError>>>);

    #[async_trait]
    impl InventorySource for Scripted {
        async fn snapshot(&self) -> Result<Vec<BlockDevice>, InventoryError> {
            self.0.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn cache_keeps_previous_list_on_failure() {
        let source = Scripted(Mutex::new(vec![
            parse_lsblk(MODERN.as_bytes()),
            Err(InventoryError::Malformed("truncated".into())),
        ]));
        let mut cache = InventoryCache::new();

        assert_eq!(cache.refresh(&source).await.unwrap().len(), 3);
        assert!(cache.refresh(&source).await.is_err());
        assert_eq!(cache.devices().len(), 3);
        assert_eq!(
            cache.last_error(),
            Some("inventory output is malformed: truncated")
        );
    }
}
