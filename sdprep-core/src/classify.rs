//! Decides which block devices may be offered for erasure.
//!
//! Classification is a closed-world allowlist: a device must survive every
//! filter *and* earn a positive score to be offered at all. Anything ambiguous
//! ends up [`SafetyClass::Rejected`].
//!
//! The filters run in a fixed order and stop at the first failure, so the
//! recorded [`RejectReason`] is always the earliest one that applies:
//!
//! 1. only whole disks are targetable;
//! 2. the disk backing `/` is never targetable;
//! 3. nothing with a system mount point ([`PROTECTED_MOUNTPOINTS`]);
//! 4. nothing read-only;
//! 5. nothing without media (zero size).
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::device::{BlockDevice, DeviceKind, Transport};

/// Mount points that mark a device as part of the running system.
pub const PROTECTED_MOUNTPOINTS: [&str; 8] = [
    "/",
    "/boot",
    "/boot/efi",
    "/usr",
    "/var",
    "/opt",
    "/snap",
    "/recovery",
];

const GIB: u64 = 1024 * 1024 * 1024;
const TIB: u64 = 1024 * GIB;

/// Name prefixes of virtual or loopback block devices.
const VIRTUAL_PREFIXES: [&str; 5] = ["loop", "zram", "ram", "nbd", "dm-"];

/// Model substrings that identify USB card readers.
const CARD_READER_HINTS: [&str; 5] = ["sd", "card", "reader", "massstorageclass", "generic"];

/// Tunables for classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RiskPolicy {
    /// Scores at or above this are `Safe`; lower positive scores are `Caution`.
    pub safe_threshold: i32,
    /// Devices below this capacity score as plausible SD/USB media.
    pub plausible_ceiling_bytes: u64,
    /// When set, devices at or above `large_capacity_cutoff_bytes` are rejected.
    pub restrict_mode: bool,
    pub large_capacity_cutoff_bytes: u64,
    /// When set, only devices that look like SD cards or SD card readers pass.
    pub sd_only: bool,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            safe_threshold: 5,
            plausible_ceiling_bytes: 512 * GIB,
            restrict_mode: true,
            large_capacity_cutoff_bytes: TIB,
            sd_only: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SafetyClass {
    Safe,
    Caution,
    Rejected,
}

impl SafetyClass {
    /// The confirmation the operator owes before a device of this class may be
    /// erased, or `None` if it may not be erased at all.
    pub fn confirmation(self) -> Option<Confirmation> {
        match self {
            SafetyClass::Safe => Some(Confirmation::YesNo),
            SafetyClass::Caution => Some(Confirmation::RetypePath),
            SafetyClass::Rejected => None,
        }
    }
}

impl fmt::Display for SafetyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyClass::Safe => "safe",
            SafetyClass::Caution => "caution",
            SafetyClass::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// How firmly the operator has to confirm before a device is erased.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// A yes/no prompt.
    YesNo,
    /// The exact device path has to be typed back.
    RetypePath,
}

/// Why a device was filtered out. Not an error; used for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    NotADisk(DeviceKind),
    RootDevice,
    ProtectedMount(PathBuf),
    ReadOnly,
    NoMedia,
    NotSdMedia,
    TooLarge { cutoff_bytes: u64 },
    LowScore(i32),
    GuardUnavailable,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotADisk(kind) => write!(f, "not a whole disk (type {kind})"),
            RejectReason::RootDevice => f.write_str("backs the root filesystem"),
            RejectReason::ProtectedMount(mp) => {
                write!(f, "has a system mount point ({})", mp.display())
            }
            RejectReason::ReadOnly => f.write_str("read-only"),
            RejectReason::NoMedia => f.write_str("no media present"),
            RejectReason::NotSdMedia => f.write_str("does not look like SD media"),
            RejectReason::TooLarge { cutoff_bytes } => write!(
                f,
                "larger than the {} restrict-mode limit",
                crate::device::human_size(*cutoff_bytes)
            ),
            RejectReason::LowScore(score) => {
                write!(f, "does not look like removable media (score {score})")
            }
            RejectReason::GuardUnavailable => f.write_str("root device could not be determined"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassificationResult {
    pub device: BlockDevice,
    pub safety_class: SafetyClass,
    /// Ranking signal only; the class is what gates erasure.
    pub score: i32,
    /// Set exactly when `safety_class` is `Rejected`.
    pub reject_reason: Option<RejectReason>,
}

impl ClassificationResult {
    fn accepted(device: BlockDevice, score: i32, class: SafetyClass) -> Self {
        Self {
            device,
            safety_class: class,
            score,
            reject_reason: None,
        }
    }

    fn rejected(device: BlockDevice, score: i32, reason: RejectReason) -> Self {
        Self {
            device,
            safety_class: SafetyClass::Rejected,
            score,
            reject_reason: Some(reason),
        }
    }

    pub fn is_selectable(&self) -> bool {
        self.reject_reason.is_none() && self.safety_class != SafetyClass::Rejected
    }

    pub fn description(&self) -> String {
        self.device.to_string()
    }
}

impl fmt::Display for ClassificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reject_reason {
            Some(reason) => write!(f, "{}  [rejected: {reason}]", self.device),
            None => write!(f, "{}  [{}]", self.device, self.safety_class),
        }
    }
}

/// Classifies every device in `snapshot`, preserving input order.
///
/// `root_parent` is the disk backing `/`, as resolved by the root guard for
/// this pass.
pub fn classify(
    snapshot: &[BlockDevice],
    root_parent: &Path,
    policy: &RiskPolicy,
) -> Vec<ClassificationResult> {
    snapshot
        .iter()
        .map(|device| classify_device(device, root_parent, policy))
        .collect()
}

/// Rejects every device with the same reason. Used when the root guard fails.
pub fn reject_all(snapshot: &[BlockDevice], reason: RejectReason) -> Vec<ClassificationResult> {
    snapshot
        .iter()
        .map(|device| ClassificationResult::rejected(device.clone(), 0, reason.clone()))
        .collect()
}

/// Keeps only the devices that may be offered to the operator.
pub fn selectable(results: Vec<ClassificationResult>) -> Vec<ClassificationResult> {
    results.into_iter().filter(|r| r.is_selectable()).collect()
}

fn classify_device(
    device: &BlockDevice,
    root_parent: &Path,
    policy: &RiskPolicy,
) -> ClassificationResult {
    if let Err(reason) = filter(device, root_parent, policy) {
        debug!(device = %device.path.display(), %reason, "rejected");
        return ClassificationResult::rejected(device.clone(), 0, reason);
    }

    let score = score(device, policy);

    if policy.restrict_mode && device.size_bytes >= policy.large_capacity_cutoff_bytes {
        let reason = RejectReason::TooLarge {
            cutoff_bytes: policy.large_capacity_cutoff_bytes,
        };
        debug!(device = %device.path.display(), score, %reason, "rejected");
        return ClassificationResult::rejected(device.clone(), score, reason);
    }

    if score <= 0 {
        debug!(device = %device.path.display(), score, "rejected: score too low");
        return ClassificationResult::rejected(device.clone(), score, RejectReason::LowScore(score));
    }

    let class = if score >= policy.safe_threshold {
        SafetyClass::Safe
    } else {
        SafetyClass::Caution
    };
    debug!(device = %device.path.display(), score, %class, "candidate");
    ClassificationResult::accepted(device.clone(), score, class)
}

fn filter(device: &BlockDevice, root_parent: &Path, policy: &RiskPolicy) -> Result<(), RejectReason> {
    if device.kind != DeviceKind::Disk {
        return Err(RejectReason::NotADisk(device.kind));
    }
    if device.path == root_parent {
        return Err(RejectReason::RootDevice);
    }
    if let Some(mp) = protected_mountpoint(device) {
        return Err(RejectReason::ProtectedMount(mp.to_path_buf()));
    }
    if device.read_only {
        return Err(RejectReason::ReadOnly);
    }
    if device.size_bytes == 0 {
        return Err(RejectReason::NoMedia);
    }
    if policy.sd_only && !looks_like_sd_media(device) {
        return Err(RejectReason::NotSdMedia);
    }
    Ok(())
}

/// The first of the device's own or child mount points that belongs to the system.
pub fn protected_mountpoint(device: &BlockDevice) -> Option<&Path> {
    device
        .mountpoints
        .iter()
        .chain(device.partitions.iter().flat_map(|p| p.mountpoints.iter()))
        .map(PathBuf::as_path)
        .find(|mp| PROTECTED_MOUNTPOINTS.iter().any(|p| Path::new(p) == *mp))
}

/// Scores how much `device` looks like removable SD/USB media.
pub fn score(device: &BlockDevice, policy: &RiskPolicy) -> i32 {
    let mut score = 0;

    if device.name.starts_with("mmcblk") {
        score += 5;
    }
    if device.removable {
        score += 3;
    }
    match device.transport {
        Transport::Mmc => score += 4,
        Transport::Usb => score += 3,
        _ => {}
    }
    if device.size_bytes > 0 && device.size_bytes < policy.plausible_ceiling_bytes {
        score += 2;
    }
    if VIRTUAL_PREFIXES.iter().any(|p| device.name.starts_with(p)) {
        score -= 10;
    }
    if device.name.starts_with("nvme") || device.transport == Transport::Nvme {
        score -= 7;
    }

    score
}

/// Whether `device` is an SD card slot or a USB SD card reader.
pub fn looks_like_sd_media(device: &BlockDevice) -> bool {
    if device.name.starts_with("mmcblk") || device.transport == Transport::Mmc {
        return true;
    }
    if device.transport == Transport::Usb && device.removable {
        let model = device.model.to_ascii_lowercase();
        return model.is_empty() || CARD_READER_HINTS.iter().any(|hint| model.contains(hint));
    }
    false
}
