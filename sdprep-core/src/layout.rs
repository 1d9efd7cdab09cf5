//! Two-partition layout planning from raw device geometry.
use std::fmt;

use crate::error::CapacityError;

pub const MIB: u64 = 1024 * 1024;

/// Size of the raw region left after the data partition.
pub const DEFAULT_RESERVED_MIB: u64 = 32;

/// The data partition starts 1 MiB in, leaving room for the MBR and alignment.
pub const PARTITION1_START_MIB: u64 = 1;

/// Partition 1 must end above this mark or planning fails.
pub const MINIMUM_USABLE_MIB: u64 = 64;

/// Where the two partitions go, in whole mebibytes.
///
/// Partition 2 always runs from the end of partition 1 to the end of the
/// device (`100%`), so it absorbs whatever the MiB truncation left over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutPlan {
    pub total_mib: u64,
    pub reserved_mib: u64,
    pub partition1_start_mib: u64,
    pub partition1_end_mib: u64,
    pub partition2_start_mib: u64,
}

impl LayoutPlan {
    /// The end argument `parted` gets for partition 2.
    pub const PARTITION2_END: &'static str = "100%";

    pub fn partition1_span_mib(&self) -> u64 {
        self.partition1_end_mib - self.partition1_start_mib
    }
}

impl fmt::Display for LayoutPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p1 FAT32 {}MiB-{}MiB, p2 reserved {}MiB-{} (device {} MiB)",
            self.partition1_start_mib,
            self.partition1_end_mib,
            self.partition2_start_mib,
            Self::PARTITION2_END,
            self.total_mib,
        )
    }
}

/// Plans the layout for a device of `size_bytes`.
///
/// Bytes become mebibytes by truncating division, matching how `parted` sees
/// the disk; rounding up here would place partition 1 past the end of the
/// device after the wipe. Fails if partition 1 would not end above
/// [`MINIMUM_USABLE_MIB`].
pub fn plan_layout(size_bytes: u64, reserved_mib: u64) -> Result<LayoutPlan, CapacityError> {
    let total_mib = size_bytes / MIB;
    let partition1_end_mib = match total_mib.checked_sub(reserved_mib) {
        Some(end) if end > MINIMUM_USABLE_MIB => end,
        _ => {
            return Err(CapacityError {
                total_mib,
                partition1_end_mib: signed_difference(total_mib, reserved_mib),
                minimum_mib: MINIMUM_USABLE_MIB,
            });
        }
    };

    Ok(LayoutPlan {
        total_mib,
        reserved_mib,
        partition1_start_mib: PARTITION1_START_MIB,
        partition1_end_mib,
        partition2_start_mib: partition1_end_mib,
    })
}

/// `a - b` for reporting, clamped to the `i64` range.
fn signed_difference(a: u64, b: u64) -> i64 {
    let a = i64::try_from(a).unwrap_or(i64::MAX);
    let b = i64::try_from(b).unwrap_or(i64::MAX);
    a.saturating_sub(b)
}
