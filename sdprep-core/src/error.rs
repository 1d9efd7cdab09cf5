//! Error types for every stage of the pipeline.
//!
//! Anything that fails before the first destructive step leaves the device
//! untouched. Failures from the wipe onwards are terminal for the job and carry
//! enough detail (step, command, captured output) to diagnose without rerunning.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::classify::RejectReason;
use crate::orchestrator::JobState;

/// The device inventory could not be read or understood.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("inventory output could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("inventory output is malformed: {0}")]
    Malformed(String),
}

/// The disk backing the root filesystem could not be determined.
///
/// Callers must treat this as "every device is unsafe".
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("could not find the filesystem mounted at /")]
    RootMountNotFound,

    #[error("root filesystem source {0} is not a known block device")]
    UnknownSource(String),

    #[error("could not resolve the parent disk of {name}: {source}")]
    Sysfs {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("device stack under {0} is too deep to resolve")]
    TooDeep(String),

    #[error("root filesystem spans several disks: {}", .0.join(", "))]
    Ambiguous(Vec<String>),
}

/// Partitions of the target stayed mounted, or could not be enumerated.
#[derive(Debug, Error)]
pub enum UnmountError {
    #[error("device remains mounted: {}", display_paths(.partitions))]
    StillMounted {
        disk: PathBuf,
        partitions: Vec<PathBuf>,
    },

    #[error("could not list partitions of {}: {source}", .disk.display())]
    Enumerate {
        disk: PathBuf,
        #[source]
        source: InventoryError,
    },
}

/// The requested layout does not fit on the device.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "device too small: {total_mib} MiB total leaves partition 1 ending at {partition1_end_mib} MiB, \
     which must be above {minimum_mib} MiB"
)]
pub struct CapacityError {
    pub total_mib: u64,
    pub partition1_end_mib: i64,
    pub minimum_mib: u64,
}

/// One external destructive operation exited unsuccessfully.
#[derive(Clone, Debug, Error)]
#[error("{step} failed: `{command}` {status}")]
pub struct StepFailure {
    pub step: JobState,
    pub command: String,
    pub status: String,
    /// Everything the command printed, stdout and stderr interleaved.
    pub output: Vec<String>,
}

/// Why a format request, confirmation or acknowledgement was refused.
///
/// None of these have side effects on any device.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("another job is already in progress ({0})")]
    Busy(JobState),

    #[error("{} is not present in the device inventory", .0.display())]
    NotFound(PathBuf),

    #[error("{} cannot be erased: {reason}", .path.display())]
    Rejected { path: PathBuf, reason: RejectReason },

    #[error("root device check failed, refusing to touch any device: {0}")]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("job is {0}, not awaiting confirmation")]
    WrongState(JobState),

    #[error("confirmation does not match {}; retype the exact device path", .0.display())]
    AcknowledgementMismatch(PathBuf),

    #[error("job {0} is not the current job")]
    UnknownJob(u64),
}

/// The reason a job ended in `Failed`.
#[derive(Debug, Error)]
pub enum JobFailure {
    #[error("root device check failed: {0}")]
    Guard(#[from] GuardError),

    #[error("{} now backs the root filesystem", .0.display())]
    RootDevice(PathBuf),

    #[error("pre-flight check failed: {0}")]
    Preflight(String),

    #[error(transparent)]
    Unmount(#[from] UnmountError),

    #[error(transparent)]
    Step(#[from] StepFailure),

    #[error("could not start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("lost track of `{command}`: {reason}")]
    Supervision { command: String, reason: String },

    #[error("partition nodes not detected: {}", display_paths(.0))]
    NodesNotDetected(Vec<PathBuf>),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
