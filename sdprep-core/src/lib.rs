//! The core, UI-agnostic library for the `sdprep` SD card preparation utility.
//!
//! `sdprep-core` decides which attached block devices may be erased and then
//! erases one of them: it wipes the old signatures, writes an MBR table with a
//! FAT32 data partition and a reserved raw partition, and formats the first
//! one. It is meant to sit behind any front-end, whether a command-line
//! interface (like `sdprep`) or a graphical one.
//!
//! The library is structured into several key modules:
//! - [`device`] and [`inventory`]: the block device snapshot and its `lsblk` parser.
//! - [`classify`]: the safety classifier deciding what is offered to the operator.
//! - [`guard`]: finds the disk behind `/`, which is never touched.
//! - [`layout`] and [`label`]: partition boundaries and the volume label.
//! - [`unmount`], [`steps`], [`runner`] and [`settle`]: the pieces of a format job.
//! - [`orchestrator`]: the [`Service`] running the job state machine.
//! - [`platform`]: the real system behind all of the above.
//!
//! Every interaction with the system goes through a trait ([`InventorySource`],
//! [`RootGuard`], [`MountControl`], [`StepRunner`], [`DeviceNodes`]), so the
//! whole pipeline can be driven against fakes.
//!
//! ## Example: Formatting the First Candidate
//!
//! ```rust,no_run
//! use sdprep_core::{Acknowledgement, Elevation, FormatSettings, RiskPolicy, Service, platform};
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let service = Service::new(
//!         platform::collaborators(Elevation::Auto)?,
//!         FormatSettings::default(),
//!     );
//!     let policy = RiskPolicy::default();
//!
//!     let candidates = service.list_candidates(&policy).await?;
//!     let Some(target) = candidates.first() else {
//!         println!("No SD card found.");
//!         return Ok(());
//!     };
//!
//!     let job = service
//!         .request_format(&target.device.path, "MICROPYTHON", &policy)
//!         .await?;
//!     // A real front-end asks the operator first. Caution devices need the
//!     // path typed back instead.
//!     service.confirm(&job, Acknowledgement::Confirmed)?;
//!
//!     let finished = job.wait().await;
//!     println!("{}", finished.status_line());
//!     service.acknowledge(&job)?;
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod device;
pub mod error;
pub mod guard;
pub mod inventory;
pub mod label;
pub mod layout;
pub mod orchestrator;
pub mod platform;
pub mod runner;
pub mod settle;
pub mod steps;
pub mod unmount;

#[cfg(test)]
mod testing;

pub use classify::{ClassificationResult, Confirmation, RejectReason, RiskPolicy, SafetyClass};
pub use device::{BlockDevice, DeviceKind, Partition, Transport};
pub use error::{
    CapacityError, GuardError, InventoryError, JobFailure, RequestError, StepFailure, UnmountError,
};
pub use guard::RootGuard;
pub use inventory::{InventoryCache, InventorySource};
pub use label::VolumeLabel;
pub use layout::{LayoutPlan, plan_layout};
pub use orchestrator::{
    Acknowledgement, Collaborators, FormatJob, FormatSettings, JobEvent, JobHandle, JobState,
    Service,
};
pub use runner::{Elevation, StepRunner};
pub use settle::DeviceNodes;
pub use unmount::MountControl;
