//! System implementations of the collaborator traits.
//!
//! Each supported OS gets its own submodule, selected with `#[cfg]`, exposing
//! the same public API: the inventory and mount readers, the root guard, the
//! device-node probe and a [`collaborators`] constructor that wires them up.
//! Only Linux is supported; the pipeline depends on `lsblk`, `parted`,
//! `mkfs.fat` and sysfs.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
