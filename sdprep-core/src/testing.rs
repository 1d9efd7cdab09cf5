//! Scripted stand-ins for the system collaborators.
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::device::{BlockDevice, DeviceKind, Partition, Transport};
use crate::error::{GuardError, InventoryError};
use crate::guard::RootGuard;
use crate::inventory::InventorySource;
use crate::orchestrator::{Collaborators, FormatSettings, Service};
use crate::runner::{OutputLine, OutputStream, SpawnedStep, StepRunner, StepStatus, Terminator};
use crate::settle::DeviceNodes;
use crate::steps::StepCommand;
use crate::unmount::MountControl;

const GIB: u64 = 1024 * 1024 * 1024;

/// The internal NVMe disk the fake system boots from.
pub fn system_disk() -> BlockDevice {
    let mut disk = BlockDevice::new("nvme0n1", DeviceKind::Disk, 512_110_190_592);
    disk.transport = Transport::Nvme;
    disk.model = "Samsung SSD 980".into();
    disk.mountpoints = vec![PathBuf::from("/boot/efi"), PathBuf::from("/")];
    disk.partitions = vec![
        Partition {
            name: "nvme0n1p1".into(),
            path: PathBuf::from("/dev/nvme0n1p1"),
            mountpoints: vec![PathBuf::from("/boot/efi")],
        },
        Partition {
            name: "nvme0n1p2".into(),
            path: PathBuf::from("/dev/nvme0n1p2"),
            mountpoints: vec![PathBuf::from("/")],
        },
    ];
    disk
}

/// A 32 GB card in the built-in SD slot.
pub fn sd_card() -> BlockDevice {
    let mut card = BlockDevice::new("mmcblk0", DeviceKind::Disk, 31_914_983_424);
    card.removable = true;
    card.transport = Transport::Mmc;
    card
}

/// A large USB SSD that only scores `Caution`.
pub fn usb_ssd() -> BlockDevice {
    let mut ssd = BlockDevice::new("sdc", DeviceKind::Disk, 900 * GIB);
    ssd.transport = Transport::Usb;
    ssd.model = "Portable SSD".into();
    ssd
}

pub struct FakeInventory {
    devices: Mutex<Result<Vec<BlockDevice>, String>>,
}

impl FakeInventory {
    pub fn new(devices: Vec<BlockDevice>) -> Self {
        Self {
            devices: Mutex::new(Ok(devices)),
        }
    }

    pub fn set(&self, devices: Vec<BlockDevice>) {
        *self.devices.lock().unwrap() = Ok(devices);
    }

    pub fn fail(&self, message: &str) {
        *self.devices.lock().unwrap() = Err(message.to_string());
    }
}

#[async_trait]
impl InventorySource for FakeInventory {
    async fn snapshot(&self) -> Result<Vec<BlockDevice>, InventoryError> {
        self.devices
            .lock()
            .unwrap()
            .clone()
            .map_err(InventoryError::Malformed)
    }
}

pub struct FakeGuard {
    root: Mutex<Option<PathBuf>>,
}

impl FakeGuard {
    pub fn new(root: &str) -> Self {
        Self {
            root: Mutex::new(Some(PathBuf::from(root))),
        }
    }

    pub fn set_root(&self, root: &str) {
        *self.root.lock().unwrap() = Some(PathBuf::from(root));
    }

    pub fn break_resolution(&self) {
        *self.root.lock().unwrap() = None;
    }
}

impl RootGuard for FakeGuard {
    fn root_parent_device(&self) -> Result<PathBuf, GuardError> {
        self.root
            .lock()
            .unwrap()
            .clone()
            .ok_or(GuardError::RootMountNotFound)
    }
}

/// Answers mount listings from a script, then from a fallback.
#[derive(Default)]
pub struct FakeMounts {
    state: Mutex<MountsState>,
    fail_userspace: AtomicBool,
}

#[derive(Default)]
struct MountsState {
    script: VecDeque<Vec<Partition>>,
    fallback: Option<Vec<Partition>>,
    enumerations: usize,
    userspace: Vec<PathBuf>,
    kernel: Vec<PathBuf>,
}

impl FakeMounts {
    /// Nothing is ever mounted.
    pub fn none() -> Self {
        let mounts = Self::default();
        mounts.state.lock().unwrap().fallback = Some(Vec::new());
        mounts
    }

    /// One listing per entry; listing past the end fails.
    pub fn scripted(rounds: Vec<Vec<Partition>>) -> Self {
        let mounts = Self::default();
        mounts.state.lock().unwrap().script = rounds.into();
        mounts
    }

    pub fn always_mounted(&self, name: &str, mountpoint: &str) {
        self.state.lock().unwrap().fallback = Some(vec![Partition {
            name: name.into(),
            path: PathBuf::from("/dev").join(name),
            mountpoints: vec![PathBuf::from(mountpoint)],
        }]);
    }

    pub fn fail_userspace(&self, fail: bool) {
        self.fail_userspace.store(fail, Ordering::SeqCst);
    }

    pub fn enumerations(&self) -> usize {
        self.state.lock().unwrap().enumerations
    }

    pub fn userspace_calls(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().userspace.clone()
    }

    pub fn kernel_calls(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().kernel.clone()
    }
}

#[async_trait]
impl MountControl for FakeMounts {
    async fn mounted_partitions(&self, _disk: &Path) -> Result<Vec<Partition>, InventoryError> {
        let mut state = self.state.lock().unwrap();
        state.enumerations += 1;
        match state.script.pop_front() {
            Some(round) => Ok(round),
            None => state
                .fallback
                .clone()
                .ok_or_else(|| InventoryError::Malformed("no scripted mount listing left".into())),
        }
    }

    async fn unmount_userspace(&self, partition: &Path) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .userspace
            .push(partition.to_path_buf());
        if self.fail_userspace.load(Ordering::SeqCst) {
            Err(io::Error::other("udisksctl: not authorized"))
        } else {
            Ok(())
        }
    }

    fn unmount_kernel(&self, mountpoint: &Path) -> io::Result<()> {
        self.state
            .lock()
            .unwrap()
            .kernel
            .push(mountpoint.to_path_buf());
        Ok(())
    }
}

/// Reports nodes missing for the first `threshold` lookups.
pub struct FakeNodes {
    threshold: AtomicUsize,
    checks: AtomicUsize,
}

impl FakeNodes {
    pub fn present() -> Self {
        Self::appearing_after(0)
    }

    pub fn appearing_after(lookups: usize) -> Self {
        Self {
            threshold: AtomicUsize::new(lookups),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn never() -> Self {
        Self::appearing_after(usize::MAX)
    }

    pub fn hide_all(&self) {
        self.threshold.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl DeviceNodes for FakeNodes {
    fn is_block_device(&self, _path: &Path) -> bool {
        let seen = self.checks.fetch_add(1, Ordering::SeqCst);
        seen >= self.threshold.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
enum Script {
    Exit { code: i32, output: Vec<String> },
    /// Runs until terminated, then exits only once released.
    Hold,
}

/// Records every command and plays back scripted outcomes.
///
/// Commands succeed silently unless a script matches a substring of the
/// rendered command line.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<RunnerState>,
    terminations: Arc<AtomicUsize>,
    release: Arc<Notify>,
}

#[derive(Default)]
struct RunnerState {
    commands: Vec<String>,
    scripts: Vec<(String, Script)>,
}

impl FakeRunner {
    pub fn fail(&self, pattern: &str, code: i32, output: &[&str]) {
        self.state.lock().unwrap().scripts.push((
            pattern.to_string(),
            Script::Exit {
                code,
                output: output.iter().map(|s| s.to_string()).collect(),
            },
        ));
    }

    pub fn hold(&self, pattern: &str) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .push((pattern.to_string(), Script::Hold));
    }

    /// Lets a terminated held process exit.
    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }
}

impl StepRunner for FakeRunner {
    fn spawn(&self, command: &StepCommand) -> io::Result<SpawnedStep> {
        let rendered = command.to_string();
        let script = {
            let mut state = self.state.lock().unwrap();
            state.commands.push(rendered.clone());
            state
                .scripts
                .iter()
                .find(|(pattern, _)| rendered.contains(pattern.as_str()))
                .map(|(_, script)| script.clone())
                .unwrap_or(Script::Exit {
                    code: 0,
                    output: Vec::new(),
                })
        };

        let (line_tx, lines) = mpsc::channel(64);
        let (term_tx, term_rx) = oneshot::channel();
        let (exit_tx, exit) = oneshot::channel();

        match script {
            Script::Exit { code, output } => {
                for text in output {
                    line_tx
                        .try_send(OutputLine {
                            stream: OutputStream::Stderr,
                            text,
                        })
                        .unwrap();
                }
                let _ = exit_tx.send(Ok(StepStatus::exited(code)));
            }
            Script::Hold => {
                let terminations = Arc::clone(&self.terminations);
                let release = Arc::clone(&self.release);
                tokio::spawn(async move {
                    let _open = line_tx;
                    if term_rx.await.is_ok() {
                        terminations.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        let _ = exit_tx.send(Ok(StepStatus::signaled(15)));
                    }
                });
            }
        }

        Ok(SpawnedStep {
            lines,
            exit,
            terminator: Terminator::new(term_tx),
        })
    }
}

/// A fake system with one internal disk plus the given devices.
pub struct Harness {
    pub inventory: Arc<FakeInventory>,
    pub guard: Arc<FakeGuard>,
    pub mounts: Arc<FakeMounts>,
    pub runner: Arc<FakeRunner>,
    pub nodes: Arc<FakeNodes>,
}

impl Harness {
    pub fn with_devices(devices: Vec<BlockDevice>) -> Self {
        let mut all = vec![system_disk()];
        all.extend(devices);
        Self {
            inventory: Arc::new(FakeInventory::new(all)),
            guard: Arc::new(FakeGuard::new("/dev/nvme0n1")),
            mounts: Arc::new(FakeMounts::none()),
            runner: Arc::new(FakeRunner::default()),
            nodes: Arc::new(FakeNodes::present()),
        }
    }

    pub fn service(&self) -> Service {
        Service::new(
            Collaborators {
                inventory: self.inventory.clone(),
                guard: self.guard.clone(),
                mounts: self.mounts.clone(),
                runner: self.runner.clone(),
                nodes: self.nodes.clone(),
            },
            FormatSettings::default(),
        )
    }
}
