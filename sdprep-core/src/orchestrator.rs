//! The format job state machine.
//!
//! A [`Service`] owns at most one [`FormatJob`] at a time. The job moves
//! through the states of [`JobState`] strictly in order; every destructive
//! step is one external process started through the [`StepRunner`], and the
//! next step only starts after the previous one has exited successfully.
//!
//! Front-ends never touch the job directly. They hold a [`JobHandle`] and
//! either [`subscribe`](JobHandle::subscribe) to its events or take
//! [`snapshots`](JobHandle::snapshot).
//!
//! Cancellation is a flag checked at every state boundary. If a process is
//! running when it is set, the process is asked to terminate and the job only
//! becomes [`JobState::Aborted`] once the runner reports that it has exited.
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::classify::{
    ClassificationResult, Confirmation, RejectReason, RiskPolicy, SafetyClass, classify,
    protected_mountpoint, reject_all, selectable,
};
use crate::device::{BlockDevice, DeviceKind};
use crate::error::{GuardError, InventoryError, JobFailure, RequestError, StepFailure, UnmountError};
use crate::guard::{RootGuard, is_root_parent};
use crate::inventory::{InventoryCache, InventorySource};
use crate::label::VolumeLabel;
use crate::layout::{DEFAULT_RESERVED_MIB, LayoutPlan, plan_layout};
use crate::runner::{SpawnedStep, StepRunner};
use crate::settle::{DeviceNodes, wait_for_nodes};
use crate::steps::{self, StepCommand};
use crate::unmount::{MountControl, unmount_all};

const EVENT_BUFFER: usize = 1024;

/// How long to keep reading output after a process has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Idle,
    Confirming,
    Unmounting,
    Wiping,
    PartitioningTable,
    CreatingPartitions,
    WaitingForDeviceNodes,
    FormattingFilesystem,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Aborted
        )
    }

    /// A job in this state blocks new requests.
    pub fn is_active(self) -> bool {
        !matches!(self, JobState::Idle) && !self.is_terminal()
    }

    /// States in which the device is being modified.
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            JobState::Wiping
                | JobState::PartitioningTable
                | JobState::CreatingPartitions
                | JobState::WaitingForDeviceNodes
                | JobState::FormattingFilesystem
        )
    }

    /// A short operator-facing description of what is happening.
    pub fn activity(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Confirming => "waiting for confirmation",
            JobState::Unmounting => "unmounting partitions",
            JobState::Wiping => "wiping signatures",
            JobState::PartitioningTable => "writing partition table",
            JobState::CreatingPartitions => "creating partitions",
            JobState::WaitingForDeviceNodes => "waiting for partition nodes",
            JobState::FormattingFilesystem => "creating FAT32 filesystem",
            JobState::Succeeded => "done",
            JobState::Failed => "failed",
            JobState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a subscriber sees, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    State(JobState),
    Log(String),
}

/// The operator's answer to a confirmation prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    /// A plain yes. Enough for `Safe` devices only.
    Confirmed,
    /// The device path as typed by the operator.
    RetypedPath(String),
}

/// A point-in-time copy of a job.
#[derive(Clone, Debug)]
pub struct FormatJob {
    pub id: u64,
    pub target: BlockDevice,
    pub classification: SafetyClass,
    pub label: VolumeLabel,
    pub plan: LayoutPlan,
    pub state: JobState,
    /// Append-only operator log, including the output of every step.
    pub log_lines: Vec<String>,
    pub cancel_requested: bool,
    pub failure: Option<Arc<JobFailure>>,
    /// Set once the first destructive step has started.
    pub device_touched: bool,
}

impl FormatJob {
    /// The one-line summary shown for the job.
    pub fn status_line(&self) -> String {
        let path = self.target.path.display();
        let mut line = match self.state {
            JobState::Succeeded => format!(
                "Done: {path} has a FAT32 partition labelled {} and a reserved partition.",
                self.label
            ),
            JobState::Failed => match &self.failure {
                Some(failure) => format!("Failed: {failure}"),
                None => "Failed.".to_string(),
            },
            JobState::Aborted => "Aborted by operator.".to_string(),
            state => format!("{path}: {}...", state.activity()),
        };

        if self.device_touched && matches!(self.state, JobState::Failed | JobState::Aborted) {
            line.push_str(&format!(
                " WARNING: {path} was partially modified and may be in an inconsistent state."
            ));
        }
        line
    }
}

/// Tunables for a format job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatSettings {
    pub unmount_attempts: u32,
    pub unmount_delay: Duration,
    pub reserved_mib: u64,
    pub node_poll_attempts: u32,
    pub node_poll_interval: Duration,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            unmount_attempts: 3,
            unmount_delay: Duration::from_millis(250),
            reserved_mib: DEFAULT_RESERVED_MIB,
            node_poll_attempts: 20,
            node_poll_interval: Duration::from_millis(250),
        }
    }
}

/// The system the service acts on.
#[derive(Clone)]
pub struct Collaborators {
    pub inventory: Arc<dyn InventorySource>,
    pub guard: Arc<dyn RootGuard>,
    pub mounts: Arc<dyn MountControl>,
    pub runner: Arc<dyn StepRunner>,
    pub nodes: Arc<dyn DeviceNodes>,
}

/// Entry point for front-ends: lists candidates and runs at most one job.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    collab: Collaborators,
    settings: FormatSettings,
    current: Mutex<Option<Arc<JobShared>>>,
    next_id: AtomicU64,
    cache: tokio::sync::Mutex<InventoryCache>,
}

/// Shared view of a single job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

struct JobShared {
    id: u64,
    job: Mutex<FormatJob>,
    events: broadcast::Sender<JobEvent>,
    state: watch::Sender<JobState>,
    wakeup: watch::Sender<bool>,
}

/// Why a running job stopped early.
enum Halt {
    Cancelled,
    Failed(JobFailure),
}

impl From<JobFailure> for Halt {
    fn from(failure: JobFailure) -> Self {
        Halt::Failed(failure)
    }
}

impl From<GuardError> for Halt {
    fn from(err: GuardError) -> Self {
        Halt::Failed(err.into())
    }
}

impl From<UnmountError> for Halt {
    fn from(err: UnmountError) -> Self {
        Halt::Failed(err.into())
    }
}

impl From<StepFailure> for Halt {
    fn from(failure: StepFailure) -> Self {
        Halt::Failed(failure.into())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Service {
    pub fn new(collab: Collaborators, settings: FormatSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                collab,
                settings,
                current: Mutex::new(None),
                next_id: AtomicU64::new(1),
                cache: tokio::sync::Mutex::new(InventoryCache::new()),
            }),
        }
    }

    /// Reads a fresh inventory snapshot. On failure the previous snapshot is
    /// kept for [`Service::last_snapshot`].
    pub async fn refresh(&self) -> Result<Vec<BlockDevice>, InventoryError> {
        let mut cache = self.inner.cache.lock().await;
        cache
            .refresh(self.inner.collab.inventory.as_ref())
            .await
            .map(<[BlockDevice]>::to_vec)
    }

    /// The last good snapshot and the error of the latest refresh, if any.
    pub async fn last_snapshot(&self) -> (Vec<BlockDevice>, Option<String>) {
        let cache = self.inner.cache.lock().await;
        (
            cache.devices().to_vec(),
            cache.last_error().map(str::to_string),
        )
    }

    /// Classifies every attached device, rejected ones included.
    ///
    /// If the root device cannot be determined every device is rejected with
    /// [`RejectReason::GuardUnavailable`].
    pub async fn classify_all(
        &self,
        policy: &RiskPolicy,
    ) -> Result<Vec<ClassificationResult>, InventoryError> {
        let snapshot = self.refresh().await?;
        match self.inner.collab.guard.root_parent_device() {
            Ok(root) => Ok(classify(&snapshot, &root, policy)),
            Err(err) => {
                error!(error = %err, "root device check failed, rejecting every device");
                Ok(reject_all(&snapshot, RejectReason::GuardUnavailable))
            }
        }
    }

    /// The devices that may be offered to the operator, in inventory order.
    pub async fn list_candidates(
        &self,
        policy: &RiskPolicy,
    ) -> Result<Vec<ClassificationResult>, InventoryError> {
        Ok(selectable(self.classify_all(policy).await?))
    }

    /// State of the current job, or `Idle` if there is none.
    pub fn state(&self) -> JobState {
        lock(&self.inner.current)
            .as_ref()
            .map_or(JobState::Idle, |job| *job.state.borrow())
    }

    /// Starts a job for `device` and leaves it awaiting confirmation.
    ///
    /// The inventory and root device are read again here rather than trusted
    /// from an earlier listing. The layout is planned and the label sanitized
    /// before the job exists, so a job in `Confirming` is always runnable.
    /// A finished job that was never acknowledged is replaced.
    pub async fn request_format(
        &self,
        device: &Path,
        label: &str,
        policy: &RiskPolicy,
    ) -> Result<JobHandle, RequestError> {
        self.ensure_available()?;

        let snapshot = self.refresh().await?;
        let root = self.inner.collab.guard.root_parent_device()?;
        let result = classify(&snapshot, &root, policy)
            .into_iter()
            .find(|result| result.device.path == device)
            .ok_or_else(|| RequestError::NotFound(device.to_path_buf()))?;

        if let Some(reason) = result.reject_reason {
            return Err(RequestError::Rejected {
                path: device.to_path_buf(),
                reason,
            });
        }

        let plan = plan_layout(result.device.size_bytes, self.inner.settings.reserved_mib)?;
        let label = VolumeLabel::sanitize(label);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let intro = [
            format!("Target: {}", result.description()),
            format!("Label: {label}"),
            format!("Layout: {plan}"),
        ];

        let shared = Arc::new(JobShared::new(FormatJob {
            id,
            target: result.device,
            classification: result.safety_class,
            label,
            plan,
            state: JobState::Confirming,
            log_lines: Vec::new(),
            cancel_requested: false,
            failure: None,
            device_touched: false,
        }));

        {
            let mut current = lock(&self.inner.current);
            let state = current
                .as_ref()
                .map_or(JobState::Idle, |job| *job.state.borrow());
            if state.is_active() {
                return Err(RequestError::Busy(state));
            }
            *current = Some(Arc::clone(&shared));
        }

        info!(job = id, device = %device.display(), "format requested");
        for line in intro {
            shared.log(line);
        }

        Ok(JobHandle { shared })
    }

    /// Confirms the job and starts running it in the background.
    ///
    /// `Caution` devices need the device path typed back; a plain
    /// [`Acknowledgement::Confirmed`] is refused for them. Must be called from
    /// within a Tokio runtime.
    pub fn confirm(&self, handle: &JobHandle, ack: Acknowledgement) -> Result<(), RequestError> {
        self.ensure_current(handle)?;
        let shared = &handle.shared;

        {
            let mut job = lock(&shared.job);
            if job.state != JobState::Confirming {
                return Err(RequestError::WrongState(job.state));
            }

            let accepted = match (job.classification.confirmation(), &ack) {
                (Some(Confirmation::YesNo), Acknowledgement::Confirmed) => true,
                (Some(_), Acknowledgement::RetypedPath(typed)) => {
                    Path::new(typed.trim()) == job.target.path
                }
                _ => false,
            };
            if !accepted {
                return Err(RequestError::AcknowledgementMismatch(job.target.path.clone()));
            }

            shared.append(&mut job, "Confirmed by operator.".to_string());
            shared.enter(&mut job, JobState::Unmounting);
        }

        let inner = Arc::clone(&self.inner);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let outcome = run_job(&inner, &shared).await;
            shared.finish(outcome);
        });
        Ok(())
    }

    /// Requests cancellation. Returns `false` if the job had already finished.
    ///
    /// A job still awaiting confirmation is aborted at once. Otherwise the
    /// running process, if any, is asked to terminate and the job reaches
    /// `Aborted` once it has exited.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        let shared = &handle.shared;
        let mut job = lock(&shared.job);
        if job.state.is_terminal() {
            return false;
        }
        if !job.cancel_requested {
            job.cancel_requested = true;
            info!(job = shared.id, state = %job.state, "cancellation requested");
            shared.append(&mut job, "Cancellation requested.".to_string());
        }
        shared.wakeup.send_replace(true);

        if job.state == JobState::Confirming {
            shared.append(&mut job, "Cancelled before any change was made.".to_string());
            shared.enter(&mut job, JobState::Aborted);
        }
        true
    }

    /// Releases a finished job so the service is `Idle` again.
    pub fn acknowledge(&self, handle: &JobHandle) -> Result<(), RequestError> {
        let mut current = lock(&self.inner.current);
        match current.as_ref() {
            Some(shared) if Arc::ptr_eq(shared, &handle.shared) => {}
            _ => return Err(RequestError::UnknownJob(handle.id())),
        }
        let state = handle.state();
        if !state.is_terminal() {
            return Err(RequestError::WrongState(state));
        }
        *current = None;
        Ok(())
    }

    fn ensure_available(&self) -> Result<(), RequestError> {
        match self.state() {
            state if state.is_active() => Err(RequestError::Busy(state)),
            _ => Ok(()),
        }
    }

    fn ensure_current(&self, handle: &JobHandle) -> Result<(), RequestError> {
        match lock(&self.inner.current).as_ref() {
            Some(shared) if Arc::ptr_eq(shared, &handle.shared) => Ok(()),
            _ => Err(RequestError::UnknownJob(handle.id())),
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> JobState {
        *self.shared.state.borrow()
    }

    pub fn snapshot(&self) -> FormatJob {
        self.shared.snapshot()
    }

    /// Events from now on. Earlier log lines are in [`JobHandle::snapshot`].
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    /// Follows the state alone, always yielding the latest value.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.shared.state.subscribe()
    }

    /// Waits for a terminal state and returns the final job.
    pub async fn wait(&self) -> FormatJob {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| state.is_terminal()).await;
        self.snapshot()
    }
}

impl JobShared {
    fn new(job: FormatJob) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(job.state);
        let (wakeup, _) = watch::channel(false);
        Self {
            id: job.id,
            job: Mutex::new(job),
            events,
            state,
            wakeup,
        }
    }

    fn snapshot(&self) -> FormatJob {
        lock(&self.job).clone()
    }

    fn target(&self) -> (BlockDevice, LayoutPlan, VolumeLabel) {
        let job = lock(&self.job);
        (job.target.clone(), job.plan, job.label.clone())
    }

    fn log(&self, line: String) {
        let mut job = lock(&self.job);
        self.append(&mut job, line);
    }

    fn append(&self, job: &mut FormatJob, line: String) {
        job.log_lines.push(line.clone());
        let _ = self.events.send(JobEvent::Log(line));
    }

    fn enter(&self, job: &mut FormatJob, next: JobState) {
        info!(job = self.id, from = %job.state, to = %next, "state change");
        job.state = next;
        if next.is_destructive() {
            job.device_touched = true;
        }
        self.state.send_replace(next);
        let _ = self.events.send(JobEvent::State(next));
    }

    /// Moves to `next` unless cancellation has been requested.
    fn advance(&self, next: JobState) -> Result<(), Halt> {
        let mut job = lock(&self.job);
        if job.cancel_requested {
            return Err(Halt::Cancelled);
        }
        self.enter(&mut job, next);
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        lock(&self.job).cancel_requested
    }

    async fn cancellation(&self) {
        let mut wakeup = self.wakeup.subscribe();
        let _ = wakeup.wait_for(|cancelled| *cancelled).await;
    }

    fn finish(&self, outcome: Result<(), Halt>) {
        let mut job = lock(&self.job);
        match outcome {
            Ok(()) => {
                let plan = job.plan;
                let p1 = job.target.partition_node(1);
                let p2 = job.target.partition_node(2);
                let label = job.label.clone();
                self.append(&mut job, "Final layout:".to_string());
                self.append(
                    &mut job,
                    format!(
                        "  {}: FAT32 \"{label}\" {}MiB-{}MiB",
                        p1.display(),
                        plan.partition1_start_mib,
                        plan.partition1_end_mib
                    ),
                );
                self.append(
                    &mut job,
                    format!(
                        "  {}: reserved (raw) {}MiB-{}",
                        p2.display(),
                        plan.partition2_start_mib,
                        LayoutPlan::PARTITION2_END
                    ),
                );
                self.enter(&mut job, JobState::Succeeded);
            }
            Err(Halt::Cancelled) => {
                if job.device_touched {
                    warn!(job = self.id, "aborted after the device was modified");
                }
                self.append(&mut job, "Aborted by operator.".to_string());
                self.warn_if_touched(&mut job);
                self.enter(&mut job, JobState::Aborted);
            }
            Err(Halt::Failed(failure)) => {
                error!(job = self.id, state = %job.state, error = %failure, "job failed");
                self.append(&mut job, format!("Failed: {failure}"));
                self.warn_if_touched(&mut job);
                job.failure = Some(Arc::new(failure));
                self.enter(&mut job, JobState::Failed);
            }
        }
    }

    fn warn_if_touched(&self, job: &mut FormatJob) {
        if job.device_touched {
            let line = format!(
                "WARNING: {} was partially modified and is left as is; it may be in an inconsistent state.",
                job.target.path.display()
            );
            self.append(job, line);
        }
    }
}

async fn run_job(inner: &Inner, shared: &JobShared) -> Result<(), Halt> {
    let (target, plan, label) = shared.target();
    let disk = target.path.clone();
    let settings = &inner.settings;

    let unmounted = tokio::select! {
        result = unmount_all(
            inner.collab.mounts.as_ref(),
            &disk,
            settings.unmount_attempts,
            settings.unmount_delay,
            |partition| shared.log(format!("Unmounting {}", partition.path.display())),
        ) => result,
        () = shared.cancellation() => return Err(Halt::Cancelled),
    };
    // A cancel outranks an unmount failure; nothing has been written yet.
    if shared.is_cancelled() {
        return Err(Halt::Cancelled);
    }
    unmounted?;
    preflight(inner, &target).await?;
    shared.log(format!("Pre-flight check passed for {}.", disk.display()));

    shared.advance(JobState::Wiping)?;
    run_step(inner, shared, JobState::Wiping, steps::wipe_signatures(&disk)).await?;

    shared.advance(JobState::PartitioningTable)?;
    run_step(
        inner,
        shared,
        JobState::PartitioningTable,
        steps::make_partition_table(&disk),
    )
    .await?;

    shared.advance(JobState::CreatingPartitions)?;
    for command in steps::make_partitions(&disk, &plan) {
        if shared.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        run_step(inner, shared, JobState::CreatingPartitions, command).await?;
    }

    shared.advance(JobState::WaitingForDeviceNodes)?;
    run_best_effort(inner, shared, steps::reread_partitions(&disk)).await?;
    run_best_effort(inner, shared, steps::settle()).await?;

    let wanted = [target.partition_node(1), target.partition_node(2)];
    let missing = tokio::select! {
        missing = wait_for_nodes(
            inner.collab.nodes.as_ref(),
            &wanted,
            settings.node_poll_attempts,
            settings.node_poll_interval,
        ) => missing,
        () = shared.cancellation() => return Err(Halt::Cancelled),
    };
    if !missing.is_empty() {
        return Err(JobFailure::NodesNotDetected(missing).into());
    }

    shared.advance(JobState::FormattingFilesystem)?;
    run_step(
        inner,
        shared,
        JobState::FormattingFilesystem,
        steps::make_filesystem(&wanted[0], &label),
    )
    .await?;
    run_best_effort(inner, shared, steps::sync()).await?;

    if shared.is_cancelled() {
        return Err(Halt::Cancelled);
    }
    Ok(())
}

/// Re-reads the target and the root device right before the first write.
async fn preflight(inner: &Inner, expected: &BlockDevice) -> Result<(), Halt> {
    let path = &expected.path;

    if is_root_parent(inner.collab.guard.as_ref(), path)? {
        return Err(JobFailure::RootDevice(path.clone()).into());
    }

    let current = inner
        .collab
        .inventory
        .device(path)
        .await
        .map_err(|err| JobFailure::Preflight(format!("inventory unreadable: {err}")))?
        .ok_or_else(|| JobFailure::Preflight(format!("{} has disappeared", path.display())))?;

    let problem = if current.kind != DeviceKind::Disk {
        Some(format!("{} is not a whole disk ({})", path.display(), current.kind))
    } else if current.read_only {
        Some(format!("{} is read-only", path.display()))
    } else if current.size_bytes != expected.size_bytes {
        Some(format!(
            "{} changed size from {} to {} bytes",
            path.display(),
            expected.size_bytes,
            current.size_bytes
        ))
    } else {
        protected_mountpoint(&current)
            .map(|mp| format!("{} is mounted at {}", path.display(), mp.display()))
    };

    match problem {
        Some(problem) => Err(JobFailure::Preflight(problem).into()),
        None => Ok(()),
    }
}

/// Runs a step whose failure is logged but does not fail the job.
async fn run_best_effort(
    inner: &Inner,
    shared: &JobShared,
    command: StepCommand,
) -> Result<(), Halt> {
    let state = *shared.state.borrow();
    match run_step(inner, shared, state, command).await {
        Err(Halt::Failed(failure)) => {
            warn!(job = shared.id, error = %failure, "best-effort step failed");
            shared.log(format!("warning: {failure}"));
            Ok(())
        }
        other => other,
    }
}

/// Runs one external process to completion, streaming its output into the log.
async fn run_step(
    inner: &Inner,
    shared: &JobShared,
    step: JobState,
    command: StepCommand,
) -> Result<(), Halt> {
    let rendered = command.to_string();
    info!(job = shared.id, %step, command = %rendered, "running");
    shared.log(format!("$ {rendered}"));

    let SpawnedStep {
        mut lines,
        mut exit,
        mut terminator,
    } = inner
        .collab
        .runner
        .spawn(&command)
        .map_err(|source| JobFailure::Spawn {
            command: rendered.clone(),
            source,
        })?;

    let mut output = Vec::new();
    let mut lines_open = true;
    let mut terminating = false;

    let exited = loop {
        tokio::select! {
            line = lines.recv(), if lines_open => match line {
                Some(line) => {
                    shared.log(line.text.clone());
                    output.push(line.text);
                }
                None => lines_open = false,
            },
            () = shared.cancellation(), if !terminating => {
                terminating = true;
                info!(job = shared.id, command = %rendered, "terminating");
                shared.log(format!("Terminating `{rendered}`..."));
                terminator.terminate();
            }
            exited = &mut exit => break exited,
        }
    };

    if lines_open {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_GRACE, async {
            while let Some(line) = lines.recv().await {
                shared.log(line.text.clone());
                output.push(line.text);
            }
        })
        .await;
    }

    if terminating || shared.is_cancelled() {
        return Err(Halt::Cancelled);
    }

    let status = match exited {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            return Err(JobFailure::Supervision {
                command: rendered,
                reason: err.to_string(),
            }
            .into());
        }
        Err(_) => {
            return Err(JobFailure::Supervision {
                command: rendered,
                reason: "exit status was never reported".to_string(),
            }
            .into());
        }
    };

    if !status.success() {
        return Err(StepFailure {
            step,
            command: rendered,
            status: status.to_string(),
            output,
        }
        .into());
    }
    Ok(())
}
