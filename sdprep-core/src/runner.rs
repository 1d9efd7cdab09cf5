//! Runs external operations with elevated privilege and streams their output.
//!
//! A spawned operation is observed through three independent handles: a line
//! channel fed from stdout and stderr, a one-shot exit notification, and a
//! [`Terminator`] that asks the supervising task to signal the process. Exit is
//! only reported after the process has actually been reaped.
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::steps::StepCommand;

const LINE_BUFFER: usize = 256;

/// Which stream a line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How a process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl StepStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for StepStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Requests termination of a running operation. Only the first call has effect.
#[derive(Debug)]
pub struct Terminator(Option<oneshot::Sender<()>>);

impl Terminator {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Some(tx))
    }

    /// Returns `false` if termination was already requested or the process is gone.
    pub fn terminate(&mut self) -> bool {
        self.0.take().is_some_and(|tx| tx.send(()).is_ok())
    }
}

/// A running external operation.
#[derive(Debug)]
pub struct SpawnedStep {
    /// Output lines in arrival order; closes once both streams reach EOF.
    pub lines: mpsc::Receiver<OutputLine>,
    /// Resolves once the process has exited and been reaped.
    pub exit: oneshot::Receiver<io::Result<StepStatus>>,
    pub terminator: Terminator,
}

/// The single "run elevated" seam every destructive step goes through.
pub trait StepRunner: Send + Sync {
    /// Starts `command`. Must be called from within a Tokio runtime.
    fn spawn(&self, command: &StepCommand) -> io::Result<SpawnedStep>;
}

/// How privileges are obtained for external operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Elevation {
    /// Run directly when already root, otherwise through `pkexec`.
    Auto,
    Pkexec,
    Sudo,
    None,
}

impl Elevation {
    /// Resolves [`Elevation::Auto`] against the current effective user.
    pub fn resolve(self) -> Elevation {
        match self {
            #[cfg(unix)]
            Elevation::Auto if nix::unistd::geteuid().is_root() => Elevation::None,
            Elevation::Auto => Elevation::Pkexec,
            other => other,
        }
    }
}

const PKEXEC_CANDIDATES: [&str; 2] = ["/usr/bin/pkexec", "/bin/pkexec"];

/// Runs commands as child processes, optionally behind `pkexec` or `sudo`.
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    prefix: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(elevation: Elevation) -> io::Result<Self> {
        let prefix = match elevation.resolve() {
            Elevation::None => None,
            Elevation::Sudo => Some(PathBuf::from("sudo")),
            Elevation::Pkexec | Elevation::Auto => Some(find_pkexec().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "pkexec not found at /usr/bin/pkexec or /bin/pkexec; install policykit-1 or run as root",
                )
            })?),
        };
        Ok(Self { prefix })
    }

    fn command(&self, step: &StepCommand) -> Command {
        let mut cmd = match &self.prefix {
            Some(prefix) => {
                let mut cmd = Command::new(prefix);
                cmd.arg(&step.program);
                cmd
            }
            None => Command::new(&step.program),
        };
        cmd.args(&step.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl StepRunner for ProcessRunner {
    fn spawn(&self, command: &StepCommand) -> io::Result<SpawnedStep> {
        let mut child = self.command(command).spawn()?;
        debug!(pid = child.id(), %command, "spawned");

        let (line_tx, lines) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (term_tx, term_rx) = oneshot::channel();
        let (exit_tx, exit) = oneshot::channel();
        tokio::spawn(supervise(child, term_rx, exit_tx));

        Ok(SpawnedStep {
            lines,
            exit,
            terminator: Terminator::new(term_tx),
        })
    }
}

fn find_pkexec() -> Option<PathBuf> {
    PKEXEC_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "output stream closed with error");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    terminate: oneshot::Receiver<()>,
    exit: oneshot::Sender<io::Result<StepStatus>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = terminate => {
            send_sigterm(&mut child);
            child.wait().await
        }
    };
    let _ = exit.send(status.map(StepStatus::from));
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, error = %err, "SIGTERM failed, killing");
        if let Err(err) = child.start_kill() {
            warn!(pid, error = %err, "could not kill child");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(error = %err, "could not kill child");
    }
}
