use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use sdprep_core::device::human_size;
use sdprep_core::label::DEFAULT_LABEL;
use sdprep_core::layout::DEFAULT_RESERVED_MIB;
use sdprep_core::{
    Acknowledgement, ClassificationResult, Confirmation, Elevation, FormatJob, FormatSettings,
    InventorySource, JobEvent, JobHandle, JobState, RiskPolicy, SafetyClass, Service, plan_layout,
    platform,
};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "sdprep")]
#[command(about = "A careful, interactive SD card and USB stick preparation tool", version)]
struct Cli {
    /// Show diagnostics on stderr (-v for info, -vv for debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Erase a device and lay out a FAT32 partition plus a reserved partition
    Format {
        /// Device to prepare, e.g. /dev/mmcblk0 (chosen interactively if omitted)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// FAT volume label; uppercased, cut to 11 characters, defaulted when empty
        #[arg(short, long, default_value = DEFAULT_LABEL)]
        label: String,

        /// How root privileges are obtained for the destructive steps
        #[arg(long, value_enum, env = "SDPREP_ELEVATE", default_value_t = ElevateArg::Auto)]
        elevate: ElevateArg,

        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// List devices that may be prepared
    List {
        /// Also show rejected devices and why they were rejected
        #[arg(short, long)]
        all: bool,

        #[command(flatten)]
        policy: PolicyArgs,
    },
    /// Show the partition layout for a device or a size in bytes, without touching anything
    Plan {
        /// A device path such as /dev/sdb, or a capacity in bytes
        target: String,

        /// Size of the reserved trailing partition
        #[arg(long, default_value_t = DEFAULT_RESERVED_MIB)]
        reserved_mib: u64,
    },
}

#[derive(Args)]
struct PolicyArgs {
    /// Also offer devices of 1 TiB and larger
    #[arg(long)]
    no_restrict: bool,

    /// Only offer SD cards and SD card readers
    #[arg(long)]
    sd_only: bool,

    /// Score at which a device no longer needs its path typed to confirm
    #[arg(long, default_value_t = RiskPolicy::default().safe_threshold)]
    safe_threshold: i32,
}

impl PolicyArgs {
    fn policy(&self) -> RiskPolicy {
        RiskPolicy {
            safe_threshold: self.safe_threshold,
            restrict_mode: !self.no_restrict,
            sd_only: self.sd_only,
            ..RiskPolicy::default()
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ElevateArg {
    /// pkexec, unless already running as root
    Auto,
    Pkexec,
    Sudo,
    /// Run the tools directly
    None,
}

impl From<ElevateArg> for Elevation {
    fn from(arg: ElevateArg) -> Self {
        match arg {
            ElevateArg::Auto => Elevation::Auto,
            ElevateArg::Pkexec => Elevation::Pkexec,
            ElevateArg::Sudo => Elevation::Sudo,
            ElevateArg::None => Elevation::None,
        }
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// With it off, cancelling a job only shows our own message.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Ctrl+C routing. While a job is being followed an interrupt requests
/// cancellation; before that it is remembered and the job is never started.
#[derive(Default)]
struct Interrupt {
    raised: AtomicBool,
    following: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
        if self.following.load(Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Sends diagnostics to stderr so they never mix with the job log on stdout.
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_service(elevation: Elevation) -> Result<Service> {
    let collaborators = platform::collaborators(elevation)
        .context("Cannot run the disk tools with elevated privileges")?;
    Ok(Service::new(collaborators, FormatSettings::default()))
}

/// Presents an interactive menu of candidates, with an entry to re-read the list.
///
/// A failed refresh keeps showing the previous list.
async fn select_device(service: &Service, policy: &RiskPolicy) -> Result<ClassificationResult> {
    let mut candidates = service
        .list_candidates(policy)
        .await
        .context("Could not read the device list")?;

    loop {
        if candidates.is_empty() {
            println!("No suitable devices found. Insert a card and choose refresh.");
        }

        let mut items: Vec<String> = candidates.iter().map(|c| c.to_string()).collect();
        items.push(style("[refresh device list]").italic().to_string());

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select the device to ERASE")
            .items(&items)
            .default(0)
            .interact()?;

        if selection < candidates.len() {
            return Ok(candidates.swap_remove(selection));
        }

        match service.list_candidates(policy).await {
            Ok(fresh) => candidates = fresh,
            Err(err) => {
                warn!(error = %err, "device list refresh failed");
                println!(
                "{} {err}. Showing the previous list.",
                    style("Refresh failed:").red().bold()
                );
            }
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Asks the user to type the device path back. Returns what was typed if it matches.
fn retype_path(path: &Path) -> Result<Option<String>> {
    let typed: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Type {} to confirm", path.display()))
        .allow_empty(true)
        .interact_text()?;

    Ok((Path::new(typed.trim()) == path).then_some(typed))
}

fn print_plan(job: &FormatJob) {
    let plan = &job.plan;
    println!(
        "  {}  FAT32 \"{}\"  {}MiB - {}MiB",
        style(job.target.partition_node(1).display()).cyan(),
        job.label,
        plan.partition1_start_mib,
        plan.partition1_end_mib
    );
    println!(
        "  {}  reserved, left raw  {}MiB - end",
        style(job.target.partition_node(2).display()).cyan(),
        plan.partition2_start_mib
    );
}

/// Streams the job log and state under a spinner until the job finishes.
///
/// The first Ctrl+C requests cancellation; the job then stops once the running
/// step has exited.
async fn follow(
    service: &Service,
    job: &JobHandle,
    mut events: broadcast::Receiver<JobEvent>,
    interrupt: &Interrupt,
) -> Result<FormatJob> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.blue} [{elapsed_precise}] {msg}")?
            .tick_strings(&["■  ", " ■ ", "  ■", " ■ ", "■■■"]),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(job.state().activity());

    interrupt.following.store(true, Ordering::SeqCst);
    let mut cancelling = interrupt.is_raised();
    if cancelling {
        service.cancel(job);
        pb.set_message("cancelling, waiting for the current step to stop...");
    }
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(JobEvent::Log(line)) => pb.println(format!("  {}", style(line).dim())),
                Ok(JobEvent::State(state)) if state.is_terminal() => break,
                Ok(JobEvent::State(state)) if !cancelling => pb.set_message(state.activity()),
                Ok(JobEvent::State(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    pb.println(format!("  ({skipped} log lines skipped)"))
                }
                Err(RecvError::Closed) => break,
            },
            () = interrupt.notify.notified(), if !cancelling => {
                cancelling = true;
                service.cancel(job);
                pb.set_message("cancelling, waiting for the current step to stop...");
            }
        }
    }

    pb.finish_and_clear();
    let finished = job.wait().await;
    interrupt.following.store(false, Ordering::SeqCst);
    Ok(finished)
}

async fn run_format(
    device: Option<PathBuf>,
    label: &str,
    elevation: Elevation,
    policy: &RiskPolicy,
    interrupt: &Interrupt,
) -> Result<()> {
    let service = build_service(elevation)?;

    let device = match device {
        Some(device) => device,
        None => select_device(&service, policy).await?.device.path,
    };

    let job = service
        .request_format(&device, label, policy)
        .await
        .with_context(|| format!("Cannot prepare {}", device.display()))?;
    let pending = job.snapshot();
    info!(
        job = job.id(),
        device = %pending.target.path.display(),
        class = %pending.classification,
        "format requested"
    );

    println!();
    println!(
        "{} This will erase ALL data on '{}' ({}).",
        style("WARNING:").red().bold(),
        pending.target.path.display(),
        pending.target.human_size(),
    );
    println!("  Device: {}", style(&pending.target).cyan());
    println!("  Layout:");
    print_plan(&pending);
    println!();

    let ack = match pending.classification.confirmation() {
        Some(Confirmation::YesNo) => {
            confirm_operation("Are you sure you want to proceed?")?.then_some(Acknowledgement::Confirmed)
        }
        Some(Confirmation::RetypePath) => {
            println!(
                "{} This device does not look like typical SD or USB flash media.",
                style("CAUTION:").yellow().bold()
            );
            retype_path(&pending.target.path)?.map(Acknowledgement::RetypedPath)
        }
        None => None,
    };

    if interrupt.is_raised() {
        service.cancel(&job);
        service.acknowledge(&job)?;
        bail!("Interrupted. Nothing was changed.");
    }
    let Some(ack) = ack else {
        service.cancel(&job);
        service.acknowledge(&job)?;
        println!("Format cancelled. Nothing was changed.");
        return Ok(());
    };

    let events = job.subscribe();
    service.confirm(&job, ack)?;
    println!();

    let finished = follow(&service, &job, events, interrupt).await?;
    service.acknowledge(&job)?;
    info!(job = finished.id, state = %finished.state, "job finished");

    match finished.state {
        JobState::Succeeded => {
            println!("\n✨ {}", finished.status_line());
            print_plan(&finished);
            Ok(())
        }
        JobState::Aborted => {
            println!("\n{}", style(finished.status_line()).yellow());
            Ok(())
        }
        _ => {
            if let Some(sdprep_core::JobFailure::Step(step)) = finished.failure.as_deref() {
                eprintln!("\nOutput of `{}`:", step.command);
                for line in &step.output {
                    eprintln!("  {line}");
                }
            }
            Err(anyhow!("{}", finished.status_line()))
        }
    }
}

async fn run_list(all: bool, policy: &RiskPolicy) -> Result<()> {
    // Listing never runs a destructive step, so no elevation helper is needed.
    let service = build_service(Elevation::None)?;
    let results = if all {
        service.classify_all(policy).await?
    } else {
        service.list_candidates(policy).await?
    };

    if results.is_empty() {
        println!("No suitable devices found.");
        return Ok(());
    }

    println!("Found {} devices:", results.len());
    println!(
        "\n  {:<16} {:<24} {:>8}  {:<8} {}",
        "DEVICE", "MODEL", "SIZE", "CLASS", "NOTES"
    );
    println!("  {:-<16} {:-<24} {:->8}  {:-<8} {:-<20}", "", "", "", "", "");
    for result in results {
        let device = &result.device;
        let class = match result.safety_class {
            SafetyClass::Safe => style(format!("{:<8}", result.safety_class)).green(),
            SafetyClass::Caution => style(format!("{:<8}", result.safety_class)).yellow(),
            SafetyClass::Rejected => style(format!("{:<8}", result.safety_class)).red(),
        };
        let notes = match (&result.reject_reason, device.is_mounted()) {
            (Some(reason), _) => reason.to_string(),
            (None, true) => "mounted; will be unmounted".to_string(),
            (None, false) => String::new(),
        };
        let model = if device.model.is_empty() {
            "Removable"
        } else {
            device.model.as_str()
        };
        println!(
            "  {:<16} {:<24} {:>8}  {} {}",
            device.path.display(),
            model,
            device.human_size(),
            class,
            notes
        );
    }
    Ok(())
}

async fn run_plan(target: &str, reserved_mib: u64) -> Result<()> {
    let size_bytes = match target.parse::<u64>() {
        Ok(bytes) => bytes,
        Err(_) => {
            let path = PathBuf::from(target);
            platform::Lsblk
                .device(&path)
                .await?
                .ok_or_else(|| anyhow!("{} is not an attached block device", path.display()))?
                .size_bytes
        }
    };

    debug!(input = target, size_bytes, reserved_mib, "planning layout");
    let plan = plan_layout(size_bytes, reserved_mib)?;
    println!("Layout for {target} ({}):", human_size(size_bytes));
    println!(
        "  partition 1  FAT32             {:>7}MiB - {}MiB  ({} MiB)",
        plan.partition1_start_mib,
        plan.partition1_end_mib,
        plan.partition1_span_mib()
    );
    println!(
        "  partition 2  reserved, raw     {:>7}MiB - end",
        plan.partition2_start_mib
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Ctrl+C only flags the interrupt; the job decides when it is safe to
    // stop, and returning from main restores the terminal.
    let interrupt = Arc::new(Interrupt::default());
    let handler = interrupt.clone();
    ctrlc::set_handler(move || handler.raise())?;

    match cli.command {
        Commands::Format {
            device,
            label,
            elevate,
            policy,
        } => run_format(device, &label, elevate.into(), &policy.policy(), &interrupt).await,
        Commands::List { all, policy } => run_list(all, &policy.policy()).await,
        Commands::Plan {
            target,
            reserved_mib,
        } => run_plan(&target, reserved_mib).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_before_a_job_is_only_remembered() {
        let interrupt = Interrupt::default();
        interrupt.raise();
        assert!(interrupt.is_raised());

        let woken = tokio::time::timeout(Duration::from_millis(20), interrupt.notify.notified()).await;
        assert!(woken.is_err());
    }

    #[tokio::test]
    async fn interrupt_while_following_wakes_the_follower() {
        let interrupt = Interrupt::default();
        interrupt.following.store(true, Ordering::SeqCst);
        interrupt.raise();

        tokio::time::timeout(Duration::from_secs(1), interrupt.notify.notified())
            .await
            .unwrap();
    }

    #[test]
    fn policy_flags_map_onto_the_risk_policy() {
        let cli = Cli::parse_from(["sdprep", "list", "--no-restrict", "--sd-only"]);
        let Commands::List { policy, .. } = cli.command else {
            panic!("expected the list command");
        };
        let policy = policy.policy();
        assert!(!policy.restrict_mode);
        assert!(policy.sd_only);
        assert_eq!(policy.safe_threshold, RiskPolicy::default().safe_threshold);
    }
}
