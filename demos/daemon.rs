use clap::Parser;
use daemon_context::{DaemonContext, Group, Mode, ProcessLockFile, User};
use std::{
    fs::OpenOptions,
    path::PathBuf,
    process::ExitCode,
    thread,
    time::Duration,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs a server that writes a heartbeat to its log file until it receives
/// SIGTERM
///
/// Standard output and standard error are both bound to the log file. The
/// lock file, if any, holds the daemon's process ID and is removed when the
/// daemon terminates.
#[derive(Debug, Parser)]
#[command(max_term_width = 80)]
struct Cli {
    /// Stay attached to the terminal
    #[arg(short, long)]
    foreground: bool,

    /// Daemon process owner
    #[arg(short, long, value_name = "USER")]
    user: Option<User>,

    /// Daemon process group
    #[arg(short, long, value_name = "GROUP")]
    group: Option<Group>,

    /// Daemon working directory
    #[arg(short = 'w', long, value_name = "DIRECTORY", default_value = "/")]
    workdir: PathBuf,

    /// Directory to use as the root directory
    #[arg(long, value_name = "DIRECTORY")]
    chroot: Option<PathBuf>,

    /// File mode creation mask, in octal
    #[arg(long, value_name = "MASK", value_parser = parse_umask)]
    umask: Option<Mode>,

    /// Path to the pidfile
    #[arg(short, long, value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// File receiving standard output and standard error
    #[arg(short, long, value_name = "FILE", default_value = "daemon.log")]
    log: PathBuf,

    /// Seconds between heartbeats
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    interval: u64,
}

fn parse_umask(value: &str) -> Result<Mode, String> {
    u32::from_str_radix(value, 8)
        .map_err(|err| format!("invalid umask '{value}': {err}"))
        .map(|bits| Mode::from_bits_truncate(bits as _))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut context = match build(&cli) {
        Ok(context) => context,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = context.open() {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    info!(pid = std::process::id(), "daemon started");

    let interval = Duration::from_secs(cli.interval);
    let mut beats: u64 = 0;

    loop {
        beats += 1;
        println!("heartbeat {beats}");
        thread::sleep(interval);
    }
}

fn build(cli: &Cli) -> Result<DaemonContext, String> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cli.log)
        .map_err(|err| {
            format!("failed to open log file '{}': {err}", cli.log.display())
        })?;

    let log_err = log.try_clone().map_err(|err| {
        format!("failed to duplicate log file handle: {err}")
    })?;

    let mut builder = DaemonContext::builder()
        .working_directory(&cli.workdir)
        .stdout(log)
        .stderr(log_err);

    if cli.foreground {
        builder = builder.detach_process(false);
    }

    if let Some(chroot) = &cli.chroot {
        builder = builder.chroot_directory(chroot);
    }

    if let Some(user) = cli.user.clone() {
        builder = builder.user(user);
    }

    if let Some(group) = cli.group.clone() {
        builder = builder.group(group);
    }

    if let Some(umask) = cli.umask {
        builder = builder.umask(umask);
    }

    if let Some(pidfile) = &cli.pidfile {
        builder = builder.pidfile(ProcessLockFile::new(pidfile));
    }

    Ok(builder.build())
}
