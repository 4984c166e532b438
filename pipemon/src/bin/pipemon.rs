// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command-line front end: parses the options, prepares the engine state,
//! and dispatches to the transfer loop, one of the watch loops, or the
//! remote-control sender.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use anyhow::Context;
use clap::{ArgAction, Parser};
use pipemon::remote::RemoteMessage;
use pipemon::state::State;
use pipemon::{files, mainloop, remote, signals, watch};
use pmcommon::{term, units};
use std::io::Write;
use std::path::PathBuf;

fn parse_size_arg(value: &str) -> Result<u64, String> {
    if !units::validate(value, units::NumberKind::Integer) {
        return Err(format!("numeric argument expected, got {value:?}"));
    }
    Ok(units::parse_size(value))
}

fn parse_interval_arg(value: &str) -> Result<f64, String> {
    if !units::validate(value, units::NumberKind::Double) {
        return Err(format!("numeric argument expected, got {value:?}"));
    }
    Ok(units::parse_interval(value))
}

fn parse_watch_arg(value: &str) -> Result<(i32, i32), String> {
    let (pid_part, fd_part) = match value.split_once(':') {
        Some((pid, fd)) => (pid, Some(fd)),
        None => (value, None),
    };
    let pid: i32 = pid_part
        .parse()
        .map_err(|_| format!("process ID expected, got {pid_part:?}"))?;
    let fd: i32 = match fd_part {
        Some(fd) => fd
            .parse()
            .map_err(|_| format!("file descriptor expected, got {fd:?}"))?,
        None => -1,
    };
    if pid < 1 {
        return Err(format!("process ID expected, got {pid_part:?}"));
    }
    Ok((pid, fd))
}

/// Monitor the progress of data moving through a pipeline.
#[derive(Debug, Parser)]
#[command(name = "pipemon", version, about, max_term_width = 100)]
struct Args {
    /// Show the progress bar
    #[arg(short = 'p', long)]
    progress: bool,
    /// Show the elapsed time
    #[arg(short = 't', long)]
    timer: bool,
    /// Show the estimated time remaining
    #[arg(short = 'e', long)]
    eta: bool,
    /// Show the estimated completion time of day
    #[arg(short = 'I', long)]
    fineta: bool,
    /// Show the current transfer rate
    #[arg(short = 'r', long)]
    rate: bool,
    /// Show the smoothed average transfer rate
    #[arg(short = 'a', long)]
    average_rate: bool,
    /// Show the amount transferred
    #[arg(short = 'b', long)]
    bytes: bool,
    /// Count quantities in bits instead of bytes
    #[arg(short = '8', long)]
    bits: bool,
    /// Show the transfer buffer utilisation
    #[arg(short = 'T', long)]
    buffer_percent: bool,
    /// Show the last NUM bytes written
    #[arg(short = 'A', long, value_name = "NUM")]
    last_written: Option<usize>,
    /// Use this format string instead of the component flags
    #[arg(short = 'F', long, value_name = "FORMAT")]
    format: Option<String>,
    /// Output plain numbers, one per update
    #[arg(short = 'n', long)]
    numeric: bool,
    /// Transfer data without any display at all
    #[arg(short = 'q', long)]
    quiet: bool,
    /// Display nothing until the first byte has been transferred
    #[arg(short = 'W', long)]
    wait: bool,
    /// Wait SEC seconds before showing any display
    #[arg(short = 'D', long, value_name = "SEC", value_parser = parse_interval_arg)]
    delay_start: Option<f64>,
    /// Assume a total data size of SIZE
    #[arg(short = 's', long, value_name = "SIZE", value_parser = parse_size_arg)]
    size: Option<u64>,
    /// Count lines instead of bytes
    #[arg(short = 'l', long)]
    line_mode: bool,
    /// Lines are terminated by NUL, not newline
    #[arg(short = '0', long = "null")]
    null: bool,
    /// Seconds between display updates
    #[arg(short = 'i', long, value_name = "SEC", value_parser = parse_interval_arg)]
    interval: Option<f64>,
    /// Assume a terminal WIDTH columns wide
    #[arg(short = 'w', long, value_name = "WIDTH")]
    width: Option<u32>,
    /// Assume a terminal HEIGHT rows tall
    #[arg(short = 'H', long, value_name = "HEIGHT")]
    height: Option<u32>,
    /// Prefix the display with this name
    #[arg(short = 'N', long, value_name = "NAME")]
    name: Option<String>,
    /// Display even when standard error is not a terminal
    #[arg(short = 'f', long)]
    force: bool,
    /// Use cursor positioning so concurrent instances share the terminal
    #[arg(short = 'c', long)]
    cursor: bool,
    /// Limit the transfer to RATE bytes (or lines) per second
    #[arg(short = 'L', long, value_name = "RATE", value_parser = parse_size_arg)]
    rate_limit: Option<u64>,
    /// Use a transfer buffer of BYTES bytes
    #[arg(short = 'B', long, value_name = "BYTES", value_parser = parse_size_arg)]
    buffer_size: Option<u64>,
    /// Never use the in-kernel zero-copy path
    #[arg(short = 'C', long)]
    no_splice: bool,
    /// Skip read errors; give twice to skip quietly
    #[arg(short = 'E', long, action = ArgAction::Count)]
    skip_errors: u8,
    /// Skip past read errors in blocks of BYTES
    #[arg(short = 'Z', long, value_name = "BYTES", value_parser = parse_size_arg)]
    error_skip_block: Option<u64>,
    /// Stop transferring after exactly the assumed size
    #[arg(short = 'S', long)]
    stop_at_size: bool,
    /// Sync the output after every write
    #[arg(short = 'Y', long)]
    sync: bool,
    /// Use direct I/O on the input and output
    #[arg(short = 'K', long)]
    direct_io: bool,
    /// Read the input but write nothing to standard output
    #[arg(short = 'X', long)]
    discard: bool,
    /// Watch the file descriptors of process PID (all, or just FD)
    #[arg(short = 'd', long = "watchfd", value_name = "PID[:FD]", value_parser = parse_watch_arg)]
    watchfd: Option<(i32, i32)>,
    /// Reconfigure the running instance with process ID PID, then exit
    #[arg(short = 'R', long, value_name = "PID")]
    remote: Option<i32>,
    /// Write our process ID to FILE
    #[arg(short = 'P', long, value_name = "FILE")]
    pidfile: Option<PathBuf>,
    /// Window over which the average rate is smoothed, in seconds
    #[arg(short = 'm', long, value_name = "SEC", default_value_t = 30)]
    average_rate_window: u32,
    /// Input files; `-` means standard input
    #[arg(value_name = "FILE")]
    files: Vec<String>,
}

impl Args {
    /// Whether any display-component option was given; without one the
    /// classic default set applies.
    fn any_display_option(&self) -> bool {
        self.progress
            || self.timer
            || self.eta
            || self.fineta
            || self.rate
            || self.average_rate
            || self.bytes
            || self.bits
            || self.buffer_percent
            || self.last_written.is_some()
            || self.numeric
            || self.quiet
    }
}

fn write_pidfile(path: &PathBuf) -> anyhow::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut staged = tempfile::Builder::new()
        .prefix(".pipemon-pid.")
        .tempfile_in(dir.unwrap_or_else(|| std::path::Path::new(".")))
        .context("failed to create PID file")?;
    writeln!(staged, "{}", std::process::id()).context("failed to write PID file")?;
    staged
        .persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    let _ = std::fs::set_permissions(path, {
        use std::os::unix::fs::PermissionsExt;
        std::fs::Permissions::from_mode(0o644)
    });
    Ok(())
}

fn run() -> u32 {
    let mut args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("PIPEMON_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let mut state = State::new("pipemon");

    // Apply the classic default component set when nothing was requested.
    if !args.any_display_option() && args.format.is_none() {
        args.progress = true;
        args.timer = true;
        args.eta = true;
        args.rate = true;
        args.bytes = true;
    }
    // Bits are a presentation of the byte count.
    if args.bits {
        args.bytes = true;
    }
    // Both of these need the data to pass through the buffer.
    if args.buffer_percent || args.last_written.is_some() {
        args.no_splice = true;
    }
    // A skip block size implies skipping.
    if args.error_skip_block.is_some() && args.skip_errors == 0 {
        args.skip_errors = 1;
    }

    // Remote mode: send the message and exit.
    if let Some(target) = args.remote {
        signals::init(false);
        let message = RemoteMessage {
            progress: args.progress,
            timer: args.timer,
            eta: args.eta,
            fineta: args.fineta,
            rate: args.rate,
            average_rate: args.average_rate,
            bytes: args.bytes,
            bufpercent: args.buffer_percent,
            lastwritten: args.last_written.unwrap_or(0) as u64,
            rate_limit: args.rate_limit.unwrap_or(0),
            buffer_size: args.buffer_size.unwrap_or(0),
            size: args.size.unwrap_or(0),
            interval: args.interval.unwrap_or(0.0),
            width: args.width.unwrap_or(0),
            height: args.height.unwrap_or(0),
            width_set_manually: args.width.is_some(),
            height_set_manually: args.height.is_some(),
            name: args.name.clone().unwrap_or_default(),
            format: args.format.clone().unwrap_or_default(),
        };
        let result = remote::remote_set(&state, &message, target);
        signals::fini(false, 1);
        return match result {
            Ok(()) => 0,
            Err(e) => {
                state.report_error(format_args!("{e}"));
                1
            }
        };
    }

    let (watch_pid, watch_fd) = args.watchfd.unwrap_or((0, -1));
    if watch_pid != 0 {
        if !args.files.is_empty() {
            state.report_error(format_args!(
                "cannot transfer files when watching file descriptors"
            ));
            return 1;
        }
        if std::fs::metadata("/proc/self/fdinfo").is_err() {
            state.report_error(format_args!(
                "--watchfd is not available without /proc/<pid>/fdinfo"
            ));
            return 1;
        }
    }

    if let Some(path) = &args.pidfile {
        if let Err(e) = write_pidfile(path) {
            state.report_error(format_args!("{e:#}"));
            return 1;
        }
    }

    if args.files.is_empty() {
        args.files.push("-".to_string());
    }
    state.files = args.files.clone();

    // Work out the total size unless one was supplied.
    let mut size = args.size.unwrap_or(0);
    if watch_pid == 0 {
        if size == 0 {
            state.control.linemode = args.line_mode;
            state.control.null_terminated_lines = args.null;
            size = files::calc_total_size(&mut state);
        }
        // No size means no ETA.
        if size < 1 {
            args.eta = false;
        }
    }

    // With no terminal and no force, there is nothing to show.
    // Safety: isatty only inspects the descriptor.
    if unsafe { libc::isatty(term::STDERR_FD) } == 0 && !args.force && !args.numeric {
        args.quiet = true;
    }

    // Detect the terminal size for anything not set explicitly, falling
    // back to 80x25.
    let mut width = args.width.unwrap_or(0);
    let mut height = args.height.unwrap_or(0);
    if width == 0 || height == 0 {
        if let Some((detected_width, detected_height)) = term::screen_size() {
            if width == 0 {
                width = detected_width;
            }
            if height == 0 {
                height = detected_height;
            }
        }
    }
    if width < 1 {
        width = 80;
    }
    if height < 1 {
        height = 25;
    }
    width = width.min(999_999);
    height = height.min(999_999);

    let interval = args.interval.unwrap_or(1.0).clamp(0.1, 600.0);

    state.control.interval = interval;
    state.control.width = width;
    state.control.width_set_manually = args.width.is_some();
    state.control.height = height;
    state.control.height_set_manually = args.height.is_some();
    state.control.no_display = args.quiet;
    state.control.force = args.force;
    state.control.cursor = args.cursor;
    state.control.numeric = args.numeric;
    state.control.wait = args.wait;
    state.control.delay_start = args.delay_start.unwrap_or(0.0);
    state.control.linemode = args.line_mode;
    state.control.bits = args.bits;
    state.control.null_terminated_lines = args.null;
    state.control.skip_errors = u32::from(args.skip_errors);
    state.control.error_skip_block = args.error_skip_block.unwrap_or(0);
    state.control.stop_at_size = args.stop_at_size || state.control.stop_at_size;
    state.control.sync_after_write = args.sync;
    state.control.direct_io = args.direct_io;
    state.control.direct_io_changed = true;
    state.control.no_splice = args.no_splice;
    state.control.discard_input = args.discard;
    state.control.rate_limit = args.rate_limit.unwrap_or(0);
    state.control.target_buffer_size = args.buffer_size.unwrap_or(0) as usize;
    state.control.size = size;
    state.control.watch_pid = watch_pid;
    state.control.watch_fd = watch_fd;
    state.control.format_string = args.format.clone();
    state.set_average_rate_window(args.average_rate_window);

    state.set_format(
        args.progress,
        args.timer,
        args.eta,
        args.fineta,
        args.rate,
        args.average_rate,
        args.bytes,
        args.buffer_percent,
        args.last_written.unwrap_or(0),
        args.name.as_deref(),
    );

    signals::init(state.control.cursor);

    let status = if watch_pid == 0 {
        mainloop::main_loop(&mut state)
    } else if watch_fd == -1 {
        watch::watchpid_loop(&mut state)
    } else {
        watch::watchfd_loop(&mut state)
    };

    if let Some(path) = &args.pidfile {
        if let Err(e) = std::fs::remove_file(path) {
            state.report_error(format_args!("{}: {}", path.display(), e));
        }
    }

    signals::fini(state.control.cursor, state.status.cursor_attach_count);

    status
}

fn main() {
    std::process::exit(run() as i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch_arg() {
        assert_eq!(parse_watch_arg("123"), Ok((123, -1)));
        assert_eq!(parse_watch_arg("123:4"), Ok((123, 4)));
        assert!(parse_watch_arg("abc").is_err());
        assert!(parse_watch_arg("123:x").is_err());
        assert!(parse_watch_arg("0").is_err());
    }

    #[test]
    fn test_parse_size_arg() {
        assert_eq!(parse_size_arg("1k"), Ok(1024));
        assert!(parse_size_arg("1.5").is_err());
        assert!(parse_size_arg("banana").is_err());
    }

    #[test]
    fn test_parse_interval_arg() {
        assert_eq!(parse_interval_arg("0.5"), Ok(0.5));
        assert!(parse_interval_arg("1k").is_err());
    }

    #[test]
    fn test_cli_shape() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_default_components_applied() {
        let args = Args::parse_from(["pipemon"]);
        assert!(!args.any_display_option());
        let args = Args::parse_from(["pipemon", "-n"]);
        assert!(args.any_display_option());
    }
}
