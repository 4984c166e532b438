// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-process state record: program status, the input file list, the
//! control block the CLI (or a remote peer) fills in, and the display and
//! transfer sub-records owned by the loop.

use crate::display::DisplayState;
use crate::transfer::TransferState;
use std::fmt;

/// Everything externally configurable about a run.  Filled in by the
/// command line before the loop starts; a subset may be overwritten by the
/// remote-control channel while the loop runs.
#[derive(Debug, Clone)]
pub struct Control {
    /// Display even if standard error is not a terminal.
    pub force: bool,
    /// Use cursor positioning to share a terminal between instances.
    pub cursor: bool,
    /// Output bare numbers instead of a formatted line.
    pub numeric: bool,
    /// Hold the display (and the clock) until the first byte moves.
    pub wait: bool,
    /// Count lines instead of bytes.
    pub linemode: bool,
    /// Report bits instead of bytes.
    pub bits: bool,
    /// Lines are NUL-terminated rather than newline-terminated.
    pub null_terminated_lines: bool,
    /// Copy data but never touch the display.
    pub no_display: bool,
    /// How verbosely to skip read errors: 0 = don't skip, 1 = skip and
    /// announce each skip, 2 = skip quietly.
    pub skip_errors: u32,
    /// Fixed error-skip block size; 0 selects the adaptive schedule.
    pub error_skip_block: u64,
    /// Stop transferring at exactly `size` bytes.
    pub stop_at_size: bool,
    /// fdatasync the output after every write.
    pub sync_after_write: bool,
    /// Use O_DIRECT on input and output.
    pub direct_io: bool,
    /// `direct_io` changed since it was last applied to the descriptors.
    pub direct_io_changed: bool,
    /// Never attempt the in-kernel zero-copy path.
    pub no_splice: bool,
    /// Read input but write nothing to standard output.
    pub discard_input: bool,
    /// Rate limit in bytes (or lines) per second; 0 is unlimited.
    pub rate_limit: u64,
    /// Requested transfer buffer size; 0 picks a default.
    pub target_buffer_size: usize,
    /// Total expected transfer size; 0 when unknown.
    pub size: u64,
    /// Seconds between display updates.
    pub interval: f64,
    /// Seconds to wait before the first display update.
    pub delay_start: f64,
    /// Process whose descriptors should be watched; 0 for none.
    pub watch_pid: i32,
    /// Specific descriptor to watch, or -1 for all of them.
    pub watch_fd: i32,
    /// Averaging window for the smoothed rate, in seconds.
    pub average_rate_window: u32,
    /// Terminal width in columns.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
    /// Width came from the operator, not from the terminal.
    pub width_set_manually: bool,
    /// Height came from the operator, not from the terminal.
    pub height_set_manually: bool,
    /// Display name shown by `%N`.
    pub name: Option<String>,
    /// Format built from the component flags when no explicit format is
    /// given.
    pub default_format: String,
    /// Operator-supplied format string.
    pub format_string: Option<String>,
}

impl Default for Control {
    fn default() -> Self {
        Control {
            force: false,
            cursor: false,
            numeric: false,
            wait: false,
            linemode: false,
            bits: false,
            null_terminated_lines: false,
            no_display: false,
            skip_errors: 0,
            error_skip_block: 0,
            stop_at_size: false,
            sync_after_write: false,
            direct_io: false,
            direct_io_changed: false,
            no_splice: false,
            discard_input: false,
            rate_limit: 0,
            target_buffer_size: 0,
            size: 0,
            interval: 1.0,
            delay_start: 0.0,
            watch_pid: 0,
            watch_fd: -1,
            average_rate_window: 30,
            width: 80,
            height: 25,
            width_set_manually: false,
            height_set_manually: false,
            name: None,
            default_format: String::new(),
            format_string: None,
        }
    }
}

impl Control {
    /// The format string in effect: the operator's, or the default built
    /// from component flags.
    pub fn effective_format(&self) -> &str {
        self.format_string.as_deref().unwrap_or(&self.default_format)
    }
}

/// Program identity and accumulated outcome.
#[derive(Debug, Clone)]
pub struct Status {
    /// Name used to prefix error reports.
    pub program_name: String,
    /// Current working directory, used to shorten displayed paths; empty
    /// when unknown or the root directory.
    pub cwd: String,
    /// Index of the input file currently being read, or `None` before the
    /// first open.
    pub current_input_file: Option<usize>,
    /// Exit status bitmask accumulated across the run.
    pub exit_status: u32,
    /// Instances still attached to the cursor coordinator's shared
    /// segment when it shut down; drives the TOSTOP clear decision.
    pub cursor_attach_count: i32,
}

/// The state record shared by the loop, the display and the transfer
/// engine.  Watch-pid mode clones one of these per watched descriptor.
#[derive(Debug)]
pub struct State {
    pub status: Status,
    /// Ordered input file names; `-` denotes standard input.
    pub files: Vec<String>,
    pub control: Control,
    pub display: DisplayState,
    pub transfer: TransferState,
}

impl State {
    pub fn new(program_name: &str) -> Self {
        let mut cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        // The root directory gives no useful relative paths.
        if cwd == "/" {
            cwd.clear();
        }

        State {
            status: Status {
                program_name: program_name.to_string(),
                cwd,
                current_input_file: None,
                exit_status: 0,
                cursor_attach_count: 1,
            },
            files: Vec::new(),
            control: Control::default(),
            display: DisplayState::new(),
            transfer: TransferState::new(),
        }
    }

    /// Report an error to standard error, prefixed with the program name.
    /// If a display line is visible, a newline is emitted first so the
    /// report does not overwrite it.
    pub fn report_error(&self, message: fmt::Arguments) {
        if self.display.visible {
            eprintln!();
        }
        eprintln!("{}: {}", self.status.program_name, message);
    }

    /// Build the default format string from the classic component flags.
    /// Also (re)sets the display name and requests a format reparse.
    #[allow(clippy::too_many_arguments)]
    pub fn set_format(
        &mut self,
        progress: bool,
        timer: bool,
        eta: bool,
        fineta: bool,
        rate: bool,
        average_rate: bool,
        bytes: bool,
        bufpercent: bool,
        lastwritten: usize,
        name: Option<&str>,
    ) {
        let mut fmt = String::new();
        let mut push = |token: &str| {
            if !fmt.is_empty() {
                fmt.push(' ');
            }
            fmt.push_str(token);
        };
        if name.is_some() {
            push("%N");
        }
        if bytes {
            push("%b");
        }
        if bufpercent {
            push("%T");
        }
        if timer {
            push("%t");
        }
        if rate {
            push("%r");
        }
        if average_rate {
            push("%a");
        }
        if progress {
            push("%p");
        }
        if eta {
            push("%e");
        }
        if fineta {
            push("%I");
        }
        if lastwritten > 0 {
            push(&format!("%{lastwritten}A"));
        }
        self.control.default_format = fmt;
        self.control.name = name.map(str::to_string);
        self.display.reparse = true;
    }

    /// Set the averaging window and size the rate-history ring to match.
    pub fn set_average_rate_window(&mut self, window_sec: u32) {
        let window_sec = window_sec.max(1);
        self.control.average_rate_window = window_sec;
        self.display.reset_history(window_sec);
    }

    /// Clone this state for one watched file descriptor: control values are
    /// copied, the effective format becomes the clone's default format, and
    /// the display gets fresh buffers and its own history ring.
    pub fn clone_for_watch(&self) -> State {
        let mut control = self.control.clone();
        control.default_format = self.control.effective_format().to_string();
        control.format_string = None;
        control.name = None;

        let mut clone = State {
            status: Status {
                program_name: self.status.program_name.clone(),
                cwd: self.status.cwd.clone(),
                current_input_file: None,
                exit_status: 0,
                cursor_attach_count: 1,
            },
            files: Vec::new(),
            control,
            display: DisplayState::new(),
            transfer: TransferState::new(),
        };
        clone.set_average_rate_window(self.control.average_rate_window);
        clone.display.reparse = true;
        clone
    }
}
