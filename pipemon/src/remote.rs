// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote reconfiguration of a running instance.
//!
//! The sender writes a fixed-layout message into a per-sender control file
//! under a well-known path, signals the target with SIGUSR2, and waits up
//! to ~1.1 s for the target to signal back.  The receiver reads the file,
//! acknowledges, and applies the whole message or nothing.

use crate::error::RemoteError;
use crate::signals;
use crate::state::State;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Size of the NUL-padded name and format fields.
const TEXT_FIELD: usize = 256;

/// Total encoded size of a control message.
pub const MESSAGE_SIZE: usize = 8 + 4 * 8 + 8 + 2 * 4 + 2 + 2 * TEXT_FIELD;

/// The representative subset of control fields a remote sender may set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteMessage {
    pub progress: bool,
    pub timer: bool,
    pub eta: bool,
    pub fineta: bool,
    pub rate: bool,
    pub average_rate: bool,
    pub bytes: bool,
    pub bufpercent: bool,
    pub lastwritten: u64,
    pub rate_limit: u64,
    pub buffer_size: u64,
    pub size: u64,
    pub interval: f64,
    pub width: u32,
    pub height: u32,
    pub width_set_manually: bool,
    pub height_set_manually: bool,
    pub name: String,
    pub format: String,
}

impl RemoteMessage {
    /// Serialise into the fixed little-endian layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_SIZE);
        for flag in [
            self.progress,
            self.timer,
            self.eta,
            self.fineta,
            self.rate,
            self.average_rate,
            self.bytes,
            self.bufpercent,
        ] {
            out.push(u8::from(flag));
        }
        out.extend_from_slice(&self.lastwritten.to_le_bytes());
        out.extend_from_slice(&self.rate_limit.to_le_bytes());
        out.extend_from_slice(&self.buffer_size.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.interval.to_le_bytes());
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.push(u8::from(self.width_set_manually));
        out.push(u8::from(self.height_set_manually));

        for text in [&self.name, &self.format] {
            let mut field = [0u8; TEXT_FIELD];
            let bytes = text.as_bytes();
            // Leave at least one trailing NUL.
            let len = bytes.len().min(TEXT_FIELD - 1);
            field[..len].copy_from_slice(&bytes[..len]);
            out.extend_from_slice(&field);
        }

        out
    }

    /// Parse a message; the text fields are terminated at their first NUL
    /// before use.
    pub fn decode(data: &[u8]) -> Result<RemoteMessage, RemoteError> {
        if data.len() < MESSAGE_SIZE {
            return Err(RemoteError::Truncated);
        }

        let mut offset = 0usize;
        let mut take = |n: usize| {
            let slice = &data[offset..offset + n];
            offset += n;
            slice
        };

        let flags: Vec<bool> = take(8).iter().map(|&b| b != 0).collect();
        let lastwritten = u64::from_le_bytes(take(8).try_into().unwrap_or_default());
        let rate_limit = u64::from_le_bytes(take(8).try_into().unwrap_or_default());
        let buffer_size = u64::from_le_bytes(take(8).try_into().unwrap_or_default());
        let size = u64::from_le_bytes(take(8).try_into().unwrap_or_default());
        let interval = f64::from_le_bytes(take(8).try_into().unwrap_or_default());
        let width = u32::from_le_bytes(take(4).try_into().unwrap_or_default());
        let height = u32::from_le_bytes(take(4).try_into().unwrap_or_default());
        let width_set_manually = take(1)[0] != 0;
        let height_set_manually = take(1)[0] != 0;

        let mut text = |field: &[u8]| {
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            String::from_utf8_lossy(&field[..end]).into_owned()
        };
        let name = text(take(TEXT_FIELD));
        let format = text(take(TEXT_FIELD));

        Ok(RemoteMessage {
            progress: flags[0],
            timer: flags[1],
            eta: flags[2],
            fineta: flags[3],
            rate: flags[4],
            average_rate: flags[5],
            bytes: flags[6],
            bufpercent: flags[7],
            lastwritten,
            rate_limit,
            buffer_size,
            size,
            interval,
            width,
            height,
            width_set_manually,
            height_set_manually,
            name,
            format,
        })
    }

    /// Clamp dimensions and interval into the ranges a receiver will
    /// accept.
    pub fn clamp(&mut self) {
        if self.width < 1 {
            self.width = 80;
        }
        if self.height < 1 {
            self.height = 25;
        }
        self.width = self.width.min(999_999);
        self.height = self.height.min(999_999);
        if self.interval > 0.0 && self.interval < 0.1 {
            self.interval = 0.1;
        }
        if self.interval > 600.0 {
            self.interval = 600.0;
        }
    }
}

/// The preferred and fallback control-file paths for a given PID.
fn control_file_paths(control_pid: u32) -> Vec<PathBuf> {
    // Safety: geteuid cannot fail.
    let euid = unsafe { libc::geteuid() };
    let mut paths = vec![PathBuf::from(format!(
        "/run/user/{euid}/pipemon.remote.{control_pid}"
    ))];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(
            PathBuf::from(home)
                .join(".pipemon")
                .join(format!("remote.{control_pid}")),
        );
    }
    paths
}

fn create_exclusive(path: &PathBuf) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

/// Create the control file for writing, preferring /run/user/<euid> and
/// falling back to a mode-700 directory under $HOME.
fn create_control_file(control_pid: u32) -> Result<(PathBuf, File), RemoteError> {
    let paths = control_file_paths(control_pid);
    let mut last_err: Option<std::io::Error> = None;

    for (idx, path) in paths.iter().enumerate() {
        match create_exclusive(path) {
            Ok(file) => return Ok((path.clone(), file)),
            Err(first_err) => {
                // The $HOME fallback directory may need creating first.
                if idx > 0 {
                    if let Some(dir) = path.parent() {
                        let _ = std::fs::create_dir_all(dir);
                        let _ = std::fs::set_permissions(
                            dir,
                            std::fs::Permissions::from_mode(0o700),
                        );
                        match create_exclusive(path) {
                            Ok(file) => return Ok((path.clone(), file)),
                            Err(e) => last_err = Some(e),
                        }
                    }
                } else {
                    last_err = Some(first_err);
                }
            }
        }
    }

    Err(RemoteError::ControlFile(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no usable control path")
    })))
}

/// Open an existing control file for reading.
fn open_control_file(control_pid: u32) -> Result<File, RemoteError> {
    let mut last_err: Option<std::io::Error> = None;
    for path in control_file_paths(control_pid) {
        match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
        {
            Ok(file) => return Ok(file),
            Err(e) => last_err = Some(e),
        }
    }
    Err(RemoteError::ControlFile(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no control file")
    })))
}

/// Send a reconfiguration message to the instance with PID `target`, and
/// wait for its acknowledgement.
pub fn remote_set(state: &State, message: &RemoteMessage, target: i32) -> Result<(), RemoteError> {
    let target_pid = Pid::from_raw(target);

    // The target must exist before we go to any trouble.
    if let Err(err) = kill(target_pid, None) {
        return Err(RemoteError::TargetMissing { pid: target, err });
    }

    let mut message = message.clone();
    message.clamp();

    let (path, mut file) = create_control_file(std::process::id())?;

    let write_result = file
        .write_all(&message.encode())
        .and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&path);
        return Err(RemoteError::ControlFile(e));
    }

    // Discard any stale acknowledgement before signalling.
    let _ = signals::take_usr2();

    if let Err(err) = kill(target_pid, Signal::SIGUSR2) {
        let _ = std::fs::remove_file(&path);
        return Err(RemoteError::SignalFailed { pid: target, err });
    }
    debug!("message sent to {target}");

    // Poll for the acknowledgement from the specific target.
    let mut remaining = Duration::from_micros(1_100_000);
    let slice = Duration::from_millis(10);
    let mut received = false;
    while remaining > Duration::from_millis(10) && !received {
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
        if let Some(sender) = signals::take_usr2() {
            if sender == target {
                debug!("message acknowledged");
                received = true;
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&path) {
        state.report_error(format_args!("{}: {}", path.display(), e));
    }

    if received {
        Ok(())
    } else {
        Err(RemoteError::NotAcknowledged { pid: target })
    }
}

/// Check for a pending remote message and apply it.  Called on a short
/// cadence from the loops; does nothing unless SIGUSR2 arrived since the
/// last check.  A failed exchange is reported and applies nothing.
pub fn remote_check(state: &mut State) {
    let Some(sender) = signals::take_usr2() else {
        return;
    };
    if sender <= 0 {
        return;
    }

    let message = open_control_file(sender as u32).and_then(|mut file| {
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(RemoteError::ControlFile)?;
        RemoteMessage::decode(&data)
    });

    let message = match message {
        Ok(message) => message,
        Err(e) => {
            state.report_error(format_args!("{e}"));
            return;
        }
    };

    // Acknowledge receipt; removal is the sender's job.
    if let Err(e) = kill(Pid::from_raw(sender), Signal::SIGUSR2) {
        debug!("acknowledgement to {sender} failed: {e}");
    }

    apply(state, &message);
}

/// Overwrite the current display configuration with the message contents.
fn apply(state: &mut State, message: &RemoteMessage) {
    state.control.format_string = None;
    state.control.name = None;

    let name = if message.name.is_empty() {
        None
    } else {
        Some(message.name.as_str())
    };
    state.set_format(
        message.progress,
        message.timer,
        message.eta,
        message.fineta,
        message.rate,
        message.average_rate,
        message.bytes,
        message.bufpercent,
        message.lastwritten as usize,
        name,
    );

    if message.rate_limit > 0 {
        state.control.rate_limit = message.rate_limit;
    }
    if message.buffer_size > 0 {
        state.control.target_buffer_size = message.buffer_size as usize;
    }
    if message.size > 0 {
        state.control.size = message.size;
    }
    if message.interval > 0.0 {
        state.control.interval = message.interval;
    }
    if message.width > 0 && message.width_set_manually {
        state.control.width = message.width;
        state.control.width_set_manually = true;
    }
    if message.height > 0 && message.height_set_manually {
        state.control.height = message.height;
        state.control.height_set_manually = true;
    }
    if !message.format.is_empty() {
        state.control.format_string = Some(message.format.clone());
    }
    state.display.reparse = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RemoteMessage {
        RemoteMessage {
            progress: true,
            timer: false,
            eta: true,
            fineta: false,
            rate: true,
            average_rate: false,
            bytes: true,
            bufpercent: false,
            lastwritten: 16,
            rate_limit: 1024 * 1024,
            buffer_size: 65536,
            size: 10_485_760,
            interval: 0.5,
            width: 132,
            height: 43,
            width_set_manually: true,
            height_set_manually: false,
            name: "staging".into(),
            format: "%p %r".into(),
        }
    }

    #[test]
    fn test_codec_round_trip() {
        let message = sample();
        let encoded = message.encode();
        assert_eq!(encoded.len(), MESSAGE_SIZE);
        let decoded = RemoteMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let encoded = sample().encode();
        assert!(matches!(
            RemoteMessage::decode(&encoded[..MESSAGE_SIZE - 1]),
            Err(RemoteError::Truncated)
        ));
    }

    #[test]
    fn test_text_fields_are_terminated() {
        let mut message = sample();
        message.name = "n".repeat(400);
        let decoded = RemoteMessage::decode(&message.encode()).unwrap();
        // Truncated to the field size, leaving a trailing NUL.
        assert_eq!(decoded.name.len(), TEXT_FIELD - 1);
    }

    #[test]
    fn test_clamp_ranges() {
        let mut message = sample();
        message.width = 0;
        message.height = 10_000_000;
        message.interval = 0.001;
        message.clamp();
        assert_eq!(message.width, 80);
        assert_eq!(message.height, 999_999);
        assert_eq!(message.interval, 0.1);

        message.interval = 1e9;
        message.clamp();
        assert_eq!(message.interval, 600.0);
    }

    #[test]
    fn test_apply_all_fields() {
        let mut state = State::new("pipemon");
        let message = sample();
        apply(&mut state, &message);

        assert_eq!(state.control.rate_limit, 1024 * 1024);
        assert_eq!(state.control.target_buffer_size, 65536);
        assert_eq!(state.control.size, 10_485_760);
        assert_eq!(state.control.interval, 0.5);
        assert_eq!(state.control.width, 132);
        assert!(state.control.width_set_manually);
        // Height was not flagged as manual, so it stays untouched.
        assert_eq!(state.control.height, 25);
        assert_eq!(state.control.format_string.as_deref(), Some("%p %r"));
        assert_eq!(state.control.name.as_deref(), Some("staging"));
        assert!(state.display.reparse);
        assert_eq!(state.control.default_format, "%N %b %r %p %e %16A");
    }

    #[test]
    fn test_control_file_paths_prefer_run_user() {
        let paths = control_file_paths(1234);
        assert!(paths[0]
            .to_string_lossy()
            .contains("/pipemon.remote.1234"));
        assert!(paths[0].starts_with("/run/user"));
    }
}
