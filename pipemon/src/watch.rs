// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Watching file descriptors in another process.
//!
//! The kernel exports each process's descriptor table under
//! `/proc/<pid>/fd` and per-descriptor offsets under
//! `/proc/<pid>/fdinfo`; reading those gives a transfer's progress without
//! touching its data stream.  Watch-fd mode follows one descriptor with
//! the normal display; watch-pid mode keeps a per-descriptor display
//! state and redraws an N-line dashboard with cursor-up escapes.

use crate::display;
use crate::error::{exit, WatchError};
use crate::remote;
use crate::signals;
use crate::state::State;
use crate::REMOTE_INTERVAL;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use pmcommon::{clock, term};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Highest descriptor number tracked per watched process.
const FD_LIMIT: usize = 1024;

/// Delay between position polls when it is not yet time to render.
const POLL_SLEEP: Duration = Duration::from_millis(50);

/// One watched descriptor and its own display state.
#[derive(Default)]
pub struct WatchedFd {
    /// Owning process; 0 marks a slot free for reuse.
    pub pid: i32,
    /// Descriptor number; -1 once deemed not displayable.
    pub fd: i32,
    fdinfo_path: PathBuf,
    fd_path: PathBuf,
    /// Path the descriptor resolves to.
    pub resolved_path: String,
    /// Name shown by `%N`, shortened to the terminal.
    pub display_name: String,
    sb_fd: Option<libc::stat>,
    sb_fd_link: Option<libc::stat>,
    /// Total size of the underlying file, 0 when unknown.
    pub size: u64,
    /// Offset last observed.
    pub position: i64,
    pub start_time: Duration,
    /// The cloned display state driving this descriptor's line.
    pub state: Option<Box<State>>,
}

impl WatchedFd {
    pub fn new(pid: i32, fd: i32) -> WatchedFd {
        WatchedFd {
            pid,
            fd,
            fdinfo_path: PathBuf::from(format!("/proc/{pid}/fdinfo/{fd}")),
            fd_path: PathBuf::from(format!("/proc/{pid}/fd/{fd}")),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for WatchedFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedFd")
            .field("pid", &self.pid)
            .field("fd", &self.fd)
            .field("resolved_path", &self.resolved_path)
            .field("size", &self.size)
            .field("position", &self.position)
            .finish()
    }
}

fn stat_path(path: &std::path::Path) -> Option<libc::stat> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    // Safety: zeroed stat is a valid out-parameter.
    let mut sb: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(cpath.as_ptr(), &mut sb) } == 0 {
        Some(sb)
    } else {
        None
    }
}

fn lstat_path(path: &std::path::Path) -> Option<libc::stat> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    // Safety: as in stat_path.
    let mut sb: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::lstat(cpath.as_ptr(), &mut sb) } == 0 {
        Some(sb)
    } else {
        None
    }
}

/// Determine the size of the watched file: block devices by open and
/// seek-to-end (with a re-check that the opened file is still a block
/// device), regular files from their stat size unless the descriptor was
/// opened for writing.  Anything else is not watchable.
fn file_size(info: &mut WatchedFd) -> bool {
    let Some(sb_fd) = info.sb_fd else {
        return false;
    };

    if sb_fd.st_mode & libc::S_IFMT == libc::S_IFBLK {
        info.size = 0;
        if let Ok(cpath) = std::ffi::CString::new(info.resolved_path.as_str()) {
            // Safety: read-only open for sizing.
            let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
            if fd >= 0 {
                // Safety: fstat then lseek on a descriptor we own.
                let mut check: libc::stat = unsafe { std::mem::zeroed() };
                unsafe {
                    if libc::fstat(fd, &mut check) == 0
                        && check.st_mode & libc::S_IFMT == libc::S_IFBLK
                    {
                        info.size = libc::lseek(fd, 0, libc::SEEK_END).max(0) as u64;
                    }
                    libc::close(fd);
                }
            }
        }
        true
    } else if sb_fd.st_mode & libc::S_IFMT == libc::S_IFREG {
        // A descriptor opened for writing is still growing its file; the
        // current size would be meaningless as a total.
        if let Some(link) = info.sb_fd_link {
            if link.st_mode & libc::S_IWUSR as libc::mode_t == 0 {
                info.size = sb_fd.st_size.max(0) as u64;
            }
        }
        true
    } else {
        false
    }
}

/// Resolve the paths and stat snapshots for a watched descriptor.
pub fn watchfd_info(info: &mut WatchedFd) -> Result<(), WatchError> {
    if let Err(err) = kill(Pid::from_raw(info.pid), None) {
        return Err(WatchError::ProcessGone {
            pid: info.pid,
            err,
        });
    }

    info.resolved_path = match std::fs::read_link(&info.fd_path) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(err) => {
            return Err(WatchError::Resolve {
                pid: info.pid,
                fd: info.fd,
                err,
            })
        }
    };

    info.sb_fd = stat_path(&info.fd_path);
    info.sb_fd_link = lstat_path(&info.fd_path);
    if info.sb_fd.is_none() || info.sb_fd_link.is_none() {
        return Err(WatchError::Stat {
            pid: info.pid,
            fd: info.fd,
            path: info.resolved_path.clone(),
            err: std::io::Error::last_os_error(),
        });
    }

    info.size = 0;
    if !file_size(info) {
        return Err(WatchError::NotRegular {
            pid: info.pid,
            fd: info.fd,
            path: info.resolved_path.clone(),
        });
    }

    Ok(())
}

/// Whether the descriptor now points somewhere else (or has closed).
pub fn watchfd_changed(info: &WatchedFd) -> bool {
    let (Some(now_fd), Some(now_link)) = (stat_path(&info.fd_path), lstat_path(&info.fd_path))
    else {
        return true;
    };
    let (Some(was_fd), Some(was_link)) = (info.sb_fd, info.sb_fd_link) else {
        return true;
    };
    now_fd.st_dev != was_fd.st_dev
        || now_fd.st_ino != was_fd.st_ino
        || now_link.st_mode != was_link.st_mode
}

fn parse_fdinfo_pos(content: &str) -> Option<i64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("pos:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// The descriptor's current file offset, or -1 if it closed or changed.
pub fn watchfd_position(info: &WatchedFd) -> i64 {
    if watchfd_changed(info) {
        return -1;
    }
    match std::fs::read_to_string(&info.fdinfo_path) {
        Ok(content) => parse_fdinfo_pos(&content).unwrap_or(-1),
        Err(_) => -1,
    }
}

/// Choose the display name for a watched descriptor: `fd:path`, with the
/// path rewritten relative to our working directory when possible and
/// middle-truncated to half the terminal width.
pub fn watchpid_setname(state: &State, info: &mut WatchedFd) {
    let mut path = info.resolved_path.as_str();
    let cwd = state.status.cwd.as_str();
    if !cwd.is_empty() && path.len() > cwd.len() && path.starts_with(cwd) {
        path = &path[cwd.len() + 1..];
    }

    let max_display_length = (state.control.width as i64 / 2 - 6).max(0) as usize;
    let chars: Vec<char> = path.chars().collect();

    if max_display_length >= chars.len() {
        info.display_name = format!("{:4}:{}", info.fd, path);
    } else {
        let prefix_length = max_display_length / 4;
        let suffix_length = max_display_length.saturating_sub(prefix_length + 3);
        let prefix: String = chars[..prefix_length].iter().collect();
        let suffix: String = chars[chars.len() - suffix_length..].iter().collect();
        info.display_name = format!("{:4}:{}...{}", info.fd, prefix, suffix);
    }

    debug!(fd = info.fd, "set name: {}", info.display_name);
}

/// Drop the given component token from a format string wherever it
/// appears.
fn strip_token(format: &mut String, token: &str) {
    while let Some(pos) = format.find(token) {
        format.replace_range(pos..pos + token.len(), "");
    }
}

/// Scan the watched process's descriptor directory, adding new
/// descriptors (each with a cloned display state) and reusing slots of
/// closed ones.
pub fn watchpid_scanfds(
    state: &State,
    watch_pid: i32,
    infos: &mut Vec<WatchedFd>,
    fd_to_idx: &mut [i32; FD_LIMIT],
) -> Result<(), ()> {
    let dir = match std::fs::read_dir(format!("/proc/{watch_pid}/fd")) {
        Ok(dir) => dir,
        Err(_) => return Err(()),
    };

    for entry in dir.flatten() {
        let Ok(fd) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        if !(0..FD_LIMIT as i32).contains(&fd) {
            continue;
        }
        if fd_to_idx[fd as usize] != -1 {
            continue;
        }

        // Reuse a free slot when one exists.
        let idx = match infos.iter().position(|slot| slot.pid == 0) {
            Some(idx) => idx,
            None => {
                infos.push(WatchedFd::default());
                infos.len() - 1
            }
        };
        debug!(fd, idx, "found new fd");

        infos[idx] = WatchedFd::new(watch_pid, fd);
        let info = &mut infos[idx];
        info.state = Some(Box::new(state.clone_for_watch()));

        let rc = watchfd_info(info);
        match &rc {
            Ok(()) | Err(WatchError::NotRegular { .. }) => {}
            Err(_) => {
                debug!(fd, "lookup failed - freeing slot");
                info.pid = 0;
                info.state = None;
                continue;
            }
        }

        fd_to_idx[fd as usize] = idx as i32;

        if rc.is_err() {
            debug!(fd, "not displayable");
            info.fd = -1;
        }

        let size = info.size;
        let Some(clone) = info.state.as_deref_mut() else {
            info.fd = -1;
            continue;
        };

        // Without a size there is no ETA to show for this descriptor.
        clone.control.size = size;
        if clone.control.size < 1 {
            strip_token(&mut clone.control.default_format, "%e");
            strip_token(&mut clone.control.default_format, "%I");
            clone.display.reparse = true;
        }

        watchpid_setname(state, info);
        let display_name = info.display_name.clone();
        if let Some(clone) = info.state.as_deref_mut() {
            clone.control.name = Some(display_name);
            clone.display.reparse = true;
        }

        info.start_time = clock::read();

        // Seed the position so the ETA is relative to where the transfer
        // already is, not to zero.
        info.position = 0;
        let position_now = watchfd_position(info);
        if position_now >= 0 {
            info.position = position_now;
            if let Some(clone) = info.state.as_deref_mut() {
                clone.display.initial_offset = position_now as u64;
            }
        }
    }

    Ok(())
}

/// Watch a single descriptor in another process, rendering the normal
/// display until the descriptor closes or changes.
pub fn watchfd_loop(state: &mut State) -> u32 {
    let mut info = WatchedFd::new(state.control.watch_pid, state.control.watch_fd);
    if let Err(e) = watchfd_info(&mut info) {
        state.report_error(format_args!("{e}"));
        state.status.exit_status |= exit::FILE_ERROR;
        return state.status.exit_status;
    }

    // A size given on the command line wins over the discovered one.
    if state.control.size == 0 {
        state.control.size = info.size;
    }
    if state.control.size < 1 {
        debug!("zero size - removing ETA");
        strip_token(&mut state.control.default_format, "%e");
        state.display.reparse = true;
    }

    let mut cur_time = clock::read();
    info.start_time = cur_time;
    let mut next_remotecheck = cur_time;
    let mut next_update = cur_time + Duration::from_secs_f64(state.control.interval);

    let mut ended = false;
    let mut total_written: i64 = 0;
    let mut transferred_since_last: i64 = 0;
    let mut first_check = true;

    while !ended {
        if cur_time > next_remotecheck {
            remote::remote_check(state);
            next_remotecheck += REMOTE_INTERVAL;
        }

        if signals::exit_triggered() {
            break;
        }

        let position_now = watchfd_position(&info);
        if position_now < 0 {
            ended = true;
        } else {
            transferred_since_last += position_now - total_written;
            total_written = position_now;
            if first_check {
                state.display.initial_offset = position_now.max(0) as u64;
                first_check = false;
            }
        }

        cur_time = clock::read();

        if ended {
            next_update = cur_time;
        }

        if cur_time < next_update {
            std::thread::sleep(POLL_SLEEP);
            continue;
        }

        next_update += Duration::from_secs_f64(state.control.interval);
        if next_update < cur_time {
            next_update = cur_time;
        }

        let init_time = info.start_time + signals::stopped_offset();
        let elapsed_sec = cur_time.saturating_sub(init_time).as_secs_f64();

        if signals::take_terminal_resized() {
            if let Some((width, height)) = term::screen_size() {
                if !state.control.width_set_manually {
                    state.control.width = width;
                }
                if !state.control.height_set_manually {
                    state.control.height = height;
                }
            }
        }

        let since_last = if ended { -1 } else { transferred_since_last };
        display::display(state, None, elapsed_sec, since_last, total_written.max(0) as u64);

        transferred_since_last = 0;
    }

    if !state.control.numeric {
        term::write_retry(term::STDERR_FD, b"\n");
    }

    if signals::exit_triggered() {
        state.status.exit_status |= exit::SIGNAL_EXIT;
    }

    state.status.exit_status
}

/// Watch every descriptor of another process, one dashboard line each.
pub fn watchpid_loop(state: &mut State) -> u32 {
    let watch_pid = state.control.watch_pid;

    if let Err(err) = kill(Pid::from_raw(watch_pid), None) {
        state.report_error(format_args!("pid {watch_pid}: {err}"));
        state.status.exit_status |= exit::FILE_ERROR;
        return state.status.exit_status;
    }

    // Every line needs its name prefix; splice %N in if the format lacks
    // one.
    let original = state.control.effective_format().to_string();
    let new_format = if original.is_empty() {
        "%N".to_string()
    } else if !original.contains("%N") {
        format!("%N {original}")
    } else {
        original
    };
    state.control.format_string = Some(new_format);
    state.display.reparse = true;

    let mut cur_time = clock::read();
    let mut next_update = cur_time + Duration::from_secs_f64(state.control.interval);

    let mut infos: Vec<WatchedFd> = Vec::new();
    let mut fd_to_idx = [-1i32; FD_LIMIT];
    let mut prev_displayed_lines = 0usize;
    let mut first_pass = true;

    loop {
        if signals::exit_triggered() {
            break;
        }

        cur_time = clock::read();

        if kill(Pid::from_raw(watch_pid), None).is_err() {
            if first_pass {
                state.report_error(format_args!("pid {watch_pid}: {}", Errno::last()));
                state.status.exit_status |= exit::FILE_ERROR;
                return state.status.exit_status;
            }
            break;
        }

        if cur_time < next_update {
            std::thread::sleep(POLL_SLEEP);
            continue;
        }

        next_update += Duration::from_secs_f64(state.control.interval);
        if next_update < cur_time {
            next_update = cur_time;
        }

        if signals::take_terminal_resized() {
            if let Some((width, height)) = term::screen_size() {
                state.control.width = width;
                state.control.height = height;
            }
            for info in infos.iter_mut() {
                if info.state.is_none() {
                    continue;
                }
                let (width, height) = (state.control.width, state.control.height);
                watchpid_setname(state, info);
                let name = info.display_name.clone();
                if let Some(clone) = info.state.as_deref_mut() {
                    clone.control.width = width;
                    clone.control.height = height;
                    clone.control.name = Some(name);
                    clone.display.reparse = true;
                }
            }
        }

        if watchpid_scanfds(state, watch_pid, &mut infos, &mut fd_to_idx).is_err() {
            if first_pass {
                state.report_error(format_args!("pid {watch_pid}: {}", Errno::last()));
                state.status.exit_status |= exit::FILE_ERROR;
                return state.status.exit_status;
            }
            break;
        }

        first_pass = false;
        let mut displayed_lines = 0usize;

        for fd in 0..FD_LIMIT {
            if displayed_lines >= state.control.height as usize {
                break;
            }

            let idx = fd_to_idx[fd];
            if idx < 0 {
                continue;
            }
            let info = &mut infos[idx as usize];

            if info.fd < 0 {
                // Not displayable; just drop it once it changes.
                if watchfd_changed(info) {
                    fd_to_idx[fd] = -1;
                    info.pid = 0;
                    debug!(fd, "removing");
                }
                continue;
            }

            if info.state.is_none() {
                continue;
            }

            let position_now = watchfd_position(info);
            if position_now < 0 {
                fd_to_idx[fd] = -1;
                info.pid = 0;
                debug!(fd, "removing");
                continue;
            }

            let transferred_since_last = position_now - info.position;
            info.position = position_now;

            let init_time = info.start_time + signals::stopped_offset();
            let elapsed_sec = cur_time.saturating_sub(init_time).as_secs_f64();

            if displayed_lines > 0 {
                term::write_retry(term::STDERR_FD, b"\n");
            }

            if let Some(clone) = info.state.as_deref_mut() {
                display::display(
                    clone,
                    None,
                    elapsed_sec,
                    transferred_since_last,
                    position_now.max(0) as u64,
                );
            }
            displayed_lines += 1;
        }

        // Blank out rows left over from a taller previous render.
        let mut blank_lines = prev_displayed_lines.saturating_sub(displayed_lines);
        prev_displayed_lines = displayed_lines;

        while blank_lines > 0 {
            if displayed_lines > 0 {
                term::write_retry(term::STDERR_FD, b"\n");
            }
            let spaces = " ".repeat(state.control.width as usize);
            term::write_retry(term::STDERR_FD, spaces.as_bytes());
            term::write_retry(term::STDERR_FD, b"\r");
            blank_lines -= 1;
            displayed_lines += 1;
        }

        // Climb back to the top for the next tick.
        while displayed_lines > 1 {
            term::write_retry(term::STDERR_FD, b"\x1b[A");
            displayed_lines -= 1;
        }
    }

    // Blank our lines and retract on the way out.
    let mut blank_lines = prev_displayed_lines;
    while blank_lines > 0 {
        let spaces = " ".repeat(state.control.width as usize);
        term::write_retry(term::STDERR_FD, spaces.as_bytes());
        term::write_retry(term::STDERR_FD, b"\r");
        blank_lines -= 1;
        if blank_lines > 0 {
            term::write_retry(term::STDERR_FD, b"\n");
        }
    }
    while prev_displayed_lines > 1 {
        term::write_retry(term::STDERR_FD, b"\x1b[A");
        prev_displayed_lines -= 1;
    }

    if signals::exit_triggered() {
        state.status.exit_status |= exit::SIGNAL_EXIT;
    }

    state.status.exit_status
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    #[test]
    fn test_parse_fdinfo_pos() {
        assert_eq!(
            parse_fdinfo_pos("pos:\t1234\nflags:\t02\nmnt_id:\t27\n"),
            Some(1234)
        );
        assert_eq!(parse_fdinfo_pos("pos: 0\n"), Some(0));
        assert_eq!(parse_fdinfo_pos("flags:\t02\n"), None);
        assert_eq!(parse_fdinfo_pos(""), None);
    }

    #[test]
    fn test_watchfd_info_on_own_fd() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let mut info = WatchedFd::new(std::process::id() as i32, file.as_raw_fd());
        watchfd_info(&mut info).expect("own fd must resolve");
        assert!(info.resolved_path.ends_with("watched"));
        assert_eq!(info.size, 4096);
    }

    #[test]
    fn test_watchfd_position_tracks_seek() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seekable");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();
        let mut file = std::fs::File::open(&path).unwrap();

        let mut info = WatchedFd::new(std::process::id() as i32, file.as_raw_fd());
        watchfd_info(&mut info).unwrap();

        assert_eq!(watchfd_position(&info), 0);
        file.seek(SeekFrom::Start(600)).unwrap();
        assert_eq!(watchfd_position(&info), 600);
    }

    #[test]
    fn test_watchfd_position_detects_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closer");
        std::fs::write(&path, b"x").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        let mut info = WatchedFd::new(std::process::id() as i32, file.as_raw_fd());
        watchfd_info(&mut info).unwrap();
        drop(file);
        assert_eq!(watchfd_position(&info), -1);
    }

    #[test]
    fn test_watchfd_info_missing_process() {
        // PID 0 can never be watched, and huge PIDs do not exist.
        let mut info = WatchedFd::new(999_999_999, 0);
        assert!(matches!(
            watchfd_info(&mut info),
            Err(WatchError::ProcessGone { .. })
        ));
    }

    #[test]
    fn test_watchfd_info_pipe_not_regular() {
        let (rd, _wr) = nix::unistd::pipe().unwrap();
        let mut info = WatchedFd::new(std::process::id() as i32, rd.as_raw_fd());
        assert!(matches!(
            watchfd_info(&mut info),
            Err(WatchError::NotRegular { .. })
        ));
    }

    #[test]
    fn test_setname_relative_and_truncated() {
        let mut state = State::new("pipemon");
        state.control.width = 80;
        state.status.cwd = "/work/data".to_string();

        let mut info = WatchedFd::new(1, 5);
        info.resolved_path = "/work/data/output.log".to_string();
        watchpid_setname(&state, &mut info);
        assert_eq!(info.display_name, "   5:output.log");

        // A long path outside the cwd gets middle truncation at
        // width/2 - 6 = 34 characters of path.
        info.resolved_path = format!("/somewhere/else/{}", "x".repeat(80));
        watchpid_setname(&state, &mut info);
        assert!(info.display_name.starts_with("   5:"));
        assert!(info.display_name.contains("..."));
        let shown = &info.display_name[5..];
        assert!(shown.len() <= 34 + 3, "too long: {shown:?}");
    }

    #[test]
    fn test_strip_token() {
        let mut format = "%N %b %e %I %e".to_string();
        strip_token(&mut format, "%e");
        assert_eq!(format, "%N %b  %I ");
        strip_token(&mut format, "%I");
        assert_eq!(format, "%N %b   ");
    }

    #[test]
    fn test_scanfds_finds_own_fds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracked");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        let fd = file.as_raw_fd();

        let mut template = State::new("pipemon");
        template.control.width = 80;
        template.control.height = 25;
        template.set_format(true, true, false, false, true, false, true, false, 0, None);

        let mut infos = Vec::new();
        let mut fd_to_idx = [-1i32; FD_LIMIT];
        watchpid_scanfds(
            &template,
            std::process::id() as i32,
            &mut infos,
            &mut fd_to_idx,
        )
        .expect("scan of our own process");

        let idx = fd_to_idx[fd as usize];
        assert!(idx >= 0, "our temp file's fd should have been found");
        let entry = &infos[idx as usize];
        assert_eq!(entry.fd, fd);
        assert_eq!(entry.size, 2048);
        let clone = entry.state.as_deref().expect("cloned state");
        assert_eq!(clone.control.size, 2048);
        assert!(clone.control.name.is_some());
    }
}
