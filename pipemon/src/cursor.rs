// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cursor coordination between concurrent instances sharing a terminal.
//!
//! A System V shared memory segment, keyed off the TTY device, holds the
//! topmost row and a TOSTOP-added flag; each instance claims the next row
//! down by attach order.  All probing and row updates happen under a
//! record lock on the terminal itself, falling back to a lockfile under
//! /tmp on systems that refuse to lock a terminal.  When IPC is not
//! usable, a single instance probes its row once and advances one line so
//! a downstream instance starts somewhere else.

use crate::signals;
use crate::state::{Control, State};
use nix::errno::Errno;
use pmcommon::{term, units};
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering::SeqCst};
use tracing::debug;

/// The record shared between coordinated instances.
#[repr(C)]
pub struct CursorShared {
    /// Terminal row of the topmost instance.
    pub y_topmost: AtomicI32,
    /// Whether any instance had to set TOSTOP on the terminal.
    pub tty_tostop_added: AtomicBool,
}

/// Lockfile location for a terminal that cannot be locked directly.
fn lockfile_path(tty_path: &str, euid: u32) -> String {
    let base = tty_path.rsplit('/').next().unwrap_or(tty_path);
    format!("/tmp/pipemon-{base}-{euid}.lock")
}

/// Row number out of a CPR answerback (`ESC [ row ; col R`).
fn parse_cpr_row(response: &[u8]) -> i32 {
    if response.len() < 3 {
        return 0;
    }
    units::parse_count(&String::from_utf8_lossy(&response[2..])) as i32
}

/// Ask the terminal where the cursor is.  Must be called with the
/// terminal locked, since it temporarily switches off canonical mode and
/// echo while reading the answerback.
fn get_ypos(terminal_fd: RawFd) -> i32 {
    // Safety: zeroed termios structs are valid out-parameters.
    let mut tty: libc::termios = unsafe { std::mem::zeroed() };
    let mut old_tty: libc::termios = unsafe { std::mem::zeroed() };
    unsafe {
        if libc::tcgetattr(terminal_fd, &mut tty) != 0 {
            debug!("tcgetattr failed: {}", Errno::last());
        }
        if libc::tcgetattr(terminal_fd, &mut old_tty) != 0 {
            debug!("tcgetattr failed: {}", Errno::last());
        }
        tty.c_lflag &= !(libc::ICANON | libc::ECHO);
        if libc::tcsetattr(terminal_fd, libc::TCSAFLUSH, &tty) != 0 {
            debug!("tcsetattr failed: {}", Errno::last());
        }
    }

    term::write_retry(terminal_fd, b"\x1b[6n");

    let mut answer = [0u8; 32];
    let mut got = 0;
    while got < answer.len() - 2 {
        // Safety: one byte at a time into the remaining buffer space.
        let n = unsafe {
            libc::read(
                terminal_fd,
                answer[got..].as_mut_ptr() as *mut libc::c_void,
                1,
            )
        };
        if n <= 0 {
            debug!("CPR answerback read stopped: {}", Errno::last());
            break;
        }
        if answer[got] == b'R' {
            break;
        }
        got += 1;
    }

    let ypos = parse_cpr_row(&answer[..got]);

    // Safety: restoring the attributes read above.
    if unsafe { libc::tcsetattr(terminal_fd, libc::TCSAFLUSH, &old_tty) } != 0 {
        debug!("tcsetattr restore failed: {}", Errno::last());
    }

    ypos
}

/// The coordinator held by one instance.
pub struct CursorContext {
    shmid: i32,
    /// Instances currently attached to the shared segment, including us.
    pub attach_count: i32,
    /// Most instances ever seen attached at once.
    peak_count: i32,
    shared: *mut CursorShared,
    y_lastread: i32,
    y_offset: i32,
    /// Shared-memory coordination is unavailable; single-instance
    /// behaviour only.
    pub noipc: bool,
    /// Lockfile descriptor: -2 before the fallback has been tried, -1
    /// when unusable, otherwise open.
    lock_fd: RawFd,
    lock_path: String,
    y_start: i32,
}

impl CursorContext {
    fn disabled() -> CursorContext {
        CursorContext {
            shmid: -1,
            attach_count: 1,
            peak_count: 0,
            shared: std::ptr::null_mut(),
            y_lastread: 0,
            y_offset: 0,
            noipc: true,
            lock_fd: -2,
            lock_path: String::new(),
            y_start: 0,
        }
    }

    /// Initialise cursor coordination.  On any failure the context comes
    /// back inert and `control.cursor` is switched off, so the caller
    /// degrades to ordinary single-line output.
    pub fn init(state: &mut State) -> CursorContext {
        let mut ctx = CursorContext::disabled();
        if !state.control.cursor {
            return ctx;
        }

        // Safety: ttyname's static result is copied out immediately.
        let tty_path = unsafe {
            let name = libc::ttyname(term::STDERR_FD);
            if name.is_null() {
                debug!("ttyname failed - cursor positioning disabled");
                state.control.cursor = false;
                return ctx;
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        };

        let Ok(tty_cstr) = CString::new(tty_path.clone()) else {
            state.control.cursor = false;
            return ctx;
        };

        // Safety: opening the terminal read-write for probing.
        let terminal_fd = unsafe { libc::open(tty_cstr.as_ptr(), libc::O_RDWR) };
        if terminal_fd < 0 {
            state.report_error(format_args!(
                "failed to open terminal: {}: {}",
                tty_path,
                Errno::last()
            ));
            state.control.cursor = false;
            return ctx;
        }

        ctx.noipc = !ctx.ipc_init(&mut state.control, &tty_cstr, terminal_fd);
        if ctx.noipc {
            debug!("shared-memory init failed, coordinating without IPC");
        }

        if !ctx.noipc {
            signals::register_cursor_shared(ctx.shared);
            // If we had already set TOSTOP before attaching, tell the
            // other instances so the last one out clears it.
            if signals::tostop_added() && !ctx.shared.is_null() {
                // Safety: shared stays mapped until fini().
                unsafe { (*ctx.shared).tty_tostop_added.store(true, SeqCst) };
            }
        } else if state.control.cursor {
            // No IPC: probe the row once and move down a line while the
            // terminal is locked, so a downstream instance starts on a
            // different row.
            ctx.lock(&mut state.control, terminal_fd);
            ctx.y_start = get_ypos(terminal_fd);
            if ctx.y_start > 0 {
                term::write_retry(term::STDERR_FD, b"\n");
            }
            ctx.unlock(terminal_fd);

            if ctx.y_start < 1 {
                state.control.cursor = false;
            }
        }

        // Safety: closing the probe descriptor.
        unsafe { libc::close(terminal_fd) };
        ctx
    }

    /// Attach to (or create) the shared segment for this terminal.  The
    /// terminal lock is held across the attach-count check and the
    /// initialisation so two instances cannot both conclude they are
    /// first.
    fn ipc_init(&mut self, control: &mut Control, tty_cstr: &CStr, terminal_fd: RawFd) -> bool {
        // Safety: ftok only inspects the path.
        let key = unsafe { libc::ftok(tty_cstr.as_ptr(), 'p' as libc::c_int) };
        if key == -1 {
            debug!("ftok failed: {}", Errno::last());
            return false;
        }

        self.lock(control, terminal_fd);
        if !control.cursor {
            debug!("cursor positioning was disabled while acquiring the lock");
            return false;
        }

        // Safety: allocating or finding a segment of the shared record's
        // size.
        self.shmid = unsafe {
            libc::shmget(
                key,
                std::mem::size_of::<CursorShared>(),
                0o600 | libc::IPC_CREAT,
            )
        };
        if self.shmid < 0 {
            debug!("shmget failed: {}", Errno::last());
            self.unlock(terminal_fd);
            return false;
        }

        // Safety: attaching the segment just created or found.
        let mapped = unsafe { libc::shmat(self.shmid, std::ptr::null(), 0) };
        if mapped as isize == -1 {
            debug!("shmat failed: {}", Errno::last());
            self.unlock(terminal_fd);
            return false;
        }
        self.shared = mapped as *mut CursorShared;

        self.refresh_attach_count();

        if self.attach_count < 2 {
            // We are the first: seed the shared record from a cursor
            // probe.
            self.y_start = get_ypos(terminal_fd);
            // Safety: shared was successfully attached above.
            unsafe {
                (*self.shared).y_topmost.store(self.y_start, SeqCst);
                (*self.shared).tty_tostop_added.store(false, SeqCst);
            }
            self.y_lastread = self.y_start;
        }

        self.y_offset = (self.attach_count - 1).max(0);

        if self.attach_count > 1 {
            // Safety: as above.
            self.y_start = unsafe { (*self.shared).y_topmost.load(SeqCst) };
            self.y_lastread = self.y_start;
        }

        self.unlock(terminal_fd);
        true
    }

    /// Update the attach count (and its peak) from the kernel's segment
    /// statistics.
    fn refresh_attach_count(&mut self) {
        if self.shmid < 0 {
            return;
        }
        // Safety: zeroed shmid_ds is a valid out-parameter for IPC_STAT.
        let mut stats: libc::shmid_ds = unsafe { std::mem::zeroed() };
        // Safety: IPC_STAT fills the struct.
        if unsafe { libc::shmctl(self.shmid, libc::IPC_STAT, &mut stats) } == 0 {
            self.attach_count = stats.shm_nattch as i32;
            if self.attach_count > self.peak_count {
                self.peak_count = self.attach_count;
            }
        }
    }

    fn open_lockfile(&mut self, control: &mut Control, terminal_fd: RawFd) {
        self.lock_fd = -1;

        // Safety: as in init(); the name is only used to build the path.
        let tty_path = unsafe {
            let name = libc::ttyname(terminal_fd);
            if name.is_null() {
                if !control.force {
                    eprintln!("pipemon: failed to get terminal name: {}", Errno::last());
                }
                control.cursor = false;
                return;
            }
            CStr::from_ptr(name).to_string_lossy().into_owned()
        };

        // Safety: geteuid cannot fail.
        self.lock_path = lockfile_path(&tty_path, unsafe { libc::geteuid() });
        let Ok(lock_cstr) = CString::new(self.lock_path.clone()) else {
            control.cursor = false;
            return;
        };

        // Safety: exclusive-follow-free open of our own lockfile path.
        self.lock_fd = unsafe {
            libc::open(
                lock_cstr.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_NOFOLLOW,
                0o600 as libc::c_uint,
            )
        };
        if self.lock_fd < 0 {
            eprintln!(
                "pipemon: {}: failed to open lock file: {}",
                self.lock_path,
                Errno::last()
            );
            control.cursor = false;
        }
    }

    /// Take the terminal lock (or the lockfile fallback).
    fn lock(&mut self, control: &mut Control, terminal_fd: RawFd) {
        let mut lock_fd = if self.lock_fd >= 0 {
            self.lock_fd
        } else {
            terminal_fd
        };

        loop {
            // Safety: zeroed flock then explicit fields; a write lock on
            // byte 0.
            let mut fl: libc::flock = unsafe { std::mem::zeroed() };
            fl.l_type = libc::F_WRLCK as libc::c_short;
            fl.l_whence = libc::SEEK_SET as libc::c_short;
            fl.l_start = 0;
            fl.l_len = 1;

            // Safety: locking a descriptor we own.
            if unsafe { libc::fcntl(lock_fd, libc::F_SETLKW, &fl) } >= 0 {
                return;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    if self.lock_fd == -2 {
                        // The terminal itself cannot be locked; fall back
                        // to the lockfile.
                        self.open_lockfile(control, terminal_fd);
                        if self.lock_fd >= 0 {
                            lock_fd = self.lock_fd;
                        }
                    } else {
                        eprintln!("pipemon: lock attempt failed: {errno}");
                        return;
                    }
                }
            }
        }
    }

    fn unlock(&mut self, terminal_fd: RawFd) {
        let lock_fd = if self.lock_fd >= 0 {
            self.lock_fd
        } else {
            terminal_fd
        };

        // Safety: as in lock(), releasing the byte-0 lock.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_UNLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 1;
        // Safety: unlocking a descriptor we own.
        unsafe { libc::fcntl(lock_fd, libc::F_SETLK, &fl) };
    }

    /// Re-acquire our row after the process was stopped and continued.
    fn reinit(&mut self, control: &mut Control) {
        debug!("cursor reinit");
        self.lock(control, term::STDERR_FD);

        signals::cursor_reinit_step();
        if self.y_offset < 1 {
            signals::cursor_reinit_clear();
        }
        if signals::cursor_reinit_pending() > 0 {
            self.unlock(term::STDERR_FD);
            return;
        }

        self.y_start = get_ypos(term::STDERR_FD);
        if self.y_offset < 1 && !self.shared.is_null() {
            // Safety: shared stays mapped until fini().
            unsafe { (*self.shared).y_topmost.store(self.y_start, SeqCst) };
        }
        self.y_lastread = self.y_start;

        self.unlock(term::STDERR_FD);
    }

    /// Emit one display line on our assigned row.
    pub fn update(&mut self, control: &mut Control, line: &str) {
        if !self.noipc {
            if signals::cursor_reinit_pending() > 0 {
                self.reinit(control);
            }

            self.refresh_attach_count();
            if !self.shared.is_null() {
                // Safety: shared stays mapped until fini().
                let topmost = unsafe { (*self.shared).y_topmost.load(SeqCst) };
                if self.y_lastread != topmost {
                    self.y_start = topmost;
                    self.y_lastread = topmost;
                }
            }

            if signals::cursor_reinit_pending() > 0 {
                return;
            }
        }

        let mut y = self.y_start;

        if !self.noipc && self.y_start + self.peak_count > control.height as i32 {
            // The block of instances would run off the bottom: shift our
            // top row up, and physically scroll if we own the top.
            let mut offset = self.y_start + self.peak_count - control.height as i32;
            self.y_start = (self.y_start - offset).max(1);

            if self.y_offset == 0 {
                self.lock(control, term::STDERR_FD);
                let cup = format!("\x1b[{};1H", control.height);
                term::write_retry(term::STDERR_FD, cup.as_bytes());
                while offset > 0 {
                    term::write_retry(term::STDERR_FD, b"\n");
                    offset -= 1;
                }
                self.unlock(term::STDERR_FD);
                debug!("scrolled screen as the top instance");
            }
        }

        if !self.noipc {
            y = self.y_start + self.y_offset;
        }

        if !(1..=999_999).contains(&y) {
            y = 1;
        }

        self.lock(control, term::STDERR_FD);
        let cup = format!("\x1b[{y};1H");
        term::write_retry(term::STDERR_FD, cup.as_bytes());
        term::write_retry(term::STDERR_FD, line.as_bytes());
        self.unlock(term::STDERR_FD);
    }

    /// Park the cursor under the block of instances, detach, and clean up
    /// the segment and lockfile if we are the last one out.
    pub fn fini(&mut self, control: &mut Control) {
        let mut y = self.y_start;
        if self.peak_count > 0 && !self.noipc {
            y += self.peak_count - 1;
        }
        y = y.min(control.height as i32);
        if !(1..=999_999).contains(&y) {
            y = 1;
        }

        self.lock(control, term::STDERR_FD);

        let cup = format!("\x1b[{y};1H\n");
        term::write_retry(term::STDERR_FD, cup.as_bytes());

        if !self.noipc && !self.shared.is_null() {
            // Safety: shared is still mapped here.
            unsafe {
                // Adopt any other instance's TOSTOP responsibility so the
                // shutdown path knows to clear the attribute.
                if (*self.shared).tty_tostop_added.load(SeqCst) {
                    signals::set_tostop_added(true);
                }
            }

            self.refresh_attach_count();
            signals::unregister_cursor_shared();
            // Safety: detaching the mapping made in ipc_init().
            unsafe { libc::shmdt(self.shared as *const libc::c_void) };
            self.shared = std::ptr::null_mut();

            if self.attach_count < 2 {
                // Last instance out removes the segment.
                // Safety: removing the segment we attached.
                let mut stats: libc::shmid_ds = unsafe { std::mem::zeroed() };
                unsafe { libc::shmctl(self.shmid, libc::IPC_RMID, &mut stats) };
            }
        }

        self.unlock(term::STDERR_FD);

        if self.lock_fd >= 0 {
            // Safety: closing our lockfile descriptor.
            unsafe { libc::close(self.lock_fd) };
            self.lock_fd = -1;
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

impl std::fmt::Debug for CursorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorContext")
            .field("shmid", &self.shmid)
            .field("attach_count", &self.attach_count)
            .field("peak_count", &self.peak_count)
            .field("noipc", &self.noipc)
            .field("y_start", &self.y_start)
            .field("y_offset", &self.y_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lockfile_path_uses_basename_and_euid() {
        assert_eq!(
            lockfile_path("/dev/pts/3", 1000),
            "/tmp/pipemon-3-1000.lock"
        );
        assert_eq!(
            lockfile_path("/dev/tty1", 0),
            "/tmp/pipemon-tty1-0.lock"
        );
    }

    #[test]
    fn test_parse_cpr_row() {
        assert_eq!(parse_cpr_row(b"\x1b[24;80R"), 24);
        assert_eq!(parse_cpr_row(b"\x1b[1;1R"), 1);
        assert_eq!(parse_cpr_row(b"\x1b["), 0);
        assert_eq!(parse_cpr_row(b""), 0);
    }

    #[test]
    fn test_disabled_context_is_inert() {
        let mut state = State::new("pipemon");
        state.control.cursor = false;
        let ctx = CursorContext::init(&mut state);
        assert!(ctx.noipc);
        assert!(ctx.shared.is_null());
        assert_eq!(ctx.attach_count, 1);
    }
}
