// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Low-level terminal helpers used by the display and cursor layers.

use nix::errno::Errno;
use std::os::fd::RawFd;
use tracing::debug;

/// Standard error's raw descriptor, the terminal the display writes to.
pub const STDERR_FD: RawFd = libc::STDERR_FILENO;

/// Query the terminal size of standard error, returning `(width, height)`
/// in character cells, or `None` if standard error is not a terminal or
/// the ioctl failed.
pub fn screen_size() -> Option<(u32, u32)> {
    // Safety: isatty only inspects the descriptor.
    if unsafe { libc::isatty(STDERR_FD) } == 0 {
        return None;
    }

    let mut wsz = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // Safety: TIOCGWINSZ writes a winsize into the pointed-to struct.
    let rc = unsafe { libc::ioctl(STDERR_FD, libc::TIOCGWINSZ, &mut wsz) };
    if rc != 0 {
        debug!("TIOCGWINSZ failed: {}", Errno::last());
        return None;
    }
    Some((u32::from(wsz.ws_col), u32::from(wsz.ws_row)))
}

/// Return true if we are the foreground process group on the terminal, or
/// if standard error is not a terminal at all.
pub fn in_foreground() -> bool {
    // Safety: both calls only inspect process/terminal state.
    unsafe {
        if libc::isatty(STDERR_FD) == 0 {
            return true;
        }
        let tty_pgrp = libc::tcgetpgrp(STDERR_FD);
        if tty_pgrp == -1 {
            // No controlling terminal counts as foreground.
            return Errno::last() == Errno::ENOTTY;
        }
        tty_pgrp == libc::getpgrp()
    }
}

/// Write the whole buffer to the given descriptor, retrying on partial
/// writes and transient errors.  Any other error abandons the write; the
/// display stream is best-effort.
pub fn write_retry(fd: RawFd, buf: &[u8]) {
    let mut offset = 0;
    while offset < buf.len() {
        // Safety: the pointer/length pair stays within `buf`.
        let n = unsafe {
            libc::write(
                fd,
                buf[offset..].as_ptr() as *const libc::c_void,
                buf.len() - offset,
            )
        };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR | Errno::EAGAIN => continue,
                _ => return,
            }
        }
        if n == 0 {
            return;
        }
        offset += n as usize;
    }
}
