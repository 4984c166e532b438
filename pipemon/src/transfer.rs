// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The transfer engine: one bounded read/write iteration over a
//! page-aligned buffer, with optional in-kernel zero-copy, error skipping,
//! line-aligned writes and rate-limit budgets applied by the caller.

use crate::display::Component;
use crate::error::{exit, TransferError};
use crate::files;
use crate::state::State;
use crate::{
    BUFFER_SIZE, LASTOUTPUT_MAX, MAX_READ_AT_ONCE, MAX_WRITE_AT_ONCE, TRANSFER_READ_TIMEOUT,
    TRANSFER_WRITE_TIMEOUT,
};
use nix::errno::Errno;
use pmcommon::clock;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::fd::RawFd;
use std::ptr::NonNull;
use tracing::debug;

/// A page-aligned allocation for the transfer buffer.  Alignment matters
/// for O_DIRECT; because an aligned block cannot be reallocated in place,
/// growth happens by allocate-copy-free in [`TransferState::ensure_buffer`].
struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuffer {
    fn new(size: usize) -> Option<AlignedBuffer> {
        let align = page_size::get().max(4096);
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        // Safety: layout has nonzero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)?;
        Some(AlignedBuffer { ptr, layout })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the allocation is layout.size() bytes and uniquely owned.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_slice(&self) -> &[u8] {
        // Safety: as above.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Safety: allocated with exactly this layout in new().
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Per-process transfer state: the buffer with its read (fill) and write
/// (drain) cursors, error-skip bookkeeping for the current input, and the
/// zero-copy poisoning record.
#[derive(Debug)]
pub struct TransferState {
    buffer: Option<AlignedBuffer>,
    /// Usable size of the buffer.
    pub buffer_size: usize,
    /// Offset data has been read up to.
    pub read_position: usize,
    /// Offset data has been written out up to; never exceeds
    /// `read_position`.
    pub write_position: usize,
    /// Input fd the error-skip counters apply to; every input file is
    /// treated independently.
    last_read_skip_fd: RawFd,
    read_errors_in_a_row: u64,
    read_error_warning_shown: bool,
    /// Input fd on which the zero-copy syscall returned EINVAL; never
    /// retried for that fd.
    splice_failed_fd: RawFd,
    /// Whether zero-copy moved this iteration's data.
    pub splice_used: bool,
    /// Bytes this iteration may write, after budget clamps.
    to_write: usize,
    /// Bytes moved to the output by the current iteration.
    written: i64,
    /// Where the payload goes; standard output in normal operation.
    pub output_fd: RawFd,
}

impl TransferState {
    pub fn new() -> Self {
        TransferState {
            buffer: None,
            buffer_size: 0,
            read_position: 0,
            write_position: 0,
            last_read_skip_fd: -1,
            read_errors_in_a_row: 0,
            read_error_warning_shown: false,
            splice_failed_fd: -1,
            splice_used: false,
            to_write: 0,
            written: 0,
            output_fd: libc::STDOUT_FILENO,
        }
    }
}

impl Default for TransferState {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait up to `timeout_ms` for readability of `fd_in` and/or writability
/// of `fd_out`.  Returns the readiness pair.
fn is_data_ready(
    fd_in: Option<RawFd>,
    fd_out: Option<RawFd>,
    timeout_ms: i32,
) -> Result<(bool, bool), Errno> {
    let mut fds = [
        libc::pollfd {
            fd: fd_in.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: fd_out.unwrap_or(-1),
            events: libc::POLLOUT,
            revents: 0,
        },
    ];

    // Safety: fds points at two valid pollfd structs.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(Errno::last());
    }

    // Error and hangup conditions count as ready so the following read or
    // write can surface the real result (EOF, EPIPE, ...).
    let in_ready =
        fds[0].fd >= 0 && (fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)) != 0;
    let out_ready =
        fds[1].fd >= 0 && (fds[1].revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR)) != 0;
    Ok((in_ready, out_ready))
}

/// Sleep briefly after a transient error so a tight retry loop cannot spin.
fn transient_wait() {
    let _ = is_data_ready(None, None, 10);
}

/// Read into `buf`, retrying partial reads while more data is immediately
/// available, for at most [`TRANSFER_READ_TIMEOUT`] of wall time.  Any
/// read error is returned as-is, even after partial progress, matching the
/// engine's per-iteration error accounting.
fn read_repeated(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let start = clock::read();
    let mut total = 0;

    while total < buf.len() {
        let want = (buf.len() - total).min(MAX_READ_AT_ONCE);
        // Safety: the pointer/length pair stays within `buf`.
        let n = unsafe {
            libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                want,
            )
        };
        if n < 0 {
            return Err(Errno::last());
        }
        if n == 0 {
            return Ok(total);
        }
        total += n as usize;

        if clock::read().saturating_sub(start) > TRANSFER_READ_TIMEOUT {
            debug!(fd, "stopping read - timer expired");
            return Ok(total);
        }

        if total < buf.len() {
            match is_data_ready(Some(fd), None, 0) {
                Ok((true, _)) => continue,
                _ => break,
            }
        }
    }

    Ok(total)
}

/// Write `buf`, retrying partial writes for at most
/// [`TRANSFER_WRITE_TIMEOUT`] of wall time.  With `sync_after_write`, the
/// output is fdatasync'd after each write and only EIO counts as failure.
/// A transient EINTR/EAGAIN returns the bytes written so far.
fn write_repeated(fd: RawFd, buf: &[u8], sync_after_write: bool) -> Result<usize, Errno> {
    let start = clock::read();
    let mut total = 0;

    while total < buf.len() {
        let want = (buf.len() - total).min(MAX_WRITE_AT_ONCE);
        // Safety: the pointer/length pair stays within `buf`.
        let n = unsafe {
            libc::write(
                fd,
                buf[total..].as_ptr() as *const libc::c_void,
                want,
            )
        };

        if sync_after_write && n >= 0 {
            // Ignore non-IO sync errors such as EINVAL on a pipe; only
            // EIO is a real write failure.
            // Safety: fd is a valid descriptor.
            if unsafe { libc::fdatasync(fd) } < 0 && Errno::last() == Errno::EIO {
                return Err(Errno::EIO);
            }
        }

        if n < 0 {
            let errno = Errno::last();
            return match errno {
                // Probably our alarm; hand back what got through.
                Errno::EINTR | Errno::EAGAIN => Ok(total),
                _ => Err(errno),
            };
        }
        if n == 0 {
            return Ok(total);
        }
        total += n as usize;

        if clock::read().saturating_sub(start) > TRANSFER_WRITE_TIMEOUT {
            debug!(fd, "stopping write - timer expired");
            return Ok(total);
        }
    }

    Ok(total)
}

#[cfg(target_os = "linux")]
fn apply_direct_io(fd: RawFd, enable: bool) {
    // Safety: F_GETFL/F_SETFL only manipulate descriptor flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        let wanted = if enable { libc::O_DIRECT } else { 0 };
        if libc::fcntl(fd, libc::F_SETFL, wanted | flags) != 0 {
            debug!(fd, "fcntl: {}", Errno::last());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_direct_io(_fd: RawFd, _enable: bool) {}

/// Skip distance for consecutive read errors when no fixed block size was
/// configured: five single bytes, five pairs, then doubling up to 512.
fn adaptive_skip_amount(errors_in_a_row: u64) -> u64 {
    if errors_in_a_row < 10 {
        if errors_in_a_row < 5 {
            1
        } else {
            2
        }
    } else if errors_in_a_row < 20 {
        1u64 << (errors_in_a_row - 10)
    } else {
        512
    }
}

/// Outcome of the read or write half of an iteration: `Done` feeds the
/// iteration result, `Transient` makes the whole iteration report zero
/// progress.
enum Phase {
    Done,
    Transient,
}

fn transfer_read(
    state: &mut State,
    fd: RawFd,
    eof_in: &mut bool,
    eof_out: &mut bool,
    allowed: u64,
) -> Phase {
    let mut do_not_skip_errors = state.control.skip_errors == 0;
    let bytes_can_read = state.transfer.buffer_size - state.transfer.read_position;

    // Ok(n) is a byte count; Err is the errno of a failed read.
    let mut nread: Result<usize, Errno> = Ok(0);

    state.transfer.splice_used = false;
    #[cfg(target_os = "linux")]
    if !state.control.linemode
        && !state.control.no_splice
        && fd != state.transfer.splice_failed_fd
        && state.transfer.to_write == 0
    {
        let bytes_to_splice = if state.control.rate_limit > 0 || allowed != 0 {
            allowed as usize
        } else {
            bytes_can_read
        };

        state.transfer.splice_used = true;
        // Safety: both descriptors are live; null offsets use the file
        // positions.
        let spliced = unsafe {
            libc::splice(
                fd,
                std::ptr::null_mut(),
                state.transfer.output_fd,
                std::ptr::null_mut(),
                bytes_to_splice,
                libc::SPLICE_F_MORE,
            )
        };
        if spliced < 0 && Errno::last() == Errno::EINVAL {
            debug!(fd, "zero-copy failed with EINVAL - disabling for this fd");
            state.transfer.splice_failed_fd = fd;
            state.transfer.splice_used = false;
            // Fall through to an ordinary read.
        } else if spliced > 0 {
            nread = Ok(spliced as usize);
            state.transfer.written = spliced as i64;
            if state.control.sync_after_write {
                // A sync failure here is a write error, which error
                // skipping cannot help with.
                // Safety: output_fd is a valid descriptor.
                if unsafe { libc::fdatasync(state.transfer.output_fd) } < 0
                    && Errno::last() == Errno::EIO
                {
                    nread = Err(Errno::EIO);
                    do_not_skip_errors = true;
                }
            }
        } else if spliced < 0 && Errno::last() == Errno::EAGAIN {
            // Nothing moved yet; treated as a transient error below.
            nread = Err(Errno::EAGAIN);
        } else {
            // A zero result here is not necessarily end of file; let an
            // ordinary read decide.
            state.transfer.splice_used = false;
        }
    }

    if !state.transfer.splice_used {
        let read_position = state.transfer.read_position;
        let buffer = state
            .transfer
            .buffer
            .as_mut()
            .map(|b| &mut b.as_mut_slice()[read_position..read_position + bytes_can_read]);
        nread = match buffer {
            Some(window) => read_repeated(fd, window),
            None => Ok(0),
        };
    }

    match nread {
        Ok(0) => {
            // End of this input file; if the buffer has drained too, the
            // output side is finished with it as well.
            *eof_in = true;
            if state.transfer.write_position >= state.transfer.read_position {
                *eof_out = true;
            }
            Phase::Done
        }
        Ok(n) => {
            state.transfer.read_errors_in_a_row = 0;
            // Zero-copy leaves nothing in the buffer.
            if !state.transfer.splice_used {
                state.transfer.read_position += n;
            }
            Phase::Done
        }
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {
            transient_wait();
            Phase::Transient
        }
        Err(errno) => {
            state.status.exit_status |= exit::TRANSFER_ERROR;
            state.transfer.read_errors_in_a_row += 1;

            if do_not_skip_errors {
                state.report_error(format_args!(
                    "{}: read failed: {}",
                    files::current_file_name(state),
                    errno
                ));
                *eof_in = true;
                if state.transfer.write_position >= state.transfer.read_position {
                    *eof_out = true;
                }
                return Phase::Done;
            }

            if !state.transfer.read_error_warning_shown {
                state.report_error(format_args!(
                    "{}: warning: read errors detected: {}",
                    files::current_file_name(state),
                    errno
                ));
                state.transfer.read_error_warning_shown = true;
            }

            // Safety: querying the file position only.
            let orig_offset = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
            if orig_offset < 0 {
                state.report_error(format_args!(
                    "{}: file is not seekable: {}",
                    files::current_file_name(state),
                    Errno::last()
                ));
                *eof_in = true;
                if state.transfer.write_position >= state.transfer.read_position {
                    *eof_out = true;
                }
                return Phase::Done;
            }

            let mut amount_to_skip: i64 = if state.control.error_skip_block > 0 {
                state.control.error_skip_block as i64
            } else {
                adaptive_skip_amount(state.transfer.read_errors_in_a_row) as i64
            };

            // Round the target down to the start of the next block of the
            // skip size, so a 512-byte skip from offset 257 lands on 512
            // rather than 769.
            if amount_to_skip > 1 {
                let mut skip_offset = orig_offset + amount_to_skip;
                skip_offset -= skip_offset % amount_to_skip;
                if skip_offset > orig_offset {
                    amount_to_skip = skip_offset - orig_offset;
                }
            }

            if amount_to_skip > bytes_can_read as i64 {
                amount_to_skip = bytes_can_read as i64;
            }

            // Safety: seeking only.
            let mut skip_offset =
                unsafe { libc::lseek(fd, orig_offset + amount_to_skip, libc::SEEK_SET) };
            if skip_offset < 0 {
                // Possibly just past end of file; retry with a single
                // byte before giving up.
                amount_to_skip = 1;
                skip_offset =
                    unsafe { libc::lseek(fd, orig_offset + amount_to_skip, libc::SEEK_SET) };
            }

            let amount_skipped = if skip_offset < 0 {
                *eof_in = true;
                // EINVAL here means we tried to seek past the end, which
                // is just the end of the file; anything else is worth a
                // report.
                if Errno::last() != Errno::EINVAL {
                    state.report_error(format_args!(
                        "{}: failed to seek past error: {}",
                        files::current_file_name(state),
                        Errno::last()
                    ));
                }
                -1
            } else {
                skip_offset - orig_offset
            };

            if amount_skipped > 0 {
                let read_position = state.transfer.read_position;
                if let Some(buffer) = state.transfer.buffer.as_mut() {
                    buffer.as_mut_slice()[read_position..read_position + amount_skipped as usize]
                        .fill(0);
                }
                state.transfer.read_position += amount_skipped as usize;
                if state.control.skip_errors < 2 {
                    state.report_error(format_args!(
                        "{}: skipped past read error: {} - {} ({} B)",
                        files::current_file_name(state),
                        orig_offset,
                        skip_offset,
                        amount_skipped
                    ));
                }
            } else {
                *eof_in = true;
                if state.transfer.write_position >= state.transfer.read_position {
                    *eof_out = true;
                }
            }

            Phase::Done
        }
    }
}

fn transfer_write(
    state: &mut State,
    eof_in: &mut bool,
    eof_out: &mut bool,
    lines_written: &mut u64,
) -> Result<Phase, TransferError> {
    if state.transfer.buffer.is_none() {
        state.report_error(format_args!("no transfer buffer allocated"));
        state.status.exit_status |= exit::ALLOCATION_ERROR;
        *eof_out = true;
        state.transfer.written = -1;
        return Err(TransferError::Allocation);
    }

    let to_write = state.transfer.to_write;
    let result: Result<usize, Errno> = if state.control.discard_input {
        Ok(to_write)
    } else {
        // A one-second alarm guarantees the write cannot wedge the loop;
        // the burst timeout inside write_repeated is the working bound.
        // Safety: installing SIG_IGN and arming/disarming an alarm.
        unsafe {
            if libc::signal(libc::SIGALRM, libc::SIG_IGN) == libc::SIG_ERR {
                state.report_error(format_args!(
                    "failed to set alarm signal handler: {}",
                    Errno::last()
                ));
            } else {
                libc::alarm(1);
            }
        }
        let window = {
            let start = state.transfer.write_position;
            let buffer = state.transfer.buffer.as_ref();
            buffer.map(|b| &b.as_slice()[start..start + to_write])
        };
        let r = match window {
            Some(w) => write_repeated(
                state.transfer.output_fd,
                w,
                state.control.sync_after_write,
            ),
            None => Ok(0),
        };
        // Safety: disarming the alarm.
        unsafe { libc::alarm(0) };
        r
    };

    match result {
        Ok(0) => {
            // End of file on the output side.
            *eof_out = true;
            Ok(Phase::Done)
        }
        Ok(n) => {
            if state.control.linemode {
                let separator = if state.control.null_terminated_lines {
                    b'\0'
                } else {
                    b'\n'
                };
                let start = state.transfer.write_position;
                if let Some(buffer) = state.transfer.buffer.as_ref() {
                    let written = &buffer.as_slice()[start..start + n];
                    *lines_written += written.iter().filter(|&&b| b == separator).count() as u64;
                }
            }

            state.transfer.write_position += n;
            state.transfer.written += n as i64;

            if state.display.requires(Component::OutputBuf) {
                let end = state.transfer.write_position;
                let copy_len = n.min(LASTOUTPUT_MAX);
                let tail: Option<Vec<u8>> = state
                    .transfer
                    .buffer
                    .as_ref()
                    .map(|b| b.as_slice()[end - copy_len..end].to_vec());
                if let Some(tail) = tail {
                    state.display.record_output(&tail);
                }
            }

            // Fully drained: both cursors go back to the start, and if the
            // input has ended this file is completely done.
            if state.transfer.write_position >= state.transfer.read_position {
                state.transfer.write_position = 0;
                state.transfer.read_position = 0;
                if *eof_in {
                    *eof_out = true;
                }
            }
            Ok(Phase::Done)
        }
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => {
            transient_wait();
            Ok(Phase::Transient)
        }
        Err(Errno::EPIPE) => {
            // Downstream closed; that is their business, not an error of
            // ours.
            *eof_in = true;
            *eof_out = true;
            Ok(Phase::Transient)
        }
        Err(errno) => {
            state.report_error(format_args!("write failed: {errno}"));
            state.status.exit_status |= exit::TRANSFER_ERROR;
            *eof_out = true;
            state.transfer.written = -1;
            Err(TransferError::Write(errno))
        }
    }
}

/// Run one transfer iteration: wait up to 90 ms for readiness, move at
/// most `allowed` bytes (0 means unlimited unless rate limiting is on),
/// and return the bytes moved.  `eof_in`/`eof_out` flag the end of the
/// input and of the buffered output.  In line mode `lines_written`
/// receives the separators written this iteration.
pub fn transfer(
    state: &mut State,
    fd: RawFd,
    eof_in: &mut bool,
    eof_out: &mut bool,
    allowed: u64,
    lines_written: &mut u64,
) -> Result<i64, TransferError> {
    // Apply a direct-I/O change to both sides before anything else.
    if state.control.direct_io_changed {
        if !*eof_in {
            apply_direct_io(fd, state.control.direct_io);
        }
        if !*eof_out {
            apply_direct_io(state.transfer.output_fd, state.control.direct_io);
        }
        state.control.direct_io_changed = false;
    }

    // A new input file gets fresh error-skip accounting.
    if fd != state.transfer.last_read_skip_fd {
        state.transfer.last_read_skip_fd = fd;
        state.transfer.read_errors_in_a_row = 0;
        state.transfer.read_error_warning_shown = false;
    }

    let target = if state.control.target_buffer_size > 0 {
        state.control.target_buffer_size
    } else {
        BUFFER_SIZE
    };

    if state.transfer.buffer.is_none() {
        match AlignedBuffer::new(target + 32) {
            Some(buffer) => {
                state.transfer.buffer = Some(buffer);
                state.transfer.buffer_size = target;
            }
            None => {
                state.report_error(format_args!("buffer allocation failed"));
                state.status.exit_status |= exit::ALLOCATION_ERROR;
                return Err(TransferError::Allocation);
            }
        }
    } else if state.transfer.buffer_size < target {
        // Grow by allocate-copy-free; alignment rules out realloc.
        match AlignedBuffer::new(target + 32) {
            Some(mut grown) => {
                let old_size = state.transfer.buffer_size;
                if let Some(old) = state.transfer.buffer.as_ref() {
                    grown.as_mut_slice()[..old_size].copy_from_slice(&old.as_slice()[..old_size]);
                }
                state.transfer.buffer = Some(grown);
                state.transfer.buffer_size = target;
                debug!(target, "transfer buffer resized");
            }
            None => {
                // Pin the target back so we do not retry every iteration.
                state.control.target_buffer_size = state.transfer.buffer_size;
            }
        }
    }

    if state.control.linemode {
        *lines_written = 0;
    }

    if *eof_in && *eof_out {
        return Ok(0);
    }

    let check_read = if !*eof_in && state.transfer.read_position < state.transfer.buffer_size {
        Some(fd)
    } else {
        None
    };

    // The write budget: what is pending in the buffer, clamped by the
    // caller's allowance when rate limiting or stop-at-size applies.
    let mut to_write = state.transfer.read_position - state.transfer.write_position;
    if (state.control.rate_limit > 0 || allowed > 0) && to_write as u64 > allowed {
        to_write = allowed as usize;
    }
    state.transfer.to_write = to_write;

    let check_write = if !*eof_out && to_write > 0 {
        Some(state.transfer.output_fd)
    } else {
        None
    };

    let (ready_read, ready_write) = match is_data_ready(check_read, check_write, 90) {
        Ok(ready) => ready,
        Err(Errno::EINTR) => return Ok(0),
        Err(errno) => {
            state.report_error(format_args!(
                "{}: select call failed: {}",
                files::current_file_name(state),
                errno
            ));
            state.status.exit_status |= exit::TRANSFER_ERROR;
            return Err(TransferError::Poll(errno));
        }
    };

    state.transfer.written = 0;

    if ready_read {
        if let Phase::Transient = transfer_read(state, fd, eof_in, eof_out, allowed) {
            return Ok(0);
        }
    }

    // In line mode, cut the pending write at the last separator so output
    // stays record-aligned.
    if state.transfer.to_write > 0 && state.control.linemode && !state.control.null_terminated_lines
    {
        let start = state.transfer.write_position;
        let end = start + state.transfer.to_write;
        if let Some(buffer) = state.transfer.buffer.as_ref() {
            let pending = &buffer.as_slice()[start..end];
            if let Some(pos) = pending.iter().rposition(|&b| b == b'\n') {
                state.transfer.to_write = pos + 1;
            }
        }
    }

    if ready_write
        && !state.transfer.splice_used
        && state.transfer.read_position > state.transfer.write_position
        && state.transfer.to_write > 0
    {
        if let Phase::Transient = transfer_write(state, eof_in, eof_out, lines_written)? {
            return Ok(0);
        }
    }

    // Rotate unwritten bytes down to the start so the next read can fill
    // the whole buffer.
    if state.transfer.write_position > 0 {
        if state.transfer.write_position < state.transfer.read_position {
            let (start, end) = (state.transfer.write_position, state.transfer.read_position);
            if let Some(buffer) = state.transfer.buffer.as_mut() {
                buffer.as_mut_slice().copy_within(start..end, 0);
            }
            state.transfer.read_position -= state.transfer.write_position;
            state.transfer.write_position = 0;
        } else {
            state.transfer.write_position = 0;
            state.transfer.read_position = 0;
        }
    }

    Ok(state.transfer.written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use nix::unistd::pipe;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn drive_to_completion(state: &mut State, in_fd: RawFd) -> u64 {
        let mut eof_in = false;
        let mut eof_out = false;
        let mut lines = 0u64;
        let mut total_lines = 0u64;
        while !(eof_in && eof_out) {
            transfer(state, in_fd, &mut eof_in, &mut eof_out, 0, &mut lines)
                .expect("transfer failed");
            total_lines += lines;
        }
        total_lines
    }

    fn state_with_pipe_output() -> (State, std::fs::File) {
        let (rd, wr) = pipe().unwrap();
        let mut state = State::new("pipemon");
        state.control.no_splice = true;
        state.control.target_buffer_size = 4096;
        state.transfer.output_fd = wr.into_raw_fd();
        (state, std::fs::File::from(rd))
    }

    #[test]
    fn test_byte_stream_identity() {
        let payload: Vec<u8> = (0u32..20_000).map(|v| (v % 251) as u8).collect();
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(&payload).unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        let (mut state, mut out_read) = state_with_pipe_output();

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got
        });

        drive_to_completion(&mut state, input.as_raw_fd());
        // Safety: the fd was moved out of an OwnedFd in the helper.
        unsafe { libc::close(state.transfer.output_fd) };

        let got = reader.join().unwrap();
        assert_eq!(got, payload);
        assert_eq!(state.status.exit_status, 0);
    }

    #[test]
    fn test_positions_within_bounds_and_reset_after_drain() {
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(&[7u8; 1000]).unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        let (mut state, mut out_read) = state_with_pipe_output();
        let reader = std::thread::spawn(move || {
            let mut sink = Vec::new();
            out_read.read_to_end(&mut sink).unwrap();
            sink.len()
        });

        let mut eof_in = false;
        let mut eof_out = false;
        let mut lines = 0u64;
        while !(eof_in && eof_out) {
            transfer(
                &mut state,
                input.as_raw_fd(),
                &mut eof_in,
                &mut eof_out,
                0,
                &mut lines,
            )
            .unwrap();
            assert!(state.transfer.write_position <= state.transfer.read_position);
            assert!(state.transfer.read_position <= state.transfer.buffer_size);
        }
        assert_eq!(state.transfer.read_position, 0);
        assert_eq!(state.transfer.write_position, 0);

        unsafe { libc::close(state.transfer.output_fd) };
        assert_eq!(reader.join().unwrap(), 1000);
    }

    #[test]
    fn test_line_mode_counts_lines() {
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(b"one\ntwo\nthree\n").unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        let (mut state, mut out_read) = state_with_pipe_output();
        state.control.linemode = true;

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got
        });

        let total_lines = drive_to_completion(&mut state, input.as_raw_fd());
        unsafe { libc::close(state.transfer.output_fd) };

        assert_eq!(reader.join().unwrap(), b"one\ntwo\nthree\n");
        assert_eq!(total_lines, 3);
    }

    #[test]
    fn test_null_terminated_line_mode() {
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(b"a\0b\0c").unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        let (mut state, mut out_read) = state_with_pipe_output();
        state.control.linemode = true;
        state.control.null_terminated_lines = true;

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got
        });

        let total_lines = drive_to_completion(&mut state, input.as_raw_fd());
        unsafe { libc::close(state.transfer.output_fd) };

        // The payload passes through unchanged, including the unterminated
        // tail, and two separators were counted.
        assert_eq!(reader.join().unwrap(), b"a\0b\0c");
        assert_eq!(total_lines, 2);
    }

    #[test]
    fn test_discard_output_writes_nothing() {
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(&[1u8; 5000]).unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        let (mut state, mut out_read) = state_with_pipe_output();
        state.control.discard_input = true;

        drive_to_completion(&mut state, input.as_raw_fd());
        unsafe { libc::close(state.transfer.output_fd) };

        let mut got = Vec::new();
        out_read.read_to_end(&mut got).unwrap();
        assert!(got.is_empty());
        assert_eq!(state.status.exit_status, 0);
    }

    #[test]
    fn test_epipe_is_graceful_end() {
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(&[9u8; 100_000]).unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        // SIGPIPE must be ignored for the write to surface EPIPE.
        // Safety: installing SIG_IGN for the duration of the test.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let (mut state, out_read) = state_with_pipe_output();
        drop(out_read); // close the read side immediately

        let mut eof_in = false;
        let mut eof_out = false;
        let mut lines = 0u64;
        let mut iterations = 0;
        while !(eof_in && eof_out) && iterations < 1000 {
            transfer(
                &mut state,
                input.as_raw_fd(),
                &mut eof_in,
                &mut eof_out,
                0,
                &mut lines,
            )
            .expect("EPIPE must not be an error");
            iterations += 1;
        }
        assert!(eof_in && eof_out);
        // Not a failure of ours: no transfer-error bit.
        assert_eq!(state.status.exit_status & 16, 0);
        unsafe { libc::close(state.transfer.output_fd) };
    }

    #[test]
    fn test_allowed_budget_clamps_writes() {
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(&[3u8; 10_000]).unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        let (mut state, mut out_read) = state_with_pipe_output();
        state.control.rate_limit = 1; // engage the budget path

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got.len()
        });

        let mut eof_in = false;
        let mut eof_out = false;
        let mut lines = 0u64;
        // Each iteration may move at most the allowed amount.
        for _ in 0..4 {
            let moved = transfer(
                &mut state,
                input.as_raw_fd(),
                &mut eof_in,
                &mut eof_out,
                100,
                &mut lines,
            )
            .unwrap();
            assert!(moved <= 100, "moved {moved} > allowed 100");
        }

        // Let the rest through unclamped.
        state.control.rate_limit = 0;
        while !(eof_in && eof_out) {
            transfer(
                &mut state,
                input.as_raw_fd(),
                &mut eof_in,
                &mut eof_out,
                0,
                &mut lines,
            )
            .unwrap();
        }
        unsafe { libc::close(state.transfer.output_fd) };
        assert_eq!(reader.join().unwrap(), 10_000);
    }

    #[test]
    fn test_adaptive_skip_schedule() {
        assert_eq!(adaptive_skip_amount(1), 1);
        assert_eq!(adaptive_skip_amount(4), 1);
        assert_eq!(adaptive_skip_amount(5), 2);
        assert_eq!(adaptive_skip_amount(9), 2);
        assert_eq!(adaptive_skip_amount(10), 1);
        assert_eq!(adaptive_skip_amount(15), 32);
        assert_eq!(adaptive_skip_amount(19), 512);
        assert_eq!(adaptive_skip_amount(25), 512);
    }

    #[test]
    fn test_aligned_buffer_page_alignment() {
        let buffer = AlignedBuffer::new(BUFFER_SIZE).unwrap();
        assert_eq!(buffer.ptr.as_ptr() as usize % page_size::get(), 0);
        assert!(buffer.as_slice().len() >= BUFFER_SIZE);
    }

    #[test]
    fn test_buffer_grows_preserving_content() {
        let mut input = tempfile::tempfile().unwrap();
        input.write_all(&[5u8; 100]).unwrap();
        input.seek(SeekFrom::Start(0)).unwrap();

        let (mut state, mut out_read) = state_with_pipe_output();
        state.control.target_buffer_size = 1024;

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got.len()
        });

        let mut eof_in = false;
        let mut eof_out = false;
        let mut lines = 0u64;
        transfer(
            &mut state,
            input.as_raw_fd(),
            &mut eof_in,
            &mut eof_out,
            0,
            &mut lines,
        )
        .unwrap();
        assert_eq!(state.transfer.buffer_size, 1024);

        // Grow mid-transfer; pending data must survive.
        state.control.target_buffer_size = 8192;
        while !(eof_in && eof_out) {
            transfer(
                &mut state,
                input.as_raw_fd(),
                &mut eof_in,
                &mut eof_out,
                0,
                &mut lines,
            )
            .unwrap();
        }
        assert_eq!(state.transfer.buffer_size, 8192);
        unsafe { libc::close(state.transfer.output_fd) };
        assert_eq!(reader.join().unwrap(), 100);
    }
}
