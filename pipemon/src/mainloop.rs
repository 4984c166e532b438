// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The main transfer loop: opens inputs in sequence, drives the transfer
//! engine under the rate-limit and stop-at-size budgets, and pushes
//! display updates on the tick schedule.

use crate::cursor::CursorContext;
use crate::display;
use crate::error::exit;
use crate::files;
use crate::remote;
use crate::signals;
use crate::state::State;
use crate::transfer;
use crate::{BUFFER_SIZE, BUFFER_SIZE_MAX, RATE_BURST_WINDOW, RATE_GRANULARITY, REMOTE_INTERVAL};
use pmcommon::{clock, term};
use std::time::Duration;

/// Copy all input files to the output, rendering progress as configured.
/// Returns the accumulated exit status.
pub fn main_loop(state: &mut State) -> u32 {
    let mut cursor = CursorContext::init(state);

    let mut eof_in = false;
    let mut eof_out = false;
    // In line mode the two totals count lines rather than bytes.
    let mut total_written: u64 = 0;
    let mut lines_written: u64 = 0;
    let mut transferred_since_last: i64 = 0;
    state.display.initial_offset = 0;

    let mut cur_time = clock::read();
    let mut start_time = cur_time;
    let mut next_ratecheck = cur_time;
    let mut next_remotecheck = cur_time;
    let mut next_update = cur_time;
    if state.control.delay_start > 0.0 && state.control.delay_start > state.control.interval {
        next_update += Duration::from_secs_f64(state.control.delay_start);
    } else {
        next_update += Duration::from_secs_f64(state.control.interval);
    }

    // Rate-limit token bucket, in bytes (or lines).
    let mut target: f64 = 0.0;
    let mut final_update = false;
    let mut file_idx = 0usize;

    // Open the first readable input file; without one there is nothing to
    // do at all.
    let mut fd = -1;
    while fd < 0 && file_idx < state.files.len() {
        match files::next_file(state, file_idx, -1) {
            Some(new_fd) => fd = new_fd,
            None => file_idx += 1,
        }
    }
    if fd < 0 {
        if state.control.cursor {
            cursor.fini(&mut state.control);
            state.status.cursor_attach_count = cursor.attach_count;
        }
        return state.status.exit_status;
    }

    #[cfg(target_os = "linux")]
    // Safety: advisory only.
    unsafe {
        libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
        // Apply direct I/O to the output once up front; later changes go
        // through the transfer engine.
        let flags = libc::fcntl(libc::STDOUT_FILENO, libc::F_GETFL);
        let wanted = if state.control.direct_io {
            libc::O_DIRECT
        } else {
            0
        };
        libc::fcntl(libc::STDOUT_FILENO, libc::F_SETFL, wanted | flags);
    }
    state.control.direct_io_changed = false;

    // Size the buffer off the input's block size when nothing was
    // requested explicitly.
    if state.control.target_buffer_size == 0 {
        // Safety: zeroed stat is a valid out-parameter.
        let mut sb: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut sb) } == 0 {
            let sz = (sb.st_blksize.max(0) as usize).saturating_mul(32);
            state.control.target_buffer_size = sz.min(BUFFER_SIZE_MAX);
        }
    }
    if state.control.target_buffer_size == 0 {
        state.control.target_buffer_size = BUFFER_SIZE;
    }

    while !(eof_in && eof_out) || !final_update {
        let mut cansend: u64 = 0;

        if cur_time > next_remotecheck {
            remote::remote_check(state);
            next_remotecheck += REMOTE_INTERVAL;
        }

        if signals::exit_triggered() {
            break;
        }

        if state.control.rate_limit > 0 {
            cur_time = clock::read();
            if cur_time > next_ratecheck {
                target += state.control.rate_limit as f64
                    / (1_000_000_000.0 / RATE_GRANULARITY.as_nanos() as f64);
                let burst_max = (state.control.rate_limit * RATE_BURST_WINDOW) as f64;
                if target > burst_max {
                    target = burst_max;
                }
                next_ratecheck += RATE_GRANULARITY;
            }
            cansend = target as u64;
        }

        // Never run past a fixed size when stop-at-size is on.
        if state.control.size > 0 && state.control.stop_at_size {
            let size = state.control.size as i64;
            if size < total_written as i64 + cansend as i64
                || (cansend == 0 && state.control.rate_limit == 0)
            {
                let remaining = size - total_written as i64;
                if remaining <= 0 {
                    cansend = 0;
                    eof_in = true;
                    eof_out = true;
                } else {
                    cansend = remaining as u64;
                }
            }
        }

        let written = if state.control.size > 0
            && state.control.stop_at_size
            && cansend == 0
            && eof_in
            && eof_out
        {
            0
        } else {
            match transfer::transfer(
                state,
                fd,
                &mut eof_in,
                &mut eof_out,
                cansend,
                &mut lines_written,
            ) {
                Ok(written) => written,
                Err(e) => {
                    // A write failure ends the run here.
                    state.status.exit_status |= e.exit_bits();
                    if state.control.cursor {
                        cursor.fini(&mut state.control);
                        state.status.cursor_attach_count = cursor.attach_count;
                    }
                    return state.status.exit_status;
                }
            }
        };

        if state.control.linemode {
            transferred_since_last += lines_written as i64;
            total_written += lines_written;
            if state.control.rate_limit > 0 {
                target -= lines_written as f64;
            }
        } else {
            transferred_since_last += written;
            total_written += written.max(0) as u64;
            if state.control.rate_limit > 0 {
                target -= written as f64;
            }
        }

        // This input finished; move on to the next one, skipping any that
        // fail to open.
        while eof_in && eof_out && file_idx + 1 < state.files.len() {
            file_idx += 1;
            match files::next_file(state, file_idx, fd) {
                Some(new_fd) => {
                    fd = new_fd;
                    eof_in = false;
                    eof_out = false;
                }
                None => fd = -1,
            }
        }

        cur_time = clock::read();

        if eof_in && eof_out {
            final_update = true;
            if state.display.visible || state.control.delay_start < 0.001 {
                next_update = cur_time;
            }
        }

        if state.control.no_display {
            continue;
        }

        // Wait-for-data: nothing is shown, and the clock does not start,
        // until the first byte (or line) actually moves.
        if state.control.wait {
            let progressed = if state.control.linemode {
                lines_written >= 1
            } else {
                written >= 1
            };
            if !progressed {
                continue;
            }

            state.control.wait = false;

            // Reset the start time with stop/continue disabled, so a
            // suspension while we waited cannot skew the offset.
            signals::no_pause();
            start_time = clock::read();
            signals::clear_stopped_offset();
            signals::allow_pause();

            next_update = start_time + Duration::from_secs_f64(state.control.interval);
        }

        if cur_time < next_update {
            continue;
        }

        next_update += Duration::from_secs_f64(state.control.interval);
        if next_update < cur_time {
            next_update = cur_time;
        }

        // Effective elapsed time: now, minus when we started, minus the
        // time spent stopped.
        let init_time = start_time + signals::stopped_offset();
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

        let since_last = if final_update {
            -1
        } else {
            transferred_since_last
        };

        let cursor_ref = if state.control.cursor {
            Some(&mut cursor)
        } else {
            None
        };
        display::display(state, cursor_ref, elapsed_sec, since_last, total_written);

        transferred_since_last = 0;
    }

    if state.control.cursor {
        cursor.fini(&mut state.control);
        state.status.cursor_attach_count = cursor.attach_count;
    } else if !state.control.numeric && !state.control.no_display && state.display.visible {
        term::write_retry(term::STDERR_FD, b"\n");
    }

    if signals::exit_triggered() {
        state.status.exit_status |= exit::SIGNAL_EXIT;
    }

    if fd >= 0 {
        // Safety: closing the final input descriptor.
        unsafe { libc::close(fd) };
    }

    state.status.exit_status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::IntoRawFd;

    fn quiet_state(files: Vec<String>) -> State {
        let mut state = State::new("pipemon");
        state.control.no_display = true;
        state.control.no_splice = true;
        state.files = files;
        state
    }

    fn with_pipe_output(state: &mut State) -> std::fs::File {
        let (rd, wr) = nix::unistd::pipe().unwrap();
        state.transfer.output_fd = wr.into_raw_fd();
        std::fs::File::from(rd)
    }

    #[test]
    fn test_small_file_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        let payload: Vec<u8> = (0u32..500).map(|v| (v % 256) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let mut state = quiet_state(vec![path.to_string_lossy().into_owned()]);
        state.control.size = 500;
        let mut out_read = with_pipe_output(&mut state);

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got
        });

        let status = main_loop(&mut state);
        // Safety: closing the test pipe's write end.
        unsafe { libc::close(state.transfer.output_fd) };

        assert_eq!(status, 0);
        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn test_multiple_files_concatenate() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"first,").unwrap();
        std::fs::write(&b, b"second").unwrap();

        let mut state = quiet_state(vec![
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ]);
        let mut out_read = with_pipe_output(&mut state);

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got
        });

        let status = main_loop(&mut state);
        unsafe { libc::close(state.transfer.output_fd) };

        assert_eq!(status, 0);
        assert_eq!(reader.join().unwrap(), b"first,second");
    }

    #[test]
    fn test_stop_at_size_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();

        let mut state = quiet_state(vec![path.to_string_lossy().into_owned()]);
        state.control.size = 1000;
        state.control.stop_at_size = true;
        let mut out_read = with_pipe_output(&mut state);

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got.len()
        });

        let status = main_loop(&mut state);
        unsafe { libc::close(state.transfer.output_fd) };

        assert_eq!(status, 0);
        assert_eq!(reader.join().unwrap(), 1000);
    }

    #[test]
    fn test_unreadable_input_sets_status() {
        let mut state = quiet_state(vec!["/nonexistent/input".into()]);
        let _out_read = with_pipe_output(&mut state);
        let status = main_loop(&mut state);
        unsafe { libc::close(state.transfer.output_fd) };
        assert_eq!(status & crate::error::exit::FILE_ERROR, 2);
    }

    #[test]
    fn test_rate_limit_slows_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limited");
        std::fs::write(&path, vec![1u8; 200_000]).unwrap();

        let mut state = quiet_state(vec![path.to_string_lossy().into_owned()]);
        state.control.rate_limit = 100_000; // bytes per second
        let mut out_read = with_pipe_output(&mut state);

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got.len()
        });

        let started = std::time::Instant::now();
        let status = main_loop(&mut state);
        let wall = started.elapsed();
        unsafe { libc::close(state.transfer.output_fd) };

        assert_eq!(status, 0);
        assert_eq!(reader.join().unwrap(), 200_000);
        // 200 kB at 100 kB/s with a 5x burst allowance: at least a
        // second, and nowhere near unlimited speed.
        assert!(wall >= Duration::from_millis(900), "took {wall:?}");
        assert!(wall <= Duration::from_secs(10), "took {wall:?}");
    }

    #[test]
    fn test_line_mode_totals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        std::fs::write(&path, b"1\n2\n3\n4\n").unwrap();

        let mut state = quiet_state(vec![path.to_string_lossy().into_owned()]);
        state.control.linemode = true;
        let mut out_read = with_pipe_output(&mut state);

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            out_read.read_to_end(&mut got).unwrap();
            got
        });

        let status = main_loop(&mut state);
        unsafe { libc::close(state.transfer.output_fd) };

        assert_eq!(status, 0);
        assert_eq!(reader.join().unwrap(), b"1\n2\n3\n4\n");
    }
}
