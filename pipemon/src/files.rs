// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Input file sequencing and total-size calculation.

use crate::error::exit;
use crate::state::State;
use nix::errno::Errno;
use std::ffi::CString;
use std::os::fd::RawFd;
use tracing::debug;

fn is_blk(mode: libc::mode_t) -> bool {
    mode & libc::S_IFMT == libc::S_IFBLK
}

fn is_reg(mode: libc::mode_t) -> bool {
    mode & libc::S_IFMT == libc::S_IFREG
}

fn fstat_fd(fd: RawFd) -> Option<libc::stat> {
    // Safety: zeroed stat is a valid out-parameter.
    let mut sb: libc::stat = unsafe { std::mem::zeroed() };
    // Safety: fstat fills the struct.
    if unsafe { libc::fstat(fd, &mut sb) } == 0 {
        Some(sb)
    } else {
        None
    }
}

fn stat_path(path: &str) -> Option<libc::stat> {
    let cpath = CString::new(path).ok()?;
    // Safety: as in fstat_fd.
    let mut sb: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(cpath.as_ptr(), &mut sb) } == 0 {
        Some(sb)
    } else {
        None
    }
}

/// Size of a block device, by opening it and seeking to the end.
fn block_device_size(path: &str) -> Option<u64> {
    let cpath = CString::new(path).ok()?;
    // Safety: read-only open for sizing.
    let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return None;
    }
    // Safety: seeking then closing a descriptor we own.
    let end = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
    unsafe { libc::close(fd) };
    if end > 0 {
        Some(end as u64)
    } else {
        Some(0)
    }
}

/// The displayable name of the current input file.
pub fn current_file_name(state: &State) -> &str {
    match state.status.current_input_file {
        None => "(none)",
        Some(idx) => match state.files.get(idx) {
            None => "(none)",
            Some(name) if name == "-" => "(stdin)",
            Some(name) => name.as_str(),
        },
    }
}

/// Close the previous input (if any) and open input number `filenum`,
/// returning the new descriptor.  Refuses an input that is the same file
/// standard output points at.  Failures accumulate exit bits and return
/// `None`.
pub fn next_file(state: &mut State, filenum: usize, oldfd: RawFd) -> Option<RawFd> {
    if oldfd >= 0 {
        // Safety: closing a descriptor this module opened earlier.
        if unsafe { libc::close(oldfd) } != 0 {
            state.report_error(format_args!("failed to close file: {}", Errno::last()));
            state.status.exit_status |= exit::CLOSE_ERROR;
            return None;
        }
    }

    if filenum >= state.files.len() {
        debug!(filenum, "file number out of range");
        state.status.exit_status |= exit::CLOSE_ERROR;
        return None;
    }

    let name = state.files[filenum].clone();
    let fd = if name == "-" {
        libc::STDIN_FILENO
    } else {
        let Ok(cpath) = CString::new(name.as_str()) else {
            state.report_error(format_args!("failed to read file: {name}"));
            state.status.exit_status |= exit::FILE_ERROR;
            return None;
        };
        // Safety: plain read-only open; the operator controls the list.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            state.report_error(format_args!(
                "failed to read file: {}: {}",
                name,
                Errno::last()
            ));
            state.status.exit_status |= exit::FILE_ERROR;
            return None;
        }
        fd
    };

    let Some(isb) = fstat_fd(fd) else {
        state.report_error(format_args!(
            "failed to stat file: {}: {}",
            name,
            Errno::last()
        ));
        // Safety: closing the fd we just opened.
        unsafe { libc::close(fd) };
        state.status.exit_status |= exit::FILE_ERROR;
        return None;
    };

    let Some(osb) = fstat_fd(libc::STDOUT_FILENO) else {
        state.report_error(format_args!(
            "failed to stat output file: {}",
            Errno::last()
        ));
        unsafe { libc::close(fd) };
        state.status.exit_status |= exit::FILE_ERROR;
        return None;
    };

    // Reading a regular file or block device back into itself truncates
    // or loops; refuse it.
    // Safety: isatty only inspects the descriptor.
    let input_is_output = isb.st_dev == osb.st_dev
        && isb.st_ino == osb.st_ino
        && unsafe { libc::isatty(fd) } == 0
        && (is_reg(isb.st_mode) || is_blk(isb.st_mode));
    if input_is_output {
        state.report_error(format_args!("input file is output file: {name}"));
        unsafe { libc::close(fd) };
        state.status.exit_status |= exit::INPUT_IS_OUTPUT;
        return None;
    }

    state.status.current_input_file = Some(filenum);

    #[cfg(target_os = "linux")]
    {
        // Safety: flag manipulation only; a failure just means no direct
        // I/O on this input.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            let wanted = if state.control.direct_io {
                libc::O_DIRECT
            } else {
                0
            };
            if libc::fcntl(fd, libc::F_SETFL, wanted | flags) != 0 {
                debug!("fcntl: {}", Errno::last());
            }
        }
    }

    debug!(filenum, fd, "next file opened");
    Some(fd)
}

fn calc_total_bytes(state: &mut State) -> u64 {
    let mut total: u64 = 0;

    if state.files.is_empty() {
        return fstat_fd(libc::STDIN_FILENO)
            .map(|sb| sb.st_size.max(0) as u64)
            .unwrap_or(0);
    }

    for idx in 0..state.files.len() {
        let name = state.files[idx].clone();

        let sb = if name == "-" {
            match fstat_fd(libc::STDIN_FILENO) {
                Some(sb) => sb,
                None => return 0,
            }
        } else {
            let Some(sb) = stat_path(&name) else {
                debug!("stat failed: {name}");
                return 0;
            };
            let Ok(cpath) = CString::new(name.as_str()) else {
                return 0;
            };
            // Safety: readability probe; a later open failure is handled
            // at transfer time.
            if unsafe { libc::access(cpath.as_ptr(), libc::R_OK) } != 0 {
                debug!("not readable: {name}");
                return 0;
            }
            sb
        };

        if is_blk(sb.st_mode) {
            let device = if name == "-" { "/dev/stdin" } else { name.as_str() };
            match block_device_size(device) {
                Some(size) => total += size,
                None => return 0,
            }
        } else if is_reg(sb.st_mode) {
            total += sb.st_size.max(0) as u64;
        } else {
            // A pipe or similar makes the total indeterminate.
            total = 0;
        }
    }

    // If the input total is unknown but the output is a block device not
    // opened for append, its capacity is the effective total; stop there
    // rather than running into "no space left on device".
    if total < 1 {
        if let Some(osb) = fstat_fd(libc::STDOUT_FILENO) {
            // Safety: flag query only.
            let append = unsafe { libc::fcntl(libc::STDOUT_FILENO, libc::F_GETFL) }
                & libc::O_APPEND
                != 0;
            if is_blk(osb.st_mode) && !append {
                // Safety: sizing the output device, then rewinding.
                let end = unsafe { libc::lseek(libc::STDOUT_FILENO, 0, libc::SEEK_END) };
                total = end.max(0) as u64;
                if unsafe { libc::lseek(libc::STDOUT_FILENO, 0, libc::SEEK_SET) } != 0 {
                    state.report_error(format_args!(
                        "(stdout): failed to seek to start of output: {}",
                        Errno::last()
                    ));
                    state.status.exit_status |= exit::FILE_ERROR;
                }
                if total > 0 {
                    state.control.stop_at_size = true;
                }
            }
        }
    }

    total
}

fn calc_total_lines(state: &mut State) -> u64 {
    let mut total: u64 = 0;
    let separator = if state.control.null_terminated_lines {
        b'\0'
    } else {
        b'\n'
    };

    for idx in 0..state.files.len() {
        let name = state.files[idx].clone();

        let fd = if name == "-" {
            match fstat_fd(libc::STDIN_FILENO) {
                Some(sb) if is_reg(sb.st_mode) => {}
                _ => return 0,
            }
            // Safety: duplicating stdin so the scan does not consume it.
            unsafe { libc::dup(libc::STDIN_FILENO) }
        } else {
            match stat_path(&name) {
                Some(sb) if is_reg(sb.st_mode) => {}
                _ => return 0,
            }
            let Ok(cpath) = CString::new(name.as_str()) else {
                return 0;
            };
            // Safety: read-only open for the scan.
            unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) }
        };

        if fd < 0 {
            debug!("open for line count failed: {name}");
            return 0;
        }

        #[cfg(target_os = "linux")]
        // Safety: advisory only.
        unsafe {
            libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
        }

        let mut scanbuf = [0u8; 1024];
        loop {
            // Safety: reading into a stack buffer of the stated size.
            let n = unsafe {
                libc::read(fd, scanbuf.as_mut_ptr() as *mut libc::c_void, scanbuf.len())
            };
            if n < 0 {
                state.report_error(format_args!("{}: {}", name, Errno::last()));
                state.status.exit_status |= exit::FILE_ERROR;
                break;
            }
            if n == 0 {
                break;
            }
            total += scanbuf[..n as usize]
                .iter()
                .filter(|&&b| b == separator)
                .count() as u64;
        }

        // Safety: rewinding for the real transfer, then closing our scan
        // descriptor.
        unsafe {
            if libc::lseek(fd, 0, libc::SEEK_SET) != 0 {
                state.report_error(format_args!("{}: {}", name, Errno::last()));
                state.status.exit_status |= exit::FILE_ERROR;
            }
            libc::close(fd);
        }
    }

    total
}

/// Total bytes (or lines, in line mode) across all inputs; 0 when the
/// total cannot be determined.
pub fn calc_total_size(state: &mut State) -> u64 {
    if state.control.linemode {
        calc_total_lines(state)
    } else {
        calc_total_bytes(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_current_file_name() {
        let mut state = State::new("pipemon");
        state.files = vec!["-".into(), "data.bin".into()];
        assert_eq!(current_file_name(&state), "(none)");
        state.status.current_input_file = Some(0);
        assert_eq!(current_file_name(&state), "(stdin)");
        state.status.current_input_file = Some(1);
        assert_eq!(current_file_name(&state), "data.bin");
        state.status.current_input_file = Some(9);
        assert_eq!(current_file_name(&state), "(none)");
    }

    #[test]
    fn test_next_file_opens_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, b"hello").unwrap();

        let mut state = State::new("pipemon");
        state.files = vec![path.to_string_lossy().into_owned()];

        let fd = next_file(&mut state, 0, -1).expect("open failed");
        assert!(fd >= 0);
        assert_eq!(state.status.current_input_file, Some(0));
        assert_eq!(state.status.exit_status, 0);
        // Safety: closing the test descriptor.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_next_file_missing_sets_file_error() {
        let mut state = State::new("pipemon");
        state.files = vec!["/nonexistent/definitely-not-here".into()];
        assert!(next_file(&mut state, 0, -1).is_none());
        assert_eq!(state.status.exit_status & exit::FILE_ERROR, exit::FILE_ERROR);
    }

    #[test]
    fn test_next_file_out_of_range() {
        let mut state = State::new("pipemon");
        state.files = vec!["-".into()];
        assert!(next_file(&mut state, 5, -1).is_none());
        assert_eq!(state.status.exit_status & exit::CLOSE_ERROR, exit::CLOSE_ERROR);
    }

    #[test]
    fn test_calc_total_bytes_sums_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, vec![0u8; 300]).unwrap();
        std::fs::write(&b, vec![0u8; 200]).unwrap();

        let mut state = State::new("pipemon");
        state.files = vec![
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ];
        assert_eq!(calc_total_size(&mut state), 500);
    }

    #[test]
    fn test_calc_total_bytes_unknown_for_missing() {
        let mut state = State::new("pipemon");
        state.files = vec!["/nonexistent/not-here-either".into()];
        assert_eq!(calc_total_size(&mut state), 0);
    }

    #[test]
    fn test_calc_total_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"a\nb\nc\nno trailing newline").unwrap();
        drop(file);

        let mut state = State::new("pipemon");
        state.control.linemode = true;
        state.files = vec![path.to_string_lossy().into_owned()];
        assert_eq!(calc_total_size(&mut state), 3);
    }

    #[test]
    fn test_calc_total_lines_null_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records");
        std::fs::write(&path, b"a\0b\0c").unwrap();

        let mut state = State::new("pipemon");
        state.control.linemode = true;
        state.control.null_terminated_lines = true;
        state.files = vec![path.to_string_lossy().into_owned()];
        assert_eq!(calc_total_size(&mut state), 2);
    }
}
