// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed errors for the engine subsystems, plus the POSIX exit bitmask the
//! process reports.  Internally failures travel as enums; the loops fold
//! them into the accumulator at the edge.

use nix::errno::Errno;

/// Exit status bits, ORed together over the life of the process.
pub mod exit {
    /// A file could not be opened, read or stat'd.
    pub const FILE_ERROR: u32 = 2;
    /// An input file turned out to be the same as the output.
    pub const INPUT_IS_OUTPUT: u32 = 4;
    /// Closing a file failed, or the file list was inconsistent.
    pub const CLOSE_ERROR: u32 = 8;
    /// A read or write on the data stream failed.
    pub const TRANSFER_ERROR: u32 = 16;
    /// An exit signal (SIGINT, SIGHUP, SIGTERM) was received.
    pub const SIGNAL_EXIT: u32 = 32;
    /// Memory allocation failed.
    pub const ALLOCATION_ERROR: u32 = 64;
}

/// Fatal failures inside one transfer iteration.  Transient conditions and
/// recoverable read errors are handled inside the engine and never surface
/// here.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("readiness wait failed: {0}")]
    Poll(Errno),
    #[error("write failed: {0}")]
    Write(Errno),
    #[error("transfer buffer allocation failed")]
    Allocation,
}

impl TransferError {
    /// The exit bits this failure contributes.
    pub fn exit_bits(&self) -> u32 {
        match self {
            TransferError::Poll(_) | TransferError::Write(_) => exit::TRANSFER_ERROR,
            TransferError::Allocation => exit::ALLOCATION_ERROR,
        }
    }
}

/// Failures in the remote-control exchange.  A failed exchange never
/// applies a partial update.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{pid}: {err}")]
    TargetMissing { pid: i32, err: Errno },
    #[error("control file: {0}")]
    ControlFile(#[from] std::io::Error),
    #[error("control file message was truncated")]
    Truncated,
    #[error("{pid}: {err}")]
    SignalFailed { pid: i32, err: Errno },
    #[error("{pid}: message not received")]
    NotAcknowledged { pid: i32 },
}

/// Failures looking up a watched file descriptor in another process.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("pid {pid}: {err}")]
    ProcessGone { pid: i32, err: Errno },
    #[error("pid {pid}: fd {fd}: {err}")]
    Resolve {
        pid: i32,
        fd: i32,
        err: std::io::Error,
    },
    #[error("pid {pid}: fd {fd}: {path}: {err}")]
    Stat {
        pid: i32,
        fd: i32,
        path: String,
        err: std::io::Error,
    },
    #[error("pid {pid}: fd {fd}: {path}: not a regular file or block device")]
    NotRegular { pid: i32, fd: i32, path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_bits() {
        assert_eq!(TransferError::Poll(Errno::EBADF).exit_bits(), 16);
        assert_eq!(TransferError::Write(Errno::EIO).exit_bits(), 16);
        assert_eq!(TransferError::Allocation.exit_bits(), 64);
    }

    #[test]
    fn test_errors_render_for_operators() {
        let e = RemoteError::NotAcknowledged { pid: 42 };
        assert_eq!(e.to_string(), "42: message not received");
    }
}
