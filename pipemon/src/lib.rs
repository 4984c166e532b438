// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine for monitoring data moving through a pipeline.
//!
//! The library copies bytes from a sequence of inputs to standard output
//! unchanged while rendering a progress line on standard error, and can
//! alternatively watch the file offsets of another process's descriptors.
//! The binary in `src/bin/pipemon.rs` is a thin command-line front end over
//! [`state::State`] and the loop entry points in [`mainloop`] and [`watch`].

#![cfg(unix)]

use std::time::Duration;

pub mod cursor;
pub mod display;
pub mod error;
pub mod files;
pub mod history;
pub mod mainloop;
pub mod remote;
pub mod signals;
pub mod state;
pub mod transfer;
pub mod watch;

/// Interval between rate-limit token refills.
pub const RATE_GRANULARITY: Duration = Duration::from_millis(100);

/// Burst tolerance for the rate limiter, in multiples of the limit.
pub const RATE_BURST_WINDOW: u64 = 5;

/// Interval between checks for remote-control messages.
pub const REMOTE_INTERVAL: Duration = Duration::from_millis(100);

/// Default transfer buffer size.
pub const BUFFER_SIZE: usize = 409_600;

/// Maximum automatically chosen transfer buffer size.
pub const BUFFER_SIZE_MAX: usize = 524_288;

/// Most bytes handed to a single read call.
pub const MAX_READ_AT_ONCE: usize = 524_288;

/// Most bytes handed to a single write call.
pub const MAX_WRITE_AT_ONCE: usize = 524_288;

/// Wall-clock bound on one read burst.
pub const TRANSFER_READ_TIMEOUT: Duration = Duration::from_millis(90);

/// Wall-clock bound on one write burst.
pub const TRANSFER_WRITE_TIMEOUT: Duration = Duration::from_millis(900);

/// Upper bound on parsed format segments.
pub const FORMAT_SEGMENT_MAX: usize = 100;

/// Size of the "recently written bytes" ring shown by `%A`.
pub const LASTOUTPUT_MAX: usize = 256;
