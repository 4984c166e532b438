// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Leaf utilities shared by the pipemon engine and binary: the monotonic
//! time source, human-friendly number parsing, and low-level terminal
//! helpers.

#![cfg(unix)]

pub mod clock;
pub mod term;
pub mod units;
