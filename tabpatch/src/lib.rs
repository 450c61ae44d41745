// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-FileCopyrightText: 2026 tabpatch contributors
// SPDX-License-Identifier: GPL-3.0-only

//! tabpatch is primarily an application. The semver versioning covers the CLI
//! only and the Rust APIs can change at any time.
//!
//! The layers build on each other: [`format`] parses and serializes images,
//! [`patch`] transforms them, [`device`] talks to a device in emergency
//! download mode, and [`pipeline`] composes all of them into tasks that
//! operate on a workspace directory.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod device;
pub mod format;
pub mod patch;
pub mod pipeline;
pub mod plan;
pub mod stream;
pub mod util;
