// SPDX-License-Identifier: Apache-2.0

//! Multi-file tail engine.
//!
//! Continuously discovers files matching a glob pattern, follows each one
//! (emitting newly appended lines to a single consumer), retires files that
//! have gone quiet, and durably checkpoints read positions so a restart
//! resumes without loss.

pub mod bounded_channel;
pub mod config;
pub mod error;
pub mod input;
pub mod meta;
pub mod tail;

pub use config::{TailConfig, Whence};
pub use error::{Error, Result};
pub use meta::Meta;
pub use tail::{ReadMode, StatsInfo, TailReader};
