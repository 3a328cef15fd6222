// SPDX-License-Identifier: Apache-2.0

//! The tail engine: glob discovery, per-file followers, a multiplexed
//! consumer API, and durable read checkpoints.

mod follower;
mod reader;
mod status;

pub use reader::{ReadMode, TailReader};
pub use status::Status;

use std::path::PathBuf;

/// One delivered line and the origin path it came from.
#[derive(Debug, Clone)]
pub(crate) struct LineRecord {
    pub line: String,
    pub origin_path: PathBuf,
}

/// Point-in-time status snapshot.
#[derive(Debug, Clone, Default)]
pub struct StatsInfo {
    pub last_error: String,
}
