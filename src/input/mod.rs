// SPDX-License-Identifier: Apache-2.0

mod line_buffer;

pub use line_buffer::{LagInfo, LineBuffer};
