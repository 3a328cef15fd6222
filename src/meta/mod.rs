// SPDX-License-Identifier: Apache-2.0

mod store;

pub use store::{Meta, SubMeta};
