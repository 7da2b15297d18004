pub mod cli;
pub mod config;
pub mod delta;
pub mod error;
pub mod fs_util;
pub mod manifest;
pub mod sync;
pub mod transport;

pub use error::{PatchError, Result};
