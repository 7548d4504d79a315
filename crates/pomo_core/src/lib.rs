//! Shared plumbing for pomo binaries: data-directory layout and logging.

pub mod logging;
pub mod paths;

pub use logging::{init_logging, init_logging_to_dir};
