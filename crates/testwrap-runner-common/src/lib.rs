//! Helpers shared by the wrapper binary and anything that drives it in-process.

pub mod launch_strategy;
pub mod os_paths;

pub use launch_strategy::{resolve_launch_strategy, LaunchStrategy};
