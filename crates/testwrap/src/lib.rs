//! Test-execution wrapper: runs one test target in an isolated environment with
//! runfiles, sharding and a fixed exit-code contract.

pub mod args;
pub mod env;
pub mod error;
pub mod invocation;
pub mod launcher;
pub mod outputs;
pub mod policy;
pub mod report;
pub mod runfiles;
pub mod shard;
pub mod strategy;
pub mod wrapper;

pub use error::{Result, WrapperError};
pub use invocation::{DeclaredRunfile, TestInvocation};
pub use launcher::{ExecutionResult, Outcome};
pub use runfiles::RunfilesPolicy;
pub use wrapper::{run, RunOptions, WrapperRun};
