//! viki: a local job runner.
//!
//! Jobs are named lists of shell steps stored under a jobs directory. Running
//! a job executes its steps in order inside a fresh scratch workspace, stops
//! at the first failing step and appends everything to the job's output log.

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod runner;
pub mod service;
pub mod store;
pub mod workspace;

pub use config::VikiConfig;
pub use engine::{Engine, RunReport};
pub use error::{ErrorKind, VikiError};
pub use job::{Job, JobDefinition, JobPatch};
pub use runner::{CommandRunner, ShellRunner};
pub use service::{Jobs, Response};
pub use store::{FsJobStore, JobStore, MemoryJobStore};
