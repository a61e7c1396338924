//! Job registry: one configuration record per job.
//!
//! [`JobStore`] is the seam between the engine and persistence.
//! [`FsJobStore`] keeps the on-disk layout (`<root>/<name>/config.json` plus a
//! cumulative `output.txt`); [`MemoryJobStore`] keeps records in memory for
//! tests and embedding.
//!
//! Writes always replace the whole record. Partial updates are done by the
//! caller as read-modify-write through [`JobStore::update`] or [`JobStore::put`].

mod fs;
mod memory;

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{Result, VikiError};
use crate::job::{Job, JobDefinition, JobPatch};

pub use fs::FsJobStore;
pub use memory::MemoryJobStore;

/// File name of the configuration record inside a job directory.
pub const CONFIG_FILE: &str = "config.json";
/// File name of the cumulative output log inside a job directory.
pub const OUTPUT_FILE: &str = "output.txt";

pub trait JobStore {
    /// Names of all jobs in the registry.
    fn list(&self) -> Result<BTreeSet<String>>;

    /// Whether a job directory exists for `name`.
    fn exists(&self, name: &str) -> bool;

    /// Raw content of the job's configuration record.
    fn get(&self, name: &str) -> Result<String>;

    /// Parsed configuration record.
    fn load(&self, name: &str) -> Result<Job> {
        let raw = self.get(name)?;
        Job::parse(name, &raw)
    }

    /// Persists a new job. Never overwrites an existing one.
    fn create(&self, name: &str, definition: JobDefinition) -> Result<Job>;

    /// Replaces the record of an existing job.
    fn put(&self, job: &Job) -> Result<()>;

    /// Merges `patch` over the stored record, keeping its counters.
    fn update(&self, name: &str, patch: JobPatch) -> Result<Job> {
        let mut job = self.load(name)?;
        patch.apply(&mut job)?;
        self.put(&job)?;
        Ok(job)
    }

    /// Removes the job and everything stored for it. Not recoverable.
    fn delete(&self, name: &str) -> Result<()>;

    /// Opens the job's output log for appending.
    fn open_output(&self, name: &str) -> Result<File>;

    /// Cumulative output of every run of the job.
    fn output(&self, name: &str) -> Result<String>;
}

/// Reads an output log. Steps write raw bytes, so invalid UTF-8 is replaced
/// rather than rejected.
fn read_output(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(VikiError::NotFound("Job output not found".into()))
        }
        Err(e) => Err(VikiError::resource("failed to read job output", e)),
    }
}
