use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;

use super::JobStore;
use crate::error::{Result, VikiError};
use crate::job::{Job, JobDefinition, validate_name};

/// In-memory registry.
///
/// Records live in a map. Output logs are real files in a private temporary
/// directory because step processes write to them through a file descriptor.
pub struct MemoryJobStore {
    records: Mutex<BTreeMap<String, String>>,
    outputs: TempDir,
}

impl MemoryJobStore {
    pub fn new() -> Result<Self> {
        let outputs = tempfile::Builder::new()
            .prefix("viki-outputs-")
            .tempdir()
            .map_err(|e| VikiError::resource("failed to create output directory", e))?;
        Ok(Self {
            records: Mutex::new(BTreeMap::new()),
            outputs,
        })
    }

    /// Stores `raw` as the record of `name` without any validation.
    pub fn insert_raw(&self, name: &str, raw: &str) {
        self.records().insert(name.to_string(), raw.to_string());
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn output_path(&self, name: &str) -> PathBuf {
        self.outputs.path().join(format!("{name}.txt"))
    }

    fn require(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.records().contains_key(name) {
            Ok(())
        } else {
            Err(VikiError::NotFound("Job not found".into()))
        }
    }
}

impl JobStore for MemoryJobStore {
    fn list(&self) -> Result<BTreeSet<String>> {
        Ok(self.records().keys().cloned().collect())
    }

    fn exists(&self, name: &str) -> bool {
        self.records().contains_key(name)
    }

    fn get(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        self.records()
            .get(name)
            .cloned()
            .ok_or_else(|| VikiError::NotFound("Job directory not found".into()))
    }

    fn create(&self, name: &str, definition: JobDefinition) -> Result<Job> {
        let job = Job::from_definition(name, definition)?;
        let raw = job.to_json()?;

        let mut records = self.records();
        if records.contains_key(name) {
            return Err(VikiError::AlreadyExists("Job directory already exists".into()));
        }
        records.insert(name.to_string(), raw);
        Ok(job)
    }

    fn put(&self, job: &Job) -> Result<()> {
        self.require(&job.name)?;
        let raw = job.to_json()?;
        self.records().insert(job.name.clone(), raw);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(VikiError::InvalidArgument("Missing job name".into()));
        }
        self.require(name)?;
        self.records().remove(name);
        match std::fs::remove_file(self.output_path(name)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(VikiError::resource("failed to remove job output", e))
            }
            _ => Ok(()),
        }
    }

    fn open_output(&self, name: &str) -> Result<File> {
        self.require(name)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.output_path(name))
            .map_err(|e| VikiError::resource("failed to open job output", e))
    }

    fn output(&self, name: &str) -> Result<String> {
        self.require(name)?;
        super::read_output(&self.output_path(name))
    }
}
