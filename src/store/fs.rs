use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{CONFIG_FILE, JobStore, OUTPUT_FILE};
use crate::error::{Result, VikiError};
use crate::job::{Job, JobDefinition, validate_name};

/// Filesystem-backed registry rooted at the jobs directory.
#[derive(Debug, Clone)]
pub struct FsJobStore {
    root: PathBuf,
}

impl FsJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the jobs directory if it is missing.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            VikiError::StoreUnavailable(format!("{}: {e}", self.root.display()))
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Atomically replaces `config.json` in `dir`: write to a temp file in the
    /// same directory, then rename over the record.
    fn write_record(&self, dir: &Path, job: &Job) -> Result<()> {
        let json = job.to_json()?;
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| VikiError::resource("failed to stage job record", e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| VikiError::resource("failed to write job record", e))?;
        tmp.persist(dir.join(CONFIG_FILE))
            .map_err(|e| VikiError::resource("failed to persist job record", e.error))?;
        Ok(())
    }
}

impl JobStore for FsJobStore {
    fn list(&self) -> Result<BTreeSet<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            VikiError::StoreUnavailable(format!("{}: {e}", self.root.display()))
        })?;

        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                VikiError::StoreUnavailable(format!("{}: {e}", self.root.display()))
            })?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.job_dir(name).is_dir()
    }

    fn get(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        let path = self.job_dir(name).join(CONFIG_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VikiError::NotFound("Job directory not found".into()));
            }
            Err(e) => return Err(VikiError::resource("failed to read job record", e)),
        };
        String::from_utf8(bytes).map_err(|e| VikiError::Parse(e.to_string()))
    }

    fn create(&self, name: &str, definition: JobDefinition) -> Result<Job> {
        let job = Job::from_definition(name, definition)?;
        self.init()?;
        let dir = self.job_dir(name);

        fs::create_dir(&dir).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => {
                VikiError::AlreadyExists("Job directory already exists".into())
            }
            _ => VikiError::resource("failed to create job directory", e),
        })?;

        if let Err(err) = self.write_record(&dir, &job) {
            // A job without its record must not be left behind.
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(job = name, error = %e, "Failed to remove partial job directory");
            }
            return Err(err);
        }

        tracing::info!(job = name, steps = job.steps.len(), "Job created");
        Ok(job)
    }

    fn put(&self, job: &Job) -> Result<()> {
        validate_name(&job.name)?;
        let dir = self.job_dir(&job.name);
        if !dir.is_dir() {
            return Err(VikiError::NotFound("Job not found".into()));
        }
        self.write_record(&dir, job)?;
        tracing::debug!(job = %job.name, run_number = job.run_number, "Job record written");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(VikiError::InvalidArgument("Missing job name".into()));
        }
        validate_name(name)?;
        let dir = self.job_dir(name);
        if !dir.is_dir() {
            return Err(VikiError::NotFound("Job not found".into()));
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| VikiError::resource("failed to remove job directory", e))?;

        tracing::info!(job = name, "Job deleted");
        Ok(())
    }

    fn open_output(&self, name: &str) -> Result<File> {
        validate_name(name)?;
        let dir = self.job_dir(name);
        if !dir.is_dir() {
            return Err(VikiError::NotFound("Job not found".into()));
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(OUTPUT_FILE))
            .map_err(|e| VikiError::resource("failed to open job output", e))
    }

    fn output(&self, name: &str) -> Result<String> {
        validate_name(name)?;
        if !self.job_dir(name).is_dir() {
            return Err(VikiError::NotFound("Job not found".into()));
        }
        super::read_output(&self.job_dir(name).join(OUTPUT_FILE))
    }
}
