use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, VikiError};

/// Keys the runner owns in `config.json`. Definitions may not set them.
const RESERVED_KEYS: &[&str] = &["name", "runNumber", "lastSuccessfulRun", "lastFailedRun"];

/// A persisted job, as stored in `<jobs_root>/<name>/config.json`.
///
/// Fields the runner does not know about are kept in `extra` and written
/// back untouched on every rewrite. `description` and `steps` are required;
/// a record missing either does not parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub description: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub run_number: u64,
    /// `run_number` of the most recent successful run, 0 if none.
    #[serde(default)]
    pub last_successful_run: u64,
    /// `run_number` of the most recent failed run, 0 if none.
    #[serde(default)]
    pub last_failed_run: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Builds a fresh job from a validated definition with zeroed counters.
    pub fn from_definition(name: &str, definition: JobDefinition) -> Result<Self> {
        validate_name(name)?;
        definition.validate()?;

        let mut extra = definition.extra;
        for key in RESERVED_KEYS {
            extra.remove(*key);
        }

        Ok(Self {
            description: definition.description,
            steps: definition.steps,
            name: name.to_string(),
            run_number: 0,
            last_successful_run: 0,
            last_failed_run: 0,
            extra,
        })
    }

    /// Parses a raw `config.json`. The directory name wins over a missing name.
    pub fn parse(name: &str, raw: &str) -> Result<Self> {
        let mut job: Job = serde_json::from_str(raw)?;
        if job.name.is_empty() {
            job.name = name.to_string();
        }
        Ok(job)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Advances the counters for a finished run and returns its run number.
    pub fn record_run(&mut self, success: bool) -> u64 {
        self.run_number += 1;
        if success {
            self.last_successful_run = self.run_number;
        } else {
            self.last_failed_run = self.run_number;
        }
        self.run_number
    }
}

/// Caller-supplied content of a new job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobDefinition {
    pub fn new(description: impl Into<String>, steps: Vec<String>) -> Self {
        Self {
            description: description.into(),
            steps,
            extra: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.description.trim().is_empty() {
            return Err(VikiError::InvalidArgument("Missing description".into()));
        }
        if self.steps.is_empty() {
            return Err(VikiError::InvalidArgument("Missing steps".into()));
        }
        Ok(())
    }
}

/// Partial update of a job. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<String>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.steps.is_none()
    }

    /// Merges the patch over `job`, keeping counters and extra fields.
    pub fn apply(self, job: &mut Job) -> Result<()> {
        if self.is_empty() {
            return Err(VikiError::InvalidArgument("Nothing to update".into()));
        }
        if let Some(description) = &self.description
            && description.trim().is_empty()
        {
            return Err(VikiError::InvalidArgument("Missing description".into()));
        }
        if let Some(steps) = &self.steps
            && steps.is_empty()
        {
            return Err(VikiError::InvalidArgument("Missing steps".into()));
        }

        if let Some(description) = self.description {
            job.description = description;
        }
        if let Some(steps) = self.steps {
            job.steps = steps;
        }
        Ok(())
    }
}

/// Job names double as directory names and must be a single path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(VikiError::InvalidArgument(
            "Missing required field: jobName".into(),
        ));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(VikiError::InvalidArgument(format!(
            "Invalid job name: {name:?}"
        )));
    }
    Ok(())
}
