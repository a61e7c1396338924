//! Operations exposed to front ends.
//!
//! [`Jobs`] wraps the store and the engine and answers every operation with a
//! [`Response`]: a `success` flag, a human-readable `message`, the error
//! `kind` on failure and the operation's own fields flattened next to them.
//! Nothing here returns `Err`; front ends only inspect `success`.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{ErrorKind, Result, VikiError};
use crate::job::{JobDefinition, JobPatch};
use crate::runner::CommandRunner;
use crate::store::JobStore;

#[derive(Debug, Clone, Serialize)]
pub struct Response<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Default> Response<T> {
    fn from_result(result: Result<T>, ok_message: &str) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                message: ok_message.to_string(),
                kind: None,
                data,
            },
            Err(e) => Self {
                success: false,
                message: e.to_string(),
                kind: Some(e.kind()),
                data: T::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobList {
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobConfig {
    pub name: String,
    pub config_json: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub return_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_number: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobOutput {
    pub output: String,
}

/// Nothing beyond `success` and `message`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Empty {}

pub struct Jobs<S, R> {
    engine: Engine<S, R>,
}

impl<S: JobStore, R: CommandRunner> Jobs<S, R> {
    pub fn new(engine: Engine<S, R>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine<S, R> {
        &self.engine
    }

    fn store(&self) -> &S {
        self.engine.store()
    }

    pub fn list_jobs(&self) -> Response<JobList> {
        let result = self.store().list().map(|names| JobList {
            jobs: names.into_iter().collect(),
        });
        Response::from_result(result, "Ok")
    }

    pub fn get_job(&self, name: &str) -> Response<JobConfig> {
        let mut response = Response::from_result(
            self.store().get(name).map(|config_json| JobConfig {
                name: name.to_string(),
                config_json,
            }),
            "Ok",
        );
        response.data.name = name.to_string();
        response
    }

    pub fn create_job(&self, name: &str, definition: JobDefinition) -> Response<Empty> {
        let result = self.store().create(name, definition).map(|_| Empty {});
        Response::from_result(result, "Job created successfully")
    }

    /// Parses `json` as a job definition before creating the job.
    pub fn create_job_from_json(&self, name: &str, json: &str) -> Response<Empty> {
        match serde_json::from_str::<JobDefinition>(json) {
            Ok(definition) => self.create_job(name, definition),
            Err(e) => Response::from_result(Err(e.into()), ""),
        }
    }

    pub fn update_job(&self, name: &str, patch: JobPatch) -> Response<Empty> {
        if self.engine.is_running(name) {
            tracing::warn!(job = name, "Updating a job while it runs");
        }
        let result = self.engine.update(name, patch).map(|job| {
            tracing::info!(job = %job.name, "Job updated");
            Empty {}
        });
        Response::from_result(result, "Job updated")
    }

    pub fn delete_job(&self, name: &str) -> Response<Empty> {
        let result = if self.engine.is_running(name) {
            Err(VikiError::Busy(name.to_string()))
        } else {
            self.store().delete(name).map(|_| Empty {})
        };
        Response::from_result(result, "Job deleted")
    }

    pub async fn run_job(&self, name: &str, cancel: &CancellationToken) -> Response<RunResult> {
        let report = self.engine.run(name, cancel).await;
        Response {
            success: report.success,
            message: report.message,
            kind: report.kind,
            data: RunResult {
                return_code: report.return_code,
                run_number: report.record.run_number,
            },
        }
    }

    pub fn job_output(&self, name: &str) -> Response<JobOutput> {
        let result = self.store().output(name).map(|output| JobOutput { output });
        Response::from_result(result, "Ok")
    }
}
