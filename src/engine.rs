//! Job execution engine.
//!
//! [`Engine::run`] turns a stored job into a sequential, fail-fast run:
//! it admits at most one run per job name, validates the record, allocates a
//! scratch workspace, runs each step through the [`CommandRunner`] with the
//! job's output log as sink, removes the workspace and writes the run
//! counters back through the [`JobStore`].

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Result, VikiError};
use crate::job::{Job, JobPatch, RunRecord, RunState, validate_name};
use crate::runner::{CommandRunner, StepContext, StepStatus};
use crate::store::JobStore;
use crate::workspace::Workspace;

/// Message of a successful run.
pub const RUN_SUCCESSFUL: &str = "Run successful";

/// Result of one call to [`Engine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub message: String,
    /// Exit code of the failing step, 0 otherwise.
    pub return_code: i32,
    pub kind: Option<ErrorKind>,
    /// Scratch workspace used by the run, already removed.
    pub workspace: Option<PathBuf>,
    pub record: RunRecord,
}

pub struct Engine<S, R> {
    store: S,
    runner: R,
    workspace_root: PathBuf,
    step_timeout: Option<Duration>,
    running: Mutex<HashSet<String>>,
    /// Serializes read-modify-write cycles on stored records.
    records: Mutex<()>,
}

/// Holds a job's run slot; releases it on drop.
struct RunSlot<'a> {
    running: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

impl<S: JobStore, R: CommandRunner> Engine<S, R> {
    pub fn new(store: S, runner: R, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            runner,
            workspace_root: workspace_root.into(),
            step_timeout: None,
            running: Mutex::new(HashSet::new()),
            records: Mutex::new(()),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Merges `patch` into the stored record. Never interleaves with the
    /// statistics write of a finishing run.
    pub fn update(&self, name: &str, patch: JobPatch) -> Result<Job> {
        let _records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        self.store.update(name, patch)
    }

    /// Runs the job's steps in order, stopping at the first failure.
    ///
    /// Never returns an error: every failure is folded into the report.
    pub async fn run(&self, name: &str, cancel: &CancellationToken) -> RunReport {
        let mut record = RunRecord::begin(name);
        let mut workspace = None;

        let result = match self.admit(name) {
            Ok(_slot) => self.run_admitted(name, cancel, &mut record, &mut workspace).await,
            Err(e) => Err(e),
        };
        record.enter(if result.is_ok() {
            RunState::Succeeded
        } else {
            RunState::Failed
        });

        match result {
            Ok(()) => {
                tracing::info!(job = name, run_number = ?record.run_number, "Run successful");
                RunReport {
                    success: true,
                    message: RUN_SUCCESSFUL.to_string(),
                    return_code: 0,
                    kind: None,
                    workspace,
                    record,
                }
            }
            Err(e) => {
                tracing::warn!(job = name, kind = %e.kind(), error = %e, "Run failed");
                record.return_code = e.return_code();
                RunReport {
                    success: false,
                    message: e.to_string(),
                    return_code: e.return_code(),
                    kind: Some(e.kind()),
                    workspace,
                    record,
                }
            }
        }
    }

    fn admit(&self, name: &str) -> Result<RunSlot<'_>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(name.to_string()) {
            return Err(VikiError::Busy(name.to_string()));
        }
        Ok(RunSlot {
            running: &self.running,
            name: name.to_string(),
        })
    }

    async fn run_admitted(
        &self,
        name: &str,
        cancel: &CancellationToken,
        record: &mut RunRecord,
        workspace: &mut Option<PathBuf>,
    ) -> Result<()> {
        record.enter(RunState::Validating);
        let job = self.validate(name, cancel)?;
        record.steps_total = job.steps.len();

        record.enter(RunState::Preparing);
        let result = self.prepare_and_execute(&job, cancel, record, workspace).await;

        record.run_number = self.record_stats(job, result.is_ok());
        result
    }

    fn validate(&self, name: &str, cancel: &CancellationToken) -> Result<Job> {
        validate_name(name)?;
        if !self.store.exists(name) {
            return Err(VikiError::NotFound("Job not found".into()));
        }
        let raw = self.store.get(name).map_err(|e| match e {
            VikiError::NotFound(_) => VikiError::NotFound("Job file not found".into()),
            other => other,
        })?;
        let job = Job::parse(name, &raw)?;
        if job.steps.is_empty() {
            return Err(VikiError::InvalidState("Job has no steps".into()));
        }
        if cancel.is_cancelled() {
            return Err(VikiError::Cancelled);
        }
        Ok(job)
    }

    async fn prepare_and_execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        record: &mut RunRecord,
        workspace_path: &mut Option<PathBuf>,
    ) -> Result<()> {
        let workspace = Workspace::allocate(&self.workspace_root)?;
        *workspace_path = Some(workspace.path().to_path_buf());

        record.enter(RunState::Running);
        let result = self
            .execute_steps(job, workspace.path(), cancel, record)
            .await;

        record.enter(RunState::Cleanup);
        match (result, workspace.close()) {
            (Ok(()), Err(cleanup)) => Err(cleanup),
            (Err(e), Err(cleanup)) => {
                tracing::warn!(job = %job.name, error = %cleanup, "Workspace cleanup failed");
                Err(e)
            }
            (result, Ok(())) => result,
        }
    }

    async fn execute_steps(
        &self,
        job: &Job,
        working_dir: &Path,
        cancel: &CancellationToken,
        record: &mut RunRecord,
    ) -> Result<()> {
        let mut log = self.store.open_output(&job.name)?;
        writeln!(
            log,
            "==> run #{} of {} started at {}",
            job.run_number + 1,
            job.name,
            Utc::now().to_rfc3339()
        )
        .map_err(|e| VikiError::resource("failed to write job output", e))?;

        for (index, step) in job.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(VikiError::Cancelled);
            }
            let number = index + 1;
            tracing::info!(job = %job.name, step = number, command = %step, "Running step");

            let sink = log
                .try_clone()
                .map_err(|e| VikiError::resource("failed to open job output", e))?;
            let ctx = StepContext {
                sink,
                working_dir,
                timeout: self.step_timeout,
                cancel,
            };
            let outcome = self.runner.run(step, ctx).await;
            record.steps_run = number;

            if !outcome.success {
                return Err(match outcome.status {
                    StepStatus::TimedOut => VikiError::StepTimedOut {
                        step: number,
                        exit_code: outcome.exit_code,
                    },
                    StepStatus::Cancelled => VikiError::Cancelled,
                    _ => VikiError::StepFailed {
                        step: number,
                        exit_code: outcome.exit_code,
                    },
                });
            }
        }
        Ok(())
    }

    /// Advances the counters on the latest stored record. Failures here are
    /// logged; the run outcome stands.
    fn record_stats(&self, job: Job, success: bool) -> Option<u64> {
        let name = job.name.clone();
        let _records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut latest = match self.store.load(&name) {
            Ok(latest) => latest,
            Err(e) => {
                tracing::warn!(job = %name, error = %e, "Reloading job for statistics failed");
                job
            }
        };
        let run_number = latest.record_run(success);
        match self.store.put(&latest) {
            Ok(()) => Some(run_number),
            Err(e) => {
                tracing::warn!(job = %name, error = %e, "Failed to record run statistics");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDefinition;
    use crate::runner::ShellRunner;
    use crate::runner::mock::MockRunner;
    use crate::store::{FsJobStore, MemoryJobStore};
    use tempfile::TempDir;

    fn steps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn mock_engine(codes: Vec<i32>) -> (TempDir, Engine<MemoryJobStore, MockRunner>) {
        let root = TempDir::new().unwrap();
        let engine = Engine::new(
            MemoryJobStore::new().unwrap(),
            MockRunner::with_codes(codes),
            root.path(),
        );
        (root, engine)
    }

    fn shell_engine() -> (TempDir, Engine<FsJobStore, ShellRunner>) {
        let tmp = TempDir::new().unwrap();
        let store = FsJobStore::new(tmp.path().join("jobs"));
        store.init().unwrap();
        std::fs::create_dir(tmp.path().join("scratch")).unwrap();
        let engine = Engine::new(store, ShellRunner::default(), tmp.path().join("scratch"));
        (tmp, engine)
    }

    fn workspaces_left(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn all_steps_succeed() {
        let (root, engine) = mock_engine(vec![]);
        engine
            .store()
            .create("ok", JobDefinition::new("d", steps(&["true", "true"])))
            .unwrap();

        let report = engine.run("ok", &CancellationToken::new()).await;
        assert!(report.success);
        assert_eq!(report.return_code, 0);
        assert_eq!(report.message, RUN_SUCCESSFUL);
        assert_eq!(report.kind, None);
        assert_eq!(engine.runner.executed_commands(), steps(&["true", "true"]));
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[tokio::test]
    async fn first_failure_stops_the_run() {
        let (root, engine) = mock_engine(vec![0, 2, 0]);
        engine
            .store()
            .create("ff", JobDefinition::new("d", steps(&["a", "b", "c"])))
            .unwrap();

        let report = engine.run("ff", &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.return_code, 2);
        assert_eq!(report.kind, Some(ErrorKind::StepFailure));
        assert_eq!(report.record.steps_run, 2);
        assert_eq!(engine.runner.executed_commands(), steps(&["a", "b"]));
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[tokio::test]
    async fn steps_run_inside_the_workspace() {
        let (_root, engine) = mock_engine(vec![]);
        engine
            .store()
            .create("ws", JobDefinition::new("d", steps(&["a", "b"])))
            .unwrap();

        let report = engine.run("ws", &CancellationToken::new()).await;
        let workspace = report.workspace.unwrap();
        assert_eq!(engine.runner.working_dirs(), vec![workspace.clone(), workspace.clone()]);
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let (root, engine) = mock_engine(vec![]);
        let report = engine.run("ghost", &CancellationToken::new()).await;

        assert!(!report.success);
        assert_eq!(report.message, "Job not found");
        assert_eq!(report.kind, Some(ErrorKind::NotFound));
        assert!(report.workspace.is_none());
        assert_eq!(workspaces_left(root.path()), 0);
    }

    #[tokio::test]
    async fn job_without_steps_is_rejected_before_workspace() {
        let (root, engine) = mock_engine(vec![]);
        engine
            .store()
            .insert_raw("empty", r#"{"description":"d","steps":[],"name":"empty"}"#);

        let report = engine.run("empty", &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.message, "Job has no steps");
        assert_eq!(report.kind, Some(ErrorKind::InvalidState));
        assert!(report.workspace.is_none());
        assert_eq!(workspaces_left(root.path()), 0);
        assert!(engine.runner.executed_commands().is_empty());
    }

    #[tokio::test]
    async fn unparsable_record_is_parse_error() {
        let (_root, engine) = mock_engine(vec![]);
        engine.store().insert_raw("broken", "{not json");

        let report = engine.run("broken", &CancellationToken::new()).await;
        assert_eq!(report.kind, Some(ErrorKind::ParseError));
        assert_eq!(report.record.run_number, None);
    }

    #[tokio::test]
    async fn statistics_advance_per_run() {
        let (_root, engine) = mock_engine(vec![0, 1, 0]);
        engine
            .store()
            .create("stats", JobDefinition::new("d", steps(&["a"])))
            .unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(engine.run("stats", &cancel).await.record.run_number, Some(1));
        assert_eq!(engine.run("stats", &cancel).await.record.run_number, Some(2));
        assert_eq!(engine.run("stats", &cancel).await.record.run_number, Some(3));

        let job = engine.store().load("stats").unwrap();
        assert_eq!(job.run_number, 3);
        assert_eq!(job.last_successful_run, 3);
        assert_eq!(job.last_failed_run, 2);
    }

    #[tokio::test]
    async fn concurrent_run_of_same_job_is_busy() {
        let (_root, engine) = mock_engine(vec![]);
        engine
            .store()
            .create("one", JobDefinition::new("d", steps(&["a", "b"])))
            .unwrap();
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(engine.run("one", &cancel), engine.run("one", &cancel));
        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.kind, Some(ErrorKind::Busy));
        assert_eq!(second.message, "Job 'one' is already running");
        assert_eq!(engine.runner.executed_commands(), steps(&["a", "b"]));
        assert!(!engine.is_running("one"));
    }

    #[tokio::test]
    async fn different_jobs_run_side_by_side() {
        let (_root, engine) = mock_engine(vec![]);
        for name in ["x", "y"] {
            engine
                .store()
                .create(name, JobDefinition::new("d", steps(&["a"])))
                .unwrap();
        }
        let cancel = CancellationToken::new();

        let (x, y) = tokio::join!(engine.run("x", &cancel), engine.run("y", &cancel));
        assert!(x.success && y.success);
        assert_ne!(x.workspace, y.workspace);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_steps() {
        let (_root, engine) = mock_engine(vec![]);
        engine
            .store()
            .create("c", JobDefinition::new("d", steps(&["a"])))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = engine.run("c", &cancel).await;
        assert_eq!(report.kind, Some(ErrorKind::Cancelled));
        assert_eq!(report.return_code, crate::runner::CANCELLED_EXIT_CODE);
        assert!(engine.runner.executed_commands().is_empty());
    }

    #[tokio::test]
    async fn output_log_accumulates_across_runs() {
        let (_root, engine) = mock_engine(vec![]);
        engine
            .store()
            .create("log", JobDefinition::new("d", steps(&["echo hi"])))
            .unwrap();
        let cancel = CancellationToken::new();
        engine.run("log", &cancel).await;
        engine.run("log", &cancel).await;

        let output = engine.store().output("log").unwrap();
        assert!(output.contains("==> run #1 of log"));
        assert!(output.contains("==> run #2 of log"));
        assert_eq!(output.matches("+ echo hi").count(), 2);
    }

    #[tokio::test]
    async fn directory_without_record_is_job_file_not_found() {
        let (tmp, engine) = shell_engine();
        std::fs::create_dir(engine.store().root().join("nocfg")).unwrap();

        let report = engine.run("nocfg", &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.message, "Job file not found");
        assert_eq!(report.kind, Some(ErrorKind::NotFound));
        assert_eq!(report.record.run_number, None);
        assert!(report.workspace.is_none());
        assert_eq!(workspaces_left(&tmp.path().join("scratch")), 0);
    }

    #[tokio::test]
    async fn record_with_invalid_utf8_is_parse_error() {
        let (tmp, engine) = shell_engine();
        let dir = engine.store().root().join("bad");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join(crate::store::CONFIG_FILE), b"\xff\xfe{").unwrap();

        let report = engine.run("bad", &CancellationToken::new()).await;
        assert_eq!(report.kind, Some(ErrorKind::ParseError));
        assert_eq!(report.record.run_number, None);
        assert!(report.workspace.is_none());
        assert_eq!(workspaces_left(&tmp.path().join("scratch")), 0);
    }

    #[tokio::test]
    async fn record_without_description_is_parse_error() {
        let (_root, engine) = mock_engine(vec![]);
        engine.store().insert_raw("nodesc", r#"{"steps":["true"]}"#);

        let report = engine.run("nodesc", &CancellationToken::new()).await;
        assert_eq!(report.kind, Some(ErrorKind::ParseError));
        assert!(engine.runner.executed_commands().is_empty());
    }

    #[tokio::test]
    async fn binary_step_output_stays_readable() {
        let (_tmp, engine) = shell_engine();
        engine
            .store()
            .create("bin", JobDefinition::new("d", steps(&[r"printf '\377\376'", "echo done"])))
            .unwrap();

        let report = engine.run("bin", &CancellationToken::new()).await;
        assert!(report.success, "{}", report.message);

        let output = engine.store().output("bin").unwrap();
        assert!(output.contains('\u{FFFD}'));
        assert!(output.contains("done"));
    }

    #[test]
    fn updates_and_statistics_do_not_lose_writes() {
        let store = MemoryJobStore::new().unwrap();
        let job = store
            .create("shared", JobDefinition::new("d0", steps(&["true"])))
            .unwrap();
        let engine = Engine::new(store, ShellRunner::default(), std::env::temp_dir());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..50 {
                    engine.record_stats(job.clone(), true);
                }
            });
            scope.spawn(|| {
                for i in 1..=50 {
                    let patch = JobPatch {
                        description: Some(format!("d{i}")),
                        steps: None,
                    };
                    engine.update("shared", patch).unwrap();
                }
            });
        });

        let stored = engine.store().load("shared").unwrap();
        assert_eq!(stored.run_number, 50);
        assert_eq!(stored.last_successful_run, 50);
        assert_eq!(stored.description, "d50");
    }

    #[tokio::test]
    async fn shell_pipeline_stops_at_false() {
        let (tmp, engine) = shell_engine();
        engine
            .store()
            .create(
                "pipeline",
                JobDefinition::new("d", steps(&["true", "false", "touch third"])),
            )
            .unwrap();

        let report = engine.run("pipeline", &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.return_code, 1);
        assert_eq!(report.record.steps_run, 2);

        let output = engine.store().output("pipeline").unwrap();
        assert!(output.contains("+ false"));
        assert!(!output.contains("touch third"));
        assert_eq!(workspaces_left(&tmp.path().join("scratch")), 0);
    }

    #[tokio::test]
    async fn shell_steps_share_the_workspace() {
        let (tmp, engine) = shell_engine();
        engine
            .store()
            .create(
                "build",
                JobDefinition::new("d", steps(&["echo built > artifact", "test -f artifact"])),
            )
            .unwrap();

        let report = engine.run("build", &CancellationToken::new()).await;
        assert!(report.success, "{}", report.message);
        assert_eq!(workspaces_left(&tmp.path().join("scratch")), 0);
    }

    #[tokio::test]
    async fn step_timeout_fails_the_run() {
        let (_tmp, engine) = shell_engine();
        let engine = engine.with_step_timeout(Some(Duration::from_millis(200)));
        engine
            .store()
            .create("slow", JobDefinition::new("d", steps(&["sleep 30", "true"])))
            .unwrap();

        let report = engine.run("slow", &CancellationToken::new()).await;
        assert_eq!(report.kind, Some(ErrorKind::Timeout));
        assert_eq!(report.return_code, crate::runner::TIMED_OUT_EXIT_CODE);
        assert_eq!(report.record.steps_run, 1);
    }

    #[tokio::test]
    async fn missing_workspace_root_is_resource_error() {
        let store = MemoryJobStore::new().unwrap();
        store
            .create("r", JobDefinition::new("d", steps(&["a"])))
            .unwrap();
        let engine = Engine::new(store, MockRunner::default(), "/nonexistent/viki-root");

        let report = engine.run("r", &CancellationToken::new()).await;
        assert_eq!(report.kind, Some(ErrorKind::ResourceError));
        assert_eq!(engine.store().load("r").unwrap().last_failed_run, 1);
    }
}
