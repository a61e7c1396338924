mod record;
mod run;

pub use record::{Job, JobDefinition, JobPatch, validate_name};
pub use run::{RunRecord, RunState};
