use thiserror::Error;

/// Errors produced by the job store, the command runner and the engine.
///
/// Messages are user-facing: the operations facade copies `to_string()`
/// into the `message` field of its responses.
#[derive(Debug, Error)]
pub enum VikiError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("Job file could not be parsed: {0}")]
    Parse(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Build step {step} failed with exit code {exit_code}")]
    StepFailed { step: usize, exit_code: i32 },

    #[error("Build step {step} timed out")]
    StepTimedOut { step: usize, exit_code: i32 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Job '{0}' is already running")]
    Busy(String),
}

impl VikiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VikiError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            VikiError::NotFound(_) => ErrorKind::NotFound,
            VikiError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            VikiError::Parse(_) => ErrorKind::ParseError,
            VikiError::InvalidState(_) => ErrorKind::InvalidState,
            VikiError::StepFailed { .. } => ErrorKind::StepFailure,
            VikiError::StepTimedOut { .. } => ErrorKind::Timeout,
            VikiError::Cancelled => ErrorKind::Cancelled,
            VikiError::Resource(_) => ErrorKind::ResourceError,
            VikiError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            VikiError::Busy(_) => ErrorKind::Busy,
        }
    }

    /// Exit code to report for a failed run. Cancellation reports 130, other
    /// failures that are not tied to a step report 0.
    pub fn return_code(&self) -> i32 {
        match self {
            VikiError::StepFailed { exit_code, .. } | VikiError::StepTimedOut { exit_code, .. } => {
                *exit_code
            }
            VikiError::Cancelled => crate::runner::CANCELLED_EXIT_CODE,
            _ => 0,
        }
    }

    pub(crate) fn resource(context: &str, err: std::io::Error) -> Self {
        VikiError::Resource(format!("{context}: {err}"))
    }
}

impl From<serde_json::Error> for VikiError {
    fn from(err: serde_json::Error) -> Self {
        VikiError::Parse(err.to_string())
    }
}

/// Stable tag for a [`VikiError`], exposed to front ends and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    ParseError,
    InvalidState,
    StepFailure,
    Timeout,
    Cancelled,
    ResourceError,
    StoreUnavailable,
    Busy,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::StepFailure => "StepFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::ResourceError => "ResourceError",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::Busy => "Busy",
        };
        write!(f, "{name}")
    }
}

pub type Result<T, E = VikiError> = std::result::Result<T, E>;
