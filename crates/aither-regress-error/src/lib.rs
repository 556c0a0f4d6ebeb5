use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for the regression orchestrator.
///
/// Variants are grouped by the stage of a case run that produces them, so the
/// suite driver can decide whether a failure is local to one case.
#[derive(Error, Debug)]
pub enum RegressError {
    // === Configuration ===
    /// The case input file does not exist in the run directory.
    #[error("input file not found: '{path}'")]
    InputFileMissing { path: PathBuf },

    /// A case configuration violates one of its invariants.
    #[error("invalid configuration for case {case}: {detail}")]
    InvalidConfig { case: String, detail: String },

    // === Execution ===
    /// The launcher or solver binary could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Polling or reaping the child process failed.
    #[error("process supervision failed: {detail}")]
    Supervise { detail: String },

    // === Residual log ===
    /// The residual log was not produced.
    #[error("residual file not found: '{path}'")]
    ResidualFileMissing { path: PathBuf },

    /// The residual log exists but has no lines.
    #[error("residual file is empty: '{path}'")]
    ResidualFileEmpty { path: PathBuf },

    /// The last residual line is too short for the tracked metrics.
    #[error("residual file '{path}': last line has {found} columns, need at least {required}")]
    ResidualColumnsMissing {
        path: PathBuf,
        required: usize,
        found: usize,
    },

    /// A residual column could not be read as a float.
    #[error("residual file '{path}': column {column} is not numeric: {token:?}")]
    ResidualNotNumeric {
        path: PathBuf,
        column: usize,
        token: String,
    },

    // === I/O and reporting ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing or reading a machine-readable report failed.
    #[error("report error: {detail}")]
    Report { detail: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`RegressError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad case setup: missing input, invalid expectations.
    Configuration,
    /// The solver could not be launched or supervised.
    Execution,
    /// The residual log is missing or malformed.
    ResidualParse,
    /// Reporting, I/O and anything else.
    Internal,
}

impl RegressError {
    /// Classify this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InputFileMissing { .. } | Self::InvalidConfig { .. } => ErrorKind::Configuration,
            Self::Spawn { .. } | Self::Supervise { .. } => ErrorKind::Execution,
            Self::ResidualFileMissing { .. }
            | Self::ResidualFileEmpty { .. }
            | Self::ResidualColumnsMissing { .. }
            | Self::ResidualNotNumeric { .. } => ErrorKind::ResidualParse,
            Self::Io(_) | Self::Report { .. } | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure only affects the case that produced it.
    ///
    /// Case-local errors are recorded against the case and the suite moves on.
    pub const fn is_case_local(&self) -> bool {
        !matches!(self, Self::Report { .. } | Self::Internal(_))
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InputFileMissing { .. } => {
                Some("Check --tests-root and that the case directory contains <case>.inp")
            }
            Self::Spawn { .. } => Some("Check the --mpirunPath and --aitherPath arguments"),
            Self::ResidualFileMissing { .. } | Self::ResidualFileEmpty { .. } => {
                Some("Inspect <case>.out in the run directory; the solver wrote no residuals")
            }
            Self::ResidualColumnsMissing { .. } => {
                Some("The expected residual vector is longer than the solver output")
            }
            _ => None,
        }
    }

    /// Create an invalid-configuration error.
    pub fn invalid_config(case: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            case: case.into(),
            detail: detail.into(),
        }
    }

    /// Create a supervision error.
    pub fn supervise(detail: impl Into<String>) -> Self {
        Self::Supervise {
            detail: detail.into(),
        }
    }

    /// Create a report error.
    pub fn report(detail: impl Into<String>) -> Self {
        Self::Report {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `RegressError`.
pub type Result<T> = std::result::Result<T, RegressError>;
