use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecorderError>;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("missing dependency command: {command}")]
    MissingCommand { command: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("required path does not exist: {path}")]
    MissingPath { path: PathBuf },

    #[error("path is not executable: {path}")]
    NotExecutable { path: PathBuf },

    #[error("application never became ready at {endpoint} after {attempts} attempts")]
    NotReady { endpoint: String, attempts: u32 },

    #[error("keploy record failed (exit={exit_code}); see {log}")]
    CaptureFailed { exit_code: i32, log: PathBuf },

    #[error("no fixture files found in {dir} {context}")]
    NoFixtures { dir: PathBuf, context: String },

    #[error("keploy sanitize failed (exit={exit_code}); see {log}")]
    SanitizeFailed { exit_code: i32, log: PathBuf },

    #[error("{0}")]
    Usage(String),

    #[error("{message}")]
    Exit { code: i32, message: String },
}

impl RecorderError {
    /// Every fatal condition exits with 1 unless a caller asked for a
    /// specific code through [`RecorderError::exit`].
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exit { code, .. } => *code,
            _ => 1,
        }
    }

    #[must_use]
    pub fn exit(code: i32, message: impl Into<String>) -> Self {
        Self::Exit {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
