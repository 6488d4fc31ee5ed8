use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("working directory does not exist: {}", .0.display())]
    MissingWorkingDir(PathBuf),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("{stream} pump failed: {reason}")]
    Pump { stream: &'static str, reason: String },
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
