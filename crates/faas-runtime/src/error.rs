//! Runtime error taxonomy
//!
//! Every fatal condition maps to a distinct process exit code so supervisors
//! can tell a bad deployment (startup/load) from a misbehaving handler.

use std::path::PathBuf;

use faas_runtime_sdk::{Failure, FailureKind};
use thiserror::Error;

use crate::services::StoreError;

/// Preconditions checked before the polling loop starts
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("handler source not found: {0:?}")]
    HandlerSourceMissing(PathBuf),

    #[error("store connection failed: {endpoint}: {reason}")]
    StoreUnreachable { endpoint: String, reason: String },

    #[error("output key is not set (REDIS_OUTPUT_KEY)")]
    OutputKeyUnset,

    #[error("archive not found: {0:?}")]
    ArchiveMissing(PathBuf),

    #[error("archive {path:?} is unreadable: {reason}")]
    ArchiveInvalid { path: PathBuf, reason: String },

    #[error("archive entry {entry:?} not found under {target_dir:?}")]
    ArchiveEntryMissing { entry: PathBuf, target_dir: PathBuf },
}

/// Failures while (re)loading the handler library
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to load handler library {path:?}: {reason}")]
    Library { path: PathBuf, reason: String },

    #[error("entry function `{entry}` not found in {path:?}")]
    EntryMissing { entry: String, path: PathBuf },

    #[error("handler ABI version {found} does not match runtime ABI version {expected}")]
    AbiMismatch { expected: u32, found: u32 },
}

/// Phase in which a fatal error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    Startup,
    Load,
    Invoke,
    Encode,
    Store,
}

/// Errors that stop the runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("handler load failed: {0}")]
    Load(#[from] LoadError),

    #[error("handler must return a JSON-encodable value: {0}")]
    Encoding(String),

    #[error("handler failed: {0}")]
    Handler(Failure),

    #[error("store unavailable after {attempts} consecutive failures: {source}")]
    StoreExhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl RuntimeError {
    /// Phase the error belongs to
    pub fn phase(&self) -> ErrorPhase {
        match self {
            RuntimeError::Config(_) | RuntimeError::Startup(_) => ErrorPhase::Startup,
            RuntimeError::Load(_) => ErrorPhase::Load,
            RuntimeError::Encoding(_) => ErrorPhase::Encode,
            RuntimeError::Handler(_) => ErrorPhase::Invoke,
            RuntimeError::StoreExhausted { .. } => ErrorPhase::Store,
        }
    }

    /// Process exit code for this error (0 is reserved for clean shutdown)
    pub fn exit_code(&self) -> u8 {
        match self.phase() {
            ErrorPhase::Startup => 2,
            ErrorPhase::Load => 3,
            ErrorPhase::Encode => 4,
            ErrorPhase::Invoke => 5,
            ErrorPhase::Store => 6,
        }
    }
}

impl From<Failure> for RuntimeError {
    fn from(failure: Failure) -> Self {
        match failure.kind {
            FailureKind::Encoding => RuntimeError::Encoding(failure.message),
            FailureKind::Handler | FailureKind::Panic | FailureKind::Protocol => {
                RuntimeError::Handler(failure)
            }
        }
    }
}
