//! Error types for the client orchestration layer.
//!
//! Every error maps onto the small exit-code taxonomy in `pyre-core`:
//! build-tool failures surface as BUCK_ERROR so calling scripts can
//! tell a broken project build from broken analysis tooling; everything
//! else is FAILURE.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use pyre_core::{CoreError, ExitCode};

use crate::buck::BuckError;

/// Client orchestration errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Root or configuration resolution failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The external build tool failed.
    #[error(transparent)]
    Buck(#[from] BuckError),

    /// The accelerated builder was requested but no Buck project root
    /// is discoverable. An environment error, not a build failure.
    #[error("No Buck configuration at `{}` or any of its ancestors", .0.display())]
    BuckRootNotFound(PathBuf),

    /// A query or incremental request was issued against a dead server.
    /// No automatic restart is attempted; the caller must `restart`.
    #[error("Server is not running; run `pyre start` or `pyre restart` first")]
    ServerNotRunning,

    /// The daemon did not report ready within the startup timeout.
    #[error("Server did not start within {seconds} seconds")]
    StartTimeout { seconds: u64 },

    /// The daemon did not exit after a graceful stop request.
    #[error("Server did not stop within {seconds} seconds; try `pyre kill`")]
    StopTimeout { seconds: u64 },

    /// A daemon-directed request completed with a failure status.
    #[error("Server request `{request}` failed with exit status {status}")]
    RequestFailed { request: String, status: i32 },

    /// The daemon binary could not be found or spawned.
    #[error("Could not run the analysis binary at `{}`: {source}", .binary.display())]
    BinaryUnavailable {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A configuration file already exists where `initialize` would
    /// write one.
    #[error("A configuration already exists at `{}`", .0.display())]
    ConfigurationExists(PathBuf),

    /// I/O error passthrough (overlay materialization, lock files).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Maps the error onto the exit-code taxonomy.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ClientError::Buck(_) => ExitCode::BuckError,
            _ => ExitCode::Failure,
        }
    }
}

/// Convenience Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
