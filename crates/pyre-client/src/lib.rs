//! Pyre Client - Orchestration in front of the analysis daemon
//!
//! This crate turns one CLI invocation into at most one interaction
//! with the long-lived analysis daemon:
//!
//! 1. **CommandDispatcher** ([`commands`]): maps the parsed invocation
//!    to exactly one session operation and an exit code.
//! 2. **AnalysisDirectory** ([`analysis`]): decides between a
//!    pass-through source directory and a synthesized overlay merging
//!    multiple roots and build outputs.
//! 3. **BuildAction** ([`buck`]): the opaque external build step that
//!    produces overlay inputs for build targets.
//! 4. **ServerSession** ([`server`]): pid-file liveness and the
//!    start/stop/restart/incremental/kill transitions.
//!
//! The client is single-threaded, synchronous, and short-lived; any
//! parallelism lives inside the daemon, which this crate treats as an
//! opaque collaborator.

pub mod analysis;
pub mod buck;
pub mod commands;
pub mod error;
pub mod persistent;
pub mod server;

// Re-export commonly used types
pub use analysis::{AnalysisDirectory, DirectoryRequest};
pub use buck::BuildAction;
pub use commands::{run, Cli, Operation};
pub use error::{ClientError, Result};
pub use server::{ServerSession, ServerState};
