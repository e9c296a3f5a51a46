//! Pyre Core - Root and configuration resolution
//!
//! This crate provides the leaf components of the Pyre client: locating
//! the project root, merging project and local configuration files, and
//! the exit-code taxonomy shared with scripting callers.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`
//! outside of tests.

pub mod config;
pub mod error;
pub mod root;

// Re-exports for convenience
pub use config::Configuration;
pub use error::{CoreError, CoreResult, ExitCode};
pub use root::{
    find_root, RootLayout, BINARY_NAME, CONFIGURATION_FILE, LOCAL_CONFIGURATION_FILE,
    LOG_DIRECTORY,
};
