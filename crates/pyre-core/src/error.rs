//! Error types and the process exit-code taxonomy.
//!
//! Exit codes are the one contract scripting callers depend on, so the
//! taxonomy is deliberately small: success, a generic/environment
//! failure, and a build-tool failure that lets callers distinguish "the
//! analysis tool is broken" from "the project's build is broken".

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// Exit Codes
// ============================================================================

/// Process exit codes surfaced to the shell.
///
/// The numeric values are a public contract; scripts match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The invocation completed normally (includes user interruption).
    Success,
    /// Environment, client, or uncategorized error.
    Failure,
    /// The external build tool failed; the project's build is broken,
    /// not the analysis tooling.
    BuckError,
}

impl ExitCode {
    /// Returns the numeric code passed to `std::process::exit`.
    pub const fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failure => 2,
            ExitCode::BuckError => 3,
        }
    }
}

// ============================================================================
// Core Error Type
// ============================================================================

/// Errors raised during root and configuration resolution.
///
/// All variants are environment errors in the taxonomy above: fatal,
/// reported to the user, never retried automatically.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A local configuration was discovered nested under another local
    /// configuration. The log-directory derivation relies on this never
    /// happening, so resolution must not proceed.
    #[error(
        "Local configuration at `{}` is nested under another local configuration at \
         `{}`. Please combine the sources into a single configuration or split the \
         parent configuration to avoid inconsistent errors.",
        .nested.display(),
        .parent.display()
    )]
    NestedLocalConfiguration { nested: PathBuf, parent: PathBuf },

    /// A directory the client needs to read does not exist or is not
    /// readable.
    #[error("`{}` is not a valid readable directory", .0.display())]
    UnreadableDirectory(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration at `{}`: {source}", .path.display())]
    ConfigurationParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The configuration file could not be read.
    #[error("Failed to read configuration at `{}`: {source}", .path.display())]
    ConfigurationRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O error passthrough (log-directory creation and similar).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_values_are_stable() {
        assert_eq!(ExitCode::Success.code(), 0);
        assert_eq!(ExitCode::Failure.code(), 2);
        assert_eq!(ExitCode::BuckError.code(), 3);
    }

    #[test]
    fn test_nested_local_configuration_display() {
        let error = CoreError::NestedLocalConfiguration {
            nested: PathBuf::from("/repo/a/b"),
            parent: PathBuf::from("/repo/a"),
        };
        let display = format!("{error}");
        assert!(display.contains("/repo/a/b"));
        assert!(display.contains("nested under another local configuration"));
    }

    #[test]
    fn test_io_error_from_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "missing");
        let core_error: CoreError = io_error.into();
        assert!(matches!(core_error, CoreError::Io(_)));
    }
}
