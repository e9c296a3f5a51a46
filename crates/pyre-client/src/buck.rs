//! External build-tool integration.
//!
//! The build system is an opaque collaborator: the client asks it to
//! materialize build targets and gets back either output locations or a
//! failure that aborts the invocation before any daemon contact.
//!
//! Two strategies exist and exactly one is chosen per invocation,
//! carried as a tagged [`BuildAction`] value rather than a pair of
//! independently mutable booleans:
//!
//! * **on-demand** - shell out to `buck` directly, running a full build
//!   only when the invocation asked for one (explicit `--build`, or a
//!   one-shot operation);
//! * **accelerated** - delegate to a separate build-orchestration
//!   daemon, which requires a discoverable Buck project root.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

use pyre_core::find_root;

/// Marker file identifying a Buck project root.
pub const BUCK_CONFIGURATION_FILE: &str = ".buckconfig";

/// Default name of the accelerated builder binary.
const DEFAULT_BUILDER_BINARY: &str = "buck-builder";

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the external build tool.
///
/// These surface as the BUCK_ERROR exit code: the project's build is
/// broken, not the analysis tooling.
#[derive(Error, Debug)]
pub enum BuckError {
    /// The build tool exited with a failure status.
    #[error("Buck build failed with status {status} for targets {targets:?}")]
    BuildFailed { targets: Vec<String>, status: i32 },

    /// The build tool (or builder daemon) could not be invoked at all.
    #[error("Failed to invoke `{tool}`: {source}")]
    Invocation {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The build tool reported output in a shape the client cannot
    /// interpret.
    #[error("Unexpected output from the build tool: {0}")]
    MalformedOutput(String),
}

// ============================================================================
// Root discovery and target helpers
// ============================================================================

/// Walks upward from `start` for the nearest Buck project root.
pub fn find_buck_root(start: &Path) -> Option<PathBuf> {
    find_root(start, BUCK_CONFIGURATION_FILE)
}

/// The directory a target presumably covers, used for filter-path
/// scoping: `//a/b:lib` -> `a/b`.
pub fn presumed_target_root(target: &str) -> PathBuf {
    let stripped = target.trim_start_matches("//");
    let stripped = stripped.split(':').next().unwrap_or(stripped);
    let stripped = stripped.trim_end_matches("/...");
    PathBuf::from(stripped)
}

// ============================================================================
// Build Action
// ============================================================================

/// The build strategy for one invocation. Chosen once, passed by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildAction {
    /// Shell out to `buck` directly. `build` controls whether a full
    /// build runs before output locations are resolved.
    OnDemand { build: bool },
    /// Delegate to the build-orchestration daemon rooted at
    /// `buck_root`.
    Accelerated {
        buck_root: PathBuf,
        builder_binary: Option<PathBuf>,
        builder_target: Option<String>,
        debug: bool,
    },
}

impl BuildAction {
    /// Materializes `targets` and returns their output locations, in
    /// target declaration order.
    ///
    /// Returns an empty list for an empty target set without touching
    /// the build tool.
    pub fn build(
        &self,
        targets: &[String],
        working_directory: &Path,
    ) -> Result<Vec<PathBuf>, BuckError> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            BuildAction::OnDemand { build } => {
                if *build {
                    info!(count = targets.len(), "Building targets with buck");
                    run_buck_build(targets, working_directory)?;
                }
                resolve_output_locations(targets, working_directory)
            }
            BuildAction::Accelerated {
                buck_root,
                builder_binary,
                builder_target,
                debug,
            } => run_accelerated_builder(
                targets,
                buck_root,
                builder_binary.as_deref(),
                builder_target.as_deref(),
                *debug,
            ),
        }
    }
}

fn run_buck_build(targets: &[String], working_directory: &Path) -> Result<(), BuckError> {
    let output = Command::new("buck")
        .arg("build")
        .args(targets)
        .current_dir(working_directory)
        .output()
        .map_err(|source| BuckError::Invocation {
            tool: "buck".to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(BuckError::BuildFailed {
            targets: targets.to_vec(),
            status: output.status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Asks buck where the targets' output trees live. One line per target:
/// `<target> <path>`.
fn resolve_output_locations(
    targets: &[String],
    working_directory: &Path,
) -> Result<Vec<PathBuf>, BuckError> {
    let output = Command::new("buck")
        .args(["targets", "--show-output"])
        .args(targets)
        .current_dir(working_directory)
        .output()
        .map_err(|source| BuckError::Invocation {
            tool: "buck".to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(BuckError::BuildFailed {
            targets: targets.to_vec(),
            status: output.status.code().unwrap_or(-1),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut locations = Vec::new();
    for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
        let mut columns = line.split_whitespace();
        let target = columns.next();
        match columns.next() {
            Some(path) => {
                debug!(target = ?target, path = %path, "Resolved build output");
                locations.push(working_directory.join(path));
            }
            None => {
                return Err(BuckError::MalformedOutput(format!(
                    "no output location reported for `{line}`"
                )))
            }
        }
    }
    Ok(locations)
}

fn run_accelerated_builder(
    targets: &[String],
    buck_root: &Path,
    builder_binary: Option<&Path>,
    builder_target: Option<&str>,
    debug: bool,
) -> Result<Vec<PathBuf>, BuckError> {
    let binary = builder_binary
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILDER_BINARY));
    let tool = binary.display().to_string();

    let mut command = Command::new(&binary);
    command.arg("--buck-root").arg(buck_root);
    if let Some(builder_target) = builder_target {
        command.arg("--builder-target").arg(builder_target);
    }
    if debug {
        command.arg("--debug");
    }
    command.args(targets);

    info!(builder = %tool, count = targets.len(), "Delegating build to the builder daemon");
    let output = command
        .output()
        .map_err(|source| BuckError::Invocation { tool, source })?;
    if !output.status.success() {
        return Err(BuckError::BuildFailed {
            targets: targets.to_vec(),
            status: output.status.code().unwrap_or(-1),
        });
    }

    // The builder reports one output tree per line.
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| PathBuf::from(line.trim()))
        .collect())
}

// ============================================================================
// Tests
// ============================================================================
