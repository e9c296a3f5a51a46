//! Command-line surface and dispatch.
//!
//! Every invocation maps to exactly one session operation. Dispatch is
//! a pure routing layer: resolve the roots, load the configuration,
//! build the analysis directory, hand the session one operation, and
//! translate the outcome into an exit code. No operation logic lives
//! here.

use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use pyre_core::{
    Configuration, ExitCode, RootLayout, CONFIGURATION_FILE, LOCAL_CONFIGURATION_FILE,
};

use crate::analysis::{resolve_analysis_directory, AnalysisDirectory, DirectoryRequest};
use crate::error::{ClientError, Result};
use crate::persistent;
use crate::server::ServerSession;

// ============================================================================
// CLI Arguments
// ============================================================================

/// A thin client in front of the type-analysis daemon.
#[derive(Parser, Debug)]
#[command(name = "pyre")]
#[command(about = "Incremental type analysis for large codebases")]
pub struct Cli {
    #[command(subcommand)]
    pub operation: Option<Operation>,

    /// Scope the run to a local configuration subdirectory.
    #[arg(long, short = 'l', global = true, value_name = "PATH")]
    pub local_configuration: Option<PathBuf>,

    /// Analyze this source directory (repeatable; overrides the
    /// configuration).
    #[arg(long, global = true, value_name = "PATH")]
    pub source_directory: Vec<PathBuf>,

    /// Analyze the outputs of this build target (repeatable; overrides
    /// the configuration).
    #[arg(long, global = true, value_name = "TARGET")]
    pub target: Vec<String>,

    /// Report errors under this directory only.
    #[arg(long, global = true, value_name = "PATH")]
    pub filter_directory: Option<PathBuf>,

    /// Freshly build all target outputs before analyzing.
    #[arg(long, global = true)]
    pub build: bool,

    /// Use the accelerated build-orchestration daemon.
    #[arg(long, global = true)]
    pub use_buck_builder: bool,

    /// Force the on-demand build tool even when the configuration
    /// prefers the accelerated path.
    #[arg(long, global = true)]
    pub use_legacy_builder: bool,

    /// Accelerated builder executable.
    #[arg(long, global = true, value_name = "PATH")]
    pub buck_builder_binary: Option<PathBuf>,

    /// Accelerated builder target.
    #[arg(long, global = true, value_name = "TARGET")]
    pub buck_builder_target: Option<String>,

    /// Run the accelerated builder with debug output.
    #[arg(long, global = true)]
    pub buck_builder_debug: bool,

    /// Additional stub/extension resolution root (repeatable; extends
    /// the configuration).
    #[arg(long, global = true, value_name = "PATH")]
    pub search_path: Vec<PathBuf>,

    /// External statistics logger binary (overrides the
    /// configuration).
    #[arg(long, global = true, value_name = "PATH")]
    pub logger: Option<PathBuf>,

    /// Run the daemon in strict mode.
    #[arg(long, global = true)]
    pub strict: bool,

    /// Analysis binary to invoke instead of the bundled one.
    #[arg(long, global = true, value_name = "PATH")]
    pub binary: Option<PathBuf>,

    /// Daemon logging sections, comma separated.
    #[arg(long, global = true, value_name = "SECTIONS")]
    pub logging_sections: Option<String>,

    /// Keep the daemon attached to the terminal instead of
    /// daemonizing (start/restart).
    #[arg(long, global = true)]
    pub terminal: bool,

    /// Accept a partial result instead of waiting for a full recheck
    /// (incremental).
    #[arg(long, global = true)]
    pub nonblocking: bool,

    /// Plain diagnostics without ANSI styling.
    #[arg(long, global = true)]
    pub noninteractive: bool,

    /// Debug-level diagnostics.
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Print the client and binary versions, then exit.
    #[arg(long)]
    pub version: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// One-shot check of the whole project, without a daemon.
    Check,
    /// One-shot whole-program analysis.
    Analyze {
        /// Write analysis results to this directory.
        #[arg(long, value_name = "PATH")]
        save_results_to: Option<PathBuf>,
    },
    /// Start the per-project analysis daemon.
    Start,
    /// Stop the daemon gracefully.
    Stop,
    /// Stop and start the daemon.
    Restart,
    /// Force-kill the daemon and remove its on-disk state.
    Kill,
    /// Fetch current errors from the daemon, starting one if needed.
    Incremental,
    /// Ask the daemon a one-off question about the analyzed code.
    Query {
        /// Query expression, e.g. `superclasses(int)`.
        query: String,
    },
    /// Long-lived IDE-integration session over stdin/stdout.
    Persistent,
    /// Write a fresh configuration file in the current directory.
    #[command(alias = "initialize")]
    Init {
        /// Write a local configuration instead of a project one.
        #[arg(long)]
        local: bool,
    },
}

// ============================================================================
// Dispatch
// ============================================================================

/// Runs one invocation to completion and returns its exit code.
/// Errors are logged here; callers only see the code.
pub fn run(cli: Cli) -> ExitCode {
    match try_run(cli) {
        Ok(code) => code,
        Err(error) => {
            error!(error = %error, "Command failed");
            error.exit_code()
        }
    }
}

fn try_run(cli: Cli) -> Result<ExitCode> {
    let original_directory = env::current_dir()?;

    // `init` runs before root resolution: its whole point is creating
    // the marker the resolver looks for.
    if let Some(Operation::Init { local }) = &cli.operation {
        initialize(&original_directory, *local)?;
        return Ok(ExitCode::Success);
    }

    let layout = RootLayout::resolve(&original_directory, cli.local_configuration.as_deref())?;

    // `kill` is the recovery hatch; a broken configuration must not
    // stop it from tearing the daemon down.
    if let Some(Operation::Kill) = &cli.operation {
        let configuration =
            Configuration::load(&layout).unwrap_or_else(|_| Configuration::default());
        let root = layout.project_root.clone();
        let mut session = ServerSession::new(
            configuration,
            layout,
            AnalysisDirectory::direct(root),
            cli.binary,
            cli.logging_sections,
        );
        session.kill()?;
        return Ok(ExitCode::Success);
    }

    let mut configuration = Configuration::load(&layout)?;
    if !cli.search_path.is_empty() {
        configuration
            .search_path
            .extend(cli.search_path.iter().map(|path| layout.translate(path)));
    }
    if let Some(logger) = &cli.logger {
        configuration.logger = Some(logger.clone());
    }
    if cli.strict {
        configuration.strict = true;
    }

    if cli.version {
        println!("Client version: {}", env!("CARGO_PKG_VERSION"));
        println!("Binary version: {}", configuration.binary_version());
        return Ok(ExitCode::Success);
    }

    if configuration.disabled {
        info!("Pyre is disabled for this project");
        return Ok(ExitCode::Success);
    }

    let operation = match cli.operation.clone() {
        Some(operation) => operation,
        None => default_operation(),
    };

    let request = directory_request(&cli, &operation);
    let analysis_directory =
        match resolve_analysis_directory(&request, &configuration, &layout) {
            Ok(directory) => directory,
            Err(error) if operation == Operation::Persistent && severs_ide_session(&error) => {
                return degrade_to_null_server(error);
            }
            Err(error) => return Err(error),
        };

    let mut session = ServerSession::new(
        configuration,
        layout,
        analysis_directory,
        cli.binary.clone(),
        cli.logging_sections.clone(),
    );

    let outcome = match &operation {
        Operation::Check => session.check(),
        Operation::Analyze { save_results_to } => {
            session.analyze(save_results_to.as_deref())
        }
        Operation::Start => session.start(cli.terminal),
        Operation::Stop => session.stop(),
        Operation::Restart => session.restart(cli.terminal),
        Operation::Incremental => session.incremental(cli.nonblocking),
        Operation::Query { query } => session.query(query),
        Operation::Persistent => session.persistent(),
        Operation::Kill | Operation::Init { .. } => Ok(()),
    };
    session.cleanup();
    match outcome {
        Err(error) if operation == Operation::Persistent && severs_ide_session(&error) => {
            degrade_to_null_server(error)
        }
        outcome => {
            outcome?;
            Ok(ExitCode::Success)
        }
    }
}

/// Environment and build-tool failures during session setup; exiting on
/// one of these would abruptly sever an editor's protocol channel.
fn severs_ide_session(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::Buck(_)
            | ClientError::BuckRootNotFound(_)
            | ClientError::Core(_)
            | ClientError::BinaryUnavailable { .. }
    )
}

/// Keeps the editor's channel alive with a null responder, then
/// surfaces the original error so its exit code still reaches the
/// shell.
fn degrade_to_null_server(error: ClientError) -> Result<ExitCode> {
    warn!(error = %error, "Session setup failed; serving null responses instead");
    let stdin = io::stdin();
    let stdout = io::stdout();
    if let Err(server_error) = persistent::run_null_server(
        &mut stdin.lock(),
        &mut stdout.lock(),
        persistent::NULL_SERVER_TIMEOUT,
    ) {
        warn!(error = %server_error, "Null responder failed");
    }
    Err(error)
}

/// The operation a bare `pyre` invocation means: incremental when a
/// file watcher is available, a one-shot check otherwise.
fn default_operation() -> Operation {
    if watchman_available() {
        Operation::Incremental
    } else {
        warn!(
            "watchman was not found on PATH; falling back to a one-shot \
             check instead of an incremental run"
        );
        Operation::Check
    }
}

fn watchman_available() -> bool {
    let path = match env::var_os("PATH") {
        Some(path) => path,
        None => return false,
    };
    env::split_paths(&path).any(|directory| is_executable(&directory.join("watchman")))
}

/// A regular file with at least one execute bit set, like `which`.
fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Flattens the invocation into an analysis-directory request.
/// Check, analyze and restart are one-shot: they always rebuild, and
/// check/analyze additionally keep their overlay private.
fn directory_request(cli: &Cli, operation: &Operation) -> DirectoryRequest {
    let one_shot = matches!(
        operation,
        Operation::Check | Operation::Analyze { .. } | Operation::Restart
    );
    let isolate = matches!(operation, Operation::Check | Operation::Analyze { .. });
    DirectoryRequest {
        source_directories: cli.source_directory.clone(),
        targets: cli.target.clone(),
        filter_directory: cli.filter_directory.clone(),
        build: cli.build,
        use_buck_builder: cli.use_buck_builder,
        use_legacy_builder: cli.use_legacy_builder,
        builder_binary: cli.buck_builder_binary.clone(),
        builder_target: cli.buck_builder_target.clone(),
        builder_debug: cli.buck_builder_debug,
        one_shot,
        isolate,
    }
}

/// Writes a fresh configuration marker into `directory`. Refuses to
/// overwrite an existing one.
fn initialize(directory: &Path, local: bool) -> Result<()> {
    let file_name = if local {
        LOCAL_CONFIGURATION_FILE
    } else {
        CONFIGURATION_FILE
    };
    let path = directory.join(file_name);
    if path.exists() {
        return Err(ClientError::ConfigurationExists(path));
    }
    let contents = serde_json::json!({
        "source_directories": ["."],
    });
    fs::write(&path, format!("{:#}\n", contents))?;
    info!(path = %path.display(), "Wrote configuration");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
