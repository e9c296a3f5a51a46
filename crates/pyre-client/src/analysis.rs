//! Analysis-directory construction.
//!
//! The daemon analyzes exactly one directory tree. When the project is
//! a single source directory that tree is used verbatim (*Direct*);
//! otherwise the client synthesizes an *Overlay*: a merged mirror of
//! every source directory and every build-target output, in declared
//! order, later entries overwriting earlier ones on path collision.
//!
//! Overlay ownership follows scoped-resource discipline. An `isolate`
//! overlay is private to one invocation and removed on every exit path
//! (it lives in a [`tempfile::TempDir`]). A shared overlay lives at a
//! deterministic path under the log directory and is handed off to the
//! long-lived daemon session, which inherits the cleanup obligation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use pyre_core::{Configuration, RootLayout};

use crate::buck::{self, BuildAction};
use crate::error::{ClientError, Result};

/// Name of the shared overlay tree under the per-project log directory.
pub const SHARED_OVERLAY_DIRECTORY: &str = "shared_analysis_directory";

// ============================================================================
// Directory Request
// ============================================================================

/// What the invocation asked for, flattened from the CLI. Source
/// directories and targets given here take precedence over the
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRequest {
    pub source_directories: Vec<PathBuf>,
    pub targets: Vec<String>,
    /// Overrides filter-path computation entirely.
    pub filter_directory: Option<PathBuf>,
    /// Explicit `--build`: freshly build all necessary artifacts.
    pub build: bool,
    pub use_buck_builder: bool,
    pub use_legacy_builder: bool,
    pub builder_binary: Option<PathBuf>,
    pub builder_target: Option<String>,
    pub builder_debug: bool,
    /// The operation is inherently one-shot (check/analyze/restart);
    /// forces an on-demand build even without `--build`.
    pub one_shot: bool,
    /// Single-invocation-private overlay, even if a long-lived session
    /// exists (check/analyze).
    pub isolate: bool,
}

// ============================================================================
// Analysis Directory
// ============================================================================

/// The source tree the daemon analyzes.
#[derive(Debug)]
pub enum AnalysisDirectory {
    /// A single existing source directory, used verbatim.
    Direct(DirectDirectory),
    /// A synthesized union of source directories and build outputs.
    Overlay(OverlayDirectory),
}

#[derive(Debug)]
pub struct DirectDirectory {
    root: PathBuf,
    filter_paths: Vec<PathBuf>,
    search_path: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct OverlayDirectory {
    source_directories: Vec<PathBuf>,
    targets: Vec<String>,
    build_action: BuildAction,
    project_root: PathBuf,
    /// Deterministic location used when the overlay is shared with a
    /// daemon session.
    shared_root: PathBuf,
    scratch: Scratch,
    filter_paths: Vec<PathBuf>,
    search_path: Vec<PathBuf>,
    isolate: bool,
}

#[derive(Debug)]
enum Scratch {
    /// Not yet materialized.
    Unprepared,
    /// Invocation-private; removed when this value drops.
    Isolated(TempDir),
    /// Handed off to the daemon session at `shared_root`.
    Shared,
}

impl AnalysisDirectory {
    /// A pass-through directory with no filter or search-path scoping.
    /// Used by operations that need no source view of their own
    /// (`kill`, `initialize`).
    pub fn direct(root: PathBuf) -> AnalysisDirectory {
        AnalysisDirectory::Direct(DirectDirectory {
            root,
            filter_paths: Vec::new(),
            search_path: Vec::new(),
        })
    }

    /// The directory the daemon should analyze. For an overlay this is
    /// only meaningful after [`AnalysisDirectory::prepare`].
    pub fn root(&self) -> &Path {
        match self {
            AnalysisDirectory::Direct(direct) => &direct.root,
            AnalysisDirectory::Overlay(overlay) => match &overlay.scratch {
                Scratch::Isolated(scratch) => scratch.path(),
                _ => &overlay.shared_root,
            },
        }
    }

    pub fn search_path(&self) -> &[PathBuf] {
        match self {
            AnalysisDirectory::Direct(direct) => &direct.search_path,
            AnalysisDirectory::Overlay(overlay) => &overlay.search_path,
        }
    }

    /// The subset of the tree that error reporting is scoped to.
    pub fn filter_paths(&self) -> &[PathBuf] {
        match self {
            AnalysisDirectory::Direct(direct) => &direct.filter_paths,
            AnalysisDirectory::Overlay(overlay) => &overlay.filter_paths,
        }
    }

    /// Materializes the directory. A no-op for Direct; for an overlay,
    /// runs the build action and mirrors every root into the scratch
    /// tree in declared order.
    pub fn prepare(&mut self) -> Result<()> {
        match self {
            AnalysisDirectory::Direct(_) => Ok(()),
            AnalysisDirectory::Overlay(overlay) => overlay.prepare(),
        }
    }

    /// Releases the directory at the end of the invocation. An isolated
    /// overlay is removed here (and on any abandoned-value exit path,
    /// via `TempDir`'s drop); a shared overlay is left in place for the
    /// daemon session that now owns it.
    pub fn cleanup(self) {
        if let AnalysisDirectory::Overlay(overlay) = self {
            match overlay.scratch {
                Scratch::Isolated(scratch) => {
                    debug!(root = %scratch.path().display(), "Removing isolated overlay");
                    if let Err(error) = scratch.close() {
                        warn!(error = %error, "Failed to remove isolated overlay");
                    }
                }
                Scratch::Shared => {
                    debug!(
                        root = %overlay.shared_root.display(),
                        "Leaving shared overlay to the daemon session"
                    );
                }
                Scratch::Unprepared => {}
            }
        }
    }
}

impl OverlayDirectory {
    fn prepare(&mut self) -> Result<()> {
        let build_outputs = self
            .build_action
            .build(&self.targets, &self.project_root)?;

        let destination = if self.isolate {
            let scratch = tempfile::Builder::new()
                .prefix("pyre-overlay-")
                .tempdir()?;
            let path = scratch.path().to_path_buf();
            self.scratch = Scratch::Isolated(scratch);
            path
        } else {
            // Rebuilt from scratch so the merge stays deterministic.
            if self.shared_root.exists() {
                fs::remove_dir_all(&self.shared_root)?;
            }
            fs::create_dir_all(&self.shared_root)?;
            self.scratch = Scratch::Shared;
            self.shared_root.clone()
        };

        for source in &self.source_directories {
            if !source.is_dir() {
                return Err(ClientError::Core(
                    pyre_core::CoreError::UnreadableDirectory(source.clone()),
                ));
            }
            mirror_tree(source, &destination)?;
        }
        for output in &build_outputs {
            mirror_tree(output, &destination)?;
        }

        info!(
            root = %destination.display(),
            sources = self.source_directories.len(),
            targets = self.targets.len(),
            "Materialized overlay directory"
        );
        Ok(())
    }
}

/// Recursively mirrors `source` into `destination`. Existing files are
/// overwritten, which gives the overlay its last-writer-by-declared-
/// order merge semantics.
fn mirror_tree(source: &Path, destination: &Path) -> io::Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            mirror_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ============================================================================
// Selection
// ============================================================================

/// Chooses between Direct and Overlay for one invocation.
///
/// Sources and targets come from the configuration unless the
/// invocation supplied its own, in which case a hint suggests
/// persisting them (ad hoc usage bypasses caching benefits). Exactly
/// one build strategy is selected; requesting the accelerated builder
/// without a discoverable Buck root is fatal.
pub fn resolve_analysis_directory(
    request: &DirectoryRequest,
    configuration: &Configuration,
    layout: &RootLayout,
) -> Result<AnalysisDirectory> {
    let from_invocation =
        !request.source_directories.is_empty() || !request.targets.is_empty();

    let (source_directories, targets) = if from_invocation {
        if request.targets.is_empty() {
            warn!("Setting up a `.pyre_configuration` with `pyre init` may reduce overhead.");
        } else {
            warn!(
                "Setting up a `.pyre_configuration.local` with `pyre init --local` may \
                 reduce overhead."
            );
        }
        let sources = request
            .source_directories
            .iter()
            .map(|path| layout.translate(path))
            .collect::<Vec<_>>();
        (sources, request.targets.clone())
    } else {
        let sources = configuration
            .source_directories
            .iter()
            .map(|path| translate_from(&layout.project_root, path))
            .collect::<Vec<_>>();
        (sources, configuration.targets.clone())
    };

    let filter_paths = match &request.filter_directory {
        Some(directory) => vec![layout.translate(directory)],
        None => resolve_filter_paths(request, layout),
    };
    let search_path = configuration.search_path.clone();

    let mut sources = source_directories;
    if sources.len() == 1 && targets.is_empty() {
        // Exactly one source directory and no targets: pass-through.
        let root = match sources.pop() {
            Some(root) => root,
            None => layout.project_root.clone(),
        };
        debug!(root = %root.display(), "Selected direct analysis directory");
        return Ok(AnalysisDirectory::Direct(DirectDirectory {
            root,
            filter_paths,
            search_path,
        }));
    }

    let use_accelerated = (request.use_buck_builder || configuration.use_buck_builder)
        && !request.use_legacy_builder;
    let build_action = if use_accelerated {
        let buck_root = buck::find_buck_root(&layout.original_directory)
            .ok_or_else(|| ClientError::BuckRootNotFound(layout.original_directory.clone()))?;
        BuildAction::Accelerated {
            buck_root,
            builder_binary: request.builder_binary.clone(),
            builder_target: request.builder_target.clone(),
            debug: request.builder_debug,
        }
    } else {
        BuildAction::OnDemand {
            build: request.build || request.one_shot,
        }
    };

    debug!(
        sources = sources.len(),
        targets = targets.len(),
        isolate = request.isolate,
        "Selected overlay analysis directory"
    );
    Ok(AnalysisDirectory::Overlay(OverlayDirectory {
        source_directories: sources,
        targets,
        build_action,
        project_root: layout.project_root.clone(),
        shared_root: layout.log_directory.join(SHARED_OVERLAY_DIRECTORY),
        scratch: Scratch::Unprepared,
        filter_paths,
        search_path,
        isolate: request.isolate,
    }))
}

/// Filter paths scope error reporting: exactly what the invocation
/// named when it named anything, else the local root, else the whole
/// project.
fn resolve_filter_paths(request: &DirectoryRequest, layout: &RootLayout) -> Vec<PathBuf> {
    if !request.source_directories.is_empty() || !request.targets.is_empty() {
        let mut paths = request
            .source_directories
            .iter()
            .map(|path| layout.translate(path))
            .collect::<Vec<_>>();
        paths.extend(
            request
                .targets
                .iter()
                .map(|target| layout.translate(&buck::presumed_target_root(target))),
        );
        return paths;
    }
    match &layout.local_root {
        Some(local_root) => vec![local_root.clone()],
        None => vec![layout.project_root.clone()],
    }
}

fn translate_from(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// ============================================================================
// Tests
// ============================================================================
