//! Project root resolution.
//!
//! The client always operates relative to the directory containing the
//! nearest `.pyre_configuration`, if one exists. Resolution walks
//! upward from the invocation directory, honors an optional local
//! configuration strictly nested under the project root, and derives
//! the per-project log directory under `.pyre/`.
//!
//! Resolution never changes the process working directory; all
//! downstream code receives explicit root-anchored paths through
//! [`RootLayout`].

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Marker file identifying a project root.
pub const CONFIGURATION_FILE: &str = ".pyre_configuration";

/// Marker file identifying a subtree-scoped local configuration.
pub const LOCAL_CONFIGURATION_FILE: &str = ".pyre_configuration.local";

/// Name of the per-project log/state namespace under the project root.
pub const LOG_DIRECTORY: &str = ".pyre";

/// Name of the external analysis daemon binary.
pub const BINARY_NAME: &str = "pyre.bin";

/// Walks upward from `start` until a directory containing `marker` as a
/// file is found. Returns `None` once the filesystem root is passed.
pub fn find_root(start: &Path, marker: &str) -> Option<PathBuf> {
    let mut current = start;
    loop {
        if current.join(marker).is_file() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}

/// The resolved root geometry of one invocation.
///
/// Immutable once resolved; every later stage (configuration loading,
/// analysis-directory construction, the daemon session) receives its
/// paths from here instead of relying on the process working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootLayout {
    /// Directory the client was invoked from. Relative paths supplied
    /// on the command line are resolved against this.
    pub original_directory: PathBuf,
    /// Directory containing the project configuration marker, or the
    /// original directory if no marker was found.
    pub project_root: PathBuf,
    /// Directory containing the local configuration marker, when one is
    /// active. Always strictly inside `project_root`.
    pub local_root: Option<PathBuf>,
    /// `<project_root>/.pyre/<relative local path>`; created on
    /// resolution. The nesting invariant guarantees this can never
    /// escape the `.pyre/` namespace.
    pub log_directory: PathBuf,
}

impl RootLayout {
    /// Resolves the project and local roots for one invocation.
    ///
    /// `local_override` is the `--local-configuration` argument; it
    /// takes precedence over the upward walk but is subject to the same
    /// invariants.
    ///
    /// # Errors
    ///
    /// * [`CoreError::NestedLocalConfiguration`] - a local
    ///   configuration sits inside another one; fatal, the invocation
    ///   must not proceed.
    /// * [`CoreError::Io`] - the log directory could not be created.
    pub fn resolve(
        original_directory: &Path,
        local_override: Option<&Path>,
    ) -> CoreResult<RootLayout> {
        let project_root = find_root(original_directory, CONFIGURATION_FILE)
            .unwrap_or_else(|| original_directory.to_path_buf());

        let mut local_root = match local_override {
            Some(path) if path.is_absolute() => Some(path.to_path_buf()),
            Some(path) => Some(original_directory.join(path)),
            None => find_root(original_directory, LOCAL_CONFIGURATION_FILE),
        };

        // Reject a local configuration nested under another local
        // configuration, whichever of the two is discovered first.
        if let Some(local) = &local_root {
            if let Some(parent_directory) = local.parent() {
                if let Some(parent_local) =
                    find_root(parent_directory, LOCAL_CONFIGURATION_FILE)
                {
                    return Err(CoreError::NestedLocalConfiguration {
                        nested: local.clone(),
                        parent: parent_local,
                    });
                }
            }
        }

        // Inverted containment: a project root at or below the local
        // root means the local configuration does not govern this
        // project. Discard it silently.
        if let Some(local) = &local_root {
            if project_root.starts_with(local) {
                debug!(
                    local = %local.display(),
                    project = %project_root.display(),
                    "Discarding local configuration outside the project root"
                );
                local_root = None;
            }
        }

        let mut log_directory = project_root.join(LOG_DIRECTORY);
        if let Some(local) = &local_root {
            if let Ok(relative) = local.strip_prefix(&project_root) {
                log_directory.push(relative);
            }
        }
        fs::create_dir_all(&log_directory)?;

        debug!(
            project = %project_root.display(),
            log = %log_directory.display(),
            "Resolved project root"
        );

        Ok(RootLayout {
            original_directory: original_directory.to_path_buf(),
            project_root,
            local_root,
            log_directory,
        })
    }

    /// Translates a path from the invocation command line into an
    /// absolute path anchored at the original directory.
    pub fn translate(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.original_directory.join(path)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        File::create(path).expect("create marker");
    }

    #[test]
    fn test_find_root_walks_upward() {
        let tree = TempDir::new().expect("tempdir");
        let root = tree.path();
        touch(&root.join(CONFIGURATION_FILE));
        fs::create_dir_all(root.join("src/pkg")).expect("mkdirs");

        assert_eq!(
            find_root(&root.join("src/pkg"), CONFIGURATION_FILE),
            Some(root.to_path_buf())
        );
    }

    #[test]
    fn test_find_root_missing_marker() {
        let tree = TempDir::new().expect("tempdir");
        assert_eq!(find_root(tree.path(), CONFIGURATION_FILE), None);
    }

    #[test]
    fn test_resolve_falls_back_to_original_directory() {
        let tree = TempDir::new().expect("tempdir");
        let layout = RootLayout::resolve(tree.path(), None).expect("resolve");
        assert_eq!(layout.project_root, tree.path());
        assert_eq!(layout.local_root, None);
        assert_eq!(layout.log_directory, tree.path().join(LOG_DIRECTORY));
        assert!(layout.log_directory.is_dir());
    }

    #[test]
    fn test_resolve_local_inside_project() {
        let tree = TempDir::new().expect("tempdir");
        let root = tree.path();
        touch(&root.join(CONFIGURATION_FILE));
        touch(&root.join("sub/project").join(LOCAL_CONFIGURATION_FILE));

        let layout =
            RootLayout::resolve(&root.join("sub/project"), None).expect("resolve");
        assert_eq!(layout.project_root, root);
        assert_eq!(layout.local_root, Some(root.join("sub/project")));
        assert_eq!(
            layout.log_directory,
            root.join(LOG_DIRECTORY).join("sub/project")
        );
        assert!(layout.log_directory.is_dir());
    }

    #[test]
    fn test_nested_local_configuration_is_fatal() {
        let tree = TempDir::new().expect("tempdir");
        let root = tree.path();
        touch(&root.join(CONFIGURATION_FILE));
        touch(&root.join("outer").join(LOCAL_CONFIGURATION_FILE));
        touch(&root.join("outer/inner").join(LOCAL_CONFIGURATION_FILE));

        let result = RootLayout::resolve(&root.join("outer/inner"), None);
        assert!(matches!(
            result,
            Err(CoreError::NestedLocalConfiguration { .. })
        ));
    }

    #[test]
    fn test_nested_local_configuration_with_override() {
        // An explicit --local-configuration is subject to the same check.
        let tree = TempDir::new().expect("tempdir");
        let root = tree.path();
        touch(&root.join(CONFIGURATION_FILE));
        touch(&root.join("outer").join(LOCAL_CONFIGURATION_FILE));
        touch(&root.join("outer/inner").join(LOCAL_CONFIGURATION_FILE));

        let result = RootLayout::resolve(root, Some(&root.join("outer/inner")));
        assert!(matches!(
            result,
            Err(CoreError::NestedLocalConfiguration { .. })
        ));
    }

    #[test]
    fn test_inverted_containment_discards_local() {
        // Local marker above the project marker: the global
        // configuration governs.
        let tree = TempDir::new().expect("tempdir");
        let root = tree.path();
        touch(&root.join(LOCAL_CONFIGURATION_FILE));
        touch(&root.join("project").join(CONFIGURATION_FILE));

        let layout = RootLayout::resolve(&root.join("project"), None).expect("resolve");
        assert_eq!(layout.project_root, root.join("project"));
        assert_eq!(layout.local_root, None);
        assert_eq!(
            layout.log_directory,
            root.join("project").join(LOG_DIRECTORY)
        );
    }

    #[test]
    fn test_translate_relative_path() {
        let tree = TempDir::new().expect("tempdir");
        let layout = RootLayout::resolve(tree.path(), None).expect("resolve");
        assert_eq!(
            layout.translate(Path::new("src")),
            tree.path().join("src")
        );
        assert_eq!(
            layout.translate(Path::new("/absolute")),
            PathBuf::from("/absolute")
        );
    }
}
