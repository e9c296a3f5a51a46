//! Configuration loading and merging.
//!
//! A project carries a JSON `.pyre_configuration` at its root and may
//! carry a `.pyre_configuration.local` in a subtree. The effective
//! configuration is the project file overlaid field-by-field with the
//! local file: set local fields win, unset fields inherit. Read once
//! per invocation, never mutated afterwards.
//!
//! Environment overrides:
//! * `PYRE_BINARY` - path to the analysis daemon binary;
//! * `PYRE_TYPESHED` - stub-library root;
//! * `PYRE_VERSION_HASH` - version hash used to select a compatible
//!   daemon build.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::root::{RootLayout, CONFIGURATION_FILE, LOCAL_CONFIGURATION_FILE};

/// Environment override for the daemon binary path.
pub const BINARY_ENVIRONMENT_VARIABLE: &str = "PYRE_BINARY";

/// Environment override for the stub-library root.
pub const TYPESHED_ENVIRONMENT_VARIABLE: &str = "PYRE_TYPESHED";

/// Environment override for the daemon version hash.
pub const VERSION_HASH_ENVIRONMENT_VARIABLE: &str = "PYRE_VERSION_HASH";

// ============================================================================
// On-disk schema
// ============================================================================

/// One configuration file as written on disk. Every field optional so
/// that the local variant can overlay only what it sets. Unknown keys
/// are tolerated for forward compatibility.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialConfiguration {
    targets: Option<Vec<String>>,
    source_directories: Option<Vec<PathBuf>>,
    search_path: Option<Vec<PathBuf>>,
    version: Option<String>,
    push_blocking: Option<bool>,
    strict: Option<bool>,
    logger: Option<PathBuf>,
    use_buck_builder: Option<bool>,
    typeshed: Option<PathBuf>,
    disabled: Option<bool>,
}

impl PartialConfiguration {
    /// Reads a configuration file, returning the empty configuration
    /// when the file does not exist.
    fn from_file(path: &Path) -> CoreResult<PartialConfiguration> {
        if !path.is_file() {
            return Ok(PartialConfiguration::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| {
            CoreError::ConfigurationRead {
                path: path.to_path_buf(),
                source,
            }
        })?;
        serde_json::from_str(&contents).map_err(|source| CoreError::ConfigurationParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays `local` on top of `self`: set local fields win.
    fn overlay(self, local: PartialConfiguration) -> PartialConfiguration {
        PartialConfiguration {
            targets: local.targets.or(self.targets),
            source_directories: local.source_directories.or(self.source_directories),
            search_path: local.search_path.or(self.search_path),
            version: local.version.or(self.version),
            push_blocking: local.push_blocking.or(self.push_blocking),
            strict: local.strict.or(self.strict),
            logger: local.logger.or(self.logger),
            use_buck_builder: local.use_buck_builder.or(self.use_buck_builder),
            typeshed: local.typeshed.or(self.typeshed),
            disabled: local.disabled.or(self.disabled),
        }
    }
}

// ============================================================================
// Effective configuration
// ============================================================================

/// The merged, effective configuration for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    /// Build-target identifiers handed to the external build tool.
    pub targets: Vec<String>,
    /// Source directories, in declaration order. Order matters: overlay
    /// merging is last-writer-wins by this order.
    pub source_directories: Vec<PathBuf>,
    /// Additional stub/extension resolution roots, passed to the daemon
    /// unchanged.
    pub search_path: Vec<PathBuf>,
    /// Version hash selecting a compatible daemon build.
    pub version_hash: Option<String>,
    /// External statistics logger binary.
    pub logger: Option<PathBuf>,
    /// Stub-library root.
    pub typeshed: Option<PathBuf>,
    pub push_blocking: bool,
    pub strict: bool,
    /// Prefer the accelerated build-orchestration daemon.
    pub use_buck_builder: bool,
    /// Explicitly disabled projects short-circuit to success.
    pub disabled: bool,
}

impl Configuration {
    /// Loads the project configuration and, when a local root is
    /// active, overlays the local configuration on top of it.
    pub fn load(layout: &RootLayout) -> CoreResult<Configuration> {
        let project =
            PartialConfiguration::from_file(&layout.project_root.join(CONFIGURATION_FILE))?;
        let merged = match &layout.local_root {
            Some(local_root) => {
                debug!(local = %local_root.display(), "Overlaying local configuration");
                let local = PartialConfiguration::from_file(
                    &local_root.join(LOCAL_CONFIGURATION_FILE),
                )?;
                project.overlay(local)
            }
            None => project,
        };
        Ok(Configuration::from_partial(merged))
    }

    fn from_partial(partial: PartialConfiguration) -> Configuration {
        let version_hash = env::var(VERSION_HASH_ENVIRONMENT_VARIABLE)
            .ok()
            .or(partial.version);
        let typeshed = env::var(TYPESHED_ENVIRONMENT_VARIABLE)
            .ok()
            .map(PathBuf::from)
            .or(partial.typeshed);
        Configuration {
            targets: partial.targets.unwrap_or_default(),
            source_directories: partial.source_directories.unwrap_or_default(),
            search_path: partial.search_path.unwrap_or_default(),
            version_hash,
            logger: partial.logger,
            typeshed,
            push_blocking: partial.push_blocking.unwrap_or(false),
            strict: partial.strict.unwrap_or(false),
            use_buck_builder: partial.use_buck_builder.unwrap_or(false),
            disabled: partial.disabled.unwrap_or(false),
        }
    }

    /// The daemon binary version to report: environment override first,
    /// then the configured hash.
    pub fn binary_version(&self) -> String {
        if let Ok(override_path) = env::var(BINARY_ENVIRONMENT_VARIABLE) {
            return format!("override: {override_path}");
        }
        match &self.version_hash {
            Some(hash) => hash.clone(),
            None => "No version set".to_string(),
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
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        let mut file = File::create(path).expect("create file");
        file.write_all(contents.as_bytes()).expect("write file");
    }

    fn layout_for(root: &Path, local_root: Option<PathBuf>) -> RootLayout {
        RootLayout {
            original_directory: root.to_path_buf(),
            project_root: root.to_path_buf(),
            local_root,
            log_directory: root.join(".pyre"),
        }
    }

    #[test]
    fn test_missing_configuration_is_empty() {
        let tree = TempDir::new().expect("tempdir");
        let configuration =
            Configuration::load(&layout_for(tree.path(), None)).expect("load");
        assert!(configuration.source_directories.is_empty());
        assert!(configuration.targets.is_empty());
        assert!(!configuration.strict);
    }

    #[test]
    fn test_project_configuration_fields() {
        let tree = TempDir::new().expect("tempdir");
        write_file(
            &tree.path().join(CONFIGURATION_FILE),
            r#"{
                "source_directories": ["src"],
                "search_path": ["stubs"],
                "version": "abc123",
                "strict": true,
                "logger": "/usr/local/bin/statlog"
            }"#,
        );

        let configuration =
            Configuration::load(&layout_for(tree.path(), None)).expect("load");
        assert_eq!(
            configuration.source_directories,
            vec![PathBuf::from("src")]
        );
        assert_eq!(configuration.search_path, vec![PathBuf::from("stubs")]);
        assert_eq!(configuration.version_hash.as_deref(), Some("abc123"));
        assert!(configuration.strict);
        assert_eq!(
            configuration.logger,
            Some(PathBuf::from("/usr/local/bin/statlog"))
        );
    }

    #[test]
    fn test_local_overlay_wins_field_by_field() {
        let tree = TempDir::new().expect("tempdir");
        let root = tree.path();
        write_file(
            &root.join(CONFIGURATION_FILE),
            r#"{"source_directories": ["src"], "version": "abc123", "strict": true}"#,
        );
        write_file(
            &root.join("sub").join(LOCAL_CONFIGURATION_FILE),
            r#"{"targets": ["//sub:lib"], "push_blocking": true}"#,
        );

        let configuration =
            Configuration::load(&layout_for(root, Some(root.join("sub")))).expect("load");
        // Local fields take precedence; unset local fields inherit.
        assert_eq!(configuration.targets, vec!["//sub:lib".to_string()]);
        assert!(configuration.push_blocking);
        assert_eq!(
            configuration.source_directories,
            vec![PathBuf::from("src")]
        );
        assert_eq!(configuration.version_hash.as_deref(), Some("abc123"));
        assert!(configuration.strict);
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let tree = TempDir::new().expect("tempdir");
        write_file(
            &tree.path().join(CONFIGURATION_FILE),
            r#"{"source_directories": ["src"], "future_knob": {"nested": 1}}"#,
        );
        let configuration =
            Configuration::load(&layout_for(tree.path(), None)).expect("load");
        assert_eq!(
            configuration.source_directories,
            vec![PathBuf::from("src")]
        );
    }

    #[test]
    fn test_malformed_configuration_is_an_error() {
        let tree = TempDir::new().expect("tempdir");
        write_file(&tree.path().join(CONFIGURATION_FILE), "{not json");
        let result = Configuration::load(&layout_for(tree.path(), None));
        assert!(matches!(
            result,
            Err(CoreError::ConfigurationParse { .. })
        ));
    }

    #[test]
    fn test_binary_version_fallback() {
        let configuration = Configuration {
            version_hash: Some("deadbeef".to_string()),
            ..Configuration::default()
        };
        // May be shadowed by PYRE_BINARY in the environment; tests run
        // without it set.
        if env::var(BINARY_ENVIRONMENT_VARIABLE).is_err() {
            assert_eq!(configuration.binary_version(), "deadbeef");
            assert_eq!(
                Configuration::default().binary_version(),
                "No version set"
            );
        }
    }
}
