//! Daemon session lifecycle.
//!
//! The analysis daemon is an external long-lived process. The client
//! owns exactly two pieces of shared state with it: the lock file
//! recording the daemon's pid under the per-project log directory, and
//! the analysis directory the daemon watches. Liveness is a file+signal
//! check, not a handshake: a daemon that is alive but wedged still
//! reports RUNNING.
//!
//! State is always recomputed, never cached across invocations. A
//! missing, unparseable, or stale lock file is simply DEAD; the client
//! self-heals by removing it.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use pyre_core::config::BINARY_ENVIRONMENT_VARIABLE;
use pyre_core::{Configuration, RootLayout, BINARY_NAME};

use crate::analysis::{AnalysisDirectory, SHARED_OVERLAY_DIRECTORY};
use crate::error::{ClientError, Result};

/// Subdirectory of the log directory holding daemon state.
const SERVER_DIRECTORY: &str = "server";

/// Lock file recording the daemon pid, one per project root.
const PID_FILE: &str = "server.pid";

/// The daemon's local communication channel artifact.
const SOCKET_FILE: &str = "server.sock";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Linux truncates `/proc/<pid>/comm` to 15 bytes.
const COMM_LENGTH: usize = 15;

// ============================================================================
// Liveness
// ============================================================================

/// Daemon liveness, derived on demand from the lock file. There is no
/// SUSPICIOUS state: anything that is not a live process of the
/// expected binary is DEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Dead,
}

/// Reads a pid from a lock file. Absent or unparseable content is
/// `None`, which callers treat as DEAD.
pub fn read_pid(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Checks that `pid` is a live process of the expected binary, by its
/// `/proc/<pid>/stat` comm field.
pub fn is_expected_process(pid: i32, expected_comm: &str) -> bool {
    let process = match procfs::process::Process::new(pid) {
        Ok(process) => process,
        Err(_) => return false,
    };
    match process.stat() {
        Ok(stat) => {
            let expected: String = expected_comm.chars().take(COMM_LENGTH).collect();
            stat.comm == expected
        }
        Err(_) => false,
    }
}

// ============================================================================
// Server Session
// ============================================================================

/// One invocation's view of the per-project daemon.
pub struct ServerSession {
    configuration: Configuration,
    layout: RootLayout,
    analysis_directory: AnalysisDirectory,
    binary: PathBuf,
    logging_sections: Option<String>,
}

impl ServerSession {
    pub fn new(
        configuration: Configuration,
        layout: RootLayout,
        analysis_directory: AnalysisDirectory,
        binary_flag: Option<PathBuf>,
        logging_sections: Option<String>,
    ) -> ServerSession {
        let binary = resolve_binary(binary_flag);
        ServerSession {
            configuration,
            layout,
            analysis_directory,
            binary,
            logging_sections,
        }
    }

    fn server_directory(&self) -> PathBuf {
        self.layout.log_directory.join(SERVER_DIRECTORY)
    }

    fn pid_file_path(&self) -> PathBuf {
        self.server_directory().join(PID_FILE)
    }

    fn socket_path(&self) -> PathBuf {
        self.server_directory().join(SOCKET_FILE)
    }

    /// The comm name the lock-file pid must resolve to.
    fn expected_comm(&self) -> String {
        self.binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| BINARY_NAME.to_string())
    }

    /// Recomputes liveness from the lock file.
    pub fn state(&self) -> ServerState {
        match read_pid(&self.pid_file_path()) {
            Some(pid) if is_expected_process(pid, &self.expected_comm()) => {
                ServerState::Running
            }
            _ => ServerState::Dead,
        }
    }

    /// The daemon-directed flag list built from the configuration.
    ///
    /// Ordering is a public contract the daemon depends on; it must
    /// stay stable for reproducible invocations. Base order:
    /// `-logging-sections`, `-project-root`, then `-logger`,
    /// `-search-path` (one pair per entry, declaration order),
    /// `-typeshed`, `-strict`, each only when configured.
    pub fn flags(&self) -> Vec<OsString> {
        let mut flags: Vec<OsString> = Vec::new();
        flags.push("-logging-sections".into());
        flags.push(
            self.logging_sections
                .clone()
                .unwrap_or_else(|| "parser".to_string())
                .into(),
        );
        flags.push("-project-root".into());
        flags.push(self.layout.project_root.clone().into());
        if let Some(logger) = &self.configuration.logger {
            flags.push("-logger".into());
            flags.push(logger.clone().into());
        }
        for path in self.analysis_directory.search_path() {
            flags.push("-search-path".into());
            flags.push(path.clone().into());
        }
        if let Some(typeshed) = &self.configuration.typeshed {
            flags.push("-typeshed".into());
            flags.push(typeshed.clone().into());
        }
        if self.configuration.strict {
            flags.push("-strict".into());
        }
        flags
    }

    /// The source-view arguments every daemon-directed command carries:
    /// the analysis root, and the filter directories that scope error
    /// reporting to the subtree the caller asked about.
    fn directory_arguments(&self) -> Vec<OsString> {
        let mut arguments: Vec<OsString> = Vec::new();
        arguments.push("-analysis-directory".into());
        arguments.push(self.analysis_directory.root().into());
        let filter_paths = self.analysis_directory.filter_paths();
        if !filter_paths.is_empty() {
            let joined = filter_paths
                .iter()
                .map(|path| path.to_string_lossy())
                .collect::<Vec<_>>()
                .join(";");
            arguments.push("-filter-directories".into());
            arguments.push(joined.into());
        }
        arguments
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// DEAD -> RUNNING. Spawns the daemon in the background (or in the
    /// terminal when `terminal` is set) and waits until it is live or
    /// the startup timeout elapses. A no-op when already RUNNING.
    pub fn start(&mut self, terminal: bool) -> Result<()> {
        if self.state() == ServerState::Running {
            info!("Server is already running");
            return Ok(());
        }

        self.analysis_directory.prepare()?;

        let pid_path = self.pid_file_path();
        if let Some(parent) = pid_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Create-exclusive, not read-then-write: two concurrent starts
        // race on this creation and the loser detects the winner. The
        // window between the staleness check and the retry below is
        // narrowed, not eliminated.
        let mut lock = match exclusive_create(&pid_path) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                if self.state() == ServerState::Running {
                    info!("Another invocation started the server first");
                    return Ok(());
                }
                debug!(path = %pid_path.display(), "Removing stale lock file");
                fs::remove_file(&pid_path)?;
                exclusive_create(&pid_path)?
            }
            Err(error) => return Err(error.into()),
        };

        let mut command = Command::new(&self.binary);
        command
            .arg("start")
            .args(self.flags())
            .args(self.directory_arguments());
        if terminal {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        let mut child = command.spawn().map_err(|source| {
            let _ = fs::remove_file(&pid_path);
            ClientError::BinaryUnavailable {
                binary: self.binary.clone(),
                source,
            }
        })?;
        write!(lock, "{}", child.id())?;
        drop(lock);

        if terminal {
            // Foreground mode: the daemon occupies the terminal until
            // it exits, then the lock file is no longer meaningful.
            let status = child.wait()?;
            let _ = fs::remove_file(&pid_path);
            return if status.success() {
                Ok(())
            } else {
                Err(ClientError::RequestFailed {
                    request: "start".to_string(),
                    status: status.code().unwrap_or(-1),
                })
            };
        }

        info!(pid = child.id(), "Waiting for server to become ready");
        let attempts = STARTUP_TIMEOUT.as_millis() / POLL_INTERVAL.as_millis();
        for _ in 0..attempts {
            if self.state() == ServerState::Running {
                info!(pid = child.id(), "Server started");
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                let _ = fs::remove_file(&pid_path);
                return Err(ClientError::RequestFailed {
                    request: "start".to_string(),
                    status: status.code().unwrap_or(-1),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(ClientError::StartTimeout {
            seconds: STARTUP_TIMEOUT.as_secs(),
        })
    }

    /// RUNNING -> DEAD, gracefully. The lock file is removed only after
    /// the process is confirmed gone. A warning no-op when nothing is
    /// running; a stale lock file is removed and counts as stopped.
    pub fn stop(&mut self) -> Result<()> {
        let pid_path = self.pid_file_path();
        let pid = match read_pid(&pid_path) {
            Some(pid) => pid,
            None => {
                warn!("No server is running");
                return Ok(());
            }
        };
        if !is_expected_process(pid, &self.expected_comm()) {
            debug!(pid, "Removing stale lock file");
            let _ = fs::remove_file(&pid_path);
            return Ok(());
        }

        info!(pid, "Stopping server");
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let attempts = STOP_TIMEOUT.as_millis() / POLL_INTERVAL.as_millis();
        for _ in 0..attempts {
            if !is_expected_process(pid, &self.expected_comm()) {
                let _ = fs::remove_file(&pid_path);
                self.remove_shared_overlay();
                info!("Server stopped");
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(ClientError::StopTimeout {
            seconds: STOP_TIMEOUT.as_secs(),
        })
    }

    /// Any state -> DEAD, forcefully. Removes the lock file and channel
    /// artifacts unconditionally; the recovery path for a daemon stuck
    /// in a bad state.
    pub fn kill(&mut self) -> Result<()> {
        let pid_path = self.pid_file_path();
        if let Some(pid) = read_pid(&pid_path) {
            if is_expected_process(pid, &self.expected_comm()) {
                info!(pid, "Killing server");
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
        let _ = fs::remove_file(&pid_path);
        let _ = fs::remove_file(self.socket_path());
        self.remove_shared_overlay();
        Ok(())
    }

    /// Stop followed by start, as two sequential operations with no
    /// daemon in between. Not atomic: a crash here leaves DEAD, which
    /// `start` recovers from.
    pub fn restart(&mut self, terminal: bool) -> Result<()> {
        self.stop()?;
        self.start(terminal)
    }

    /// Returns the current type errors from a running daemon, starting
    /// one implicitly when DEAD. Blocking by default; `nonblocking`
    /// accepts a partial result as soon as the daemon acknowledges.
    pub fn incremental(&mut self, nonblocking: bool) -> Result<()> {
        if self.state() == ServerState::Dead {
            info!("No server running; starting one");
            self.start(false)?;
        } else {
            // The incremental request owns rebuilding the daemon's view.
            self.analysis_directory.prepare()?;
        }
        let mut extra: Vec<OsString> = Vec::new();
        if nonblocking {
            extra.push("-nonblocking".into());
        }
        self.request("incremental", &extra)
    }

    /// One-shot check. Never starts a persistent daemon and never
    /// touches the lock file.
    pub fn check(&mut self) -> Result<()> {
        self.analysis_directory.prepare()?;
        self.request("check", &[])
    }

    /// One-shot whole-program analysis, same lifecycle as `check`.
    pub fn analyze(&mut self, save_results_to: Option<&Path>) -> Result<()> {
        self.analysis_directory.prepare()?;
        let mut extra: Vec<OsString> = Vec::new();
        if let Some(path) = save_results_to {
            extra.push("-save-results-to".into());
            extra.push(path.into());
        }
        self.request("analyze", &extra)
    }

    /// Queries a running daemon. An error when DEAD; no automatic
    /// restart is attempted.
    pub fn query(&mut self, query: &str) -> Result<()> {
        if self.state() == ServerState::Dead {
            return Err(ClientError::ServerNotRunning);
        }
        self.request("query", &[OsString::from(query)])
    }

    /// IDE-integration session: ensures a daemon is up, then hands the
    /// terminal's stdin/stdout to one long-lived protocol subprocess.
    /// Callers degrade setup failures to a null responder instead of
    /// severing the editor's channel.
    pub fn persistent(&mut self) -> Result<()> {
        if self.state() == ServerState::Dead {
            info!("No server running; starting one");
            self.start(false)?;
        }
        self.request("persistent", &[])
    }

    /// Releases the analysis directory at the end of the invocation.
    pub fn cleanup(self) {
        self.analysis_directory.cleanup();
    }

    /// One blocking round trip to the daemon via the analysis binary.
    fn request(&self, request: &str, extra: &[OsString]) -> Result<()> {
        debug!(request, binary = %self.binary.display(), "Dispatching request");
        let status = Command::new(&self.binary)
            .arg(request)
            .args(self.flags())
            .args(self.directory_arguments())
            .args(extra)
            .status()
            .map_err(|source| ClientError::BinaryUnavailable {
                binary: self.binary.clone(),
                source,
            })?;
        if !status.success() {
            return Err(ClientError::RequestFailed {
                request: request.to_string(),
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    fn remove_shared_overlay(&self) {
        let shared = self.layout.log_directory.join(SHARED_OVERLAY_DIRECTORY);
        if shared.exists() {
            debug!(root = %shared.display(), "Removing shared overlay");
            if let Err(error) = fs::remove_dir_all(&shared) {
                warn!(error = %error, "Failed to remove shared overlay");
            }
        }
    }
}

fn exclusive_create(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Locates the analysis binary: explicit flag, then the `PYRE_BINARY`
/// environment override, then a sibling of the client executable, then
/// the bare name resolved through `PATH` at spawn time.
fn resolve_binary(binary_flag: Option<PathBuf>) -> PathBuf {
    if let Some(binary) = binary_flag {
        return binary;
    }
    if let Ok(binary) = std::env::var(BINARY_ENVIRONMENT_VARIABLE) {
        return PathBuf::from(binary);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|directory| directory.join(BINARY_NAME)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(BINARY_NAME))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisDirectory;
    use std::fs::File;
    use tempfile::TempDir;

    fn session_for(root: &Path, configuration: Configuration) -> ServerSession {
        let log_directory = root.join(".pyre");
        fs::create_dir_all(&log_directory).expect("log dir");
        let layout = RootLayout {
            original_directory: root.to_path_buf(),
            project_root: root.to_path_buf(),
            local_root: None,
            log_directory,
        };
        ServerSession::new(
            configuration,
            layout,
            AnalysisDirectory::direct(root.to_path_buf()),
            Some(PathBuf::from("/nonexistent/pyre.bin")),
            None,
        )
    }

    fn current_comm() -> String {
        procfs::process::Process::myself()
            .expect("own process")
            .stat()
            .expect("own stat")
            .comm
    }

    #[test]
    fn test_read_pid_parses_numbers_only() {
        let tree = TempDir::new().expect("tempdir");
        let path = tree.path().join("server.pid");

        assert_eq!(read_pid(&path), None);

        fs::write(&path, "derp").expect("write");
        assert_eq!(read_pid(&path), None);

        fs::write(&path, "1234\n").expect("write");
        assert_eq!(read_pid(&path), Some(1234));
    }

    #[test]
    fn test_is_expected_process_matches_comm() {
        let pid = std::process::id() as i32;
        assert!(is_expected_process(pid, &current_comm()));
        assert!(!is_expected_process(pid, "pyre.bin"));
        assert!(!is_expected_process(999_999_999, &current_comm()));
    }

    #[test]
    fn test_state_missing_lock_file_is_dead() {
        let tree = TempDir::new().expect("tempdir");
        let session = session_for(tree.path(), Configuration::default());
        assert_eq!(session.state(), ServerState::Dead);
    }

    #[test]
    fn test_state_garbage_lock_file_is_dead() {
        let tree = TempDir::new().expect("tempdir");
        let session = session_for(tree.path(), Configuration::default());
        fs::create_dir_all(session.server_directory()).expect("server dir");
        fs::write(session.pid_file_path(), "derp").expect("write");
        assert_eq!(session.state(), ServerState::Dead);
    }

    #[test]
    fn test_state_unrelated_process_is_dead() {
        // A live pid of a different binary must not count as RUNNING.
        let tree = TempDir::new().expect("tempdir");
        let session = session_for(tree.path(), Configuration::default());
        fs::create_dir_all(session.server_directory()).expect("server dir");
        fs::write(session.pid_file_path(), format!("{}", std::process::id()))
            .expect("write");
        assert_eq!(session.state(), ServerState::Dead);
    }

    #[test]
    fn test_flags_base_contract() {
        let tree = TempDir::new().expect("tempdir");
        let session = session_for(tree.path(), Configuration::default());
        assert_eq!(
            session.flags(),
            vec![
                OsString::from("-logging-sections"),
                OsString::from("parser"),
                OsString::from("-project-root"),
                OsString::from(tree.path()),
            ]
        );
    }

    #[test]
    fn test_flags_append_logger_when_configured() {
        let tree = TempDir::new().expect("tempdir");
        let configuration = Configuration {
            logger: Some(PathBuf::from("/foo/bar")),
            ..Configuration::default()
        };
        let session = session_for(tree.path(), configuration);
        assert_eq!(
            session.flags(),
            vec![
                OsString::from("-logging-sections"),
                OsString::from("parser"),
                OsString::from("-project-root"),
                OsString::from(tree.path()),
                OsString::from("-logger"),
                OsString::from("/foo/bar"),
            ]
        );
    }

    #[test]
    fn test_directory_arguments_carry_filter_scope() {
        use crate::analysis::{resolve_analysis_directory, DirectoryRequest};

        let tree = TempDir::new().expect("tempdir");
        let log_directory = tree.path().join(".pyre");
        fs::create_dir_all(&log_directory).expect("log dir");
        let layout = RootLayout {
            original_directory: tree.path().to_path_buf(),
            project_root: tree.path().to_path_buf(),
            local_root: None,
            log_directory,
        };
        let configuration = Configuration {
            source_directories: vec![PathBuf::from("src")],
            ..Configuration::default()
        };
        let directory = resolve_analysis_directory(
            &DirectoryRequest::default(),
            &configuration,
            &layout,
        )
        .expect("analysis directory");

        let session = ServerSession::new(
            configuration,
            layout,
            directory,
            Some(PathBuf::from("/nonexistent/pyre.bin")),
            None,
        );
        // Filter paths default to the project root; the whole scope is
        // forwarded to the daemon next to the analysis root.
        assert_eq!(
            session.directory_arguments(),
            vec![
                OsString::from("-analysis-directory"),
                OsString::from(tree.path().join("src")),
                OsString::from("-filter-directories"),
                OsString::from(tree.path()),
            ]
        );
    }

    #[test]
    fn test_kill_removes_lock_file_from_any_state() {
        let tree = TempDir::new().expect("tempdir");
        let mut session = session_for(tree.path(), Configuration::default());
        fs::create_dir_all(session.server_directory()).expect("server dir");
        fs::write(session.pid_file_path(), "not-a-pid").expect("write");
        File::create(session.socket_path()).expect("socket");

        session.kill().expect("kill");
        assert!(!session.pid_file_path().exists());
        assert!(!session.socket_path().exists());
        assert_eq!(session.state(), ServerState::Dead);
    }

    #[test]
    fn test_stop_heals_stale_lock_file() {
        let tree = TempDir::new().expect("tempdir");
        let mut session = session_for(tree.path(), Configuration::default());
        fs::create_dir_all(session.server_directory()).expect("server dir");
        fs::write(session.pid_file_path(), "999999999").expect("write");

        session.stop().expect("stop");
        assert!(!session.pid_file_path().exists());
    }

    #[test]
    fn test_query_against_dead_server_is_an_error() {
        let tree = TempDir::new().expect("tempdir");
        let mut session = session_for(tree.path(), Configuration::default());
        assert!(matches!(
            session.query("superclasses(int)"),
            Err(ClientError::ServerNotRunning)
        ));
    }
}
