//! End-to-end daemon lifecycle against a stand-in analysis binary.
//!
//! The stand-in is a shell script named like the real binary so the
//! comm-based liveness check accepts it. Its `start` mode stays alive
//! until SIGTERM; every other mode exits immediately.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use pyre_client::analysis::{resolve_analysis_directory, DirectoryRequest};
use pyre_client::{ClientError, ServerSession, ServerState};
use pyre_core::{Configuration, RootLayout};

const FAKE_BINARY: &str = "\
#!/bin/sh
case \"$1\" in
  start)
    trap 'exit 0' TERM
    sleep 60 &
    wait $!
    ;;
  *)
    exit 0
    ;;
esac
";

struct Project {
    tree: TempDir,
}

impl Project {
    fn new() -> Project {
        let tree = TempDir::new().expect("tempdir");
        fs::create_dir(tree.path().join("src")).expect("source dir");
        fs::write(
            tree.path().join(".pyre_configuration"),
            "{\"source_directories\": [\"src\"]}",
        )
        .expect("configuration");

        let binary = tree.path().join("pyre.bin");
        fs::write(&binary, FAKE_BINARY).expect("binary");
        let mut permissions = fs::metadata(&binary).expect("metadata").permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&binary, permissions).expect("permissions");

        Project { tree }
    }

    fn root(&self) -> &Path {
        self.tree.path()
    }

    fn pid_file(&self) -> PathBuf {
        self.root().join(".pyre/server/server.pid")
    }

    fn session(&self) -> ServerSession {
        let layout = RootLayout::resolve(self.root(), None).expect("layout");
        let configuration = Configuration::load(&layout).expect("configuration");
        let directory = resolve_analysis_directory(
            &DirectoryRequest::default(),
            &configuration,
            &layout,
        )
        .expect("analysis directory");
        ServerSession::new(
            configuration,
            layout,
            directory,
            Some(self.root().join("pyre.bin")),
            None,
        )
    }
}

#[test]
fn test_start_then_stop() {
    let project = Project::new();
    let mut session = project.session();
    assert_eq!(session.state(), ServerState::Dead);

    session.start(false).expect("start");
    assert_eq!(session.state(), ServerState::Running);
    assert!(project.pid_file().exists());

    session.stop().expect("stop");
    assert_eq!(session.state(), ServerState::Dead);
    assert!(!project.pid_file().exists());
}

#[test]
fn test_start_is_idempotent_while_running() {
    let project = Project::new();
    let mut session = project.session();

    session.start(false).expect("first start");
    let pid = fs::read_to_string(project.pid_file()).expect("pid");

    session.start(false).expect("second start");
    assert_eq!(fs::read_to_string(project.pid_file()).expect("pid"), pid);

    session.kill().expect("kill");
}

#[test]
fn test_kill_tears_down_state() {
    let project = Project::new();
    let mut session = project.session();

    session.start(false).expect("start");
    assert_eq!(session.state(), ServerState::Running);

    session.kill().expect("kill");
    assert_eq!(session.state(), ServerState::Dead);
    assert!(!project.pid_file().exists());
}

#[test]
fn test_restart_recovers_from_dead() {
    let project = Project::new();
    let mut session = project.session();
    assert_eq!(session.state(), ServerState::Dead);

    // Stop half of the restart tolerates the missing daemon.
    session.restart(false).expect("restart");
    assert_eq!(session.state(), ServerState::Running);

    session.kill().expect("kill");
}

#[test]
fn test_check_round_trips_through_the_binary() {
    let project = Project::new();
    let mut session = project.session();

    session.check().expect("check");
    // One-shot operations never leave a daemon behind.
    assert_eq!(session.state(), ServerState::Dead);
    assert!(!project.pid_file().exists());
}

#[test]
fn test_failing_request_surfaces_the_status() {
    let project = Project::new();
    // Replace the stand-in with one that rejects every request.
    fs::write(
        project.root().join("pyre.bin"),
        "#!/bin/sh\nexit 7\n",
    )
    .expect("binary");

    let mut session = project.session();
    match session.check() {
        Err(ClientError::RequestFailed { status, .. }) => assert_eq!(status, 7),
        other => panic!("expected a failed request, got {other:?}"),
    }
}
