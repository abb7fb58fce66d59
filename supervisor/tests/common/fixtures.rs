//! Test fixtures: shell-backed worker bootstraps
//!
//! The supervisor launches `<interpreter> <bootstrap> --script <target> ...`.
//! These fixtures use `bash` as the interpreter, so each bootstrap is a small
//! shell script; the extra argv entries are simply ignored by the scripts.

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

pub struct TestFixtures;

impl TestFixtures {
    /// Bootstrap that emits one line of every recognized shape and exits 0.
    ///
    /// The short sleep keeps the process alive through wire-up, so the zero
    /// exit is observed by status polling rather than racing the spawn path.
    pub const ECHO_BOOTSTRAP: &'static str = concat!(
        "echo 'BOOTSTRAP_STATUS: {\"status\":\"initialized\"}'\n",
        "echo '2024-01-01 12:00:00,123 - TestLogger - WARNING - low disk'\n",
        "echo 'plain line of output'\n",
        "echo 'stderr text' >&2\n",
        "sleep 0.2\n",
        "exit 0\n",
    );

    /// Bootstrap that stays alive until terminated.
    pub const SLEEP_BOOTSTRAP: &'static str = "sleep 30\n";

    /// Bootstrap that ignores graceful termination requests.
    pub const STUBBORN_BOOTSTRAP: &'static str = "trap '' TERM\nsleep 30\n";

    /// Bootstrap that fails immediately.
    pub const FAIL_BOOTSTRAP: &'static str = "exit 3\n";

    /// Writes a bootstrap script and a dummy target script into a fresh
    /// temp directory, returning (dir, bootstrap path, target path).
    pub fn worker(bootstrap_body: &str) -> (TempDir, PathBuf, PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let bootstrap = dir.path().join("bootstrap.sh");
        fs::write(&bootstrap, bootstrap_body).expect("write bootstrap");

        let target = dir.path().join("target.py");
        fs::write(&target, "print('hello')\n").expect("write target");

        (dir, bootstrap, target)
    }
}
