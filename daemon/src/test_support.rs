/// Spawns `sleep` under executable names no other process on the host uses,
/// so kill-by-name tests can never hit an unrelated process.
///
/// The kernel takes the process name from the path handed to `execve`, so a
/// symlink named `pw<pid>x<n>` pointing at `sleep` shows up under that name.
/// [`NamedSleeper::long`] picks a name past the kernel's 15-byte limit; it is
/// started with its own path as argv[0] so the full name stays recoverable.
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

pub struct NamedSleeper {
    _dir: tempfile::TempDir,
    exe: PathBuf,
    pub name: String,
    keep_argv0: bool,
}

impl NamedSleeper {
    /// A name short enough to be the kernel process name verbatim.
    pub fn new() -> Self {
        let name = format!(
            "pw{}x{}",
            std::process::id() % 10_000_000,
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        );
        Self::named(name, false)
    }

    /// A name the kernel cuts short.
    pub fn long() -> Self {
        let name = format!(
            "procwatchlongname{}x{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        );
        Self::named(name, true)
    }

    fn named(name: String, keep_argv0: bool) -> Self {
        let target = ["/bin/sleep", "/usr/bin/sleep"]
            .into_iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .expect("no sleep binary found");

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join(&name);
        std::os::unix::fs::symlink(target, &exe).unwrap();
        Self {
            _dir: dir,
            exe,
            name,
            keep_argv0,
        }
    }

    pub fn spawn(&self) -> Child {
        let mut command = Command::new(&self.exe);
        if !self.keep_argv0 {
            command.arg0("sleep");
        }
        command.arg("60").spawn().unwrap()
    }
}

/// Polls `child` until it exits or `timeout` elapses; reaps it on exit.
pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if child.try_wait().unwrap().is_some() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Kills and reaps `child` if it is still running.
pub fn cleanup(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
