//! Subprocess plumbing over `std::process`, waited on from a blocking
//! thread. The tokio `process` feature is deliberately not used (see the
//! workspace manifest); this wrapper is the encapsulated work-around.
//! Children are placed in their own process group so that a timeout can
//! reap the converter and everything it forked.

pub use std::process::Command;

use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;

pub struct Child {
    inner: std::process::Child,
    pub stderr: Option<tokio::fs::File>,
}

impl Child {
    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    pub async fn wait(mut self) -> std::io::Result<std::process::ExitStatus> {
        let handle = tokio::runtime::Handle::current().spawn_blocking(move || self.inner.wait());
        handle.await.expect("wait does not panic")
    }
}

fn map_stdio<F>(f: Option<F>) -> Option<tokio::fs::File>
where
    F: Into<OwnedFd>,
{
    let f: Option<OwnedFd> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(Into::into)
}

/// Spawns the command as the leader of a new process group, with stdin
/// closed, stdout discarded, and stderr piped for capture.
pub fn spawn_group(cmd: &mut Command) -> std::io::Result<Child> {
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .process_group(0);

    tracing::debug!(program = ?cmd.get_program(), args = ?cmd.get_args().collect::<Vec<_>>(), "invoking");

    let mut inner = cmd.spawn()?;
    let stderr = map_stdio(inner.stderr.take());
    Ok(Child { inner, stderr })
}

/// Signals the child's entire process group.
pub fn kill_group(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::killpg(pid as libc::pid_t, signal);
    }
}
