//! Process-group primitives: spawn into a fresh group, kill the whole group.
//!
//! On unix the job is started with `process_group(0)`, so the job's shell is
//! the group leader and its pid is the pgid. Everything it forks (launcher,
//! workers, data loaders) inherits that group and dies with one `killpg`.
//!
//! Other targets have no process groups. There `configure_new_group` is a
//! no-op and `kill_group` reports `Unsupported`; callers fall back to killing
//! the direct child, which can leave grandchildren running.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::Command;

/// Whether this target can signal a whole process group.
pub const GROUP_KILL_SUPPORTED: bool = cfg!(unix);

/// Make the spawned child the leader of a new process group.
#[cfg(unix)]
pub fn configure_new_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub fn configure_new_group(_cmd: &mut Command) {}

/// Send SIGKILL to every process in group `pgid`.
///
/// A group that no longer exists counts as success.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    let pgid = checked_pgid(pgid)?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not available on this platform",
    ))
}

/// Whether any process is still a member of group `pgid`.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    match checked_pgid(pgid) {
        // SAFETY: signal 0 performs the permission/existence check only.
        Ok(pgid) => unsafe { libc::killpg(pgid, 0) == 0 },
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

/// Refuse pgids that would address the caller's own group (0) or init (1).
#[cfg(unix)]
fn checked_pgid(pgid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pgid) {
        Ok(p) if p > 1 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        )),
    }
}

/// One-shot kill of a job's process group.
///
/// `fire` sends the kill the first time it is called and is a no-op after
/// that. Dropping the guard fires it, so the group dies on normal return,
/// on early return after a failed check, on panic unwind, and when the
/// owning future is cancelled.
#[derive(Debug)]
pub struct GroupGuard {
    pgid: u32,
    fired: AtomicBool,
}

impl GroupGuard {
    pub fn new(pgid: u32) -> Self {
        Self {
            pgid,
            fired: AtomicBool::new(false),
        }
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Kill the group. Returns `true` only for the call that actually fired.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        match kill_group(self.pgid) {
            Ok(()) => tracing::debug!(pgid = self.pgid, "process group killed"),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                tracing::debug!(pgid = self.pgid, "group kill unsupported on this platform")
            }
            Err(e) => tracing::warn!(pgid = self.pgid, error = %e, "failed to kill process group"),
        }
        true
    }

    /// Retire the guard without signalling. Once the leader has been reaped
    /// and the group is empty the pgid is free for reuse, so a later kill
    /// could hit an unrelated group. Returns `true` if the guard was armed.
    pub fn disarm(&self) -> bool {
        let armed = !self.fired.swap(true, Ordering::AcqRel);
        if armed {
            tracing::debug!(pgid = self.pgid, "process group already gone");
        }
        armed
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.fire();
    }
}
