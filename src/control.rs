//! Control-plane operations. Every operation is a short-lived mutation of
//! the target's lockfile plus (usually) a SIGKILL; the long-running monitor
//! workers observe the change on their next wake-up. There is no rendezvous
//! with the supervisor itself.

use nix::errno::Errno;
use nix::sys::signal::{kill as send_signal, Signal};
use nix::unistd::Pid;

use crate::config::Paths;
use crate::errors::ProcmonError;
use crate::lockfile::{now_epoch, Lockfile, CONTROL_DELETE, CONTROL_NONE, CONTROL_SUSPEND};

/// Kill the process and suspend its monitoring: the worker will observe the
/// suspend word and stop restarting until `start` clears it.
pub fn kill(paths: &Paths, id: &str) -> Result<(), ProcmonError> {
    terminate_command(paths, id, CONTROL_SUSPEND)
}

/// Kill the process and delete its monitoring: the worker removes the
/// lockfile and exits permanently.
pub fn delete(paths: &Paths, id: &str) -> Result<(), ProcmonError> {
    terminate_command(paths, id, CONTROL_DELETE)
}

/// Resume monitoring of a previously killed process by clearing the control
/// word; the worker respawns within one polling interval.
pub fn start(paths: &Paths, id: &str) -> Result<(), ProcmonError> {
    let mut lockfile = Lockfile::open(&paths.lock_dir, id)?;
    lockfile.set_control(CONTROL_NONE)
}

/// Restart the process by killing its current pid; the restart itself is a
/// natural consequence of the worker observing the death.
pub fn restart(paths: &Paths, id: &str) -> Result<(), ProcmonError> {
    tracing::info!("restarting {id}");
    let mut lockfile = Lockfile::open(&paths.lock_dir, id)?;
    let record = lockfile.read_header()?;
    kill_pid(record.pid)
}

fn terminate_command(paths: &Paths, id: &str, word: u32) -> Result<(), ProcmonError> {
    let mut lockfile = Lockfile::open(&paths.lock_dir, id)?;
    let record = lockfile.read_header()?;
    lockfile.set_control(word)?;
    lockfile.reset_start_time(now_epoch())?;
    kill_pid(record.pid)
}

fn kill_pid(pid: i32) -> Result<(), ProcmonError> {
    if pid <= 0 {
        return Err(ProcmonError::Signal {
            pid,
            source: Errno::ESRCH,
        });
    }
    send_signal(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|source| ProcmonError::Signal { pid, source })
}

/// Zero-signal existence probe. EPERM means the pid exists but belongs to
/// someone else.
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match send_signal(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
