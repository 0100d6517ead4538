//! The monitor worker: one task per supervised record, owning that record's
//! whole lifecycle from spawn through death detection, restart, and the
//! kick-off of dependent restarts. Errors stay inside the worker; nothing
//! here ever propagates to siblings or to the scheduler.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::control;
use crate::errors::ProcmonError;
use crate::lockfile::{
    self, DeathEvent, LockRecord, Lockfile, CONTROL_DELETE, CONTROL_NONE, CONTROL_SUSPEND,
};
use crate::process::{parent_run_count, ProcState, ProcessRecord, SupervisorContext};

/// Time allowed for a freshly spawned child to take its lock and settle.
const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Poll interval while suspended or in the deadlock fallback.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Create the monitor task for a record and move it to STARTED.
pub fn spawn_worker(ctx: &Arc<SupervisorContext>, record: &Arc<ProcessRecord>) {
    record.set_state(ProcState::Started);
    let task_ctx = Arc::clone(ctx);
    let task_record = Arc::clone(record);
    let handle = tokio::spawn(async move {
        monitor_loop(task_ctx, task_record).await;
    });
    record.set_worker(handle);
}

async fn monitor_loop(ctx: Arc<SupervisorContext>, record: Arc<ProcessRecord>) {
    debug!("monitor worker started for {}", record.id);
    let mut child: Option<Child> = None;

    loop {
        if !record.monitored && record.run_count() >= parent_run_count(&ctx.procs, &record) {
            // One run per parent generation; the dependent-restart policy
            // recreates this worker when a parent comes back.
            debug!("{} has completed its generation", record.id);
            break;
        }

        if record.monitored {
            match Lockfile::try_read(&ctx.paths.lock_dir, &record.id) {
                Ok(Some(header)) => {
                    if header.run_count > record.run_count() {
                        // Carry the cumulative count across supervisor
                        // restarts.
                        record.run_count.store(header.run_count, Ordering::SeqCst);
                    }
                    match header.terminate {
                        CONTROL_DELETE => {
                            info!("monitoring of {} deleted by operator", record.id);
                            if let Err(err) = lockfile::delete(&ctx.paths.lock_dir, &record.id) {
                                warn!("failed to remove lockfile for {}: {err}", record.id);
                            }
                            break;
                        }
                        CONTROL_SUSPEND => {
                            sleep(POLL_INTERVAL).await;
                            continue;
                        }
                        _ => {}
                    }
                    if control::process_exists(header.pid) {
                        match await_death(&ctx, &record, header.pid).await {
                            Ok(()) => {
                                reap(&mut child).await;
                                continue;
                            }
                            Err(err) => {
                                error!("lock wait failed for {}: {err}", record.id);
                                record.set_state(ProcState::Terminated);
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("cannot read lockfile for {}: {err}", record.id);
                    sleep(POLL_INTERVAL).await;
                    continue;
                }
            }
        }

        // Not running: spawn a new instance after the restart delay.
        let delay = record.restart_delay.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_secs(delay)).await;
        }
        record.run_count.fetch_add(1, Ordering::SeqCst);

        match spawn_child(&ctx, &record).await {
            Ok(new_child) => {
                if record.monitored {
                    child = Some(new_child);
                    sleep(SETTLE_DELAY).await;
                    restart_dependents(&ctx, &record).await;
                    // Death is observed at the top of the loop, where the
                    // control word is re-checked first.
                } else {
                    wait_for_exit(new_child, &record).await;
                    restart_dependents(&ctx, &record).await;
                    break;
                }
            }
            Err(err) => {
                error!("failed to spawn {}: {err}", record.id);
                sleep(POLL_INTERVAL).await;
            }
        }
    }

    reap(&mut child).await;
    debug!("monitor worker for {} exited", record.id);
}

/// Block until the current instance dies, observed through the lockfile.
/// On a kernel-detected lock cycle (the supervisor pair watching each
/// other) fall back to 1 Hz polling of the lock and the pid.
async fn await_death(
    ctx: &Arc<SupervisorContext>,
    record: &Arc<ProcessRecord>,
    pid: i32,
) -> Result<(), ProcmonError> {
    let lockfile = Lockfile::open(&ctx.paths.lock_dir, &record.id)?;
    let handle = lockfile.blocking_handle()?;
    let event = tokio::task::spawn_blocking(move || lockfile::wait_for_death(&handle))
        .await
        .map_err(|err| ProcmonError::Io(io::Error::new(io::ErrorKind::Other, err)))??;

    if event == DeathEvent::Deadlock {
        debug!(
            "lock cycle while monitoring {}; falling back to polling pid {pid}",
            record.id
        );
        loop {
            if lockfile.probe_death()? || !control::process_exists(pid) {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    debug!("observed death of {} (pid {pid})", record.id);
    Ok(())
}

/// Fork/exec one instance. In the child, between fork and exec: start a new
/// session and take the byte-0 write lock on the lockfile via a descriptor
/// that survives `exec`; that lock is the liveness signal every observer
/// waits on. The file is created ahead of the spawn but its handle is
/// dropped first: closing an inherited descriptor at exec time would
/// release every lock the child holds on the file, so no descriptor to the
/// lockfile may survive into the fork. The worker is the record's only
/// header writer while the child runs, so pid, run count, start time and
/// the exec string are written through a fresh handle after the spawn
/// returns.
async fn spawn_child(
    ctx: &Arc<SupervisorContext>,
    record: &Arc<ProcessRecord>,
) -> Result<Child, ProcmonError> {
    let argv: Vec<String> = record.exec.split_whitespace().map(str::to_string).collect();
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcmonError::InvalidConfig(format!(
            "process {} has an empty exec",
            record.id
        )));
    };

    let lock_path = if record.monitored {
        drop(Lockfile::prepare(&ctx.paths.lock_dir, &record.id)?);
        let path = lockfile::path_for(&ctx.paths.lock_dir, &record.id);
        Some(
            CString::new(path.as_os_str().as_bytes())
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?,
        )
    } else {
        None
    };

    let mut command = Command::new(program);
    command.args(args);
    unsafe {
        command.pre_exec(move || {
            // Only async-signal-safe calls from here to exec. A failed
            // setsid leaves the child in our session; the exec proceeds
            // regardless.
            libc::setsid();
            if let Some(path) = &lock_path {
                lockfile::lock_in_child(path);
            }
            Ok(())
        });
    }

    if record.verbose || ctx.verbose {
        debug!("running {}", record.exec);
    }
    let child = command.spawn()?;
    let pid = child
        .id()
        .map(|pid| pid as i32)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned child has no pid"))?;

    if record.monitored {
        let mut lockfile = Lockfile::open(&ctx.paths.lock_dir, &record.id)?;
        lockfile.write_record(&LockRecord {
            pid,
            terminate: CONTROL_NONE,
            run_count: record.run_count(),
            start_time: lockfile::now_epoch(),
            exec: record.exec.clone(),
        })?;
    }

    info!(
        "started {} (pid {pid}, run {})",
        record.id,
        record.run_count()
    );
    Ok(child)
}

/// On parent death, conditionally restart each direct dependent. Dependents
/// further down restart transitively when their own parent's death is
/// observed. Best-effort: failures are logged and forgotten.
pub async fn restart_dependents(ctx: &Arc<SupervisorContext>, record: &Arc<ProcessRecord>) {
    for &child_idx in &record.children {
        let dependent = &ctx.procs[child_idx];
        if !dependent.restart_on_parent_death
            || dependent.skip
            || dependent.state() == ProcState::Init
        {
            continue;
        }

        // Propagate the parent's settle time as the dependent's delay.
        dependent.restart_delay.store(record.wait, Ordering::SeqCst);

        if dependent.monitored {
            if let Err(err) = control::restart(&ctx.paths, &dependent.id) {
                warn!("failed to restart dependent {}: {err}", dependent.id);
            }
        } else if !dependent.has_live_worker() {
            debug!("starting a fresh worker for dependent {}", dependent.id);
            spawn_worker(ctx, dependent);
        }
    }
}

async fn wait_for_exit(mut child: Child, record: &Arc<ProcessRecord>) {
    match child.wait().await {
        Ok(status) => debug!("{} exited with {status}", record.id),
        Err(err) => warn!("wait for {} failed: {err}", record.id),
    }
}

async fn reap(child: &mut Option<Child>) {
    if let Some(mut done) = child.take() {
        match done.wait().await {
            Ok(status) => debug!("reaped child ({status})"),
            Err(err) => debug!("child reap failed: {err}"),
        }
    }
}
