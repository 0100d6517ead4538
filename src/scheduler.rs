//! Dependency-ordered bring-up. The fixed-point loop needs no topological
//! sort: every pass starts whatever has become runnable, and the loop ends
//! on the first pass that changes nothing. Configuration order is the
//! tie-break between independent records and is observable behaviour.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::control;
use crate::lockfile::{Lockfile, CONTROL_NONE};
use crate::monitor;
use crate::process::{parent_run_count, ProcState, SupervisorContext};

/// Start every record whose preconditions hold, as many times as progress
/// can be made, then return. Records still in INIT afterwards are part of a
/// dependency cycle and will never start.
pub async fn run_processes(ctx: &Arc<SupervisorContext>) {
    loop {
        let mut changed = false;
        for idx in 0..ctx.procs.len() {
            let record = &ctx.procs[idx];
            if record.state() != ProcState::Init {
                continue;
            }
            if record.skip {
                // Inert: never spawned, but dependents may proceed.
                record.set_state(ProcState::Running);
                changed = true;
                continue;
            }
            if !runnable(ctx, idx) {
                continue;
            }
            run(ctx, idx).await;
            changed = true;
        }
        if !changed {
            break;
        }
    }

    for record in &ctx.procs {
        if record.state() == ProcState::Init {
            warn!(
                "{} never became runnable; dependency cycle suspected",
                record.id
            );
        }
    }
}

/// A record may start when every parent is RUNNING and nothing already
/// supervises it.
fn runnable(ctx: &Arc<SupervisorContext>, idx: usize) -> bool {
    let record = &ctx.procs[idx];
    if record.has_live_worker() {
        return false;
    }
    record
        .parents
        .iter()
        .all(|&parent| ctx.procs[parent].state() == ProcState::Running)
}

async fn run(ctx: &Arc<SupervisorContext>, idx: usize) {
    let record = &ctx.procs[idx];
    monitor::spawn_worker(ctx, record);
    settle(ctx, idx).await;
    record.set_state(ProcState::Running);
}

/// Hold the scheduler for the record's settle delay, so dependents only
/// start once the process has (presumably) finished initialising. Skipped
/// when an instance is already alive or suspended (the crash-recovery
/// path) and for unmonitored records that have exhausted their current
/// generation.
async fn settle(ctx: &Arc<SupervisorContext>, idx: usize) {
    let record = &ctx.procs[idx];
    if record.wait == 0 {
        return;
    }

    match Lockfile::try_read(&ctx.paths.lock_dir, &record.id) {
        Ok(Some(header)) => {
            if header.terminate != CONTROL_NONE || control::process_exists(header.pid) {
                return;
            }
        }
        Ok(None) => {}
        Err(_) => {}
    }

    if record.monitored || record.run_count() < parent_run_count(&ctx.procs, record) {
        record.set_state(ProcState::Waiting);
        sleep(Duration::from_secs(record.wait)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{run_processes, runnable};
    use crate::config::{Paths, ProcessSpec};
    use crate::process::{build_graph, find, ProcState, SupervisorContext};

    fn temp_paths(prefix: &str) -> Paths {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let lock_dir = std::env::temp_dir().join(format!("procmon-sched-{prefix}-{nonce}"));
        std::fs::create_dir_all(&lock_dir).expect("failed to create lock dir");
        Paths { lock_dir }
    }

    fn skip_spec(id: &str, depends: &[&str]) -> ProcessSpec {
        // skip=true records go through every scheduler state transition
        // without ever spawning, which keeps these tests process-free.
        ProcessSpec {
            id: id.to_string(),
            exec: format!("{id} --run"),
            wait: 0,
            restart_delay: 0,
            depends: depends.iter().map(|value| value.to_string()).collect(),
            restart_on_parent_death: false,
            monitored: true,
            verbose: false,
            skip: true,
        }
    }

    fn ctx_from(specs: Vec<ProcessSpec>) -> Arc<SupervisorContext> {
        Arc::new(SupervisorContext {
            paths: temp_paths("fixture"),
            procs: build_graph(specs).expect("graph build failed"),
            verbose: false,
        })
    }

    #[tokio::test]
    async fn bring_up_reaches_every_record_of_a_dag() {
        let ctx = ctx_from(vec![
            skip_spec("varserver", &[]),
            skip_spec("corevars", &["varserver"]),
            skip_spec("filevars", &["varserver"]),
            skip_spec("execvars", &["varserver", "filevars"]),
        ]);

        run_processes(&ctx).await;

        for record in &ctx.procs {
            assert_eq!(record.state(), ProcState::Running, "{} not running", record.id);
        }
    }

    #[tokio::test]
    async fn cycles_are_left_in_init() {
        let ctx = ctx_from(vec![
            skip_spec("a", &["b"]),
            skip_spec("b", &["a"]),
            skip_spec("root", &[]),
        ]);

        run_processes(&ctx).await;

        let root = find(&ctx.procs, "root").expect("root missing");
        assert_eq!(ctx.procs[root].state(), ProcState::Running);
        let a = find(&ctx.procs, "a").expect("a missing");
        let b = find(&ctx.procs, "b").expect("b missing");
        assert_eq!(ctx.procs[a].state(), ProcState::Init);
        assert_eq!(ctx.procs[b].state(), ProcState::Init);
    }

    #[tokio::test]
    async fn children_are_not_runnable_until_all_parents_run() {
        let ctx = ctx_from(vec![
            skip_spec("a", &[]),
            skip_spec("b", &[]),
            skip_spec("child", &["a", "b"]),
        ]);

        let child = find(&ctx.procs, "child").expect("child missing");
        assert!(!runnable(&ctx, child));

        ctx.procs[0].set_state(ProcState::Running);
        assert!(!runnable(&ctx, child), "one running parent is not enough");

        ctx.procs[1].set_state(ProcState::Running);
        assert!(runnable(&ctx, child));
    }

    #[tokio::test]
    async fn a_record_without_edges_starts_in_the_first_pass() {
        let ctx = ctx_from(vec![skip_spec("lonely", &[])]);
        run_processes(&ctx).await;
        assert_eq!(ctx.procs[0].state(), ProcState::Running);
    }
}
