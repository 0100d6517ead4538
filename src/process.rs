use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::config::{Paths, ProcessSpec};
use crate::errors::ProcmonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Init,
    Started,
    Running,
    Terminated,
    Waiting,
}

impl std::fmt::Display for ProcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            ProcState::Init => "INIT",
            ProcState::Started => "STARTED",
            ProcState::Running => "RUNNING",
            ProcState::Terminated => "TERMINATED",
            ProcState::Waiting => "WAITING",
        };
        write!(f, "{value}")
    }
}

/// One supervised process. Everything is fixed after graph construction
/// except the fields each monitor worker (or the dependent-restart policy)
/// mutates: state, run count, restart delay, and the worker handle itself.
#[derive(Debug)]
pub struct ProcessRecord {
    pub id: String,
    pub exec: String,
    /// Settle delay after spawn, in seconds.
    pub wait: u64,
    pub restart_on_parent_death: bool,
    pub monitored: bool,
    pub verbose: bool,
    pub skip: bool,
    /// Delay between observed death and respawn, in seconds. Mutated by the
    /// dependent-restart policy, which propagates the parent's settle time.
    pub restart_delay: AtomicU64,
    /// Cumulative spawn attempts.
    pub run_count: AtomicU64,
    state: Mutex<ProcState>,
    /// Indices into the owning record vector.
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessRecord {
    pub fn from_spec(spec: ProcessSpec) -> Self {
        Self {
            id: spec.id,
            exec: spec.exec,
            wait: spec.wait,
            restart_on_parent_death: spec.restart_on_parent_death,
            monitored: spec.monitored,
            verbose: spec.verbose,
            skip: spec.skip,
            restart_delay: AtomicU64::new(spec.restart_delay),
            run_count: AtomicU64::new(0),
            state: Mutex::new(ProcState::Init),
            parents: Vec::new(),
            children: Vec::new(),
            worker: Mutex::new(None),
        }
    }

    /// A record for one of the two supervisors. Always monitored, never a
    /// member of the dependency graph.
    pub fn supervisor(id: &str, exec: String, verbose: bool) -> Self {
        Self {
            id: id.to_string(),
            exec,
            wait: 0,
            restart_on_parent_death: false,
            monitored: true,
            verbose,
            skip: false,
            restart_delay: AtomicU64::new(0),
            run_count: AtomicU64::new(0),
            state: Mutex::new(ProcState::Init),
            parents: Vec::new(),
            children: Vec::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProcState {
        *lock_ignoring_poison(&self.state)
    }

    pub fn set_state(&self, state: ProcState) {
        *lock_ignoring_poison(&self.state) = state;
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn has_live_worker(&self) -> bool {
        lock_ignoring_poison(&self.worker)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    pub fn set_worker(&self, handle: JoinHandle<()>) {
        *lock_ignoring_poison(&self.worker) = Some(handle);
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a monitor worker needs beyond its own record: the lockfile
/// directory and the (read-only) graph, threaded explicitly rather than
/// reached through process-wide state.
#[derive(Debug)]
pub struct SupervisorContext {
    pub paths: Paths,
    pub procs: Vec<Arc<ProcessRecord>>,
    pub verbose: bool,
}

/// Linear, deterministic id lookup.
pub fn find<R: std::borrow::Borrow<ProcessRecord>>(procs: &[R], id: &str) -> Option<usize> {
    procs
        .iter()
        .position(|record| record.borrow().id == id)
}

/// Two-pass graph construction. Pass 1 materialises records in
/// configuration order; pass 2 resolves declared dependencies into
/// symmetric parent/child index edges. Unresolved or self-referencing
/// dependencies abort; cycles are not detected here (affected records
/// simply never become runnable).
pub fn build_graph(specs: Vec<ProcessSpec>) -> Result<Vec<Arc<ProcessRecord>>, ProcmonError> {
    let depends: Vec<Vec<String>> = specs.iter().map(|spec| spec.depends.clone()).collect();
    let mut records: Vec<ProcessRecord> = specs.into_iter().map(ProcessRecord::from_spec).collect();

    let mut edges = Vec::new();
    for (child, deps) in depends.iter().enumerate() {
        for parent_id in deps {
            let parent =
                find(&records, parent_id).ok_or_else(|| ProcmonError::DependencyMissing {
                    child: records[child].id.clone(),
                    parent: parent_id.clone(),
                })?;
            if parent == child {
                return Err(ProcmonError::SelfDependency(records[child].id.clone()));
            }
            edges.push((child, parent));
        }
    }

    for (child, parent) in edges {
        records[child].parents.push(parent);
        records[parent].children.push(child);
    }

    Ok(records.into_iter().map(Arc::new).collect())
}

/// Largest run count among the record's parents. An unmonitored record has
/// finished its current generation once its own count catches up to this.
pub fn parent_run_count(procs: &[Arc<ProcessRecord>], record: &ProcessRecord) -> u64 {
    record
        .parents
        .iter()
        .map(|&parent| procs[parent].run_count())
        .max()
        .unwrap_or(0)
}
