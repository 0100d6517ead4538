mod list;
mod shutdown;

use crate::cli::Invocation;
use crate::config::Paths;
use crate::control;
use crate::errors::ProcmonError;

/// Run one short-lived control invocation. The four per-process operations
/// are pure lockfile mutations plus a signal; `list` and `shutdown-all`
/// scan the lockfile directory.
pub async fn run(invocation: Invocation, paths: &Paths) -> Result<(), ProcmonError> {
    match invocation {
        Invocation::Kill(id) => control::kill(paths, &id),
        Invocation::Start(id) => control::start(paths, &id),
        Invocation::Restart(id) => control::restart(paths, &id),
        Invocation::Delete(id) => control::delete(paths, &id),
        Invocation::List(format) => list::run(paths, format),
        Invocation::ShutdownAll => shutdown::run(paths).await,
        Invocation::Usage | Invocation::Daemon { .. } => {
            unreachable!("daemon and usage are handled before command dispatch")
        }
    }
}
