use std::fs;
use std::io;
use std::time::Duration;

use tokio::time::sleep;

use crate::config::{Paths, LOCKFILE_PREFIX};
use crate::control;
use crate::errors::ProcmonError;
use crate::lockfile::{self, BACKUP_ID, PRIMARY_ID};

/// Tear everything down: delete-monitoring for every ordinary process
/// first (so the supervisors don't fight the shutdown), then for the two
/// supervisors, then unlink the supervisor lockfiles.
pub(crate) async fn run(paths: &Paths) -> Result<(), ProcmonError> {
    println!("shutting down all processes....");

    for id in lockfile_ids(paths)? {
        if id.starts_with("procmon") {
            continue;
        }
        println!("terminating {id}");
        if let Err(err) = control::delete(paths, &id) {
            eprintln!("failed to terminate {id} ({err})");
            let _ = lockfile::delete(&paths.lock_dir, &id);
        }
    }

    // Give the monitor workers a chance to observe the delete words and
    // clean up before their supervisors go away.
    sleep(Duration::from_secs(1)).await;

    if let Err(err) = control::delete(paths, PRIMARY_ID) {
        eprintln!("failed to terminate {PRIMARY_ID} ({err})");
    }
    if let Err(err) = control::delete(paths, BACKUP_ID) {
        eprintln!("failed to terminate {BACKUP_ID} ({err})");
    }

    sleep(Duration::from_secs(1)).await;

    let _ = lockfile::delete(&paths.lock_dir, PRIMARY_ID);
    let _ = lockfile::delete(&paths.lock_dir, BACKUP_ID);

    Ok(())
}

fn lockfile_ids(paths: &Paths) -> Result<Vec<String>, ProcmonError> {
    let mut ids = Vec::new();
    let dir = match fs::read_dir(&paths.lock_dir) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ids),
        Err(err) => return Err(err.into()),
    };
    for dirent in dir {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        if let Some(id) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix(LOCKFILE_PREFIX))
        {
            if !id.is_empty() {
                ids.push(id.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}
