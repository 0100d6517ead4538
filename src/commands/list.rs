use std::fs;
use std::io;
use std::path::Path;

use serde_json::json;

use crate::cli::ListFormat;
use crate::config::{Paths, LOCKFILE_PREFIX};
use crate::control;
use crate::errors::ProcmonError;
use crate::lockfile::{now_epoch, Lockfile};

struct ListEntry {
    name: String,
    pid: i32,
    run_count: u64,
    since: String,
    running: bool,
    exec: String,
}

pub(crate) fn run(paths: &Paths, format: ListFormat) -> Result<(), ProcmonError> {
    let entries = scan(&paths.lock_dir)?;
    match format {
        ListFormat::Human => print_table(&entries),
        ListFormat::Json => println!("{}", json_array(&entries)),
    }
    Ok(())
}

/// Read every `procmon.*` record in the lockfile directory. Unreadable
/// records are reported and skipped; the listing itself always succeeds.
fn scan(lock_dir: &Path) -> Result<Vec<ListEntry>, ProcmonError> {
    let mut entries = Vec::new();
    let dir = match fs::read_dir(lock_dir) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(entries),
        Err(err) => return Err(err.into()),
    };

    for dirent in dir {
        let dirent = dirent?;
        let file_name = dirent.file_name();
        let Some(id) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix(LOCKFILE_PREFIX))
        else {
            continue;
        };
        if id.is_empty() {
            continue;
        }

        match Lockfile::try_read(lock_dir, id) {
            Ok(Some(record)) => entries.push(ListEntry {
                name: id.to_string(),
                pid: record.pid,
                run_count: record.run_count,
                since: format_since(now_epoch().saturating_sub(record.start_time).max(0) as u64),
                running: control::process_exists(record.pid),
                exec: record.exec,
            }),
            Ok(None) => {}
            Err(err) => eprintln!("skipping {id}: {err}"),
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn print_table(entries: &[ListEntry]) {
    println!(
        "{:<15} {:>8} {:>8} {:>16} {:>7}   {}",
        "Process Name", "pid", "Restarts", "Since", "Status", "Command"
    );
    for entry in entries {
        println!(
            "{:<15} {:>8} {:>8} {:>16} {} : {}",
            entry.name,
            entry.pid,
            entry.run_count,
            entry.since,
            status(entry.running),
            entry.exec
        );
    }
}

fn json_array(entries: &[ListEntry]) -> String {
    let values: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "name": entry.name,
                "pid": entry.pid,
                "runcount": entry.run_count,
                "since": entry.since,
                "state": status(entry.running),
                "exec": entry.exec,
            })
        })
        .collect();
    serde_json::Value::Array(values).to_string()
}

fn status(running: bool) -> &'static str {
    if running {
        "running"
    } else {
        "stopped"
    }
}

/// Compact state-duration format: units above the largest nonzero one are
/// omitted, everything below is zero-padded to two digits.
fn format_since(runtime: u64) -> String {
    let secs = runtime % 60;
    let mins = (runtime / 60) % 60;
    let hours = (runtime / 3600) % 24;
    let days = runtime / 86400;

    if runtime < 60 {
        format!("{runtime}s")
    } else if runtime < 3600 {
        format!("{mins}m{secs:02}s")
    } else if runtime < 86400 {
        format!("{hours}h{mins:02}m{secs:02}s")
    } else {
        format!("{days}d{hours:02}h{mins:02}m{secs:02}s")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{format_since, json_array, scan};
    use crate::lockfile::{now_epoch, Lockfile};

    fn temp_lock_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock failure")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("procmon-list-{prefix}-{nonce}"));
        fs::create_dir_all(&dir).expect("failed to create lock dir");
        dir
    }

    #[test]
    fn format_since_matches_the_compact_layout() {
        assert_eq!(format_since(0), "0s");
        assert_eq!(format_since(37), "37s");
        assert_eq!(format_since(60), "1m00s");
        assert_eq!(format_since(5 * 60 + 2), "5m02s");
        assert_eq!(format_since(2 * 3600 + 5 * 60 + 30), "2h05m30s");
        assert_eq!(format_since(86400 + 3), "1d00h00m03s");
        assert_eq!(
            format_since(3 * 86400 + 12 * 3600 + 45 * 60 + 37),
            "3d12h45m37s"
        );
    }

    #[test]
    fn format_since_is_uniquely_parseable() {
        // Two distinct durations must never render identically.
        let samples = [0, 1, 59, 60, 61, 3599, 3600, 3661, 86399, 86400, 90063];
        for (i, &a) in samples.iter().enumerate() {
            for &b in &samples[i + 1..] {
                assert_ne!(format_since(a), format_since(b), "{a} vs {b} collide");
            }
        }
    }

    #[test]
    fn scan_reports_live_and_stale_records() {
        let dir = temp_lock_dir("scan");
        let own_pid = std::process::id() as i32;

        let _live = Lockfile::create(&dir, "alive", own_pid, "alive --serve", now_epoch())
            .expect("create failed");
        // A pid far beyond any real pid range: reads as stopped.
        let _stale = Lockfile::create(&dir, "dead", i32::MAX, "dead --serve", now_epoch())
            .expect("create failed");
        // Unrelated files are ignored.
        fs::write(dir.join("notes.txt"), "not a lockfile").expect("write failed");

        let entries = scan(&dir).expect("scan failed");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "alive");
        assert!(entries[0].running);
        assert_eq!(entries[0].exec, "alive --serve");
        assert_eq!(entries[1].name, "dead");
        assert!(!entries[1].running);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn json_listing_carries_the_expected_keys() {
        let dir = temp_lock_dir("json");
        let own_pid = std::process::id() as i32;
        let _live = Lockfile::create(&dir, "svc", own_pid, "svc --port 80", now_epoch())
            .expect("create failed");

        let entries = scan(&dir).expect("scan failed");
        let value: serde_json::Value =
            serde_json::from_str(&json_array(&entries)).expect("invalid JSON output");

        let list = value.as_array().expect("expected a JSON array");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "svc");
        assert_eq!(list[0]["pid"], own_pid);
        assert_eq!(list[0]["runcount"], 1);
        assert_eq!(list[0]["state"], "running");
        assert_eq!(list[0]["exec"], "svc --port 80");
        assert!(list[0]["since"].is_string());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn scan_of_a_missing_directory_is_empty() {
        let dir = temp_lock_dir("missing").join("nowhere");
        let entries = scan(&dir).expect("scan failed");
        assert!(entries.is_empty());
    }
}
