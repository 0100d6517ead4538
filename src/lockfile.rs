//! The per-process lockfile: a binary status record, a liveness signal, and
//! a control mailbox in one file.
//!
//! While a monitored process is alive it holds an exclusive write lock on
//! byte 0 of its lockfile (the descriptor is opened between fork and exec
//! and descends across `exec`). Any observer that completes a blocking
//! acquire of the same byte has therefore witnessed the owner's death. The
//! 4-byte control word at offset 4 doubles as the operator mailbox; it is
//! always written as a single aligned positional write, never through a
//! serialisation framework, so readers observe it atomically.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::LOCKFILE_PREFIX;
use crate::errors::ProcmonError;

/// Normal operation.
pub const CONTROL_NONE: u32 = 0x0000_0000;
/// Operator request: do not restart the process until told otherwise.
pub const CONTROL_SUSPEND: u32 = 0xDEAD_BEEF;
/// Operator request: remove the lockfile and stop monitoring permanently.
pub const CONTROL_DELETE: u32 = 0xDEAF_BABE;

/// Reserved lockfile id of the primary supervisor.
pub const PRIMARY_ID: &str = "procmon1";
/// Reserved lockfile id of the backup supervisor.
pub const BACKUP_ID: &str = "procmon2";

const CONTROL_OFFSET: u64 = 4;
const START_TIME_OFFSET: u64 = 16;
pub const HEADER_LEN: usize = 24;

const OPEN_RETRIES: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Decoded lockfile contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub pid: i32,
    pub terminate: u32,
    pub run_count: u64,
    pub start_time: i64,
    pub exec: String,
}

impl LockRecord {
    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let field = |range: std::ops::Range<usize>| &buf[range];
        Some(Self {
            pid: i32::from_ne_bytes(field(0..4).try_into().ok()?),
            terminate: u32::from_ne_bytes(field(4..8).try_into().ok()?),
            run_count: u64::from_ne_bytes(field(8..16).try_into().ok()?),
            start_time: i64::from_ne_bytes(field(16..24).try_into().ok()?),
            exec: String::from_utf8_lossy(&buf[HEADER_LEN..]).into_owned(),
        })
    }

    fn encode_header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        header[4..8].copy_from_slice(&self.terminate.to_ne_bytes());
        header[8..16].copy_from_slice(&self.run_count.to_ne_bytes());
        header[16..24].copy_from_slice(&self.start_time.to_ne_bytes());
        header
    }
}

/// Outcome of a blocking wait on another process's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathEvent {
    /// The lock was acquired: the owner has died or released it.
    Died,
    /// The kernel detected a lock cycle. This only happens between the two
    /// supervisors monitoring each other; the caller falls back to polling.
    Deadlock,
}

/// An open lockfile handle.
#[derive(Debug)]
pub struct Lockfile {
    file: File,
    path: PathBuf,
}

impl Lockfile {
    /// Open-or-create the lockfile without writing or locking anything.
    /// Used by monitor workers to ensure the file exists before the child
    /// tries to lock it. Callers about to fork a child that will lock this
    /// file must drop the handle first: record locks die with the close of
    /// any descriptor for the file, including exec's close of an inherited
    /// close-on-exec one.
    pub fn prepare(dir: &Path, id: &str) -> Result<Self, ProcmonError> {
        let path = path_for(dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Open-or-create the lockfile, take the exclusive non-blocking write
    /// lock on byte 0, and only then write a fresh record. When the file
    /// already exists the stored run count is carried forward (incremented)
    /// and the control word is preserved. Fails with `LockBusy` when
    /// another process holds the lock, in which case the live owner's
    /// record is left untouched: only the lock holder may write the header.
    pub fn create(
        dir: &Path,
        id: &str,
        pid: i32,
        exec: &str,
        now: i64,
    ) -> Result<Self, ProcmonError> {
        let mut lockfile = Self::prepare(dir, id)?;

        match lock_byte0(lockfile.file.as_raw_fd(), libc::F_SETLK, libc::F_WRLCK) {
            Ok(()) => {}
            Err(err)
                if err.raw_os_error() == Some(libc::EAGAIN)
                    || err.raw_os_error() == Some(libc::EACCES) =>
            {
                return Err(ProcmonError::LockBusy(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        let mut record = LockRecord {
            pid,
            terminate: CONTROL_NONE,
            run_count: 1,
            start_time: now,
            exec: exec.to_string(),
        };
        if let Ok(previous) = lockfile.read_header() {
            record.terminate = previous.terminate;
            record.run_count = previous.run_count.saturating_add(1);
        }
        lockfile.write_record(&record)?;

        Ok(lockfile)
    }

    /// Open an existing lockfile, retrying for half a second: the file may
    /// be created by another process at any moment.
    pub fn open(dir: &Path, id: &str) -> Result<Self, ProcmonError> {
        let path = path_for(dir, id);
        let mut tries = 0;
        loop {
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => return Ok(Self { file, path }),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tries += 1;
                    if tries >= OPEN_RETRIES {
                        return Err(ProcmonError::NotFound(id.to_string()));
                    }
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Read the full record, or `None` when no lockfile exists. A present
    /// but truncated file is `Unusable`.
    pub fn try_read(dir: &Path, id: &str) -> Result<Option<LockRecord>, ProcmonError> {
        let path = path_for(dir, id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        LockRecord::decode(&buf)
            .map(Some)
            .ok_or_else(|| ProcmonError::Unusable(id.to_string()))
    }

    pub fn read_header(&mut self) -> Result<LockRecord, ProcmonError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        LockRecord::decode(&buf).ok_or_else(|| ProcmonError::Unusable(self.id()))
    }

    /// Rewrite the full record. The caller must be the record's single
    /// writer (the owning monitor worker, or `create` before the lock is
    /// contested).
    pub fn write_record(&mut self, record: &LockRecord) -> Result<(), ProcmonError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&record.encode_header())?;
        self.file.write_all(record.exec.as_bytes())?;
        self.file
            .set_len((HEADER_LEN + record.exec.len()) as u64)?;
        Ok(())
    }

    /// Store a control word. Aligned positional write, no lock taken.
    pub fn set_control(&mut self, word: u32) -> Result<(), ProcmonError> {
        self.write_at(CONTROL_OFFSET, &word.to_ne_bytes())
    }

    /// Overwrite `start_time` in place so state durations restart from now.
    pub fn reset_start_time(&mut self, now: i64) -> Result<(), ProcmonError> {
        self.write_at(START_TIME_OFFSET, &now.to_ne_bytes())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), ProcmonError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Duplicate the underlying descriptor for use on the blocking pool.
    pub fn blocking_handle(&self) -> Result<File, ProcmonError> {
        Ok(self.file.try_clone()?)
    }

    /// Non-blocking death probe: true when the byte-0 lock is free, i.e.
    /// the owner has exited (a zombie releases its locks too, which a pid
    /// probe alone would miss).
    pub fn probe_death(&self) -> Result<bool, ProcmonError> {
        match lock_byte0(self.file.as_raw_fd(), libc::F_SETLK, libc::F_WRLCK) {
            Ok(()) => {
                let _ = lock_byte0(self.file.as_raw_fd(), libc::F_SETLK, libc::F_UNLCK);
                Ok(true)
            }
            Err(err)
                if err.raw_os_error() == Some(libc::EAGAIN)
                    || err.raw_os_error() == Some(libc::EACCES) =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn id(&self) -> String {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(LOCKFILE_PREFIX))
            .unwrap_or("?")
            .to_string()
    }
}

/// Block until the byte-0 write lock can be taken, then release it again.
/// `Died` means the owner is gone; `Deadlock` means the kernel found a
/// cycle (the two supervisors waiting on each other).
pub fn wait_for_death(file: &File) -> Result<DeathEvent, ProcmonError> {
    match lock_byte0(file.as_raw_fd(), libc::F_SETLKW, libc::F_WRLCK) {
        Ok(()) => {
            let _ = lock_byte0(file.as_raw_fd(), libc::F_SETLK, libc::F_UNLCK);
            Ok(DeathEvent::Died)
        }
        Err(err) if err.raw_os_error() == Some(libc::EDEADLK) => Ok(DeathEvent::Deadlock),
        Err(err) => Err(err.into()),
    }
}

/// Unlink a lockfile.
pub fn delete(dir: &Path, id: &str) -> Result<(), ProcmonError> {
    std::fs::remove_file(path_for(dir, id))?;
    Ok(())
}

pub fn path_for(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{LOCKFILE_PREFIX}{id}"))
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn lock_byte0(fd: RawFd, cmd: libc::c_int, kind: libc::c_int) -> io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 1;

    loop {
        let rc = unsafe { libc::fcntl(fd, cmd, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if cmd == libc::F_SETLKW && err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// Child-side half of the death-detection protocol. Runs between fork and
/// exec, so only async-signal-safe calls are allowed: open the lockfile and
/// take the byte-0 write lock on a descriptor that is deliberately left
/// open (and not close-on-exec) so the lock descends to the new image. The
/// lock only survives exec if the forking process held no other descriptor
/// for this file: the kernel drops all of a process's locks on a file when
/// any descriptor for it closes, and exec closes every inherited
/// close-on-exec descriptor.
///
/// Failures are tolerated: the exec must proceed either way, and an
/// unlocked lockfile simply reads as an already-dead process.
pub fn lock_in_child(path: &std::ffi::CStr) {
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDWR);
        if fd < 0 {
            return;
        }
        let mut fl: libc::flock = std::mem::zeroed();
        fl.l_type = libc::F_WRLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = 0;
        fl.l_len = 1;
        let _ = libc::fcntl(fd, libc::F_SETLK, &fl);
        // fd intentionally not closed: closing any descriptor for the file
        // would drop the lock.
    }
}
