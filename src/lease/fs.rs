//! Filesystem slot backend.
//!
//! One descriptor file per (endpoint, slot) under the lease directory:
//! `slot-<sha256(endpoint id)[..8]>-<slot>.lease`. Ownership is the exclusive
//! advisory lock on that file; the JSON inside says who holds it. The OS drops
//! the lock when the holder dies, so a descriptor whose lock can be taken is
//! reclaimable whatever PID it names.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::LeaseDescriptor;
use super::broker::{Endpoint, SlotLease, SlotStore};
use crate::error::LeaseError;

const LEASE_EXT: &str = "lease";

#[derive(Debug, Clone)]
pub struct FsSlotStore {
    lease_dir: PathBuf,
}

/// A descriptor found on disk, for status reporting.
#[derive(Debug, Clone)]
pub struct LeaseStatus {
    pub path: PathBuf,
    pub descriptor: Option<LeaseDescriptor>,
    pub holder_alive: bool,
}

impl FsSlotStore {
    pub fn new(lease_dir: impl Into<PathBuf>) -> Result<Self, LeaseError> {
        let lease_dir = lease_dir.into();
        fs::create_dir_all(&lease_dir).map_err(|e| LeaseError::io(&lease_dir, e))?;
        Ok(Self { lease_dir })
    }

    pub fn lease_dir(&self) -> &Path {
        &self.lease_dir
    }

    pub fn descriptor_path(&self, endpoint_id: &str, slot: u32) -> PathBuf {
        let digest = Sha256::digest(endpoint_id.as_bytes());
        let short = hex::encode(&digest[..4]);
        self.lease_dir.join(format!("slot-{short}-{slot}.{LEASE_EXT}"))
    }

    /// Every descriptor currently on disk with its holder's liveness.
    pub fn snapshot(&self) -> Result<Vec<LeaseStatus>, LeaseError> {
        let mut found = Vec::new();
        for path in self.descriptor_files()? {
            let descriptor = match fs::read_to_string(&path) {
                Ok(text) => serde_json::from_str::<LeaseDescriptor>(&text).ok(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(LeaseError::io(&path, e)),
            };
            let holder_alive = descriptor.as_ref().is_some_and(|d| is_pid_alive(d.pid));
            found.push(LeaseStatus {
                path,
                descriptor,
                holder_alive,
            });
        }
        Ok(found)
    }

    /// Removes descriptors that name this process but are no longer locked
    /// by any of its handles. Run on the shutdown path.
    pub fn release_own_stale(&self) -> Result<usize, LeaseError> {
        let mut removed = 0;
        for path in self.descriptor_files()? {
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(descriptor) = serde_json::from_str::<LeaseDescriptor>(&text) else {
                continue;
            };
            if !descriptor.is_own() {
                continue;
            }
            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            if try_lock_exclusive(&file).map_err(|e| LeaseError::io(&path, e))? {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(LeaseError::io(&path, e)),
                }
                debug!(path = %path.display(), "removed own leftover lease");
            }
        }
        Ok(removed)
    }

    fn descriptor_files(&self) -> Result<Vec<PathBuf>, LeaseError> {
        let entries = match fs::read_dir(&self.lease_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LeaseError::io(&self.lease_dir, e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| LeaseError::io(&self.lease_dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == LEASE_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl SlotStore for FsSlotStore {
    type Slot = FsSlotLease;

    fn try_acquire(
        &self,
        endpoint: &Endpoint,
        slot: u32,
        purpose: &str,
    ) -> Result<Option<FsSlotLease>, LeaseError> {
        let path = self.descriptor_path(&endpoint.id, slot);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| LeaseError::io(&path, e))?;

        if !try_lock_exclusive(&file).map_err(|e| LeaseError::io(&path, e))? {
            return Ok(None);
        }
        // A releasing holder unlinks before unlocking; a lock on the unlinked
        // inode guards nothing.
        if !still_linked(&file, &path).map_err(|e| LeaseError::io(&path, e))? {
            return Ok(None);
        }

        let mut existing = Vec::new();
        file.read_to_end(&mut existing)
            .map_err(|e| LeaseError::io(&path, e))?;
        // Holding the lock proves nobody else does; the descriptor only
        // decides how loudly the takeover is logged.
        if let Ok(previous) = serde_json::from_slice::<LeaseDescriptor>(&existing)
            && !previous.is_own()
        {
            if is_pid_alive(previous.pid) {
                warn!(
                    endpoint = %endpoint.id,
                    slot,
                    stale_pid = previous.pid,
                    "unlocked lease names a running process (reused pid?), reclaiming"
                );
            } else {
                info!(
                    endpoint = %endpoint.id,
                    slot,
                    stale_pid = previous.pid,
                    "reclaiming abandoned lease"
                );
            }
        }

        let descriptor = LeaseDescriptor::new(endpoint.id.clone(), slot, purpose);
        let json = serde_json::to_vec(&descriptor).map_err(|e| LeaseError::io(&path, e.into()))?;
        overwrite(&mut file, &json).map_err(|e| LeaseError::io(&path, e))?;

        Ok(Some(FsSlotLease {
            file: Some(file),
            path,
            descriptor,
        }))
    }
}

/// A held slot: the open, locked descriptor file.
#[derive(Debug)]
pub struct FsSlotLease {
    file: Option<File>,
    path: PathBuf,
    descriptor: LeaseDescriptor,
}

impl FsSlotLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the descriptor, then closes the file, which drops the lock.
    fn release_inner(&mut self) -> Result<(), LeaseError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LeaseError::io(&self.path, e)),
        };
        drop(file);
        debug!(
            endpoint = %self.descriptor.endpoint,
            slot = self.descriptor.slot,
            "lease released"
        );
        removed
    }
}

impl SlotLease for FsSlotLease {
    fn descriptor(&self) -> &LeaseDescriptor {
        &self.descriptor
    }

    fn release(mut self) -> Result<(), LeaseError> {
        self.release_inner()
    }
}

impl Drop for FsSlotLease {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(error = %e, "failed to release lease");
        }
    }
}

/// Non-blocking `flock(LOCK_EX)`. `Ok(false)` when another handle holds it.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    match fs2::FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

/// Whether `pid` names a running process.
///
/// Uses `kill(pid, 0)`, which probes without signalling. `EPERM` means the
/// process exists under another user and counts as alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    true
}

fn overwrite(file: &mut File, contents: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(contents)?;
    file.sync_all()
}
