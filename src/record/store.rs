//! Crash-safe create / claim / transition primitives over plain directories.
//!
//! Every stage directory owns a `tmp/` subdirectory. New contents are always
//! written there first and renamed into place, and a claimed record is parked
//! there under a unique name while its transform runs. Candidate listing never
//! descends into `tmp/`, so a record is visible in exactly one stage directory
//! at any time.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};
use uuid::Uuid;

use super::{JOB_ID, JobRecord, format};
use crate::error::StoreError;

pub const TMP_DIR: &str = "tmp";

const RECORD_EXT: &str = "job";
const CLAIM_SUFFIX: &str = "claimed";
const PART_SUFFIX: &str = "part";

/// Location of a record that was just created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub id: String,
    pub path: PathBuf,
}

/// A record owned exclusively by the caller after a successful claim.
///
/// Consumed by [`RecordStore::transition`] or [`RecordStore::abandon`]. If it
/// is simply dropped the file stays in the in-progress location for manual
/// recovery.
#[derive(Debug)]
pub struct ClaimedRecord {
    pub record: JobRecord,
    origin: PathBuf,
    in_progress: PathBuf,
}

impl ClaimedRecord {
    /// Path the record had in its source directory before the claim.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn in_progress_path(&self) -> &Path {
        &self.in_progress
    }

    pub fn file_name(&self) -> &OsStr {
        self.origin.file_name().unwrap_or_default()
    }

    /// Identifier from the headers, or the file stem for records written by
    /// collaborators that never set one.
    pub fn record_id(&self) -> String {
        match self.record.id() {
            Some(id) => id.to_string(),
            None => self
                .origin
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Stateless record store; every call re-reads the directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordStore;

impl RecordStore {
    pub fn new() -> Self {
        Self
    }

    /// Writes a new record into `target_dir`, assigning a `Job-ID` when the
    /// headers do not carry one.
    pub fn create(
        &self,
        target_dir: &Path,
        headers: BTreeMap<String, String>,
        body: impl Into<String>,
    ) -> Result<RecordHandle, StoreError> {
        let mut record = JobRecord::new(headers, body);
        let id = match record.id() {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                record.set_header(JOB_ID, id.clone());
                id
            }
        };
        if id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(StoreError::InvalidHeader(format::FormatError::InvalidKey {
                key: JOB_ID.to_string(),
                reason: "identifier is not usable as a file name",
            }));
        }

        let contents = format::render(&record)?;
        let file_name = format!("{id}.{RECORD_EXT}");
        let path = target_dir.join(&file_name);

        let tmp_dir = target_dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir).map_err(|e| StoreError::io(&tmp_dir, e))?;
        let part = write_part(&tmp_dir, &file_name, &contents)?;
        if let Err(e) = publish(&part, &path) {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
        debug!(job_id = %id, path = %path.display(), "record created");
        Ok(RecordHandle { id, path })
    }

    /// Lists claimable files in `source_dir`, oldest first.
    ///
    /// Hidden files and subdirectories (including `tmp/`) are skipped. A
    /// missing directory has no candidates.
    pub fn candidates(&self, source_dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let entries = match fs::read_dir(source_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(source_dir, e)),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(source_dir, e))?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                // Claimed by someone else between listing and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(entry.path(), e)),
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, entry.path()));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    /// Claims the first available candidate of `source_dir`.
    ///
    /// Returns `Ok(None)` when nothing is claimable. A corrupt candidate stops
    /// the scan with [`StoreError::Corrupt`]; it stays in place.
    pub fn claim(&self, source_dir: &Path) -> Result<Option<ClaimedRecord>, StoreError> {
        for candidate in self.candidates(source_dir)? {
            if let Some(claimed) = self.claim_path(&candidate)? {
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    /// Tries to take exclusive ownership of one file.
    ///
    /// The rename into `tmp/` decides races: the loser sees `NotFound` and
    /// gets `Ok(None)`. If the claimed file fails to parse it is renamed back
    /// to `path` before [`StoreError::Corrupt`] is returned.
    pub fn claim_path(&self, path: &Path) -> Result<Option<ClaimedRecord>, StoreError> {
        let (source_dir, file_name) = split_path(path)?;
        let tmp_dir = source_dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir).map_err(|e| StoreError::io(&tmp_dir, e))?;

        let token = Uuid::new_v4().simple();
        let in_progress = tmp_dir.join(format!(
            "{}.{token}.{CLAIM_SUFFIX}",
            file_name.to_string_lossy()
        ));

        match fs::rename(path, &in_progress) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "claim lost to another worker");
                return Ok(None);
            }
            Err(e) => return Err(StoreError::io(path, e)),
        }

        let parsed = fs::read(&in_progress)
            .map_err(|e| StoreError::io(&in_progress, e))
            .and_then(|bytes| {
                format::parse(&format::decode(bytes)).map_err(|err| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })
            });

        match parsed {
            Ok(record) => Ok(Some(ClaimedRecord {
                record,
                origin: path.to_path_buf(),
                in_progress,
            })),
            Err(err) => {
                publish(&in_progress, path)?;
                Err(err)
            }
        }
    }

    /// Persists `record` and moves it into `destination_dir`.
    ///
    /// The new contents replace the in-progress file through a temp file and
    /// rename; a final rename publishes it in the destination, after which the
    /// claimed location no longer exists.
    ///
    /// A same-named file already in the destination is never replaced: the
    /// claim goes back to its source directory and
    /// [`StoreError::AlreadyExists`] is returned.
    pub fn transition(
        &self,
        claimed: ClaimedRecord,
        record: &JobRecord,
        destination_dir: &Path,
    ) -> Result<PathBuf, StoreError> {
        let contents = format::render(record)?;
        fs::create_dir_all(destination_dir).map_err(|e| StoreError::io(destination_dir, e))?;

        let (tmp_dir, claim_name) = split_path(&claimed.in_progress)?;
        let part = write_part(tmp_dir, &claim_name.to_string_lossy(), &contents)?;
        if let Err(e) = fs::rename(&part, &claimed.in_progress) {
            let _ = fs::remove_file(&part);
            return Err(StoreError::io(&claimed.in_progress, e));
        }

        let destination = destination_dir.join(claimed.file_name());
        match publish(&claimed.in_progress, &destination) {
            Ok(()) => Ok(destination),
            Err(err @ StoreError::AlreadyExists { .. }) => {
                warn!(
                    destination = %destination.display(),
                    "destination already holds this record, returning claim to its stage"
                );
                publish(&claimed.in_progress, &claimed.origin)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns a claimed record, unchanged, to where it was claimed from.
    pub fn abandon(&self, claimed: ClaimedRecord) -> Result<PathBuf, StoreError> {
        publish(&claimed.in_progress, &claimed.origin)?;
        Ok(claimed.origin)
    }

    /// Claimed-but-untransitioned files parked under `source_dir/tmp`.
    pub fn in_progress(&self, source_dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let tmp_dir = source_dir.join(TMP_DIR);
        let entries = match fs::read_dir(&tmp_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&tmp_dir, e)),
        };
        let mut found = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&tmp_dir, e))?.path();
            if path.extension() == Some(OsStr::new(CLAIM_SUFFIX)) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Moves an in-progress file back into its stage directory under its
    /// original name. Only for operator-driven recovery after a crash.
    pub fn recover(&self, in_progress: &Path) -> Result<PathBuf, StoreError> {
        let (tmp_dir, claim_name) = split_path(in_progress)?;
        let claim_name = claim_name.to_string_lossy();
        let original = claim_name
            .strip_suffix(&format!(".{CLAIM_SUFFIX}"))
            .and_then(|rest| rest.rsplit_once('.'))
            .map(|(name, _token)| name.to_string())
            .ok_or_else(|| {
                StoreError::io(
                    in_progress,
                    io::Error::new(io::ErrorKind::InvalidInput, "not an in-progress claim file"),
                )
            })?;
        let source_dir = tmp_dir.parent().ok_or_else(|| {
            StoreError::io(
                in_progress,
                io::Error::new(io::ErrorKind::InvalidInput, "claim file outside a stage"),
            )
        })?;

        let target = source_dir.join(original);
        publish(in_progress, &target)?;
        warn!(path = %target.display(), "in-progress record returned to its stage");
        Ok(target)
    }
}

fn split_path(path: &Path) -> Result<(&Path, &OsStr), StoreError> {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(StoreError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "record path has no file name"),
        )),
    }
}

/// Renames `from` to `to`, refusing to replace an existing `to`.
fn publish(from: &Path, to: &Path) -> Result<(), StoreError> {
    match rename_noreplace(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::AlreadyExists {
            path: to.to_path_buf(),
        }),
        Err(e) => Err(StoreError::io(to, e)),
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_from = CString::new(from.as_os_str().as_bytes())?;
    let c_to = CString::new(to.as_os_str().as_bytes())?;
    // SAFETY: both pointers come from NUL-terminated CStrings alive for the call.
    let rc = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            c_from.as_ptr(),
            libc::AT_FDCWD,
            c_to.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        // Filesystem or kernel without RENAME_NOREPLACE.
        Some(libc::EINVAL) | Some(libc::ENOSYS) => link_then_unlink(from, to),
        _ => Err(err),
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
    link_then_unlink(from, to)
}

fn link_then_unlink(from: &Path, to: &Path) -> io::Result<()> {
    fs::hard_link(from, to)?;
    fs::remove_file(from)
}

/// Writes `contents` to a fresh, fsynced temp file in `tmp_dir`.
fn write_part(tmp_dir: &Path, stem: &str, contents: &str) -> Result<PathBuf, StoreError> {
    let part = tmp_dir.join(format!("{stem}.{}.{PART_SUFFIX}", Uuid::new_v4().simple()));
    let result = File::create(&part).and_then(|mut file| {
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&part);
        return Err(StoreError::io(&part, e));
    }
    Ok(part)
}
