//! One open cache bucket: two append-only files, an in-memory index, and
//! an optional exclusive write lock.
//!
//! The data file is raw concatenated blob bytes. The metadata file is a
//! 4-byte little-endian touch-timestamp header followed by fixed
//! `hash(20) ‖ size(4, LE)` records in write order; record i's data offset
//! is the running sum of the sizes before it. A bucket whose reconstructed
//! data size disagrees with the data file's actual length is corrupt and is
//! reset wholesale (both files truncated, index cleared) rather than
//! partially replayed.

use crate::error::CacheError;
use crate::hash::{ContentHash, HASH_LEN};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub(crate) const META_HEADER_LEN: u64 = 4;
pub(crate) const META_RECORD_LEN: u64 = (HASH_LEN + 4) as u64;

/// Failure modes of an append, after rollback.
#[derive(Debug)]
pub(crate) enum AppendError {
  /// Out of space, or a platform write anomaly normalized into the quota
  /// path so the rollback-and-evict cycle fires uniformly.
  Quota(CacheError),
  Io(io::Error),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexEntry {
  pub offset: u64,
  pub size: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFileContents {
  pid: u32,
  started_at: u64,
}

/// Exclusive advisory write lock for one bucket, held as a lock file.
///
/// Released exactly once: explicitly on close, or by the drop guard if the
/// bucket is torn down another way.
#[derive(Debug)]
pub(crate) struct LockToken {
  path: PathBuf,
  released: bool,
}

impl LockToken {
  pub(crate) fn release(&mut self) {
    if !self.released {
      self.released = true;
      let _ = fs::remove_file(&self.path);
    }
  }
}

impl Drop for LockToken {
  fn drop(&mut self) {
    self.release();
  }
}

#[derive(Debug)]
pub(crate) struct Bucket {
  name: String,
  data: File,
  meta: File,
  data_len: u64,
  meta_len: u64,
  index: FxHashMap<ContentHash, IndexEntry>,
  lock: Option<LockToken>,
  #[cfg(test)]
  pub(crate) fail_appends: std::cell::Cell<usize>,
}

impl Bucket {
  /// Opens (creating if absent) the bucket named `name` under `root`.
  ///
  /// Returns the bucket and whether a corruption repair ran. Lock
  /// contention is not an error: the bucket opens without the write token
  /// and serves reads only. Failure to create or open either file is an
  /// error; the caller marks the bucket permanently failed.
  pub(crate) fn open(
    root: &Path,
    name: &str,
    lock_stale_after: Duration,
  ) -> io::Result<(Self, bool)> {
    let data_path = data_path_for(root, name);
    let meta_path = meta_path_for_data(&data_path);

    let data = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(&data_path)?;
    let meta = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(&meta_path)?;

    let lock = acquire_bucket_lock(&lock_path_for(&data_path), lock_stale_after);
    if lock.is_none() {
      debug!(bucket = name, "write lock held elsewhere, opening read-only");
    }

    let mut bucket = Self {
      name: name.to_string(),
      data,
      meta,
      data_len: 0,
      meta_len: 0,
      index: FxHashMap::default(),
      lock,
      #[cfg(test)]
      fail_appends: std::cell::Cell::new(0),
    };

    if bucket.is_writer() {
      bucket.touch()?;
    }
    let repaired = bucket.load_index()?;
    Ok((bucket, repaired))
  }

  pub(crate) fn is_writer(&self) -> bool {
    self.lock.is_some()
  }

  pub(crate) fn entry_count(&self) -> usize {
    self.index.len()
  }

  /// Writes the current time into the metadata header, marking recent use
  /// so age-based eviction leaves this bucket alone.
  fn touch(&mut self) -> io::Result<()> {
    let secs = now_seconds().min(u64::from(u32::MAX)) as u32;
    self.meta.seek(SeekFrom::Start(0))?;
    self.meta.write_all(&secs.to_le_bytes())?;
    Ok(())
  }

  /// Loads the metadata records into the in-memory index.
  ///
  /// Returns whether a corruption repair ran. A size mismatch between the
  /// records and the data file resets the bucket: both files truncated,
  /// index cleared. Without the write token the reset cannot be performed;
  /// the index is simply left empty so every lookup misses.
  fn load_index(&mut self) -> io::Result<bool> {
    self.data_len = self.data.metadata()?.len();
    self.meta_len = self.meta.metadata()?.len();

    if self.meta_len < META_HEADER_LEN {
      if self.meta_len == 0 && self.data_len == 0 {
        // Fresh bucket; the writer already wrote the header in touch().
        return Ok(false);
      }
      return self.repair("metadata shorter than its header");
    }

    let body_len = self.meta_len - META_HEADER_LEN;
    if body_len % META_RECORD_LEN != 0 {
      return self.repair("metadata not a whole number of records");
    }

    let mut body = vec![0u8; body_len as usize];
    self.meta.seek(SeekFrom::Start(META_HEADER_LEN))?;
    self.meta.read_exact(&mut body)?;

    let mut index = FxHashMap::default();
    let mut offset = 0u64;
    for record in body.chunks_exact(META_RECORD_LEN as usize) {
      let hash = ContentHash::from_slice(&record[..HASH_LEN]).expect("record slice is HASH_LEN");
      let size = u32::from_le_bytes(record[HASH_LEN..].try_into().unwrap());
      // Re-stored hashes shadow the earlier copy; the old bytes stay until
      // the whole bucket is evicted.
      index.insert(hash, IndexEntry { offset, size });
      offset += u64::from(size);
    }

    if offset != self.data_len {
      return self.repair("data length disagrees with metadata records");
    }

    self.index = index;
    Ok(false)
  }

  fn repair(&mut self, detail: &str) -> io::Result<bool> {
    self.index.clear();
    if !self.is_writer() {
      debug!(
        bucket = %self.name,
        detail,
        "corrupt bucket opened read-only, serving no entries"
      );
      self.data_len = 0;
      self.meta_len = 0;
      return Ok(false);
    }

    warn!(bucket = %self.name, detail, "resetting corrupt bucket");
    self.data.set_len(0)?;
    self.meta.set_len(0)?;
    self.data_len = 0;
    self.touch()?;
    self.meta_len = META_HEADER_LEN;
    Ok(true)
  }

  /// Reads the blob stored for `hash`, or `None` when absent.
  pub(crate) fn read_blob(&mut self, hash: &ContentHash) -> io::Result<Option<Vec<u8>>> {
    let Some(entry) = self.index.get(hash).copied() else {
      return Ok(None);
    };
    let mut blob = vec![0u8; entry.size as usize];
    self.data.seek(SeekFrom::Start(entry.offset))?;
    self.data.read_exact(&mut blob)?;
    Ok(Some(blob))
  }

  /// Appends one assembled batch to both files.
  ///
  /// On success returns the data offset the batch landed at; the caller
  /// then records the new index entries via [`Self::absorb`]. On any
  /// failure both files are truncated back to their pre-append lengths
  /// before the error is returned, so previously stored entries stay
  /// intact.
  pub(crate) fn append(&mut self, data_buf: &[u8], meta_buf: &[u8]) -> Result<u64, AppendError> {
    let pre_data = self.data_len;
    let pre_meta = self.meta_len;
    let requested = data_buf.len() + meta_buf.len();

    #[cfg(test)]
    if self.fail_appends.get() > 0 {
      self.fail_appends.set(self.fail_appends.get() - 1);
      return Err(AppendError::Quota(CacheError::QuotaExceeded {
        bucket: self.name.clone(),
        requested,
      }));
    }

    let result = self
      .append_at(true, pre_data, data_buf)
      .and_then(|()| self.append_at(false, pre_meta, meta_buf));

    match result {
      Ok(()) => {
        self.data_len = pre_data + data_buf.len() as u64;
        self.meta_len = pre_meta + meta_buf.len() as u64;
        Ok(pre_data)
      }
      Err(err) => {
        // Roll back so a torn batch is never visible to a later open.
        let _ = self.data.set_len(pre_data);
        let _ = self.meta.set_len(pre_meta);
        Err(self.classify_append_error(err, requested))
      }
    }
  }

  fn append_at(&mut self, to_data: bool, at: u64, bytes: &[u8]) -> io::Result<()> {
    let file = if to_data { &mut self.data } else { &mut self.meta };
    file.seek(SeekFrom::Start(at))?;
    let mut written = 0usize;
    while written < bytes.len() {
      match file.write(&bytes[written..]) {
        Ok(0) => {
          return Err(io::Error::new(
            ErrorKind::WriteZero,
            format!("wrote {written} of {} bytes", bytes.len()),
          ));
        }
        Ok(n) if n > bytes.len() - written => {
          return Err(io::Error::new(
            ErrorKind::WriteZero,
            format!("platform reported {n} bytes written, asked for fewer"),
          ));
        }
        Ok(n) => written += n,
        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
        Err(err) => return Err(err),
      }
    }
    Ok(())
  }

  fn classify_append_error(&self, err: io::Error, requested: usize) -> AppendError {
    if is_quota_error(&err) {
      return AppendError::Quota(CacheError::QuotaExceeded {
        bucket: self.name.clone(),
        requested,
      });
    }
    // A short or over-long write is a platform anomaly; treat it like
    // quota exhaustion so the evict-and-retry cycle fires.
    if err.kind() == ErrorKind::WriteZero {
      return AppendError::Quota(CacheError::PartialWrite {
        bucket: self.name.clone(),
        written: 0,
        requested,
      });
    }
    AppendError::Io(err)
  }

  /// Records freshly appended entries in the index. `base` is the data
  /// offset returned by the matching [`Self::append`].
  pub(crate) fn absorb(&mut self, entries: &[(ContentHash, u32)], base: u64) {
    let mut offset = base;
    for &(hash, size) in entries {
      self.index.insert(hash, IndexEntry { offset, size });
      offset += u64::from(size);
    }
  }

  /// Flushes and closes both files and releases the write-lock token.
  pub(crate) fn close(mut self) {
    let _ = self.data.sync_all();
    let _ = self.meta.sync_all();
    if let Some(lock) = self.lock.as_mut() {
      lock.release();
    }
  }
}

pub(crate) fn data_path_for(root: &Path, name: &str) -> PathBuf {
  root.join(format!("{name}.bin"))
}

pub(crate) fn meta_path_for_data(data_path: &Path) -> PathBuf {
  let mut meta_path = data_path.to_path_buf();
  meta_path.set_extension("bin.meta");
  meta_path
}

pub(crate) fn lock_path_for(data_path: &Path) -> PathBuf {
  let mut name = data_path.as_os_str().to_owned();
  name.push(".lock");
  PathBuf::from(name)
}

/// Best-effort non-blocking acquisition of a bucket's write lock.
///
/// `None` means another tab owns the bucket (or the lock file could not be
/// created); the caller opens in degraded read-only mode. A lock file left
/// by a dead process, or older than `stale_after`, is cleared and taken
/// over.
pub(crate) fn acquire_bucket_lock(lock_path: &Path, stale_after: Duration) -> Option<LockToken> {
  for attempt in 0..2 {
    match OpenOptions::new()
      .write(true)
      .create_new(true)
      .open(lock_path)
    {
      Ok(mut file) => {
        let contents = LockFileContents {
          pid: std::process::id(),
          started_at: now_seconds(),
        };
        if let Ok(serialized) = serde_json::to_vec(&contents) {
          let _ = file.write_all(&serialized);
        }
        return Some(LockToken {
          path: lock_path.to_path_buf(),
          released: false,
        });
      }
      Err(err) if err.kind() == ErrorKind::AlreadyExists => {
        if attempt == 0 && !lock_is_active(lock_path, stale_after) {
          if !clear_lock_file(lock_path) {
            return None;
          }
          continue;
        }
        return None;
      }
      Err(_) => return None,
    }
  }
  None
}

/// Whether a lock file denotes a live owner.
///
/// A missing file is inactive. A file older than `stale_after`, or whose
/// recorded pid is provably dead, is treated as abandoned.
pub(crate) fn lock_is_active(lock_path: &Path, stale_after: Duration) -> bool {
  match fs::metadata(lock_path) {
    Ok(meta) => {
      let meta_age = lock_age_from_metadata(&meta);
      if meta_age.map(|age| age > stale_after).unwrap_or(false) {
        return false;
      }
      let contents = fs::read(lock_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockFileContents>(&bytes).ok());
      if let Some(contents) = contents {
        if let Some(false) = pid_is_alive(contents.pid) {
          return false;
        }
        // On filesystems without usable mtime/ctime, fall back to the
        // timestamp stored in the lock file itself.
        if meta_age.is_none() {
          let lock_age = Duration::from_secs(now_seconds().saturating_sub(contents.started_at));
          if lock_age > stale_after {
            return false;
          }
        }
      }
      true
    }
    Err(err) => err.kind() != ErrorKind::NotFound,
  }
}

pub(crate) fn clear_lock_file(lock_path: &Path) -> bool {
  match fs::remove_file(lock_path) {
    Ok(()) => true,
    Err(err) if err.kind() == ErrorKind::NotFound => true,
    Err(_) => false,
  }
}

fn lock_age_from_metadata(meta: &fs::Metadata) -> Option<Duration> {
  meta
    .modified()
    .or_else(|_| meta.created())
    .ok()
    .and_then(|time| SystemTime::now().duration_since(time).ok())
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> Option<bool> {
  // `kill(0)` is special-cased to signal the current process group.
  if pid == 0 || pid > i32::MAX as u32 {
    return None;
  }

  // SAFETY: signal 0 performs error checking without sending a signal.
  let result = unsafe { libc::kill(pid as i32, 0) };
  if result == 0 {
    return Some(true);
  }
  let err = io::Error::last_os_error();
  match err.raw_os_error() {
    Some(code) if code == libc::ESRCH => Some(false),
    Some(code) if code == libc::EPERM => Some(true),
    _ => None,
  }
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> Option<bool> {
  None
}

fn is_quota_error(err: &io::Error) -> bool {
  if err.kind() == ErrorKind::StorageFull {
    return true;
  }
  #[cfg(unix)]
  if let Some(code) = err.raw_os_error() {
    return code == libc::ENOSPC || code == libc::EDQUOT;
  }
  false
}

pub(crate) fn now_seconds() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  const STALE: Duration = Duration::from_secs(60 * 60);

  fn hash(seed: u8) -> ContentHash {
    ContentHash::from_bytes([seed; HASH_LEN])
  }

  #[test]
  fn fresh_bucket_writes_header_and_holds_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let (bucket, repaired) = Bucket::open(tmp.path(), "geom", STALE).expect("open");
    assert!(bucket.is_writer());
    assert!(!repaired);
    assert_eq!(bucket.entry_count(), 0);

    let meta_len = fs::metadata(tmp.path().join("geom.bin.meta")).unwrap().len();
    assert_eq!(meta_len, META_HEADER_LEN);
    assert!(tmp.path().join("geom.bin.lock").exists());
  }

  #[test]
  fn append_then_reopen_replays_index() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut bucket, _) = Bucket::open(tmp.path(), "geom", STALE).expect("open");

    let blob_a = b"aaaaa".as_slice();
    let blob_b = b"bb".as_slice();
    let mut data = Vec::new();
    data.extend_from_slice(blob_a);
    data.extend_from_slice(blob_b);
    let mut meta = Vec::new();
    for (h, blob) in [(hash(1), blob_a), (hash(2), blob_b)] {
      meta.extend_from_slice(h.as_bytes());
      meta.extend_from_slice(&(blob.len() as u32).to_le_bytes());
    }
    let base = bucket.append(&data, &meta).expect("append");
    bucket.absorb(&[(hash(1), 5), (hash(2), 2)], base);

    assert_eq!(bucket.read_blob(&hash(1)).unwrap().as_deref(), Some(blob_a));
    assert_eq!(bucket.read_blob(&hash(2)).unwrap().as_deref(), Some(blob_b));
    bucket.close();

    let (mut reopened, repaired) = Bucket::open(tmp.path(), "geom", STALE).expect("reopen");
    assert!(!repaired);
    assert_eq!(reopened.entry_count(), 2);
    assert_eq!(
      reopened.read_blob(&hash(2)).unwrap().as_deref(),
      Some(blob_b)
    );
    assert_eq!(reopened.read_blob(&hash(3)).unwrap(), None);
  }

  #[test]
  fn truncated_data_file_resets_bucket_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut bucket, _) = Bucket::open(tmp.path(), "geom", STALE).expect("open");
    let mut meta = Vec::new();
    meta.extend_from_slice(hash(1).as_bytes());
    meta.extend_from_slice(&8u32.to_le_bytes());
    let base = bucket.append(&[9u8; 8], &meta).expect("append");
    bucket.absorb(&[(hash(1), 8)], base);
    bucket.close();

    // Chop the data file so it no longer matches the metadata records.
    let data_path = tmp.path().join("geom.bin");
    let file = OpenOptions::new().write(true).open(&data_path).unwrap();
    file.set_len(3).unwrap();
    drop(file);

    let (reopened, repaired) = Bucket::open(tmp.path(), "geom", STALE).expect("reopen");
    assert!(repaired);
    assert_eq!(reopened.entry_count(), 0);
    assert_eq!(fs::metadata(&data_path).unwrap().len(), 0);
    assert_eq!(
      fs::metadata(tmp.path().join("geom.bin.meta")).unwrap().len(),
      META_HEADER_LEN
    );
  }

  #[test]
  fn ragged_metadata_resets_bucket_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let meta_path = tmp.path().join("geom.bin.meta");
    fs::write(tmp.path().join("geom.bin"), b"xyz").unwrap();
    fs::write(&meta_path, [0u8; (META_HEADER_LEN + 7) as usize]).unwrap();

    let (bucket, repaired) = Bucket::open(tmp.path(), "geom", STALE).expect("open");
    assert!(repaired);
    assert_eq!(bucket.entry_count(), 0);
  }

  #[test]
  fn second_open_is_read_only_while_lock_held() {
    let tmp = tempfile::tempdir().unwrap();
    let (writer, _) = Bucket::open(tmp.path(), "geom", STALE).expect("first open");
    assert!(writer.is_writer());

    let (reader, _) = Bucket::open(tmp.path(), "geom", STALE).expect("second open");
    assert!(!reader.is_writer());

    writer.close();
    let (again, _) = Bucket::open(tmp.path(), "geom", STALE).expect("open after close");
    assert!(again.is_writer(), "lock released exactly once on close");
  }

  #[test]
  fn stale_lock_file_is_taken_over() {
    let tmp = tempfile::tempdir().unwrap();
    let lock_path = tmp.path().join("geom.bin.lock");
    fs::write(&lock_path, r#"{"pid":0,"started_at":0}"#).unwrap();
    assert!(lock_is_active(&lock_path, STALE), "fresh mtime keeps it live");

    // Age the lock past the staleness window, as if its owner was
    // hard-killed hours ago.
    let past = filetime::FileTime::from_unix_time(now_seconds() as i64 - 7200, 0);
    filetime::set_file_mtime(&lock_path, past).unwrap();
    assert!(!lock_is_active(&lock_path, STALE));

    let (bucket, _) = Bucket::open(tmp.path(), "geom", STALE).expect("open");
    assert!(bucket.is_writer(), "stale lock cleared and taken over");
  }

  #[test]
  fn failed_append_rolls_both_files_back() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut bucket, _) = Bucket::open(tmp.path(), "geom", STALE).expect("open");
    let mut meta = Vec::new();
    meta.extend_from_slice(hash(1).as_bytes());
    meta.extend_from_slice(&4u32.to_le_bytes());
    let base = bucket.append(&[1u8; 4], &meta).expect("append");
    bucket.absorb(&[(hash(1), 4)], base);
    let data_len = bucket.data_len;
    let meta_len = bucket.meta_len;

    bucket.fail_appends.set(1);
    let err = bucket.append(&[2u8; 64], &meta).expect_err("forced quota");
    assert!(matches!(err, AppendError::Quota(_)));
    assert_eq!(bucket.data_len, data_len);
    assert_eq!(bucket.meta_len, meta_len);
    assert_eq!(
      bucket.read_blob(&hash(1)).unwrap().as_deref(),
      Some(&[1u8; 4][..])
    );
  }

  #[test]
  fn restore_shadows_earlier_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut bucket, _) = Bucket::open(tmp.path(), "geom", STALE).expect("open");

    for payload in [b"old".as_slice(), b"newer".as_slice()] {
      let mut meta = Vec::new();
      meta.extend_from_slice(hash(7).as_bytes());
      meta.extend_from_slice(&(payload.len() as u32).to_le_bytes());
      let base = bucket.append(payload, &meta).expect("append");
      bucket.absorb(&[(hash(7), payload.len() as u32)], base);
    }

    assert_eq!(
      bucket.read_blob(&hash(7)).unwrap().as_deref(),
      Some(b"newer".as_slice())
    );
    // Old bytes are not reclaimed; the data file holds both copies.
    assert_eq!(bucket.data_len, 8);
    bucket.close();

    let (mut reopened, _) = Bucket::open(tmp.path(), "geom", STALE).expect("reopen");
    assert_eq!(
      reopened.read_blob(&hash(7)).unwrap().as_deref(),
      Some(b"newer".as_slice()),
      "replay keeps the later record"
    );
  }
}
