//! Durable bucket cache for content-addressed blobs.
//!
//! A [`CacheStore`] manages named buckets under one lazily-created root
//! directory. Each bucket is two append-only files plus an in-memory index
//! (see [`bucket`]); cross-tab coordination happens solely through
//! per-bucket lock files, so several processes can share one root: the tab
//! holding a bucket's lock writes, everyone else reads a possibly-stale
//! index until they reopen.
//!
//! Failure policy: a cache failure is never fatal to the caller — a failed
//! bucket yields misses, corruption is repaired by resetting the bucket,
//! and quota exhaustion costs at most the batch being stored. Only
//! unexpected I/O during an append, after rollback, surfaces as `Err`.

mod bucket;

use crate::error::{CacheError, Error, Result};
use crate::hash::ContentHash;
use bucket::{AppendError, Bucket};
use rustc_hash::FxHashMap;
use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub(crate) use bucket::{META_HEADER_LEN, META_RECORD_LEN};

/// Age past which a bucket is unconditionally reclaimable (3 months).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Age past which a lock file is presumed abandoned and taken over.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Fraction requested from the eviction pass that runs between a
/// quota-failed append and its single retry.
const QUOTA_RETRY_EVICT_FRACTION: f64 = 0.2;

/// Configuration for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Root directory holding every bucket's files.
  pub root: PathBuf,
  /// Eviction cutoff: buckets untouched for longer are always deleted.
  pub max_age: Duration,
  /// Staleness window for abandoned-lock takeover.
  pub lock_stale_after: Duration,
}

impl CacheConfig {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self {
      root: root.into(),
      max_age: DEFAULT_MAX_AGE,
      lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
    }
  }
}

/// Aggregate on-disk usage, derived by scanning the root directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: u64,
  pub data_bytes: u64,
  pub metadata_bytes: u64,
}

/// How a bucket open resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
  /// This instance holds the write lock; stores and reads both work.
  Ready,
  /// Another tab owns the write lock; reads work off the index loaded at
  /// open time, stores are silent no-ops.
  ReadOnlyDegraded,
  /// The bucket could not be opened. Sticky: every later operation
  /// against this name no-ops.
  Failed(String),
}

impl OpenOutcome {
  pub fn is_ready(&self) -> bool {
    matches!(self, OpenOutcome::Ready)
  }
}

/// External observability collaborator.
///
/// One call per noteworthy event; implementations forward to whatever
/// analytics sink the embedding application uses. The default methods
/// ignore everything.
pub trait CacheObserver {
  fn bucket_open_failed(&self, _bucket: &str, _reason: &str) {}
  fn bucket_repaired(&self, _bucket: &str) {}
  fn quota_exceeded(&self, _bucket: &str, _error: &CacheError) {}
  fn eviction_finished(&self, _freed_bytes: u64, _target_met: bool) {}
}

struct NoopObserver;

impl CacheObserver for NoopObserver {}

/// Event counters, instance-owned so independent stores stay independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
  pub hits: u64,
  pub misses: u64,
  pub corrupt_repairs: u64,
  pub quota_retries: u64,
  pub evicted_buckets: u64,
}

enum BucketSlot {
  Open(Bucket),
  /// Sticky open failure; the reason was reported to the observer once.
  Failed(String),
}

/// One (data, metadata) file pair found in the cache root.
///
/// Produced by [`scan_root`], the single listing query that eviction and
/// stats run against; it never consults any open bucket's in-memory state.
#[derive(Debug, Clone)]
pub struct BucketListing {
  pub name: String,
  pub data_path: PathBuf,
  pub meta_path: PathBuf,
  pub data_len: u64,
  pub meta_len: u64,
  pub last_touched: SystemTime,
}

/// A store batch assembled but not yet durable.
///
/// Phase 1 ([`CacheStore::begin_store`]) partitions and concatenates the
/// input into per-bucket buffers; phase 2 ([`PendingStore::commit`]) does
/// the durable appends. [`CacheStore::store`] runs both back to back;
/// holding the value between the phases lets tests observe the
/// pre-durability state.
#[must_use = "a pending store does nothing until committed"]
pub struct PendingStore {
  batches: Vec<BucketBatch>,
}

struct BucketBatch {
  key: String,
  entries: Vec<(ContentHash, u32)>,
  data: Vec<u8>,
  meta: Vec<u8>,
}

impl PendingStore {
  pub fn is_empty(&self) -> bool {
    self.batches.is_empty()
  }

  /// Appends every assembled batch to its bucket. See
  /// [`CacheStore::store`] for the failure contract.
  pub fn commit(self, store: &mut CacheStore) -> Result<()> {
    store.commit_batches(self.batches)
  }
}

/// Durable cache over one root directory.
pub struct CacheStore {
  config: CacheConfig,
  root_created: bool,
  /// Sticky storage-unavailable reason; set once, fails all buckets.
  root_error: Option<String>,
  buckets: FxHashMap<String, BucketSlot>,
  observer: Box<dyn CacheObserver>,
  counters: CacheCounters,
}

impl CacheStore {
  pub fn new(config: CacheConfig) -> Self {
    Self {
      config,
      root_created: false,
      root_error: None,
      buckets: FxHashMap::default(),
      observer: Box::new(NoopObserver),
      counters: CacheCounters::default(),
    }
  }

  /// Opens a store rooted at `root` with default configuration.
  pub fn open(root: impl Into<PathBuf>) -> Self {
    Self::new(CacheConfig::new(root))
  }

  pub fn with_observer(mut self, observer: Box<dyn CacheObserver>) -> Self {
    self.observer = observer;
    self
  }

  pub fn counters(&self) -> CacheCounters {
    self.counters
  }

  /// Opens (or reports the cached state of) the named bucket.
  pub fn open_outcome(&mut self, bucket_name: &str) -> OpenOutcome {
    let key = sanitize_bucket_name(bucket_name);
    self.ensure_bucket(&key);
    match self.buckets.get(&key) {
      Some(BucketSlot::Open(bucket)) if bucket.is_writer() => OpenOutcome::Ready,
      Some(BucketSlot::Open(_)) => OpenOutcome::ReadOnlyDegraded,
      Some(BucketSlot::Failed(reason)) => OpenOutcome::Failed(reason.clone()),
      None => OpenOutcome::Failed("bucket not tracked".to_string()),
    }
  }

  /// Looks up each (hash, bucket) pair; results align positionally with
  /// the inputs. A failed bucket or absent hash yields `None`; so does a
  /// read error, which is logged — a cache failure is just a miss.
  pub fn get(&mut self, hashes: &[ContentHash], bucket_names: &[&str]) -> Vec<Option<Vec<u8>>> {
    let mut results = Vec::with_capacity(hashes.len());
    for (hash, name) in hashes.iter().zip(bucket_names) {
      let key = sanitize_bucket_name(name);
      self.ensure_bucket(&key);
      let blob = match self.buckets.get_mut(&key) {
        Some(BucketSlot::Open(bucket)) => match bucket.read_blob(hash) {
          Ok(found) => found,
          Err(err) => {
            warn!(bucket = %key, %hash, %err, "read failed, treating as miss");
            None
          }
        },
        _ => None,
      };
      if blob.is_some() {
        self.counters.hits += 1;
      } else {
        self.counters.misses += 1;
      }
      results.push(blob);
    }
    results
  }

  /// Stores each blob under its (hash, bucket) pair: assembles the
  /// per-bucket buffers, then appends them durably.
  ///
  /// Buckets this instance cannot write (degraded or failed) are skipped
  /// silently. A quota-failed append is rolled back, followed by one
  /// eviction pass and one retry, then dropped silently. Any other append
  /// error is rolled back and returned, after the remaining buckets have
  /// been attempted.
  pub fn store(
    &mut self,
    hashes: &[ContentHash],
    bucket_names: &[&str],
    datas: &[&[u8]],
  ) -> Result<()> {
    self.begin_store(hashes, bucket_names, datas).commit(self)
  }

  /// Phase 1 of [`Self::store`]: pure buffer assembly, nothing durable.
  pub fn begin_store(
    &mut self,
    hashes: &[ContentHash],
    bucket_names: &[&str],
    datas: &[&[u8]],
  ) -> PendingStore {
    let mut order: Vec<String> = Vec::new();
    let mut groups: FxHashMap<String, Vec<(ContentHash, &[u8])>> = FxHashMap::default();

    for ((hash, name), data) in hashes.iter().zip(bucket_names).zip(datas) {
      let key = sanitize_bucket_name(name);
      self.ensure_bucket(&key);
      let writable = matches!(
        self.buckets.get(&key),
        Some(BucketSlot::Open(bucket)) if bucket.is_writer()
      );
      if !writable {
        debug!(bucket = %key, %hash, "skipping store for non-writable bucket");
        continue;
      }
      if !groups.contains_key(&key) {
        order.push(key.clone());
      }
      groups.entry(key).or_default().push((*hash, *data));
    }

    let batches = order
      .into_iter()
      .filter_map(|key| {
        let entries = groups.remove(&key)?;
        let (data, meta, sized) = assemble_batch(&entries);
        Some(BucketBatch {
          key,
          entries: sized,
          data,
          meta,
        })
      })
      .collect();
    PendingStore { batches }
  }

  fn commit_batches(&mut self, batches: Vec<BucketBatch>) -> Result<()> {
    let mut first_error: Option<Error> = None;
    for batch in batches {
      if let Err(err) = self.commit_one(&batch) {
        warn!(bucket = %batch.key, %err, "append failed");
        if first_error.is_none() {
          first_error = Some(err);
        }
      }
    }
    match first_error {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn commit_one(&mut self, batch: &BucketBatch) -> Result<()> {
    match self.append_batch(batch) {
      Ok(()) => Ok(()),
      Err(AppendError::Quota(cache_err)) => {
        self.counters.quota_retries += 1;
        self.observer.quota_exceeded(&batch.key, &cache_err);
        debug!(bucket = %batch.key, %cache_err, "quota hit, evicting and retrying once");
        self.evict(QUOTA_RETRY_EVICT_FRACTION);
        match self.append_batch(batch) {
          Ok(()) => Ok(()),
          Err(AppendError::Quota(retry_err)) => {
            // Give up on this batch; previously cached entries are intact.
            debug!(bucket = %batch.key, %retry_err, "quota retry failed, dropping batch");
            Ok(())
          }
          Err(AppendError::Io(err)) => Err(err.into()),
        }
      }
      Err(AppendError::Io(err)) => Err(err.into()),
    }
  }

  fn append_batch(&mut self, batch: &BucketBatch) -> std::result::Result<(), AppendError> {
    // The bucket may have been closed between the phases; that is a skip,
    // not an error.
    let Some(BucketSlot::Open(bucket)) = self.buckets.get_mut(&batch.key) else {
      return Ok(());
    };
    if !bucket.is_writer() {
      return Ok(());
    }
    let base = bucket.append(&batch.data, &batch.meta)?;
    bucket.absorb(&batch.entries, base);
    Ok(())
  }

  /// Frees at least `min_fraction` of the bytes under the root.
  ///
  /// Scans every (data, metadata) pair on disk — including buckets other
  /// tabs have open. Pairs past the age cutoff are deleted
  /// unconditionally; younger pairs are deleted oldest-first until the
  /// target is reached. A pair whose lock is live is skipped (another tab
  /// owns it); other delete failures are logged. Returns whether the
  /// target fraction was freed.
  pub fn evict(&mut self, min_fraction: f64) -> bool {
    let listing = match scan_root(&self.config.root) {
      Ok(listing) => listing,
      Err(err) if err.kind() == ErrorKind::NotFound => return true,
      Err(err) => {
        warn!(root = %self.config.root.display(), %err, "eviction scan failed");
        return false;
      }
    };

    let lock_stale_after = self.config.lock_stale_after;
    let mut removed_buckets = 0u64;
    let (freed, met) = run_eviction(
      listing,
      SystemTime::now(),
      self.config.max_age,
      min_fraction,
      |entry| {
        let lock_path = bucket::lock_path_for(&entry.data_path);
        if bucket::lock_is_active(&lock_path, lock_stale_after) {
          debug!(bucket = %entry.name, "bucket open elsewhere, skipping eviction");
          return false;
        }
        if remove_bucket_files(entry) {
          removed_buckets += 1;
          true
        } else {
          false
        }
      },
    );

    self.counters.evicted_buckets += removed_buckets;
    self.observer.eviction_finished(freed, met);
    met
  }

  /// Flushes and closes every open bucket, releases each write-lock token,
  /// runs a zero-target eviction pass, and clears all bucket state.
  pub fn close(&mut self) {
    for (_, slot) in self.buckets.drain() {
      if let BucketSlot::Open(bucket) = slot {
        bucket.close();
      }
    }
    self.evict(0.0);
  }

  /// [`Self::close`] followed by a full eviction pass.
  pub fn clear(&mut self) {
    self.close();
    self.evict(1.0);
  }

  /// Sums usage across every file under the root, without opening any
  /// bucket. Returns zeroes when the root does not exist yet.
  pub fn stats(&self) -> CacheStats {
    let Ok(listing) = scan_root(&self.config.root) else {
      return CacheStats::default();
    };
    let mut stats = CacheStats::default();
    for entry in listing {
      stats.entries += entry.meta_len.saturating_sub(META_HEADER_LEN) / META_RECORD_LEN;
      stats.data_bytes += entry.data_len;
      stats.metadata_bytes += entry.meta_len;
    }
    stats
  }

  fn ensure_bucket(&mut self, key: &str) {
    if self.buckets.contains_key(key) {
      return;
    }

    if let Err(reason) = self.ensure_root() {
      self.observer.bucket_open_failed(key, &reason);
      self
        .buckets
        .insert(key.to_string(), BucketSlot::Failed(reason));
      return;
    }

    match Bucket::open(&self.config.root, key, self.config.lock_stale_after) {
      Ok((bucket, repaired)) => {
        if repaired {
          self.counters.corrupt_repairs += 1;
          self.observer.bucket_repaired(key);
        }
        debug!(
          bucket = %key,
          entries = bucket.entry_count(),
          writer = bucket.is_writer(),
          "bucket opened"
        );
        self.buckets.insert(key.to_string(), BucketSlot::Open(bucket));
      }
      Err(err) => {
        let reason = err.to_string();
        warn!(bucket = %key, %err, "bucket open failed");
        self.observer.bucket_open_failed(key, &reason);
        self
          .buckets
          .insert(key.to_string(), BucketSlot::Failed(reason));
      }
    }
  }

  fn ensure_root(&mut self) -> std::result::Result<(), String> {
    if let Some(reason) = &self.root_error {
      return Err(reason.clone());
    }
    if self.root_created {
      return Ok(());
    }
    match fs::create_dir_all(&self.config.root) {
      Ok(()) => {
        self.root_created = true;
        Ok(())
      }
      Err(err) => {
        let error = CacheError::StorageUnavailable {
          path: self.config.root.display().to_string(),
          source: err,
        };
        warn!(%error, "cache root unavailable");
        let reason = error.to_string();
        self.root_error = Some(reason.clone());
        Err(reason)
      }
    }
  }

  #[cfg(test)]
  fn test_bucket_mut(&mut self, bucket_name: &str) -> Option<&mut Bucket> {
    let key = sanitize_bucket_name(bucket_name);
    match self.buckets.get_mut(&key) {
      Some(BucketSlot::Open(bucket)) => Some(bucket),
      _ => None,
    }
  }
}

impl Drop for CacheStore {
  fn drop(&mut self) {
    // Locks must not outlive the instance; files close on their own.
    for (_, slot) in self.buckets.drain() {
      if let BucketSlot::Open(bucket) = slot {
        bucket.close();
      }
    }
  }
}

/// Builds one bucket's contiguous data and metadata buffers, in input
/// order. Pure; phase 1 of a store.
fn assemble_batch(
  entries: &[(ContentHash, &[u8])],
) -> (Vec<u8>, Vec<u8>, Vec<(ContentHash, u32)>) {
  let total: usize = entries.iter().map(|(_, blob)| blob.len()).sum();
  let mut data = Vec::with_capacity(total);
  let mut meta = Vec::with_capacity(entries.len() * META_RECORD_LEN as usize);
  let mut sized = Vec::with_capacity(entries.len());

  for (hash, blob) in entries {
    let Ok(size) = u32::try_from(blob.len()) else {
      warn!(%hash, len = blob.len(), "blob exceeds the 4-byte size field, skipping");
      continue;
    };
    data.extend_from_slice(blob);
    meta.extend_from_slice(hash.as_bytes());
    meta.extend_from_slice(&size.to_le_bytes());
    sized.push((*hash, size));
  }
  (data, meta, sized)
}

/// Lists every (data, metadata) pair under `root` with sizes and
/// last-touch times.
pub fn scan_root(root: &Path) -> io::Result<Vec<BucketListing>> {
  let mut listing = Vec::new();
  for entry in fs::read_dir(root)? {
    let Ok(entry) = entry else { continue };
    let data_path = entry.path();
    if data_path.extension().and_then(|e| e.to_str()) != Some("bin") {
      continue;
    }
    let Some(name) = data_path
      .file_stem()
      .and_then(|s| s.to_str())
      .map(str::to_string)
    else {
      continue;
    };
    let Ok(data_meta) = entry.metadata() else {
      continue;
    };
    let meta_path = bucket::meta_path_for_data(&data_path);
    let meta_len = fs::metadata(&meta_path).map(|m| m.len()).unwrap_or(0);
    let last_touched = read_touch_time(&meta_path)
      .or_else(|| fs::metadata(&meta_path).and_then(|m| m.modified()).ok())
      .or_else(|| data_meta.modified().ok())
      .unwrap_or(UNIX_EPOCH);
    listing.push(BucketListing {
      name,
      data_path,
      meta_path,
      data_len: data_meta.len(),
      meta_len,
      last_touched,
    });
  }
  Ok(listing)
}

/// Reads the touch timestamp out of a metadata file's header.
fn read_touch_time(meta_path: &Path) -> Option<SystemTime> {
  let mut header = [0u8; META_HEADER_LEN as usize];
  let mut file = fs::File::open(meta_path).ok()?;
  file.read_exact(&mut header).ok()?;
  let secs = u32::from_le_bytes(header);
  if secs == 0 {
    return None;
  }
  UNIX_EPOCH.checked_add(Duration::from_secs(u64::from(secs)))
}

/// Core eviction walk, separated from the filesystem so it can run against
/// a fake listing.
///
/// `remove` performs (or refuses) the actual deletion of one pair and
/// reports success. Returns (bytes freed, target met).
fn run_eviction<F: FnMut(&BucketListing) -> bool>(
  mut listing: Vec<BucketListing>,
  now: SystemTime,
  max_age: Duration,
  min_fraction: f64,
  mut remove: F,
) -> (u64, bool) {
  let total: u64 = listing.iter().map(|e| e.data_len + e.meta_len).sum();
  let target = (total as f64 * min_fraction.clamp(0.0, 1.0)).ceil() as u64;
  let cutoff = now.checked_sub(max_age);

  // stored_at has second resolution, so ties get a deterministic order.
  listing.sort_by(|a, b| {
    a.last_touched
      .cmp(&b.last_touched)
      .then_with(|| a.name.cmp(&b.name))
  });

  let mut freed = 0u64;
  for entry in &listing {
    let over_age = cutoff
      .map(|cutoff| entry.last_touched < cutoff)
      .unwrap_or(false);
    // Entries are oldest-first: once the target is met and the age cutoff
    // no longer applies, nothing further qualifies.
    if !over_age && freed >= target {
      break;
    }
    if remove(entry) {
      freed += entry.data_len + entry.meta_len;
    }
  }
  (freed, freed >= target)
}

/// Deletes one bucket's files; true when both are gone.
fn remove_bucket_files(entry: &BucketListing) -> bool {
  let mut ok = true;
  for path in [&entry.data_path, &entry.meta_path] {
    match fs::remove_file(path) {
      Ok(()) => {}
      Err(err) if err.kind() == ErrorKind::NotFound => {}
      Err(err) => {
        warn!(path = %path.display(), %err, "failed to delete cache file");
        ok = false;
      }
    }
  }
  if ok {
    // A leftover lock file from a dead owner goes with the bucket.
    let _ = fs::remove_file(bucket::lock_path_for(&entry.data_path));
  }
  ok
}

/// Maps a caller-supplied bucket name onto the safe filename alphabet.
///
/// Forbidden path characters become underscores; names that sanitize to
/// nothing (or to dots) collapse to a single underscore.
pub fn sanitize_bucket_name(name: &str) -> String {
  let sanitized: String = name
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c == '.' || c == '_' || c == '-' {
        c
      } else {
        '_'
      }
    })
    .collect();
  if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
    return "_".to_string();
  }
  sanitized
}
