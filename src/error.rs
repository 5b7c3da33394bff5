//! Error types for geomcache
//!
//! This module provides error types for both halves of the crate:
//! - Protocol errors (malformed inbound frames)
//! - Cache errors (storage, corruption, quota)
//!
//! All errors use the `thiserror` crate for minimal boilerplate and
//! proper error trait implementations.
//!
//! Most cache-side failures are *not* surfaced as `Err`: corruption is
//! auto-repaired, quota exhaustion triggers one evict-and-retry cycle and
//! then drops the batch, and a failed bucket degrades every later operation
//! on that bucket into a miss. Only unexpected I/O during an append, after
//! rollback, reaches the caller.

use thiserror::Error;

/// Result type alias for geomcache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for geomcache.
///
/// Each variant wraps a more specific error type for that subsystem.
#[derive(Error, Debug)]
pub enum Error {
  /// Inbound frame could not be decoded
  #[error("Protocol error: {0}")]
  Protocol(#[from] ProtocolError),

  /// Cache storage error
  #[error("Cache error: {0}")]
  Cache(#[from] CacheError),

  /// Content hash construction error
  #[error("Hash error: {0}")]
  Hash(#[from] HashError),

  /// I/O error (file handles, transport writes)
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// Errors that occur while decoding an inbound binary frame.
///
/// A frame that fails to decode is dropped without touching the in-flight
/// request table; the peer will not see an acknowledgement and the affected
/// hashes stay pending.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
  /// First four bytes did not match the frame signature
  #[error("Bad frame magic {found:?}, expected {expected:?}")]
  BadMagic { found: [u8; 4], expected: [u8; 4] },

  /// Frame ended before the announced header/offset table/item data
  #[error("Truncated frame: need {needed} bytes, have {available}")]
  Truncated { needed: usize, available: usize },

  /// Item offset table points outside the item blob or runs backwards
  #[error("Invalid item offset {offset} at index {index} ({blob_len}-byte item blob)")]
  BadOffsets {
    index: usize,
    offset: u32,
    blob_len: usize,
  },

  /// Item too small to carry its leading content hash
  #[error("Item {index} is {len} bytes, shorter than a content hash")]
  ItemTooShort { index: usize, len: usize },
}

/// Errors that occur in the durable bucket store.
#[derive(Error, Debug)]
pub enum CacheError {
  /// The cache root directory could not be created or opened.
  ///
  /// Every bucket permanently fails to open once this is hit.
  #[error("Cache root '{path}' unavailable: {source}")]
  StorageUnavailable {
    path: String,
    #[source]
    source: std::io::Error,
  },

  /// A bucket's files could not be created or opened
  #[error("Bucket '{bucket}' failed to open: {reason}")]
  BucketOpenFailed { bucket: String, reason: String },

  /// On-disk sizes disagreed with the metadata records
  #[error("Bucket '{bucket}' corrupt: {detail}")]
  Corrupt { bucket: String, detail: String },

  /// The platform rejected an append for lack of space
  #[error("Quota exceeded appending {requested} bytes to bucket '{bucket}'")]
  QuotaExceeded { bucket: String, requested: usize },

  /// The platform wrote a different byte count than requested
  #[error("Partial write to bucket '{bucket}': {written} of {requested} bytes")]
  PartialWrite {
    bucket: String,
    written: usize,
    requested: usize,
  },
}

/// Errors constructing a [`crate::hash::ContentHash`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HashError {
  /// Byte slice was not exactly the hash width
  #[error("Invalid hash length {len}, expected {expected}")]
  InvalidLength { len: usize, expected: usize },

  /// Hex string was malformed
  #[error("Invalid hash hex at position {position}")]
  InvalidHex { position: usize },
}
