//! geomcache — content-addressed asset retrieval and durable caching for a
//! 3D-model viewer.
//!
//! The crate has three tightly coupled pieces:
//!
//! - [`hash`]: the 20-byte content digest used as the sole cache and
//!   request key;
//! - [`protocol`]: a client that batches hash requests over one persistent
//!   duplex connection and decodes multi-item response frames;
//! - [`cache`]: a durable bucket store persisting blobs keyed by hash,
//!   with corruption recovery, cross-tab write locking, and space-bounded
//!   eviction.
//!
//! The protocol client is the sole source of cache misses, the cache store
//! is the durable home for hits, and both share [`hash::ContentHash`] as
//! their key representation. A cache failure is always equivalent to a
//! miss: callers re-fetch over the protocol, so correctness never depends
//! on the cache.

pub mod cache;
pub mod error;
pub mod hash;
pub mod protocol;

pub use cache::{CacheConfig, CacheCounters, CacheObserver, CacheStats, CacheStore, OpenOutcome};
pub use error::{CacheError, Error, HashError, ProtocolError, Result};
pub use hash::{ContentHash, HASH_LEN};
pub use protocol::{
  ProtocolClient, ReceivedResource, ResourceKind, ResourceSink, Transport, FRAME_MAGIC,
};
