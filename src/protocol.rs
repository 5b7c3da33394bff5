//! Binary streaming protocol client.
//!
//! This module multiplexes many outstanding hash-keyed resource requests
//! over one persistent duplex byte stream. The library stays agnostic about
//! the actual socket: the embedding application provides a [`Transport`]
//! for outbound messages and feeds inbound frames to
//! [`ProtocolClient::handle_frame`], which delivers decoded resources
//! through a [`ResourceSink`].
//!
//! Wire shapes:
//!
//! - outbound resource frame: `[1-byte kind tag][20-byte hash]*`, one frame
//!   per (account, kind) batch, preceded by a text control message naming
//!   the account whenever it changes;
//! - inbound frame: `OPK1` magic, a little-endian word whose low byte is
//!   the ASCII kind tag, an item count, an offset table, then the items
//!   concatenated. Each item is a 20-byte hash followed by its payload.

use crate::error::ProtocolError;
use crate::hash::{ContentHash, HASH_LEN};
use rustc_hash::FxHashMap;
use std::io;
use tracing::{debug, warn};
use url::Url;

/// Four-byte signature opening every inbound frame.
pub const FRAME_MAGIC: [u8; 4] = *b"OPK1";

/// Fixed inbound header: magic, kind word, item count.
const FRAME_HEADER_LEN: usize = 12;

/// Byte count of the 4-byte status code prefixing an error item's message.
const ERROR_STATUS_LEN: usize = 4;

/// One-byte ASCII tag naming a resource type on the wire.
///
/// The set of tags is defined by the viewer, not by this crate, so the type
/// admits any byte; the known tags are provided as constants.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind(pub u8);

impl ResourceKind {
  /// Geometry blobs.
  pub const GEOMETRY: ResourceKind = ResourceKind(b'g');
  /// Material blobs.
  pub const MATERIAL: ResourceKind = ResourceKind(b'm');
  /// Server-reported per-hash failures.
  pub const ERROR: ResourceKind = ResourceKind(b'e');

  /// The raw tag byte.
  pub fn tag(self) -> u8 {
    self.0
  }
}

impl std::fmt::Debug for ResourceKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.0.is_ascii_graphic() {
      write!(f, "ResourceKind('{}')", self.0 as char)
    } else {
      write!(f, "ResourceKind(0x{:02x})", self.0)
    }
  }
}

/// Outbound half of the duplex connection.
///
/// Implemented by the embedding application over whatever socket it holds
/// (WebSocket, TCP, an in-memory pair in tests).
pub trait Transport {
  /// Sends one binary frame.
  fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;

  /// Sends one out-of-band text control message.
  fn send_control(&mut self, message: &str) -> io::Result<()>;
}

/// Receiver for decoded inbound traffic.
pub trait ResourceSink {
  /// Called once per decoded resource frame, items in frame order.
  fn resources_received(&mut self, resources: Vec<ReceivedResource>, kind: ResourceKind);

  /// Called once per failed hash (server-reported or link failure).
  fn resource_failed(&mut self, hash: ContentHash, kind: ResourceKind, message: &str);
}

/// One decoded (hash, payload) pair delivered to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedResource {
  pub hash: ContentHash,
  /// Lineage identifier recorded when the hash was requested. `None` when
  /// the delivery had no matching in-flight request (duplicate or late);
  /// callers tolerate the missing correlation.
  pub lineage_id: Option<String>,
  pub payload: Vec<u8>,
}

/// A decoded inbound frame, before in-flight correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
  pub kind: ResourceKind,
  pub items: Vec<(ContentHash, Vec<u8>)>,
}

/// Bookkeeping linking a sent hash request to its origin metadata.
#[derive(Debug, Clone)]
struct InflightRequest {
  origin: String,
  lineage_id: String,
  kind: ResourceKind,
  query: Option<String>,
}

/// Hashes queued for one (account, kind) pair, flushed as one frame.
#[derive(Debug)]
struct PendingBatch {
  account: String,
  kind: ResourceKind,
  hashes: Vec<ContentHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
  /// Connection not yet announced open; requests queue locally.
  Connecting,
  Open,
  /// Terminal. Requests are dropped; in-flight entries were failed.
  Failed,
}

/// Protocol client over one persistent duplex connection.
pub struct ProtocolClient<T: Transport> {
  transport: T,
  state: LinkState,
  pending: Vec<PendingBatch>,
  pending_hashes: usize,
  inflight: FxHashMap<ContentHash, InflightRequest>,
  announced_account: Option<String>,
}

impl<T: Transport> ProtocolClient<T> {
  pub fn new(transport: T) -> Self {
    Self {
      transport,
      state: LinkState::Connecting,
      pending: Vec::new(),
      pending_hashes: 0,
      inflight: FxHashMap::default(),
      announced_account: None,
    }
  }

  /// Marks the link open and flushes anything queued while connecting.
  pub fn link_opened(&mut self) -> io::Result<()> {
    if self.state == LinkState::Failed {
      return Ok(());
    }
    self.state = LinkState::Open;
    self.flush()
  }

  /// Enters the terminal error state, failing every in-flight request.
  ///
  /// Later [`Self::request_resource`] calls log and no-op.
  pub fn fail_link(&mut self, reason: &str, sink: &mut dyn ResourceSink) {
    if self.state == LinkState::Failed {
      return;
    }
    warn!(reason, "resource link failed");
    self.state = LinkState::Failed;
    self.pending.clear();
    self.pending_hashes = 0;
    for (hash, request) in self.inflight.drain() {
      sink.resource_failed(hash, request.kind, reason);
    }
  }

  pub fn is_failed(&self) -> bool {
    self.state == LinkState::Failed
  }

  /// Number of hashes queued but not yet flushed.
  pub fn pending_len(&self) -> usize {
    self.pending_hashes
  }

  /// Number of requests sent (or queued) and not yet answered.
  pub fn inflight_len(&self) -> usize {
    self.inflight.len()
  }

  /// Queues a request for `hash` and sends it when the link allows.
  ///
  /// The account identifier is parsed out of `url`; requests batch per
  /// (account, kind). Returns immediately; delivery happens through the
  /// sink passed to [`Self::handle_frame`]. On a failed link this logs and
  /// does nothing.
  pub fn request_resource(
    &mut self,
    url: &str,
    lineage_id: &str,
    hash: ContentHash,
    kind: ResourceKind,
    query: Option<&str>,
  ) -> io::Result<()> {
    if self.state == LinkState::Failed {
      debug!(%hash, "dropping resource request on failed link");
      return Ok(());
    }

    let account = account_from_url(url);
    self.inflight.insert(
      hash,
      InflightRequest {
        origin: url.to_string(),
        lineage_id: lineage_id.to_string(),
        kind,
        query: query.map(str::to_string),
      },
    );

    match self
      .pending
      .iter_mut()
      .find(|batch| batch.account == account && batch.kind == kind)
    {
      Some(batch) => batch.hashes.push(hash),
      None => self.pending.push(PendingBatch {
        account,
        kind,
        hashes: vec![hash],
      }),
    }
    self.pending_hashes += 1;

    if self.state == LinkState::Open {
      self.flush()?;
    }
    Ok(())
  }

  /// Sends every queued batch and clears the queue.
  ///
  /// For each account with pending sends, a control message announcing the
  /// account precedes its frames whenever the active account changed; then
  /// each (account, kind) batch goes out as one
  /// `[tag][hash]*` frame in queue order.
  pub fn flush(&mut self) -> io::Result<()> {
    if self.state != LinkState::Open || self.pending.is_empty() {
      return Ok(());
    }

    let batches = std::mem::take(&mut self.pending);
    self.pending_hashes = 0;

    // Group per account (first-seen order) so each account is announced at
    // most once per flush, with all its frames together.
    let mut accounts: Vec<&str> = Vec::new();
    for batch in &batches {
      if !accounts.contains(&batch.account.as_str()) {
        accounts.push(&batch.account);
      }
    }

    for account in accounts {
      if self.announced_account.as_deref() != Some(account) {
        self.transport.send_control(account)?;
        self.announced_account = Some(account.to_string());
      }

      for batch in batches.iter().filter(|batch| batch.account == account) {
        let mut frame = vec![0u8; 1 + batch.hashes.len() * HASH_LEN];
        frame[0] = batch.kind.tag();
        for (i, hash) in batch.hashes.iter().enumerate() {
          hash.write_to(&mut frame, 1 + i * HASH_LEN);
        }
        self.transport.send_frame(&frame)?;
      }
    }
    Ok(())
  }

  /// Decodes one inbound frame and delivers its items to `sink`.
  ///
  /// A frame that fails to decode is dropped (logged) without altering any
  /// in-flight state. Error items fail their matching request; resource
  /// items are delivered in frame order, with `lineage_id: None` for
  /// deliveries that no longer match an in-flight entry.
  pub fn handle_frame(&mut self, bytes: &[u8], sink: &mut dyn ResourceSink) {
    let frame = match decode_frame(bytes) {
      Ok(frame) => frame,
      Err(err) => {
        warn!(%err, len = bytes.len(), "dropping undecodable frame");
        return;
      }
    };

    if frame.kind == ResourceKind::ERROR {
      for (hash, payload) in frame.items {
        // First four bytes are a status-like code the client ignores.
        let message = String::from_utf8_lossy(
          payload.get(ERROR_STATUS_LEN..).unwrap_or_default(),
        )
        .into_owned();
        match self.inflight.remove(&hash) {
          Some(request) => sink.resource_failed(hash, request.kind, &message),
          None => debug!(%hash, "error for unknown hash, nothing in flight"),
        }
      }
      return;
    }

    let mut resources = Vec::with_capacity(frame.items.len());
    for (hash, payload) in frame.items {
      let lineage_id = match self.inflight.remove(&hash) {
        Some(request) => Some(request.lineage_id),
        None => {
          debug!(%hash, "delivery without matching in-flight request");
          None
        }
      };
      resources.push(ReceivedResource {
        hash,
        lineage_id,
        payload,
      });
    }
    sink.resources_received(resources, frame.kind);
  }

  /// Shared access to the underlying transport.
  pub fn transport_ref(&self) -> &T {
    &self.transport
  }

  /// Origin URL and query recorded for an in-flight hash, if any.
  pub fn inflight_origin(&self, hash: &ContentHash) -> Option<(&str, Option<&str>)> {
    self
      .inflight
      .get(hash)
      .map(|request| (request.origin.as_str(), request.query.as_deref()))
  }
}

/// Extracts the account identifier from a request URL.
///
/// Viewer URLs have the form `https://host/<account>/...`; the first
/// non-empty path segment is the batching key. Unparseable URLs fall back
/// to a single shared batch.
fn account_from_url(url: &str) -> String {
  Url::parse(url)
    .ok()
    .and_then(|parsed| {
      parsed
        .path_segments()
        .and_then(|mut segments| segments.find(|segment| !segment.is_empty()))
        .map(str::to_string)
    })
    .unwrap_or_default()
}

/// Decodes one inbound binary frame.
///
/// Layout: bytes 0-3 magic, 4-7 little-endian word whose low byte is the
/// kind tag, 8-11 little-endian item count N, then N little-endian u32
/// offsets into the trailing item blob, then the items concatenated. Item i
/// spans `[offset[i], offset[i+1])`; the last item runs to the end of the
/// buffer. Each item starts with its 20-byte hash.
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame, ProtocolError> {
  if bytes.len() < FRAME_HEADER_LEN {
    return Err(ProtocolError::Truncated {
      needed: FRAME_HEADER_LEN,
      available: bytes.len(),
    });
  }

  let magic: [u8; 4] = bytes[0..4].try_into().unwrap();
  if magic != FRAME_MAGIC {
    return Err(ProtocolError::BadMagic {
      found: magic,
      expected: FRAME_MAGIC,
    });
  }

  let kind_word = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
  let kind = ResourceKind((kind_word & 0xff) as u8);
  let count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;

  let items_base = count
    .checked_mul(4)
    .and_then(|table| table.checked_add(FRAME_HEADER_LEN))
    .ok_or(ProtocolError::Truncated {
      needed: usize::MAX,
      available: bytes.len(),
    })?;
  if bytes.len() < items_base {
    return Err(ProtocolError::Truncated {
      needed: items_base,
      available: bytes.len(),
    });
  }

  let blob = &bytes[items_base..];
  let mut offsets = Vec::with_capacity(count);
  for i in 0..count {
    let at = FRAME_HEADER_LEN + i * 4;
    offsets.push(u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()));
  }

  let mut items = Vec::with_capacity(count);
  for (i, &offset) in offsets.iter().enumerate() {
    let start = offset as usize;
    let end = offsets
      .get(i + 1)
      .map(|&next| next as usize)
      .unwrap_or(blob.len());
    if start > end || end > blob.len() {
      return Err(ProtocolError::BadOffsets {
        index: i,
        offset,
        blob_len: blob.len(),
      });
    }
    let item = &blob[start..end];
    if item.len() < HASH_LEN {
      return Err(ProtocolError::ItemTooShort {
        index: i,
        len: item.len(),
      });
    }
    let hash = ContentHash::from_slice(&item[..HASH_LEN]).expect("slice is HASH_LEN");
    items.push((hash, item[HASH_LEN..].to_vec()));
  }

  Ok(DecodedFrame { kind, items })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Default)]
  struct RecordingTransport {
    frames: Vec<Vec<u8>>,
    controls: Vec<String>,
  }

  impl Transport for RecordingTransport {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
      self.frames.push(frame.to_vec());
      Ok(())
    }

    fn send_control(&mut self, message: &str) -> io::Result<()> {
      self.controls.push(message.to_string());
      Ok(())
    }
  }

  #[derive(Default)]
  struct RecordingSink {
    received: Vec<(ReceivedResource, ResourceKind)>,
    failed: Vec<(ContentHash, ResourceKind, String)>,
  }

  impl ResourceSink for RecordingSink {
    fn resources_received(&mut self, resources: Vec<ReceivedResource>, kind: ResourceKind) {
      for resource in resources {
        self.received.push((resource, kind));
      }
    }

    fn resource_failed(&mut self, hash: ContentHash, kind: ResourceKind, message: &str) {
      self.failed.push((hash, kind, message.to_string()));
    }
  }

  fn hash(seed: u8) -> ContentHash {
    let mut bytes = [0u8; HASH_LEN];
    for (i, b) in bytes.iter_mut().enumerate() {
      *b = seed.wrapping_mul(7).wrapping_add(i as u8);
    }
    ContentHash::from_bytes(bytes)
  }

  fn build_frame(kind: ResourceKind, items: &[(ContentHash, &[u8])]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&u32::from(kind.tag()).to_le_bytes());
    frame.extend_from_slice(&(items.len() as u32).to_le_bytes());
    let mut offset = 0u32;
    for (_, payload) in items {
      frame.extend_from_slice(&offset.to_le_bytes());
      offset += (HASH_LEN + payload.len()) as u32;
    }
    for (item_hash, payload) in items {
      frame.extend_from_slice(item_hash.as_bytes());
      frame.extend_from_slice(payload);
    }
    frame
  }

  #[test]
  fn decode_two_item_frame() {
    let payload_a = [0xaau8; 24];
    let payload_b = [0xbbu8; 7];
    let frame = build_frame(
      ResourceKind::GEOMETRY,
      &[(hash(1), &payload_a), (hash(2), &payload_b)],
    );

    let decoded = decode_frame(&frame).expect("valid frame");
    assert_eq!(decoded.kind, ResourceKind::GEOMETRY);
    assert_eq!(decoded.items.len(), 2);
    assert_eq!(decoded.items[0], (hash(1), payload_a.to_vec()));
    assert_eq!(decoded.items[1], (hash(2), payload_b.to_vec()));
  }

  #[test]
  fn decode_rejects_bad_magic() {
    let mut frame = build_frame(ResourceKind::GEOMETRY, &[(hash(1), b"x")]);
    frame[0] = b'X';
    assert!(matches!(
      decode_frame(&frame),
      Err(ProtocolError::BadMagic { .. })
    ));
  }

  #[test]
  fn decode_rejects_truncated_header() {
    assert_eq!(
      decode_frame(b"OPK1"),
      Err(ProtocolError::Truncated {
        needed: FRAME_HEADER_LEN,
        available: 4,
      })
    );
  }

  #[test]
  fn decode_rejects_offset_table_past_end() {
    let mut frame = Vec::new();
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&u32::from(b'g').to_le_bytes());
    frame.extend_from_slice(&3u32.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes()); // only one of three offsets
    assert!(matches!(
      decode_frame(&frame),
      Err(ProtocolError::Truncated { .. })
    ));
  }

  #[test]
  fn decode_rejects_backwards_offsets() {
    let payload = [0u8; 4];
    let mut frame = build_frame(
      ResourceKind::GEOMETRY,
      &[(hash(1), &payload), (hash(2), &payload)],
    );
    // Second offset points before the first.
    let second_offset_at = FRAME_HEADER_LEN + 4;
    frame[second_offset_at..second_offset_at + 4].copy_from_slice(&2u32.to_le_bytes());
    frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 4].copy_from_slice(&10u32.to_le_bytes());
    assert!(matches!(
      decode_frame(&frame),
      Err(ProtocolError::BadOffsets { .. })
    ));
  }

  #[test]
  fn decode_rejects_item_shorter_than_hash() {
    let mut frame = Vec::new();
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&u32::from(b'g').to_le_bytes());
    frame.extend_from_slice(&1u32.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(&[0u8; 10]);
    assert_eq!(
      decode_frame(&frame),
      Err(ProtocolError::ItemTooShort { index: 0, len: 10 })
    );
  }

  #[test]
  fn requests_batch_per_account_and_kind() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    client
      .request_resource(
        "https://viewer.example/acct1/models/1",
        "lin-1",
        hash(1),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();
    client
      .request_resource(
        "https://viewer.example/acct1/models/2",
        "lin-2",
        hash(2),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();
    client
      .request_resource(
        "https://viewer.example/acct1/models/2",
        "lin-2",
        hash(3),
        ResourceKind::MATERIAL,
        Some("lod=2"),
      )
      .unwrap();
    assert_eq!(client.pending_len(), 3);

    client.link_opened().unwrap();
    assert_eq!(client.pending_len(), 0);

    let transport = &client.transport;
    assert_eq!(transport.controls, vec!["acct1".to_string()]);
    assert_eq!(transport.frames.len(), 2);

    let geometry = &transport.frames[0];
    assert_eq!(geometry[0], b'g');
    assert_eq!(geometry.len(), 1 + 2 * HASH_LEN);
    assert_eq!(&geometry[1..1 + HASH_LEN], hash(1).as_bytes());
    assert_eq!(&geometry[1 + HASH_LEN..], hash(2).as_bytes());

    let material = &transport.frames[1];
    assert_eq!(material[0], b'm');
    assert_eq!(&material[1..], hash(3).as_bytes());
  }

  #[test]
  fn account_change_reannounces() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    client.link_opened().unwrap();
    client
      .request_resource(
        "https://viewer.example/acct1/a",
        "lin",
        hash(1),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();
    client
      .request_resource(
        "https://viewer.example/acct2/b",
        "lin",
        hash(2),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();
    // Same account again: no third announcement.
    client
      .request_resource(
        "https://viewer.example/acct2/c",
        "lin",
        hash(3),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();
    assert_eq!(
      client.transport.controls,
      vec!["acct1".to_string(), "acct2".to_string()]
    );
  }

  #[test]
  fn open_link_flushes_immediately() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    client.link_opened().unwrap();
    client
      .request_resource(
        "https://viewer.example/acct/m",
        "lin",
        hash(4),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();
    assert_eq!(client.pending_len(), 0);
    assert_eq!(client.transport.frames.len(), 1);
    assert_eq!(client.inflight_len(), 1);
  }

  #[test]
  fn delivery_matches_inflight_and_removes_it() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    let mut sink = RecordingSink::default();
    client.link_opened().unwrap();
    for (h, lineage) in [(hash(1), "lin-a"), (hash(2), "lin-b")] {
      client
        .request_resource(
          "https://viewer.example/acct/m",
          lineage,
          h,
          ResourceKind::GEOMETRY,
          None,
        )
        .unwrap();
    }

    let payload_a = [1u8; 24];
    let payload_b = [2u8; 24];
    let frame = build_frame(
      ResourceKind::GEOMETRY,
      &[(hash(1), &payload_a), (hash(2), &payload_b)],
    );
    client.handle_frame(&frame, &mut sink);

    assert_eq!(sink.received.len(), 2);
    assert_eq!(sink.received[0].0.lineage_id.as_deref(), Some("lin-a"));
    assert_eq!(sink.received[0].0.payload, payload_a.to_vec());
    assert_eq!(sink.received[1].0.lineage_id.as_deref(), Some("lin-b"));
    assert_eq!(client.inflight_len(), 0);
  }

  #[test]
  fn bad_magic_frame_leaves_inflight_untouched() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    let mut sink = RecordingSink::default();
    client.link_opened().unwrap();
    client
      .request_resource(
        "https://viewer.example/acct/m",
        "lin",
        hash(1),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();

    let mut frame = build_frame(ResourceKind::GEOMETRY, &[(hash(1), &[0u8; 4])]);
    frame[..4].copy_from_slice(b"NOPE");
    client.handle_frame(&frame, &mut sink);

    assert!(sink.received.is_empty());
    assert!(sink.failed.is_empty());
    assert_eq!(client.inflight_len(), 1);
  }

  #[test]
  fn error_frame_fails_matching_request() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    let mut sink = RecordingSink::default();
    client.link_opened().unwrap();
    client
      .request_resource(
        "https://viewer.example/acct/m",
        "lin",
        hash(9),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();

    let mut payload = 404u32.to_le_bytes().to_vec();
    payload.extend_from_slice(b"not found");
    let frame = build_frame(ResourceKind::ERROR, &[(hash(9), &payload)]);
    client.handle_frame(&frame, &mut sink);

    assert_eq!(sink.failed.len(), 1);
    let (failed_hash, failed_kind, message) = &sink.failed[0];
    assert_eq!(*failed_hash, hash(9));
    assert_eq!(*failed_kind, ResourceKind::GEOMETRY);
    assert_eq!(message, "not found");
    assert_eq!(client.inflight_len(), 0);
  }

  #[test]
  fn unmatched_delivery_arrives_without_lineage() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    let mut sink = RecordingSink::default();
    client.link_opened().unwrap();

    let frame = build_frame(ResourceKind::GEOMETRY, &[(hash(5), &[7u8; 3])]);
    client.handle_frame(&frame, &mut sink);

    assert_eq!(sink.received.len(), 1);
    assert_eq!(sink.received[0].0.lineage_id, None);
    assert_eq!(sink.received[0].0.payload, vec![7u8; 3]);
  }

  #[test]
  fn failed_link_drops_requests_and_fails_inflight() {
    let mut client = ProtocolClient::new(RecordingTransport::default());
    let mut sink = RecordingSink::default();
    client.link_opened().unwrap();
    client
      .request_resource(
        "https://viewer.example/acct/m",
        "lin",
        hash(1),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();

    client.fail_link("socket closed", &mut sink);
    assert_eq!(sink.failed.len(), 1);
    assert_eq!(sink.failed[0].2, "socket closed");

    client
      .request_resource(
        "https://viewer.example/acct/m",
        "lin",
        hash(2),
        ResourceKind::GEOMETRY,
        None,
      )
      .unwrap();
    assert_eq!(client.inflight_len(), 0);
    assert_eq!(client.pending_len(), 0);
    assert_eq!(client.transport.frames.len(), 1, "no frame after failure");
  }

  #[test]
  fn account_parsing_takes_first_path_segment() {
    assert_eq!(account_from_url("https://h.example/acct7/x/y"), "acct7");
    assert_eq!(account_from_url("https://h.example/"), "");
    assert_eq!(account_from_url("not a url"), "");
  }
}
