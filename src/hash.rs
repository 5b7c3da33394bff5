//! 20-byte content hash keys.
//!
//! Every blob in the system is addressed by the 20-byte digest of its
//! contents. The digest is opaque to this crate: equality is byte equality,
//! and the raw fixed-width array is used directly as the key of the bucket
//! index and the in-flight request table. Hex encoding exists for logs and
//! the audit CLI only; it never appears on the wire or on disk.

use crate::error::HashError;
use std::fmt;
use std::str::FromStr;

/// Width of a content hash in bytes.
pub const HASH_LEN: usize = 20;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// A 20-byte content digest identifying one immutable blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
  /// Wraps a raw 20-byte digest.
  pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
    Self(bytes)
  }

  /// Reads a hash from a byte slice that must be exactly [`HASH_LEN`] long.
  pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
    let bytes: [u8; HASH_LEN] = slice.try_into().map_err(|_| HashError::InvalidLength {
      len: slice.len(),
      expected: HASH_LEN,
    })?;
    Ok(Self(bytes))
  }

  /// The raw digest bytes.
  pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
    &self.0
  }

  /// Copies the digest into `dest` starting at `offset`.
  ///
  /// Used by the outbound frame builder and the metadata record encoder,
  /// which assemble fixed-layout buffers. `dest` must have at least
  /// [`HASH_LEN`] bytes available at `offset`.
  pub fn write_to(&self, dest: &mut [u8], offset: usize) {
    dest[offset..offset + HASH_LEN].copy_from_slice(&self.0);
  }

  /// Lowercase hex rendering, for logs and tooling.
  pub fn to_hex(&self) -> String {
    let mut out = String::with_capacity(HASH_LEN * 2);
    for &b in self.0.iter() {
      out.push(HEX[(b >> 4) as usize] as char);
      out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
  }
}

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ContentHash({})", self.to_hex())
  }
}

impl FromStr for ContentHash {
  type Err = HashError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() != HASH_LEN * 2 {
      return Err(HashError::InvalidLength {
        len: s.len(),
        expected: HASH_LEN * 2,
      });
    }
    let mut bytes = [0u8; HASH_LEN];
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
      let hi = hex_nibble(chunk[0]).ok_or(HashError::InvalidHex { position: i * 2 })?;
      let lo = hex_nibble(chunk[1]).ok_or(HashError::InvalidHex { position: i * 2 + 1 })?;
      bytes[i] = (hi << 4) | lo;
    }
    Ok(Self(bytes))
  }
}

fn hex_nibble(c: u8) -> Option<u8> {
  match c {
    b'0'..=b'9' => Some(c - b'0'),
    b'a'..=b'f' => Some(c - b'a' + 10),
    b'A'..=b'F' => Some(c - b'A' + 10),
    _ => None,
  }
}
