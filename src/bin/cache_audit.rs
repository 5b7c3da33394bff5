//! Audit (and optionally shrink) a geomcache root directory.
//!
//! Lists every bucket's on-disk footprint and last-touch age without
//! opening any bucket, so it is safe to run while viewer tabs are live.
//! Eviction is opt-in and honors bucket locks the same way the library
//! does: buckets open in another process are skipped.

use clap::Parser;
use geomcache::cache::{scan_root, CacheStore};
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Parser)]
#[command(
  name = "cache_audit",
  about = "Audit (and optionally shrink) a geomcache bucket directory"
)]
struct Cli {
  /// Cache root directory to scan (flat; no recursion).
  #[arg(value_name = "PATH")]
  root: PathBuf,

  /// Run an eviction pass targeting this fraction of total bytes (0.0-1.0).
  #[arg(long, value_name = "FRACTION")]
  evict: Option<f64>,

  /// Emit a single JSON object (stable keys) for scripting.
  #[arg(long)]
  json: bool,
}

fn main() -> std::io::Result<()> {
  let cli = Cli::parse();
  let listing = scan_root(&cli.root)?;
  let now = SystemTime::now();

  let mut total_data = 0u64;
  let mut total_meta = 0u64;
  let mut rows = Vec::with_capacity(listing.len());
  for entry in &listing {
    total_data += entry.data_len;
    total_meta += entry.meta_len;
    let age_secs = now
      .duration_since(entry.last_touched)
      .map(|age| age.as_secs())
      .unwrap_or(0);
    rows.push(serde_json::json!({
      "bucket": entry.name,
      "data_bytes": entry.data_len,
      "metadata_bytes": entry.meta_len,
      "age_seconds": age_secs,
    }));
  }

  let evicted = cli.evict.map(|fraction| {
    let mut store = CacheStore::open(&cli.root);
    store.evict(fraction)
  });

  if cli.json {
    let out = serde_json::json!({
      "root": cli.root.display().to_string(),
      "buckets": rows,
      "total_data_bytes": total_data,
      "total_metadata_bytes": total_meta,
      "eviction_target_met": evicted,
    });
    println!(
      "{}",
      serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
    );
    return Ok(());
  }

  println!("Cache audit: {}", cli.root.display());
  println!(
    "Buckets: {} (data={} bytes, metadata={} bytes)",
    listing.len(),
    total_data,
    total_meta
  );
  for entry in &listing {
    let age_secs = now
      .duration_since(entry.last_touched)
      .map(|age| age.as_secs())
      .unwrap_or(0);
    println!(
      "  {:<32} data={:>10}  meta={:>8}  age={}s",
      entry.name, entry.data_len, entry.meta_len, age_secs
    );
  }
  if let Some(met) = evicted {
    println!();
    println!(
      "Eviction pass: target {}",
      if met { "met" } else { "not met" }
    );
  }
  Ok(())
}
