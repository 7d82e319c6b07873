//! Hashing System - SHA-256 for Inputs and Manifests
//!
//! Provides deterministic, reproducible hashes so a run can be traced back
//! to the exact spec, template, logos and branding that produced it.

use sha2::{Sha256, Digest};
use serde::Serialize;
use serde_json::{Value, to_string};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => {
            Value::Array(arr.iter().map(sort_value).collect())
        }
        _ => v.clone()
    }
}

/// Compute manifest hash for a run record
pub fn compute_manifest_hash<T: Serialize>(manifest: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(manifest)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Compute the reproducibility hash of one composition.
///
/// input_hash = sha256(spec_hash : template_hash : asset_hash,... : branding_hash : engine_version)
///
/// Asset hashes are taken in the order given; callers pass them in
/// first-reference order so the hash follows the diagram, not a map.
pub fn compute_input_hash(
    spec_hash: &str,
    template_hash: &str,
    asset_hashes: &[&str],
    branding: Option<&str>,
    engine_version: &str,
) -> String {
    let branding_hash = branding
        .map(|b| sha256_hex(b.as_bytes()))
        .unwrap_or_default();
    let combined = format!(
        "{}:{}:{}:{}:{}",
        spec_hash,
        template_hash,
        asset_hashes.join(","),
        branding_hash,
        engine_version
    );
    sha256_hex(combined.as_bytes())
}
