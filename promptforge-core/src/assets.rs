//! Logo Asset Registry - The Only Owner of File Names
//!
//! Everything downstream sees `{name, description, bytes, hash}`. File names
//! and stems stay private to this module; they are used for exactly two
//! things: `AssetError` diagnostics and `scan_for_leaks`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::AssetError;
use crate::hashing::sha256_hex;

pub const MAX_ASSET_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_CATALOG_FILE: &str = "catalog.json";

/// Shorter stems would match ordinary words in a prompt, so such files
/// are rejected and every loaded stem is scanned.
pub const MIN_STEM_LEN: usize = 3;

/// Description used when the catalog has none. Never derived from a file name.
pub const FALLBACK_DESCRIPTION: &str = "uncatalogued reference logo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            _ => None,
        }
    }

    /// Detect the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            _ => None,
        }
    }
}

/// Read pixel dimensions from a PNG or JPEG header.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    match ImageFormat::sniff(bytes)? {
        ImageFormat::Png => {
            if bytes.len() < 24 || &bytes[12..16] != b"IHDR" {
                return None;
            }
            let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
            let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
            Some((width, height))
        }
        ImageFormat::Jpeg => jpeg_dimensions(bytes),
    }
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == 0xFF {
            i += 1;
        }
        let marker = *bytes.get(i)?;
        i += 1;
        // Markers without a length field.
        if marker == 0x01 || (0xD0..=0xD9).contains(&marker) {
            continue;
        }
        let len = u16::from_be_bytes([*bytes.get(i)?, *bytes.get(i + 1)?]) as usize;
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let height = u16::from_be_bytes([*bytes.get(i + 3)?, *bytes.get(i + 4)?]);
            let width = u16::from_be_bytes([*bytes.get(i + 5)?, *bytes.get(i + 6)?]);
            return Some((width as u32, height as u32));
        }
        if len < 2 {
            return None;
        }
        i += len;
    }
    None
}

/// Loading options. Aliases map a file name to an explicit logo name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetOptions {
    pub max_bytes: u64,
    pub catalog_file: String,
    pub aliases: BTreeMap<String, String>,
    pub strip_suffixes: Vec<String>,
}

impl Default for AssetOptions {
    fn default() -> Self {
        Self {
            max_bytes: MAX_ASSET_BYTES,
            catalog_file: DEFAULT_CATALOG_FILE.to_string(),
            aliases: BTreeMap::new(),
            strip_suffixes: default_strip_suffixes(),
        }
    }
}

pub fn default_strip_suffixes() -> Vec<String> {
    ["_logo", "-logo", "_icon", "-icon"].iter().map(|s| s.to_string()).collect()
}

/// Hand-authored descriptions and aliases kept next to the logos.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssetCatalog {
    #[serde(default)]
    pub descriptions: BTreeMap<String, String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl AssetCatalog {
    pub fn load(path: &Path) -> Result<Self, AssetError> {
        let content = fs::read_to_string(path).map_err(|e| AssetError::Catalog {
            file: display_name(path),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| AssetError::Catalog {
            file: display_name(path),
            reason: e.to_string(),
        })
    }
}

/// A logo as seen by the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoAsset {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub hash: String,
    pub format: ImageFormat,
    pub size: u64,
    pub description: String,
    /// False when `description` is the neutral fallback.
    pub catalogued: bool,
}

/// Serializable view of an asset, safe to print.
#[derive(Debug, Clone, Serialize)]
pub struct AssetSummary {
    pub name: String,
    pub hash: String,
    pub format: ImageFormat,
    pub size: u64,
    pub description: String,
    pub dimensions: Option<[u32; 2]>,
}

#[derive(Debug, Clone)]
struct SourceIdentity {
    file_name: String,
    stem: String,
}

#[derive(Debug, Clone)]
pub struct AssetRegistry {
    assets: BTreeMap<String, LogoAsset>,
    sources: BTreeMap<String, SourceIdentity>,
    aggregate_hash: String,
}

impl AssetRegistry {
    /// Load every logo in a directory, plus its optional catalog file.
    pub fn load_dir(dir: &Path, options: &AssetOptions) -> Result<Self, AssetError> {
        let entries = fs::read_dir(dir).map_err(|e| AssetError::Directory {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut files = vec![];
        for entry in entries {
            let entry = entry.map_err(|e| AssetError::Directory {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() || name.starts_with('.') || name == options.catalog_file {
                continue;
            }
            files.push(path);
        }
        files.sort();

        let catalog_path = dir.join(&options.catalog_file);
        let catalog = if catalog_path.is_file() {
            AssetCatalog::load(&catalog_path)?
        } else {
            AssetCatalog::default()
        };

        Self::build(&files, &catalog, options)
    }

    /// Build a registry from an explicit list of logo files.
    pub fn from_files(
        files: &[PathBuf],
        catalog: &AssetCatalog,
        options: &AssetOptions,
    ) -> Result<Self, AssetError> {
        Self::build(files, catalog, options)
    }

    fn build(
        files: &[PathBuf],
        catalog: &AssetCatalog,
        options: &AssetOptions,
    ) -> Result<Self, AssetError> {
        let mut loaded: BTreeMap<String, (SourceIdentity, Arc<[u8]>, ImageFormat)> =
            BTreeMap::new();

        for path in files {
            let file_name = display_name(path);
            let (bytes, format) = read_validated(path, &file_name, options.max_bytes)?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| file_name.clone());
            if stem.trim().chars().count() < MIN_STEM_LEN {
                return Err(AssetError::StemTooShort { file: file_name, min: MIN_STEM_LEN });
            }

            let name = options
                .aliases
                .get(&file_name)
                .or_else(|| catalog.aliases.get(&file_name))
                .cloned()
                .unwrap_or_else(|| normalize_name(&stem, &options.strip_suffixes));

            if let Some((existing, _, _)) = loaded.get(&name) {
                return Err(AssetError::NameCollision {
                    name,
                    first: existing.file_name.clone(),
                    second: file_name,
                });
            }
            loaded.insert(name, (SourceIdentity { file_name, stem }, bytes.into(), format));
        }

        let mut assets = BTreeMap::new();
        let mut sources = BTreeMap::new();
        let mut seen_hashes: HashMap<String, String> = HashMap::new();

        for (name, (source, bytes, format)) in loaded {
            let hash = sha256_hex(&bytes);
            if let Some(other) = seen_hashes.get(&hash) {
                debug!(asset = name.as_str(), duplicate_of = other.as_str(); "Identical logo content");
            } else {
                seen_hashes.insert(hash.clone(), name.clone());
            }

            let (description, catalogued) = match catalog.descriptions.get(&name) {
                Some(d) if !d.trim().is_empty() => (d.trim().to_string(), true),
                _ => {
                    warn!(asset = name.as_str(); "No catalogued description, using neutral fallback");
                    (FALLBACK_DESCRIPTION.to_string(), false)
                }
            };

            assets.insert(
                name.clone(),
                LogoAsset {
                    name: name.clone(),
                    size: bytes.len() as u64,
                    bytes,
                    hash,
                    format,
                    description,
                    catalogued,
                },
            );
            sources.insert(name, source);
        }

        let aggregate_hash = aggregate_hash(&assets);
        debug!(count = assets.len(), aggregate = aggregate_hash.as_str(); "Asset registry loaded");

        Ok(Self { assets, sources, aggregate_hash })
    }

    pub fn get(&self, name: &str) -> Option<&LogoAsset> {
        self.assets.get(name)
    }

    /// Catalogued description for a logo name. Never derived from a file name.
    pub fn describe(&self, name: &str) -> Option<&str> {
        self.assets.get(name).map(|a| a.description.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.assets.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.assets.keys().map(String::as_str)
    }

    pub fn assets(&self) -> impl Iterator<Item = &LogoAsset> {
        self.assets.values()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Hash over every (name, content hash, description) in name order.
    pub fn aggregate_hash(&self) -> &str {
        &self.aggregate_hash
    }

    /// Names of logos whose file name or stem appears in `text`,
    /// compared case-insensitively. Includes logos the caller never referenced.
    pub fn scan_for_leaks(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        self.sources
            .iter()
            .filter(|(_, source)| {
                let file_name = source.file_name.to_lowercase();
                let stem = source.stem.to_lowercase();
                haystack.contains(&file_name) || haystack.contains(&stem)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<AssetSummary> {
        self.assets
            .values()
            .map(|a| AssetSummary {
                name: a.name.clone(),
                hash: a.hash.clone(),
                format: a.format,
                size: a.size,
                description: a.description.clone(),
                dimensions: image_dimensions(&a.bytes).map(|(w, h)| [w, h]),
            })
            .collect()
    }
}

fn read_validated(
    path: &Path,
    file_name: &str,
    max_bytes: u64,
) -> Result<(Vec<u8>, ImageFormat), AssetError> {
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ImageFormat::from_extension)
        .ok_or_else(|| AssetError::UnsupportedFormat { file: file_name.to_string() })?;

    let unreadable = |e: std::io::Error| AssetError::Unreadable {
        file: file_name.to_string(),
        reason: e.to_string(),
    };
    let size = fs::metadata(path).map_err(unreadable)?.len();
    if size > max_bytes {
        return Err(AssetError::TooLarge { file: file_name.to_string(), size, limit: max_bytes });
    }

    let bytes = fs::read(path).map_err(unreadable)?;
    if ImageFormat::sniff(&bytes) != Some(format) {
        return Err(AssetError::FormatMismatch { file: file_name.to_string() });
    }
    Ok((bytes, format))
}

/// Lowercase the stem and drop the first matching known suffix.
pub fn normalize_name(stem: &str, strip_suffixes: &[String]) -> String {
    let lower = stem.trim().to_lowercase();
    for suffix in strip_suffixes {
        let suffix = suffix.to_lowercase();
        if lower.len() > suffix.len() && lower.ends_with(&suffix) {
            return lower[..lower.len() - suffix.len()].to_string();
        }
    }
    lower
}

fn aggregate_hash(assets: &BTreeMap<String, LogoAsset>) -> String {
    let mut buf = String::new();
    for asset in assets.values() {
        buf.push_str(&asset.name);
        buf.push('\0');
        buf.push_str(&asset.hash);
        buf.push('\0');
        buf.push_str(&asset.description);
        buf.push('\n');
    }
    sha256_hex(buf.as_bytes())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Directory-keyed registry cache. Entries are replaced only when the
/// directory's aggregate hash no longer matches.
#[derive(Debug, Default)]
pub struct AssetCache {
    options: AssetOptions,
    entries: RwLock<HashMap<PathBuf, Arc<AssetRegistry>>>,
}

impl AssetCache {
    pub fn new(options: AssetOptions) -> Self {
        Self { options, entries: RwLock::new(HashMap::new()) }
    }

    pub fn load(&self, dir: &Path) -> Result<Arc<AssetRegistry>, AssetError> {
        let fresh = AssetRegistry::load_dir(dir, &self.options)?;
        let key = dir.to_path_buf();

        let cached = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(cached) = cached {
            if cached.aggregate_hash() == fresh.aggregate_hash() {
                debug!(aggregate = cached.aggregate_hash(); "Asset cache hit");
                return Ok(cached);
            }
            debug!(aggregate = fresh.aggregate_hash(); "Asset directory changed, replacing cache entry");
        }

        let registry = Arc::new(fresh);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&registry));
        Ok(registry)
    }

    pub fn invalidate(&self, dir: &Path) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dir)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Minimal PNG header with the given dimensions, padded to `len` bytes.
    pub fn png_bytes(width: u32, height: u32, len: usize) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        if bytes.len() < len {
            bytes.resize(len, 0);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::png_bytes;
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_name_normalization() {
        let suffixes = default_strip_suffixes();
        assert_eq!(normalize_name("Databricks_Logo", &suffixes), "databricks");
        assert_eq!(normalize_name("snowflake-icon", &suffixes), "snowflake");
        assert_eq!(normalize_name("DBX", &suffixes), "dbx");
        assert_eq!(normalize_name("_logo", &suffixes), "_logo");
    }

    #[test]
    fn test_load_dir_with_catalog() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "dbx.png", &png_bytes(64, 32, 64));
        write(
            dir.path(),
            DEFAULT_CATALOG_FILE,
            br#"{"descriptions": {"dbx": "red layered brick icon"}}"#,
        );

        let registry = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.describe("dbx"), Some("red layered brick icon"));
        let asset = registry.get("dbx").unwrap();
        assert_eq!(asset.format, ImageFormat::Png);
        assert_eq!(asset.size, 64);
        assert_eq!(registry.summaries()[0].dimensions, Some([64, 32]));
    }

    #[test]
    fn test_alias_overrides_normalized_name() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "vendor_mark_2024.png", &png_bytes(1, 1, 32));
        let mut options = AssetOptions::default();
        options.aliases.insert("vendor_mark_2024.png".to_string(), "acme".to_string());

        let registry = AssetRegistry::load_dir(dir.path(), &options).unwrap();
        assert!(registry.contains("acme"));
        assert!(!registry.contains("vendor_mark_2024"));
    }

    #[test]
    fn test_oversized_asset_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "big.png", &png_bytes(1, 1, 6 * 1024 * 1024));
        let err = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap_err();
        match err {
            AssetError::TooLarge { file, limit, .. } => {
                assert_eq!(file, "big.png");
                assert_eq!(limit, MAX_ASSET_BYTES);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsupported_and_mismatched_formats() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "mark.gif", b"GIF89a");
        let err = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap_err();
        assert!(matches!(err, AssetError::UnsupportedFormat { ref file } if file == "mark.gif"));

        let dir = TempDir::new().unwrap();
        write(dir.path(), "fake.jpg", &png_bytes(1, 1, 32));
        let err = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap_err();
        assert!(matches!(err, AssetError::FormatMismatch { .. }));
    }

    #[test]
    fn test_name_collision_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "acme.png", &png_bytes(1, 1, 32));
        write(dir.path(), "acme_logo.png", &png_bytes(2, 2, 32));
        let err = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap_err();
        assert!(matches!(err, AssetError::NameCollision { ref name, .. } if name == "acme"));
    }

    #[test]
    fn test_same_bytes_same_hash() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "one.png", &png_bytes(8, 8, 128));
        let a = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap();
        let b = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap();
        assert_eq!(a.get("one").unwrap().hash, b.get("one").unwrap().hash);
        assert_eq!(a.aggregate_hash(), b.aggregate_hash());
    }

    #[test]
    fn test_scan_for_leaks_names_asset_not_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Snowflake_Logo.png", &png_bytes(1, 1, 32));
        write(dir.path(), "dbx.png", &png_bytes(1, 1, 32));
        let registry = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap();

        assert_eq!(registry.scan_for_leaks("render snowflake_logo here"), vec!["snowflake"]);
        assert!(registry.scan_for_leaks("a lab about nothing").is_empty());
        assert_eq!(registry.scan_for_leaks("see DBX.PNG"), vec!["dbx"]);
        assert_eq!(registry.scan_for_leaks("the Dbx cluster"), vec!["dbx"]);
    }

    #[test]
    fn test_short_stem_rejected() {
        for file in ["ai.png", "x.jpg"] {
            let dir = TempDir::new().unwrap();
            let bytes = if file.ends_with(".png") {
                png_bytes(1, 1, 32)
            } else {
                vec![0xFF, 0xD8, 0xFF, 0xD9]
            };
            write(dir.path(), file, &bytes);
            let err = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap_err();
            assert!(
                matches!(err, AssetError::StemTooShort { file: ref f, min: MIN_STEM_LEN } if f == file),
                "{file} should be rejected, got {err:?}"
            );
            assert!(err.to_string().contains("rename"));
        }

        // An alias does not help: the file name itself is what could leak.
        let dir = TempDir::new().unwrap();
        write(dir.path(), "ai.png", &png_bytes(1, 1, 32));
        let mut options = AssetOptions::default();
        options.aliases.insert("ai.png".to_string(), "spark".to_string());
        assert!(AssetRegistry::load_dir(dir.path(), &options).is_err());
    }

    #[test]
    fn test_missing_description_falls_back_to_neutral_text() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "zeta_mark.png", &png_bytes(1, 1, 32));
        let registry = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap();
        let description = registry.describe("zeta_mark").unwrap();
        assert!(!description.contains("zeta"));
        assert_eq!(description, FALLBACK_DESCRIPTION);
        assert!(!registry.get("zeta_mark").unwrap().catalogued);
    }

    #[test]
    fn test_jpeg_dimensions() {
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00];
        jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08, 0x01, 0xE0, 0x02, 0x80]);
        assert_eq!(image_dimensions(&jpeg), Some((640, 480)));
    }

    #[test]
    fn test_cache_reuses_until_directory_changes() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "one.png", &png_bytes(1, 1, 32));
        let cache = AssetCache::new(AssetOptions::default());

        let first = cache.load(dir.path()).unwrap();
        let second = cache.load(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        write(dir.path(), "two.png", &png_bytes(2, 2, 32));
        let third = cache.load(dir.path()).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 2);
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate(dir.path()));
        assert!(cache.is_empty());
    }
}
