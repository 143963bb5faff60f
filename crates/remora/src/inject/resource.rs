use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Supplies the bytes of modules to inject.
pub trait ResourceLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Cow<'_, [u8]>>;
}

impl<T: ResourceLoader + ?Sized> ResourceLoader for std::sync::Arc<T> {
    fn load(&self, name: &str) -> Result<Cow<'_, [u8]>> {
        (**self).load(name)
    }
}

fn missing(name: &str) -> Error {
    Error::Injection(format!("Resource '{name}' not found"))
}

/// Resources compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedResources {
    entries: HashMap<String, &'static [u8]>,
}

impl EmbeddedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, bytes: &'static [u8]) -> Self {
        self.entries.insert(name.to_string(), bytes);
        self
    }
}

impl ResourceLoader for EmbeddedResources {
    fn load(&self, name: &str) -> Result<Cow<'_, [u8]>> {
        self.entries
            .get(name)
            .map(|bytes| Cow::Borrowed(*bytes))
            .ok_or_else(|| missing(name))
    }
}

/// Resources read from files in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceLoader for DirectoryResources {
    fn load(&self, name: &str) -> Result<Cow<'_, [u8]>> {
        let path = self.root.join(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Cow::Owned(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing(name)),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn file_matches_hash(path: &Path, expected: &str) -> bool {
    fs::read(path)
        .map(|bytes| sha256_hex(&bytes) == expected)
        .unwrap_or(false)
}

fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (file_name, ""),
    }
}

const RANDOM_LEN: usize = 8;

/// Matches the `<stem>.<random><suffix>` names written by [`extract_resource`].
fn is_extracted_name(name: &str, prefix: &str, suffix: &str) -> bool {
    name.len() == prefix.len() + RANDOM_LEN + suffix.len()
        && name.starts_with(prefix)
        && name.ends_with(suffix)
        && name.as_bytes()[prefix.len()..prefix.len() + RANDOM_LEN]
            .iter()
            .all(u8::is_ascii_alphanumeric)
}

/// Write `bytes` into `dir` as `<stem>.<random>.<ext>`, or reuse an earlier
/// extraction with identical content.
pub fn extract_resource(bytes: &[u8], dir: &Path, file_name: &str) -> Result<PathBuf> {
    let hash = sha256_hex(bytes);
    let (stem, ext) = split_name(file_name);
    let prefix = format!("{stem}.");
    let suffix = if ext.is_empty() {
        String::new()
    } else {
        format!(".{ext}")
    };

    for entry in fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_extracted_name(&name, &prefix, &suffix) && file_matches_hash(&entry.path(), &hash) {
            info!("{} matches existing file {}. Reusing.", file_name, name);
            return Ok(entry.path());
        }
    }

    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(&suffix)
        .rand_bytes(RANDOM_LEN)
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;

    debug!("extracted {} ({} bytes, sha256 {})", path.display(), bytes.len(), hash);
    info!("Extracted resource file: {}", path.display());
    Ok(path)
}
