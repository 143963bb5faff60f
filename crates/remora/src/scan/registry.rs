use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

use super::signature::parse_pattern;

/// Which scan resolves an entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SignatureKind {
    /// `scan_text`, following a CALL/JMP at the match
    #[default]
    Text,
    Data,
    /// `static_address` at the match plus `offset`
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub key: String,
    pub pattern: String,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub kind: SignatureKind,
}

impl SignatureEntry {
    pub fn new<K: Into<String>, P: Into<String>>(key: K, pattern: P, kind: SignatureKind) -> Self {
        Self {
            key: key.into(),
            pattern: pattern.into(),
            offset: 0,
            kind,
        }
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Stable key to signature table, loaded once per attach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRegistry {
    #[serde(default)]
    pub version: String,
    pub entries: Vec<SignatureEntry>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, key: &str) -> Option<&SignatureEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    /// Add an entry, replacing any existing one with the same key.
    pub fn insert(&mut self, entry: SignatureEntry) {
        match self.entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignatureEntry> {
        self.entries.iter()
    }

    /// Check every pattern parses and keys are unique.
    pub fn validate(&self) -> Result<()> {
        for (index, entry) in self.entries.iter().enumerate() {
            parse_pattern(&entry.pattern)
                .map_err(|e| Error::InvalidPattern(format!("{}: {}", entry.key, e)))?;
            if self.entries[..index].iter().any(|e| e.key == entry.key) {
                return Err(Error::InvalidPattern(format!(
                    "duplicate signature key '{}'",
                    entry.key
                )));
            }
        }
        Ok(())
    }
}

pub fn load_signatures<P: AsRef<Path>>(path: P) -> Result<SignatureRegistry> {
    let content = fs::read_to_string(&path)?;
    let registry: SignatureRegistry = serde_json::from_str(&content)?;
    registry.validate()?;
    Ok(registry)
}

pub fn save_signatures<P: AsRef<Path>>(path: P, registry: &SignatureRegistry) -> Result<()> {
    let content = serde_json::to_string_pretty(registry)?;
    fs::write(path, content)?;
    Ok(())
}
