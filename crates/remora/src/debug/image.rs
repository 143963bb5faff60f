use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::inject::sha256_hex;
use crate::scan::pe::parse_sections;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionReport {
    pub name: String,
    pub file_offset: u64,
    pub size: u64,
    pub virtual_address: u64,
    pub virtual_size: u64,
}

/// Section table and fingerprint of a module file.
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub sections: Vec<SectionReport>,
}

impl ImageReport {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(path.as_ref(), &bytes)
    }

    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Result<Self> {
        let sections = parse_sections(bytes)?
            .into_iter()
            .map(|s| SectionReport {
                name: s.name,
                file_offset: s.file_offset,
                size: s.size,
                virtual_address: s.virtual_address,
                virtual_size: s.virtual_size,
            })
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
            sections,
        })
    }

    pub fn section(&self, name: &str) -> Option<&SectionReport> {
        self.sections.iter().find(|s| s.name == name)
    }
}
