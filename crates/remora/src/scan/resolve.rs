use std::collections::HashMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::ipc::AddressResolver;

use super::registry::{SignatureEntry, SignatureKind, SignatureRegistry};
use super::scanner::{ResolvedAddress, SignatureScanner};
use super::signature::Signature;

/// Outcome of resolving a signature registry against one module.
#[derive(Debug, Default)]
pub struct ResolvedAddresses {
    resolved: HashMap<String, ResolvedAddress>,
    failed: HashMap<String, Error>,
}

impl ResolvedAddresses {
    pub fn get(&self, key: &str) -> Option<u64> {
        self.resolved.get(key).map(|r| r.address)
    }

    pub fn entry(&self, key: &str) -> Option<&ResolvedAddress> {
        self.resolved.get(key)
    }

    /// Address for `key`, or the failure recorded when it was resolved.
    pub fn require(&self, key: &str) -> Result<u64> {
        if let Some(address) = self.get(key) {
            return Ok(address);
        }
        Err(match self.failed.get(key) {
            Some(e) => replay(e),
            None => Error::ScanNotFound {
                signature: format!("{key} (not in registry)"),
            },
        })
    }

    pub fn failure(&self, key: &str) -> Option<&Error> {
        self.failed.get(key)
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Resolved entries sorted by key.
    pub fn addresses(&self) -> Vec<(&str, ResolvedAddress)> {
        let mut entries: Vec<_> = self
            .resolved
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn to_report(&self) -> ResolveReport {
        let mut failed: Vec<_> = self
            .failed
            .iter()
            .map(|(k, e)| (k.clone(), e.to_string()))
            .collect();
        failed.sort();
        ResolveReport {
            resolved: self
                .addresses()
                .into_iter()
                .map(|(k, r)| (k.to_string(), r))
                .collect(),
            failed,
        }
    }
}

impl AddressResolver for ResolvedAddresses {
    fn resolve(&self, key: &str) -> Result<u64> {
        self.require(key)
    }
}

/// Serializable summary for tooling output.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveReport {
    pub resolved: Vec<(String, ResolvedAddress)>,
    pub failed: Vec<(String, String)>,
}

/// Resolve every registry entry in parallel. Failures are logged and
/// recorded; the batch always completes.
pub fn resolve_all(scanner: &SignatureScanner, registry: &SignatureRegistry) -> ResolvedAddresses {
    let results: Vec<(String, Result<ResolvedAddress>)> = registry
        .entries
        .par_iter()
        .map(|entry| (entry.key.clone(), resolve_entry(scanner, entry)))
        .collect();

    let mut addresses = ResolvedAddresses::default();
    for (key, result) in results {
        match result {
            Ok(resolved) => {
                addresses.resolved.insert(key, resolved);
            }
            Err(e) => {
                error!(
                    "Failed to resolve signature '{}': {}. \
                     (Have you tried restarting the target process?)",
                    key, e
                );
                addresses.failed.insert(key, e);
            }
        }
    }

    info!(
        "Resolved {} of {} signatures",
        addresses.resolved_count(),
        registry.len()
    );
    addresses
}

pub fn resolve_entry(
    scanner: &SignatureScanner,
    entry: &SignatureEntry,
) -> Result<ResolvedAddress> {
    let compiled: Signature = entry.pattern.parse()?;
    match entry.kind {
        SignatureKind::Text => scanner
            .resolve_text(&compiled, &entry.pattern)
            .map(|r| ResolvedAddress {
                address: r.address.wrapping_add_signed(entry.offset),
                ..r
            }),
        SignatureKind::Data => scanner
            .resolve_data(&compiled, &entry.pattern)
            .map(|r| ResolvedAddress {
                address: r.address.wrapping_add_signed(entry.offset),
                ..r
            }),
        SignatureKind::Static => scanner.resolve_static(&compiled, &entry.pattern, entry.offset),
    }
}

/// Rebuild a recorded scan failure for a later caller.
fn replay(e: &Error) -> Error {
    match e {
        Error::ScanNotFound { signature } => Error::ScanNotFound {
            signature: signature.clone(),
        },
        Error::ScanConflict { signature, target } => Error::ScanConflict {
            signature: signature.clone(),
            target: *target,
        },
        Error::InvalidPattern(message) => Error::InvalidPattern(message.clone()),
        Error::MemoryAccess {
            address,
            code,
            message,
        } => Error::memory(*address, *code, message.clone()),
        other => Error::ScanNotFound {
            signature: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::pe::test_image::TestImage;
    use crate::scan::scanner::AddressKind;

    const BASE: u64 = 0x1_4000_0000;

    fn scanner() -> SignatureScanner {
        let mut text = vec![0xCCu8; 0x200];
        // mov rax, [rip+0x1000]
        text[0x20..0x27].copy_from_slice(&[0x48, 0x8B, 0x05, 0x00, 0x10, 0x00, 0x00]);
        // call .text+0x100
        text[0x40] = 0xE8;
        text[0x41..0x45].copy_from_slice(&(0x100i32 - 0x45).to_le_bytes());
        text[0x100..0x104].copy_from_slice(&[0x40, 0x53, 0x48, 0x83]);

        let mut data = vec![0u8; 0x40];
        data[0x10..0x14].copy_from_slice(&[0xFE, 0xED, 0xFA, 0xCE]);

        let image = TestImage::new()
            .text(0x200, 0x1000, text)
            .data(0x400, 0x3000, data)
            .build();
        SignatureScanner::from_image(image, BASE).unwrap()
    }

    fn registry() -> SignatureRegistry {
        let mut registry = SignatureRegistry::new();
        registry.insert(SignatureEntry::new("tick", "E8 ?? ?? ?? ?? CC", SignatureKind::Text));
        registry.insert(
            SignatureEntry::new("prologue", "40 53 48 83", SignatureKind::Text).with_offset(2),
        );
        registry.insert(SignatureEntry::new("magic", "FE ED FA CE", SignatureKind::Data));
        registry.insert(SignatureEntry::new("global", "48 8B 05", SignatureKind::Static));
        registry.insert(SignatureEntry::new("gone", "0F 0B 0F 0B", SignatureKind::Text));
        registry
    }

    #[test]
    fn test_resolve_all_continues_past_failures() {
        let resolved = resolve_all(&scanner(), &registry());

        assert_eq!(resolved.resolved_count(), 4);
        assert_eq!(resolved.failed_count(), 1);

        let tick = resolved.entry("tick").unwrap();
        assert_eq!(tick.kind, AddressKind::Trampoline);
        assert_eq!(tick.address, BASE + 0x1100);

        assert_eq!(resolved.get("prologue"), Some(BASE + 0x1102));
        assert_eq!(resolved.get("magic"), Some(BASE + 0x3010));

        let global = resolved.entry("global").unwrap();
        assert_eq!(global.kind, AddressKind::StaticOperand);
        assert_eq!(global.address, BASE + 0x1020 + 7 + 0x1000);
    }

    #[test]
    fn test_require_replays_failure() {
        let resolved = resolve_all(&scanner(), &registry());

        match resolved.require("gone") {
            Err(Error::ScanNotFound { signature }) => assert_eq!(signature, "0F 0B 0F 0B"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(resolved.require("unknown").is_err());
        assert!(resolved.failure("gone").is_some());
        assert_eq!(resolved.resolve("magic").unwrap(), BASE + 0x3010);
    }

    #[test]
    fn test_report_is_sorted() {
        let report = resolve_all(&scanner(), &registry()).to_report();
        let keys: Vec<_> = report.resolved.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["global", "magic", "prologue", "tick"]);
        assert_eq!(report.failed.len(), 1);
        assert!(serde_json::to_string(&report).unwrap().contains("Trampoline"));
    }
}
