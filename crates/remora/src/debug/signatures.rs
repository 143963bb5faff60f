use serde::Serialize;

use crate::error::Error;
use crate::scan::{SignatureKind, SignatureRegistry, SignatureScanner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignatureStatus {
    Unique { address: u64 },
    /// More than one `.text` match; the scanner takes the first
    Ambiguous { addresses: Vec<u64> },
    NotFound,
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SignatureCheck {
    pub key: String,
    pub pattern: String,
    pub kind: SignatureKind,
    #[serde(flatten)]
    pub status: SignatureStatus,
}

impl SignatureCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self.status, SignatureStatus::Unique { .. })
    }
}

/// Count raw matches for every registry entry, sorted by key.
///
/// `Text` and `Static` entries report every `.text` match so that patterns
/// too short to be unique stand out. `Data` entries report the first match.
pub fn check_signatures(
    scanner: &SignatureScanner,
    registry: &SignatureRegistry,
) -> Vec<SignatureCheck> {
    let mut checks: Vec<SignatureCheck> = registry
        .iter()
        .map(|entry| {
            let status = match entry.kind {
                SignatureKind::Data => match scanner.scan_data(&entry.pattern) {
                    Ok(address) => SignatureStatus::Unique { address },
                    Err(e) => failure(e),
                },
                SignatureKind::Text | SignatureKind::Static => {
                    match scanner.scan_text_all(&entry.pattern) {
                        Ok(addresses) => match addresses.as_slice() {
                            [] => SignatureStatus::NotFound,
                            [address] => SignatureStatus::Unique { address: *address },
                            _ => SignatureStatus::Ambiguous { addresses },
                        },
                        Err(e) => failure(e),
                    }
                }
            };
            SignatureCheck {
                key: entry.key.clone(),
                pattern: entry.pattern.clone(),
                kind: entry.kind,
                status,
            }
        })
        .collect();
    checks.sort_by(|a, b| a.key.cmp(&b.key));
    checks
}

fn failure(e: Error) -> SignatureStatus {
    match e {
        Error::ScanNotFound { .. } => SignatureStatus::NotFound,
        other => SignatureStatus::Invalid {
            reason: other.to_string(),
        },
    }
}
