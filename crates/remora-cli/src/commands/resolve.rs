//! Resolve command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use owo_colors::OwoColorize;
use remora::{
    SignatureCheck, SignatureScanner, SignatureStatus, check_signatures, load_signatures,
    resolve_all,
};

use super::hex_utils::parse_hex_address;

/// Run the resolve command
pub fn run(
    image: &Path,
    signatures: Option<&Path>,
    base: &str,
    check: bool,
    json: bool,
) -> Result<()> {
    let Some(signatures) = signatures else {
        bail!("No signature file given (use --signatures or set session.signatures in the config)");
    };
    let registry = load_signatures(signatures)?;
    registry.validate()?;
    let scanner = SignatureScanner::open(image, parse_hex_address(base)?)?;

    if check {
        let checks = check_signatures(&scanner, &registry);
        if json {
            println!("{}", serde_json::to_string_pretty(&checks)?);
        } else {
            for check in &checks {
                println!("{}", describe(check));
            }
        }
        let failing = checks.iter().filter(|c| !c.is_ok()).count();
        if failing > 0 {
            bail!("{} of {} signatures are not unique", failing, checks.len());
        }
        return Ok(());
    }

    let resolved = resolve_all(&scanner, &registry);
    let report = resolved.to_report();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (key, address) in &report.resolved {
        println!(
            "{} {:<32} 0x{:X} ({:?})",
            "OK  ".green(),
            key,
            address.address,
            address.kind
        );
    }
    for (key, reason) in &report.failed {
        println!("{} {:<32} {}", "FAIL".red(), key, reason);
    }
    println!();
    println!(
        "{} resolved, {} failed (registry version {})",
        resolved.resolved_count(),
        resolved.failed_count(),
        if registry.version.is_empty() { "-" } else { registry.version.as_str() }
    );

    Ok(())
}

fn describe(check: &SignatureCheck) -> String {
    match &check.status {
        SignatureStatus::Unique { address } => {
            format!("{} {:<32} 0x{:X}", "unique   ".green(), check.key, address)
        }
        SignatureStatus::Ambiguous { addresses } => format!(
            "{} {:<32} {} matches, first 0x{:X}",
            "ambiguous".yellow(),
            check.key,
            addresses.len(),
            addresses.first().copied().unwrap_or_default()
        ),
        SignatureStatus::NotFound => {
            format!("{} {:<32} {}", "missing  ".red(), check.key, check.pattern)
        }
        SignatureStatus::Invalid { reason } => {
            format!("{} {:<32} {}", "invalid  ".red(), check.key, reason)
        }
    }
}
