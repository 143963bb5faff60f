//! Scan command implementation.

use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;
use remora::SignatureScanner;

use super::hex_utils::parse_hex_address;
use crate::ScanMode;

/// Run the scan command
pub fn run(
    image: &Path,
    pattern: &str,
    mode: ScanMode,
    base: &str,
    offset: i64,
    all: bool,
) -> Result<()> {
    let scanner = SignatureScanner::open(image, parse_hex_address(base)?)?;

    if all {
        let matches = scanner.scan_text_all(pattern)?;
        println!("{} match(es) in .text", matches.len());
        for address in matches {
            println!("  0x{:X}  (+0x{:X})", address, address - scanner.module_base());
        }
        return Ok(());
    }

    let address = match mode {
        ScanMode::Text => scanner.scan_text(pattern)?,
        ScanMode::Data => scanner.scan_data(pattern)?,
        ScanMode::Module => scanner.scan_module(pattern)?,
        ScanMode::Static => scanner.static_address(pattern, offset)?,
    };

    println!(
        "{} 0x{:X}  (+0x{:X})",
        "Found".green(),
        address,
        address.wrapping_sub(scanner.module_base())
    );
    Ok(())
}
