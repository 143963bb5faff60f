//! Sections command implementation.

use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;
use remora::ImageReport;

/// Run the sections command
pub fn run(image: &Path, json: bool) -> Result<()> {
    let report = ImageReport::from_path(image)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", report.path.display().bold());
    println!("Size:   {} bytes", report.size);
    println!("SHA256: {}", report.sha256);
    println!();
    println!(
        "{:<8} {:>10} {:>10} {:>10} {:>10}",
        "Name", "File", "Size", "RVA", "VSize"
    );
    for section in &report.sections {
        let name = format!("{:<8}", section.name);
        let name = if section.size == 0 {
            name.dimmed().to_string()
        } else {
            name
        };
        println!(
            "{} {:>#10x} {:>#10x} {:>#10x} {:>#10x}",
            name, section.file_offset, section.size, section.virtual_address, section.virtual_size
        );
    }

    Ok(())
}
