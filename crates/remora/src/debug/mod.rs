//! Debug utilities for inspecting target images and signatures
//!
//! This module provides tools for:
//! - Summarizing a module file's section table (`ImageReport`)
//! - Dumping raw memory as hex (`MemoryDump`)
//! - Checking that registry patterns match exactly once (`SignatureCheck`)

mod dump;
mod image;
mod signatures;

pub use dump::MemoryDump;
pub use image::{ImageReport, SectionReport};
pub use signatures::{SignatureCheck, SignatureStatus, check_signatures};
