//! CLI command implementations.

pub mod attach;
pub mod dump;
pub mod hex_utils;
pub mod resolve;
pub mod scan;
pub mod sections;
