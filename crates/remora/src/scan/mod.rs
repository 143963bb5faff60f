//! Signature scanning over a module file.
//!
//! A [`SignatureScanner`] maps the target's executable, locates `.text` and
//! `.data`, and turns IDA-style byte patterns into addresses of the module as
//! loaded in the target. [`resolve_all`] runs a whole [`SignatureRegistry`]
//! in one pass.

pub mod pe;
mod registry;
mod resolve;
mod scanner;
mod signature;

pub use pe::Section;
pub use registry::{
    SignatureEntry, SignatureKind, SignatureRegistry, load_signatures, save_signatures,
};
pub use resolve::{ResolveReport, ResolvedAddresses, resolve_all, resolve_entry};
pub use scanner::{AddressKind, ModuleImage, ResolvedAddress, SignatureScanner};
pub use signature::{Signature, format_pattern, parse_pattern};
