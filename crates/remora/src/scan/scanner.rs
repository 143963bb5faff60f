use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LE};
use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};
use memmap2::Mmap;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::ReadMemory;

use super::pe::{self, DATA_SECTION, Section, TEXT_SECTION};
use super::signature::Signature;

/// Instructions examined when looking for a static operand
const STATIC_DECODE_WINDOW: usize = 64;
const MAX_INSTRUCTION_LEN: usize = 15;

const CALL_REL32: u8 = 0xE8;
const JMP_REL32: u8 = 0xE9;

/// How a signature match became an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressKind {
    /// The match itself
    Direct,
    /// Target of the CALL/JMP rel32 at the match
    Trampoline,
    /// Memory operand of an instruction near the match
    StaticOperand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedAddress {
    pub address: u64,
    pub kind: AddressKind,
}

/// Bytes of the module file.
pub enum ModuleImage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for ModuleImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ModuleImage::Mapped(map) => map,
            ModuleImage::Owned(bytes) => bytes,
        }
    }
}

/// Signature scanner over a module file, translating file offsets into
/// addresses of the module as loaded at `module_base`.
pub struct SignatureScanner {
    image: ModuleImage,
    module_base: u64,
    sections: Vec<Section>,
    text: Section,
    data: Section,
    live: Option<Arc<dyn ReadMemory + Send + Sync>>,
}

impl SignatureScanner {
    /// Map `path` read-only and index its sections.
    pub fn open<P: AsRef<Path>>(path: P, module_base: u64) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the mapping is read-only and the module file is locked by
        // the loader while the target runs.
        let map = unsafe { Mmap::map(&file)? };
        debug!(
            "mapped {} ({} bytes)",
            path.as_ref().display(),
            map.len()
        );
        Self::with_image(ModuleImage::Mapped(map), module_base)
    }

    pub fn from_image(bytes: Vec<u8>, module_base: u64) -> Result<Self> {
        Self::with_image(ModuleImage::Owned(bytes), module_base)
    }

    fn with_image(image: ModuleImage, module_base: u64) -> Result<Self> {
        let sections = pe::parse_sections(&image)?;
        let text = pe::find_section(&sections, TEXT_SECTION)?;
        let data = pe::find_section(&sections, DATA_SECTION)?;
        debug!(
            ".text at file {:#x} (va {:#x}, {} bytes), .data at file {:#x} (va {:#x}, {} bytes)",
            text.file_offset,
            text.virtual_address,
            text.size,
            data.file_offset,
            data.virtual_address,
            data.size
        );

        Ok(Self {
            image,
            module_base,
            sections,
            text,
            data,
            live: None,
        })
    }

    /// Read code from the running process instead of the file.
    pub fn with_live_memory(mut self, reader: Arc<dyn ReadMemory + Send + Sync>) -> Self {
        self.live = Some(reader);
        self
    }

    pub fn module_base(&self) -> u64 {
        self.module_base
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn text_section(&self) -> &Section {
        &self.text
    }

    pub fn data_section(&self) -> &Section {
        &self.data
    }

    /// Scan `.text`, following a CALL/JMP at the match.
    pub fn scan_text(&self, signature: &str) -> Result<u64> {
        self.resolve_text(&signature.parse()?, signature)
            .map(|r| r.address)
    }

    pub fn scan_data(&self, signature: &str) -> Result<u64> {
        self.scan_section(&self.data, &signature.parse()?, signature)
    }

    /// Scan the whole file, headers included.
    pub fn scan_module(&self, signature: &str) -> Result<u64> {
        let compiled: Signature = signature.parse()?;
        let offset = compiled
            .find(&self.image)
            .ok_or_else(|| not_found(signature))?;
        Ok(self.file_offset_to_address(offset as u64))
    }

    /// Every `.text` match, without trampoline resolution.
    pub fn scan_text_all(&self, signature: &str) -> Result<Vec<u64>> {
        let compiled: Signature = signature.parse()?;
        let bytes = &self.image[self.text.file_range()];
        Ok(compiled
            .find_all(bytes)
            .into_iter()
            .map(|i| self.section_address(&self.text, i))
            .collect())
    }

    /// Address referenced by the first memory operand at or after the
    /// `.text` match plus `offset`.
    pub fn static_address(&self, signature: &str, offset: i64) -> Result<u64> {
        self.resolve_static(&signature.parse()?, signature, offset)
            .map(|r| r.address)
    }

    pub(crate) fn resolve_text(&self, compiled: &Signature, text: &str) -> Result<ResolvedAddress> {
        let address = self.scan_section(&self.text, compiled, text)?;

        let head = self.read_code(address, 5)?;
        if head.len() == 5 && (head[0] == CALL_REL32 || head[0] == JMP_REL32) {
            let disp = LE::read_i32(&head[1..5]);
            let target = (address + 5).wrapping_add_signed(disp as i64);
            if !self.text_contains(target) {
                return Err(Error::ScanConflict {
                    signature: text.to_string(),
                    target,
                });
            }
            debug!("{} at {:#x} branches to {:#x}", text, address, target);
            return Ok(ResolvedAddress {
                address: target,
                kind: AddressKind::Trampoline,
            });
        }

        Ok(ResolvedAddress {
            address,
            kind: AddressKind::Direct,
        })
    }

    pub(crate) fn resolve_data(&self, compiled: &Signature, text: &str) -> Result<ResolvedAddress> {
        self.scan_section(&self.data, compiled, text)
            .map(|address| ResolvedAddress {
                address,
                kind: AddressKind::Direct,
            })
    }

    pub(crate) fn resolve_static(
        &self,
        compiled: &Signature,
        text: &str,
        offset: i64,
    ) -> Result<ResolvedAddress> {
        let start = self
            .resolve_text(compiled, text)?
            .address
            .wrapping_add_signed(offset);
        let code = self.read_code(start, STATIC_DECODE_WINDOW * MAX_INSTRUCTION_LEN)?;

        let mut decoder = Decoder::with_ip(64, &code, start, DecoderOptions::NONE);
        let mut instruction = Instruction::default();
        for _ in 0..STATIC_DECODE_WINDOW {
            if !decoder.can_decode() {
                break;
            }
            decoder.decode_out(&mut instruction);
            if instruction.is_invalid() {
                break;
            }
            if !has_memory_operand(&instruction) {
                continue;
            }

            if instruction.is_ip_rel_memory_operand() {
                let address = instruction.ip_rel_memory_address();
                debug!("{} operand at {:#x} -> {:#x}", text, instruction.ip(), address);
                return Ok(ResolvedAddress {
                    address,
                    kind: AddressKind::StaticOperand,
                });
            }

            let offsets = decoder.get_constant_offsets(&instruction);
            if offsets.has_displacement() && offsets.displacement_size() == 4 {
                let field = (instruction.ip() - start) as usize + offsets.displacement_offset();
                let disp = LE::read_i32(&code[field..field + 4]);
                let field_address = instruction.ip() + offsets.displacement_offset() as u64;
                let address = (field_address + 4).wrapping_add_signed(disp as i64);
                debug!("{} displacement at {:#x} -> {:#x}", text, field_address, address);
                return Ok(ResolvedAddress {
                    address,
                    kind: AddressKind::StaticOperand,
                });
            }
        }

        Err(not_found(text))
    }

    fn scan_section(&self, section: &Section, compiled: &Signature, text: &str) -> Result<u64> {
        let bytes = &self.image[section.file_range()];
        let index = compiled.find(bytes).ok_or_else(|| not_found(text))?;
        let address = self.section_address(section, index);
        debug!("{} matched in {} at {:#x}", text, section.name, address);
        Ok(address)
    }

    fn section_address(&self, section: &Section, index: usize) -> u64 {
        self.module_base + section.virtual_address + index as u64
    }

    fn file_offset_to_address(&self, offset: u64) -> u64 {
        match self.sections.iter().find(|s| s.contains_file_offset(offset)) {
            Some(s) => self.module_base + s.virtual_address + (offset - s.file_offset),
            // headers are mapped as-is
            None => self.module_base + offset,
        }
    }

    fn text_contains(&self, address: u64) -> bool {
        address
            .checked_sub(self.module_base)
            .is_some_and(|rva| self.text.contains_rva(rva))
    }

    /// Up to `len` code bytes at `address`, never reading past `.text`.
    fn read_code(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let text_start = self.module_base + self.text.virtual_address;
        let text_end = text_start + self.text.size;
        if address < text_start || address >= text_end {
            return Err(Error::ScanConflict {
                signature: format!("code read at {address:#x}"),
                target: address,
            });
        }
        let len = len.min((text_end - address) as usize);

        match &self.live {
            Some(reader) => reader.read_bytes(address, len),
            None => {
                let start = self.text.file_offset as usize + (address - text_start) as usize;
                Ok(self.image[start..start + len].to_vec())
            }
        }
    }
}

fn has_memory_operand(instruction: &Instruction) -> bool {
    (0..instruction.op_count()).any(|i| instruction.op_kind(i) == OpKind::Memory)
}

fn not_found(signature: &str) -> Error {
    Error::ScanNotFound {
        signature: signature.to_string(),
    }
}
