//! Minimal PE section table reader.

use byteorder::{ByteOrder, LE};

use crate::error::{Error, Result};

/// Offset of `e_lfanew` in the DOS header
const NT_HEADER_POINTER: usize = 0x3C;
const PE_MAGIC: &[u8; 4] = b"PE\0\0";
const FILE_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;

/// Section names as little-endian u64, NUL padded
pub const TEXT_SECTION: u64 = 0x7478_6574_2E;
pub const DATA_SECTION: u64 = 0x6174_6164_2E;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    /// Raw 8-byte name as a little-endian integer
    pub tag: u64,
    /// `PointerToRawData`
    pub file_offset: u64,
    /// Bytes of the section present in the file
    pub size: u64,
    pub virtual_address: u64,
    pub virtual_size: u64,
}

impl Section {
    pub fn contains_file_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.file_offset + self.size
    }

    pub fn contains_rva(&self, rva: u64) -> bool {
        rva >= self.virtual_address && rva < self.virtual_address + self.virtual_size.max(self.size)
    }

    pub fn file_range(&self) -> std::ops::Range<usize> {
        self.file_offset as usize..(self.file_offset + self.size) as usize
    }
}

fn field<const N: usize>(image: &[u8], offset: usize, what: &str) -> Result<[u8; N]> {
    image
        .get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::InvalidImage(format!("truncated {what} at {offset:#x}")))
}

/// Read every section header of a PE image.
///
/// Sizes are clamped to the bytes actually present in `image`.
pub fn parse_sections(image: &[u8]) -> Result<Vec<Section>> {
    let nt = LE::read_u32(&field::<4>(image, NT_HEADER_POINTER, "DOS header")?) as usize;
    if &field::<4>(image, nt, "NT signature")? != PE_MAGIC {
        return Err(Error::InvalidImage("missing PE signature".to_string()));
    }

    let file_header = nt + 4;
    let count = LE::read_u16(&field::<2>(image, file_header + 2, "file header")?) as usize;
    let optional_size = LE::read_u16(&field::<2>(image, file_header + 16, "file header")?) as usize;
    let table = file_header + FILE_HEADER_SIZE + optional_size;

    let mut sections = Vec::with_capacity(count);
    for index in 0..count {
        let header = field::<SECTION_HEADER_SIZE>(
            image,
            table + index * SECTION_HEADER_SIZE,
            "section header",
        )?;

        let tag = LE::read_u64(&header[0..8]);
        let name_len = header[..8].iter().position(|&b| b == 0).unwrap_or(8);
        let virtual_size = LE::read_u32(&header[8..12]) as u64;
        let virtual_address = LE::read_u32(&header[12..16]) as u64;
        let raw_size = LE::read_u32(&header[16..20]) as u64;
        let file_offset = LE::read_u32(&header[20..24]) as u64;

        let available = (image.len() as u64).saturating_sub(file_offset);
        let size = virtual_size.min(raw_size).min(available);

        sections.push(Section {
            name: String::from_utf8_lossy(&header[..name_len]).into_owned(),
            tag,
            file_offset,
            size,
            virtual_address,
            virtual_size,
        });
    }

    Ok(sections)
}

/// Find a section by its 8-byte name constant.
pub fn find_section(sections: &[Section], tag: u64) -> Result<Section> {
    let label = String::from_utf8_lossy(&tag.to_le_bytes())
        .trim_end_matches('\0')
        .to_string();

    match sections.iter().find(|s| s.tag == tag) {
        Some(section) if section.size == 0 => {
            Err(Error::InvalidImage(format!("section {label} is empty")))
        }
        Some(section) => Ok(section.clone()),
        None => Err(Error::InvalidImage(format!("section {label} not found"))),
    }
}

#[cfg(test)]
pub(crate) mod test_image {
    //! Synthetic PE images for scanner tests.

    use byteorder::{ByteOrder, LE};

    pub const NT_OFFSET: usize = 0x40;

    struct SectionSpec {
        name: [u8; 8],
        file_offset: u32,
        virtual_address: u32,
        bytes: Vec<u8>,
    }

    #[derive(Default)]
    pub struct TestImage {
        sections: Vec<SectionSpec>,
    }

    impl TestImage {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn section(
            mut self,
            name: &str,
            file_offset: u32,
            virtual_address: u32,
            bytes: Vec<u8>,
        ) -> Self {
            let mut raw = [0u8; 8];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            self.sections.push(SectionSpec {
                name: raw,
                file_offset,
                virtual_address,
                bytes,
            });
            self
        }

        pub fn text(self, file_offset: u32, virtual_address: u32, bytes: Vec<u8>) -> Self {
            self.section(".text", file_offset, virtual_address, bytes)
        }

        pub fn data(self, file_offset: u32, virtual_address: u32, bytes: Vec<u8>) -> Self {
            self.section(".data", file_offset, virtual_address, bytes)
        }

        pub fn build(self) -> Vec<u8> {
            let end = self
                .sections
                .iter()
                .map(|s| s.file_offset as usize + s.bytes.len())
                .max()
                .unwrap_or(0)
                .max(0x200);
            let mut image = vec![0u8; end];

            image[0..2].copy_from_slice(b"MZ");
            LE::write_u32(&mut image[0x3C..0x40], NT_OFFSET as u32);
            image[NT_OFFSET..NT_OFFSET + 4].copy_from_slice(b"PE\0\0");
            LE::write_u16(&mut image[NT_OFFSET + 4..], 0x8664);
            LE::write_u16(&mut image[NT_OFFSET + 6..], self.sections.len() as u16);
            // empty optional header; section table follows the file header
            LE::write_u16(&mut image[NT_OFFSET + 20..], 0);

            let table = NT_OFFSET + 24;
            for (i, s) in self.sections.iter().enumerate() {
                let h = table + i * 40;
                image[h..h + 8].copy_from_slice(&s.name);
                LE::write_u32(&mut image[h + 8..], s.bytes.len() as u32);
                LE::write_u32(&mut image[h + 12..], s.virtual_address);
                LE::write_u32(&mut image[h + 16..], s.bytes.len() as u32);
                LE::write_u32(&mut image[h + 20..], s.file_offset);
                let start = s.file_offset as usize;
                image[start..start + s.bytes.len()].copy_from_slice(&s.bytes);
            }
            image
        }
    }
}
