//! PE section locator.
//!
//! Parses just enough of a Portable Executable to enumerate its sections and
//! the file extents of their raw data.
//!
//! ## Layout
//!
//! 1. Legacy (DOS) header: `MZ` magic at offset 0, `e_lfanew` (u32) at `0x3C`
//! 2. At `e_lfanew`: the `PE\0\0` signature
//! 3. A 20-byte file header carrying the section count and the size of the
//!    optional header that follows it
//! 4. After the optional header: the section table, 40 bytes per entry
//!
//! Nothing else in the image is interpreted. Every field is read through a
//! bounds-checked accessor, so truncated or hostile headers produce
//! [`Error::MalformedImage`] rather than out-of-bounds reads.

mod reader;

use crate::error::{Error, Result};
use std::fmt;
use std::ops::Range;
use tracing::{debug, trace, warn};

/// Size of the legacy header; `e_lfanew` is its last field
pub const DOS_HEADER_SIZE: usize = 64;

/// Offset of `e_lfanew` within the legacy header
const E_LFANEW_OFFSET: usize = 0x3C;

/// Legacy header magic
const MZ_MAGIC: [u8; 2] = *b"MZ";

/// PE signature found at `e_lfanew`
const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";

/// Size of the COFF file header following the signature
const FILE_HEADER_SIZE: usize = 20;

/// Size of one section table entry
pub const SECTION_HEADER_SIZE: usize = 40;

/// Width of the section name field
pub const SECTION_NAME_LEN: usize = 8;

/// A section name exactly as stored in the section table.
///
/// The field is eight bytes wide and is only NUL-terminated when the name is
/// shorter than that, so it is never treated as a C string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectionName([u8; SECTION_NAME_LEN]);

impl SectionName {
    /// Wraps a raw name field
    pub const fn new(raw: [u8; SECTION_NAME_LEN]) -> Self {
        Self(raw)
    }

    /// The name bytes up to the first NUL, or all eight if there is none
    pub fn as_bytes(&self) -> &[u8] {
        let len = self
            .0
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SECTION_NAME_LEN);
        &self.0[..len]
    }

    /// The untrimmed field
    pub fn raw(&self) -> &[u8; SECTION_NAME_LEN] {
        &self.0
    }
}

impl From<&str> for SectionName {
    /// Builds a name from a string, truncating to eight bytes
    fn from(name: &str) -> Self {
        let mut raw = [0u8; SECTION_NAME_LEN];
        let len = name.len().min(SECTION_NAME_LEN);
        raw[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(raw)
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Non-printable bytes are escaped rather than written to the terminal
        write!(f, "{}", self.as_bytes().escape_ascii())
    }
}

impl fmt::Debug for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionName(\"{}\")", self)
    }
}

/// One section's raw-data extent.
///
/// This is a view into the image (offset and length), it owns no bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// Position in the on-disk section table
    pub index: usize,
    /// Section name
    pub name: SectionName,
    /// `PointerToRawData`
    pub raw_offset: u64,
    /// `SizeOfRawData`
    pub raw_size: u64,
}

impl SectionDescriptor {
    /// File offset one past the last raw byte
    pub fn raw_end(&self) -> u64 {
        self.raw_offset.saturating_add(self.raw_size)
    }

    /// Whether the raw data lies entirely inside an image of `image_len` bytes
    pub fn fits_in(&self, image_len: usize) -> bool {
        self.raw_offset
            .checked_add(self.raw_size)
            .is_some_and(|end| end <= image_len as u64)
    }

    /// The raw data as a byte range into an image of `image_len` bytes
    pub fn raw_range(&self, image_len: usize) -> Result<Range<usize>> {
        if !self.fits_in(image_len) {
            return Err(Error::malformed(
                self.raw_offset,
                format!(
                    "raw data of section {} ({:#x}..{:#x}) extends past end of file ({:#x} bytes)",
                    self.name,
                    self.raw_offset,
                    self.raw_end(),
                    image_len
                ),
            ));
        }
        // Both bounds are <= image_len, which is a usize
        Ok(self.raw_offset as usize..self.raw_end() as usize)
    }
}

/// How the locator treats a section table that does not fit in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TablePolicy {
    /// Any out-of-bounds table entry or raw-data extent is an error
    #[default]
    Strict,
    /// Keep the entries that are fully in bounds and drop the rest
    Truncate,
}

/// Configuration for the section locator
#[derive(Debug, Clone, Default)]
pub struct LocatorConfig {
    /// Out-of-bounds handling
    pub policy: TablePolicy,
}

impl LocatorConfig {
    /// Creates a new locator config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the table policy
    pub fn policy(mut self, policy: TablePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// The section table of a PE image, in on-disk order
#[derive(Debug, Clone)]
pub struct SectionTable {
    machine: u16,
    size_of_optional_header: u16,
    declared_sections: u16,
    sections: Vec<SectionDescriptor>,
}

impl SectionTable {
    /// Parses the section table with the strict policy
    pub fn parse(image: &[u8]) -> Result<Self> {
        Self::parse_with_config(image, &LocatorConfig::default())
    }

    /// Parses the section table with a custom configuration
    pub fn parse_with_config(image: &[u8], config: &LocatorConfig) -> Result<Self> {
        debug!("Locating sections in {} byte image", image.len());

        if image.len() < DOS_HEADER_SIZE {
            return Err(Error::malformed(
                0,
                format!(
                    "file is {} bytes, too small for the {} byte legacy header",
                    image.len(),
                    DOS_HEADER_SIZE
                ),
            ));
        }

        let magic: [u8; 2] = reader::array(image, 0, "legacy header magic")?;
        if magic != MZ_MAGIC {
            return Err(Error::not_a_pe_file(format!(
                "expected MZ magic, found {:02x?}",
                magic
            )));
        }

        let e_lfanew = reader::u32_le(image, E_LFANEW_OFFSET, "e_lfanew")? as usize;
        trace!("e_lfanew = {:#x}", e_lfanew);

        let signature: [u8; 4] = reader::array(image, e_lfanew, "PE signature")?;
        if signature != PE_SIGNATURE {
            return Err(Error::not_a_pe_file(format!(
                "expected PE signature at {:#x}, found {:02x?}",
                e_lfanew, signature
            )));
        }

        let file_header = e_lfanew + PE_SIGNATURE.len();
        reader::bytes(image, file_header, FILE_HEADER_SIZE, "file header")?;
        let machine = reader::u16_le(image, file_header, "machine")?;
        let declared_sections = reader::u16_le(image, file_header + 2, "number of sections")?;
        let size_of_optional_header =
            reader::u16_le(image, file_header + 16, "size of optional header")?;

        debug!(
            "machine {:#06x}, {} sections, optional header {} bytes",
            machine, declared_sections, size_of_optional_header
        );

        // Cannot overflow: file_header + 20 is in bounds and the addend is a u16
        let table_start = file_header + FILE_HEADER_SIZE + size_of_optional_header as usize;
        let count = Self::entries_in_bounds(image, table_start, declared_sections, config.policy)?;

        let mut sections = Vec::with_capacity(count);
        for index in 0..count {
            let entry = table_start + index * SECTION_HEADER_SIZE;
            let descriptor = SectionDescriptor {
                index,
                name: SectionName::new(reader::array(image, entry, "section name")?),
                raw_size: u64::from(reader::u32_le(image, entry + 16, "SizeOfRawData")?),
                raw_offset: u64::from(reader::u32_le(image, entry + 20, "PointerToRawData")?),
            };

            trace!(
                "Section {} {}: raw {:#x} + {:#x}",
                index,
                descriptor.name,
                descriptor.raw_offset,
                descriptor.raw_size
            );

            if let Err(e) = descriptor.raw_range(image.len()) {
                match config.policy {
                    TablePolicy::Strict => return Err(e),
                    TablePolicy::Truncate => {
                        warn!("Skipping section {}: {}", descriptor.name, e);
                        continue;
                    }
                }
            }

            sections.push(descriptor);
        }

        Ok(Self {
            machine,
            size_of_optional_header,
            declared_sections,
            sections,
        })
    }

    /// Number of table entries that can be read, per `policy`
    fn entries_in_bounds(
        image: &[u8],
        table_start: usize,
        declared: u16,
        policy: TablePolicy,
    ) -> Result<usize> {
        let declared = declared as usize;
        let available = image.len().saturating_sub(table_start) / SECTION_HEADER_SIZE;

        if declared <= available {
            return Ok(declared);
        }

        match policy {
            TablePolicy::Strict => Err(Error::malformed(
                table_start as u64,
                format!(
                    "section table declares {} entries but only {} fit in the file",
                    declared, available
                ),
            )),
            TablePolicy::Truncate => {
                warn!(
                    "Section table declares {} entries, truncating to the {} in bounds",
                    declared, available
                );
                Ok(available)
            }
        }
    }

    /// `Machine` field of the file header
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// `SizeOfOptionalHeader` field of the file header
    pub fn size_of_optional_header(&self) -> u16 {
        self.size_of_optional_header
    }

    /// `NumberOfSections` as declared, before any truncation
    pub fn declared_sections(&self) -> u16 {
        self.declared_sections
    }

    /// Located sections in table order
    pub fn sections(&self) -> &[SectionDescriptor] {
        &self.sections
    }

    /// Iterates sections in table order
    pub fn iter(&self) -> std::slice::Iter<'_, SectionDescriptor> {
        self.sections.iter()
    }

    /// Number of located sections
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Returns true if no sections were located
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl<'a> IntoIterator for &'a SectionTable {
    type Item = &'a SectionDescriptor;
    type IntoIter = std::slice::Iter<'a, SectionDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::PeBuilder;
    use crate::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_section_name_trimming() {
        assert_eq!(SectionName::from(".text").as_bytes(), b".text");
        assert_eq!(SectionName::new(*b".textbss").as_bytes(), b".textbss");
        assert_eq!(SectionName::new(*b"ab\0cdefg").as_bytes(), b"ab");
    }

    #[test]
    fn test_section_name_display_escapes() {
        let name = SectionName::new([b'.', b'x', 0x01, 0xff, 0, 0, 0, 0]);
        assert_eq!(name.to_string(), ".x\\x01\\xff");
        assert_eq!(SectionName::from(".rdata").to_string(), ".rdata");
    }

    #[test]
    fn test_parse_sections_in_table_order() {
        let image = PeBuilder::new()
            .section(".text", &[0x90; 0x40])
            .section(".data", &[0x11; 0x20])
            .build();

        let table = SectionTable::parse(&image).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.machine(), 0x8664);
        assert_eq!(table.declared_sections(), 2);

        let names: Vec<String> = table.iter().map(|s| s.name.to_string()).collect();
        assert_eq!(names, vec![".text", ".data"]);

        let text = &table.sections()[0];
        assert_eq!(text.index, 0);
        assert_eq!(text.raw_size, 0x40);
        assert_eq!(&image[text.raw_range(image.len()).unwrap()], &[0x90u8; 0x40][..]);
    }

    #[test]
    fn test_table_order_not_offset_order() {
        let image = PeBuilder::new()
            .section(".a", &[1; 16])
            .section(".b", &[2; 16])
            .reverse_raw_layout()
            .build();

        let table = SectionTable::parse(&image).unwrap();
        let names: Vec<String> = table.iter().map(|s| s.name.to_string()).collect();
        assert_eq!(names, vec![".a", ".b"]);
        assert!(table.sections()[0].raw_offset > table.sections()[1].raw_offset);
    }

    #[test]
    fn test_too_small_for_legacy_header() {
        let err = SectionTable::parse(b"MZ").unwrap_err();
        assert!(err.is_malformed());

        let err = SectionTable::parse(&[]).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_missing_mz_magic() {
        let mut image = PeBuilder::new().section(".text", &[0; 8]).build();
        image[0] = b'Z';
        assert!(matches!(
            SectionTable::parse(&image),
            Err(Error::NotAPeFile { .. })
        ));
    }

    #[test]
    fn test_e_lfanew_past_end() {
        let mut image = vec![0u8; DOS_HEADER_SIZE];
        image[..2].copy_from_slice(b"MZ");
        image[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(SectionTable::parse(&image).unwrap_err().is_malformed());

        image[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(SectionTable::parse(&image).unwrap_err().is_malformed());
    }

    #[test]
    fn test_bad_pe_signature() {
        let mut image = PeBuilder::new().section(".text", &[0; 8]).build();
        let e_lfanew = PeBuilder::E_LFANEW;
        image[e_lfanew..e_lfanew + 2].copy_from_slice(b"NE");
        assert!(matches!(
            SectionTable::parse(&image),
            Err(Error::NotAPeFile { .. })
        ));
    }

    #[test]
    fn test_truncated_file_header() {
        let image = PeBuilder::new().section(".text", &[0; 8]).build();
        let cut = &image[..PeBuilder::E_LFANEW + 4 + 10];
        assert!(SectionTable::parse(cut).unwrap_err().is_malformed());
    }

    #[test]
    fn test_section_count_exceeds_buffer() {
        let image = PeBuilder::new()
            .section(".text", &[0; 8])
            .declared_sections(500)
            .build();

        assert!(SectionTable::parse(&image).unwrap_err().is_malformed());

        let config = LocatorConfig::new().policy(TablePolicy::Truncate);
        let table = SectionTable::parse_with_config(&image, &config).unwrap();
        assert_eq!(table.declared_sections(), 500);
        assert!(table.len() < 500);
        assert_eq!(table.sections()[0].name.to_string(), ".text");
    }

    #[test]
    fn test_raw_data_past_end() {
        let image = PeBuilder::new()
            .section(".text", &[0x90; 16])
            .section_header(".bogus", 0x10_0000, 0x200)
            .build();

        let err = SectionTable::parse(&image).unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains(".bogus"));

        let config = LocatorConfig::new().policy(TablePolicy::Truncate);
        let table = SectionTable::parse_with_config(&image, &config).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.sections()[0].name.to_string(), ".text");
    }

    #[test]
    fn test_virtual_only_section() {
        let image = PeBuilder::new()
            .section(".text", &[0x90; 16])
            .section_header(".bss", 0, 0)
            .build();

        let table = SectionTable::parse(&image).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.sections()[1].raw_size, 0);
    }
}
