//! Synthetic PE images for tests.
//!
//! [`PeBuilder`] lays out a minimal PE32+ image: a legacy header, the PE
//! signature, a file header, a zero-filled optional header and a section
//! table, followed by each section's raw data packed back to back with no
//! alignment padding. Packing keeps adjacent sections byte-contiguous so
//! boundary behavior can be tested directly.

/// Builder for minimal PE images
#[derive(Debug, Clone, Default)]
pub struct PeBuilder {
    sections: Vec<Section>,
    declared_sections: Option<u16>,
    reverse_raw_layout: bool,
}

#[derive(Debug, Clone)]
enum Section {
    /// Raw data placed by the builder
    Data { name: String, data: Vec<u8> },
    /// Header only, with explicit raw extents
    Header {
        name: String,
        raw_offset: u32,
        raw_size: u32,
    },
}

impl PeBuilder {
    /// Offset of the PE signature in built images
    pub const E_LFANEW: usize = 0x80;

    /// `SizeOfOptionalHeader` for PE32+
    pub const OPTIONAL_HEADER_SIZE: u16 = 0xF0;

    /// Size the headers are padded to before the first section's data
    pub const HEADERS_ALIGNMENT: usize = 0x200;

    /// Creates an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a section whose raw data is `data`
    pub fn section(mut self, name: &str, data: &[u8]) -> Self {
        self.sections.push(Section::Data {
            name: name.to_string(),
            data: data.to_vec(),
        });
        self
    }

    /// Adds a section table entry with explicit raw extents and no data
    pub fn section_header(mut self, name: &str, raw_offset: u32, raw_size: u32) -> Self {
        self.sections.push(Section::Header {
            name: name.to_string(),
            raw_offset,
            raw_size,
        });
        self
    }

    /// Overrides `NumberOfSections` in the file header
    pub fn declared_sections(mut self, count: u16) -> Self {
        self.declared_sections = Some(count);
        self
    }

    /// Places raw data in reverse table order
    pub fn reverse_raw_layout(mut self) -> Self {
        self.reverse_raw_layout = true;
        self
    }

    /// File offset where raw data begins
    pub fn data_start(&self) -> usize {
        let headers = Self::E_LFANEW
            + 4
            + 20
            + Self::OPTIONAL_HEADER_SIZE as usize
            + self.sections.len() * 40;
        headers.div_ceil(Self::HEADERS_ALIGNMENT) * Self::HEADERS_ALIGNMENT
    }

    /// Builds the image
    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.data_start()];

        image[..2].copy_from_slice(b"MZ");
        put_u32(&mut image, 0x3C, Self::E_LFANEW as u32);

        let file_header = Self::E_LFANEW + 4;
        image[Self::E_LFANEW..file_header].copy_from_slice(b"PE\0\0");
        put_u16(&mut image, file_header, 0x8664);
        let count = self
            .declared_sections
            .unwrap_or(self.sections.len() as u16);
        put_u16(&mut image, file_header + 2, count);
        put_u16(&mut image, file_header + 16, Self::OPTIONAL_HEADER_SIZE);

        let optional_header = file_header + 20;
        put_u16(&mut image, optional_header, 0x020B);

        // Raw data placement, in table order unless reversed
        let mut placed = vec![(0u32, 0u32); self.sections.len()];
        let mut order: Vec<usize> = (0..self.sections.len()).collect();
        if self.reverse_raw_layout {
            order.reverse();
        }
        for index in order {
            placed[index] = match &self.sections[index] {
                Section::Data { data, .. } => {
                    let offset = image.len() as u32;
                    image.extend_from_slice(data);
                    (offset, data.len() as u32)
                }
                Section::Header {
                    raw_offset,
                    raw_size,
                    ..
                } => (*raw_offset, *raw_size),
            };
        }

        let table = optional_header + Self::OPTIONAL_HEADER_SIZE as usize;
        for (index, section) in self.sections.iter().enumerate() {
            let entry = table + index * 40;
            let name = match section {
                Section::Data { name, .. } | Section::Header { name, .. } => name.as_bytes(),
            };
            let len = name.len().min(8);
            image[entry..entry + len].copy_from_slice(&name[..len]);

            let (raw_offset, raw_size) = placed[index];
            put_u32(&mut image, entry + 8, raw_size);
            put_u32(&mut image, entry + 12, 0x1000 * (index as u32 + 1));
            put_u32(&mut image, entry + 16, raw_size);
            put_u32(&mut image, entry + 20, raw_offset);
            put_u32(&mut image, entry + 36, 0x6000_0020);
        }

        image
    }
}

fn put_u16(image: &mut [u8], offset: usize, value: u16) {
    image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], offset: usize, value: u32) {
    image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
