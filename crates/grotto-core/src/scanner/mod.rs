//! Code cave scanning.
//!
//! A code cave is a maximal run of zero bytes inside one section's raw data.
//! Each section is scanned on its own in a single left-to-right pass:
//!
//! 1. Count consecutive zero bytes, starting from 0 at the section's first byte
//! 2. On a nonzero byte, emit the run if it reached the minimum, then reset
//! 3. At the section's last byte, emit the trailing run if it reached the minimum
//!
//! Caves never span sections. The run counter restarts for every section even
//! if the previous one ended inside a run of zeros, because two sections that
//! happen to be adjacent on disk are not one writable region.
//!
//! ## Sinks
//!
//! Records are pushed into a [`CaveSink`] as they are found:
//!
//! ```no_run
//! use grotto_core::{CaveRecord, CaveScanner, ScannerConfig, SectionTable};
//!
//! let image = std::fs::read("./target/release/app.exe")?;
//! let table = SectionTable::parse(&image)?;
//! let scanner = CaveScanner::new(ScannerConfig::new(64)?);
//!
//! let mut caves: Vec<CaveRecord> = Vec::new();
//! scanner.scan_image(&image, &table, &mut caves)?;
//!
//! scanner.scan_image(&image, &table, &mut |cave: &CaveRecord| {
//!     println!("{} bytes at {:#x}", cave.length, cave.absolute_offset);
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{Error, Result};
use crate::pe::{LocatorConfig, SectionDescriptor, SectionName, SectionTable};
use std::path::Path;
use tracing::{debug, trace};

/// A run of zero bytes inside one section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaveRecord {
    /// Position of the containing section in the section table
    pub section_index: usize,
    /// Name of the containing section
    pub section_name: SectionName,
    /// File offset of the first zero byte
    pub absolute_offset: u64,
    /// Number of zero bytes
    pub length: u64,
}

impl CaveRecord {
    /// File offset one past the last zero byte
    pub fn end(&self) -> u64 {
        self.absolute_offset + self.length
    }
}

/// Configuration for the cave scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Smallest run of zero bytes reported as a cave
    pub min_cave: u64,
    /// Maximum number of caves to report (0 = unlimited)
    pub max_results: usize,
}

impl ScannerConfig {
    /// Creates a scanner config, rejecting a zero minimum cave size
    pub fn new(min_cave: u64) -> Result<Self> {
        if min_cave == 0 {
            return Err(Error::invalid_argument(
                "minimum cave size must be a positive integer",
            ));
        }
        Ok(Self {
            min_cave,
            max_results: 0,
        })
    }

    /// Sets the maximum number of results to return
    pub fn max_results(mut self, max: usize) -> Self {
        self.max_results = max;
        self
    }
}

/// Receives cave records as the scanner finds them
pub trait CaveSink {
    /// Accept one record
    fn accept(&mut self, cave: &CaveRecord);
}

impl CaveSink for Vec<CaveRecord> {
    fn accept(&mut self, cave: &CaveRecord) {
        self.push(*cave);
    }
}

impl<F> CaveSink for F
where
    F: FnMut(&CaveRecord),
{
    fn accept(&mut self, cave: &CaveRecord) {
        self(cave)
    }
}

/// Totals for one scanned image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Sections whose raw data was scanned
    pub sections_scanned: usize,
    /// Caves reported to the sink
    pub caves_found: usize,
    /// Total bytes across reported caves
    pub cave_bytes: u64,
    /// Longest reported cave (first one wins on ties)
    pub largest: Option<CaveRecord>,
    /// Scanning stopped early because `max_results` was reached
    pub limit_reached: bool,
}

impl ScanSummary {
    fn record(&mut self, cave: &CaveRecord) {
        self.caves_found += 1;
        self.cave_bytes += cave.length;
        if self.largest.map_or(true, |largest| cave.length > largest.length) {
            self.largest = Some(*cave);
        }
    }
}

/// Lazy iterator over the caves of one section, in ascending offset order
#[derive(Debug, Clone)]
pub struct SectionCaves<'a> {
    section: SectionDescriptor,
    bytes: &'a [u8],
    min_cave: u64,
    position: usize,
    /// Zero bytes seen since the last nonzero byte; 0 means not in a run
    run: u64,
    finished: bool,
}

impl<'a> SectionCaves<'a> {
    fn new(section: SectionDescriptor, bytes: &'a [u8], min_cave: u64) -> Self {
        Self {
            section,
            bytes,
            min_cave,
            position: 0,
            run: 0,
            finished: false,
        }
    }

    /// Ends the current run at section-relative `end`, keeping it if long enough
    fn flush(&mut self, end: usize) -> Option<CaveRecord> {
        let length = std::mem::take(&mut self.run);
        (length >= self.min_cave).then(|| CaveRecord {
            section_index: self.section.index,
            section_name: self.section.name,
            absolute_offset: self.section.raw_offset + end as u64 - length,
            length,
        })
    }
}

impl Iterator for SectionCaves<'_> {
    type Item = CaveRecord;

    fn next(&mut self) -> Option<CaveRecord> {
        while let Some(&byte) = self.bytes.get(self.position) {
            let at = self.position;
            self.position += 1;

            if byte == 0 {
                self.run += 1;
            } else if let Some(cave) = self.flush(at) {
                return Some(cave);
            }
        }

        if self.finished {
            return None;
        }
        self.finished = true;
        self.flush(self.bytes.len())
    }
}

impl std::iter::FusedIterator for SectionCaves<'_> {}

/// Scanner for zero-byte runs in PE section data
#[derive(Debug, Clone)]
pub struct CaveScanner {
    config: ScannerConfig,
}

impl CaveScanner {
    /// Creates a new scanner
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// The scanner's configuration
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Iterates the caves of one section.
    ///
    /// Fails with `MalformedImage` if the section's raw data is not fully
    /// inside `image`; nothing is read in that case.
    pub fn caves<'a>(
        &self,
        image: &'a [u8],
        section: &SectionDescriptor,
    ) -> Result<SectionCaves<'a>> {
        let range = section.raw_range(image.len())?;
        Ok(SectionCaves::new(*section, &image[range], self.config.min_cave))
    }

    /// Scans one section into `sink`, returning the number of caves emitted.
    ///
    /// `max_results` is not applied here; see [`CaveScanner::scan_image`].
    pub fn scan_section<S>(
        &self,
        image: &[u8],
        section: &SectionDescriptor,
        sink: &mut S,
    ) -> Result<usize>
    where
        S: CaveSink + ?Sized,
    {
        let mut emitted = 0;
        for cave in self.caves(image, section)? {
            sink.accept(&cave);
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Scans every section of `table` in table order.
    pub fn scan_image<S>(
        &self,
        image: &[u8],
        table: &SectionTable,
        sink: &mut S,
    ) -> Result<ScanSummary>
    where
        S: CaveSink + ?Sized,
    {
        let mut summary = ScanSummary::default();

        debug!(
            "Scanning {} sections for caves of at least {} bytes",
            table.len(),
            self.config.min_cave
        );

        'sections: for section in table {
            trace!(
                "Scanning section {} ({:#x}..{:#x})",
                section.name,
                section.raw_offset,
                section.raw_end()
            );

            // Validate before emitting anything for this section
            let caves = self.caves(image, section)?;
            summary.sections_scanned += 1;

            for cave in caves {
                trace!(
                    "Cave in {} at {:#x} ({} bytes)",
                    cave.section_name,
                    cave.absolute_offset,
                    cave.length
                );
                sink.accept(&cave);
                summary.record(&cave);

                if self.config.max_results > 0 && summary.caves_found >= self.config.max_results {
                    summary.limit_reached = true;
                    break 'sections;
                }
            }
        }

        debug!(
            "Scan complete: {} caves ({} bytes) in {} sections",
            summary.caves_found, summary.cave_bytes, summary.sections_scanned
        );
        Ok(summary)
    }
}

/// Scan a PE file for code caves of at least `min_cave` bytes
///
/// This is a convenience function that reads the file, locates its sections
/// with the strict policy and collects every cave.
pub fn scan_file(path: impl AsRef<Path>, min_cave: u64) -> Result<Vec<CaveRecord>> {
    scan_file_with_config(path, &ScannerConfig::new(min_cave)?, &LocatorConfig::default())
}

/// Scan a PE file with custom configuration
pub fn scan_file_with_config(
    path: impl AsRef<Path>,
    config: &ScannerConfig,
    locator: &LocatorConfig,
) -> Result<Vec<CaveRecord>> {
    let path = path.as_ref();
    let image = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
    let table = SectionTable::parse_with_config(&image, locator)?;

    let mut caves = Vec::new();
    CaveScanner::new(config.clone()).scan_image(&image, &table, &mut caves)?;
    Ok(caves)
}
