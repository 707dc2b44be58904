//! grotto - Find code caves in PE binaries
//!
//! This tool scans the raw section data of Portable Executable files for
//! runs of zero bytes large enough to hold a patch or payload.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use grotto_core::{
    CaveRecord, CaveScanner, LocatorConfig, ScanSummary, ScannerConfig, SectionTable,
    TablePolicy,
};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Find code caves (runs of zero bytes) inside PE section data
#[derive(Parser, Debug)]
#[command(name = "grotto")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// PE file to scan, or a directory to scan recursively
    #[arg(value_name = "PE_FILE")]
    path: PathBuf,

    /// Minimum number of consecutive zero bytes to report
    #[arg(value_name = "MIN_CAVE_SIZE", value_parser = clap::value_parser!(u64).range(1..))]
    min_cave_size: u64,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Maximum number of caves to report per file (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_caves: usize,

    /// Truncate section tables that run past the end of the file and skip
    /// sections whose raw data does, instead of failing
    #[arg(long)]
    lenient: bool,
}

/// Output format for cave reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Cave found in <section> at 0x<offset>, size: <n> bytes
    Text,
    /// section,offset,size (for scripting)
    Csv,
}

fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if cli.path.is_dir() {
        process_directory(&cli, &cli.path, &mut out)
    } else {
        process_single_file(&cli, &cli.path, &mut out)
    }
}

/// Process a single PE file
fn process_single_file(cli: &Cli, file: &Path, out: &mut impl Write) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let summary = process_binary(cli, file, None, out)?;
    print_summary(file, &summary);
    Ok(())
}

/// Process a directory of PE files recursively
fn process_directory(cli: &Cli, directory: &Path, out: &mut impl Write) -> Result<()> {
    info!("Scanning directory: {}", directory.display());

    let mut binaries_processed = 0;
    let mut caves_found = 0;

    for entry in WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if !path.is_file() {
            continue;
        }

        // Skip hidden files
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
        {
            continue;
        }

        if !has_mz_magic(path) {
            trace!("Skipping non-PE file: {}", path.display());
            continue;
        }

        debug!("Processing binary: {}", path.display());
        match process_binary(cli, path, Some(path), out) {
            Ok(summary) => {
                print_summary(path, &summary);
                caves_found += summary.caves_found;
            }
            // Log error but continue with other files
            Err(e) => warn!("Error processing {}: {:#}", path.display(), e),
        }
        binaries_processed += 1;
    }

    info!(
        "Processed {} binaries, {} caves found",
        binaries_processed, caves_found
    );
    Ok(())
}

/// Returns true if the file starts with the legacy `MZ` magic
fn has_mz_magic(path: &Path) -> bool {
    let mut magic = [0u8; 2];
    fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .map(|()| &magic == b"MZ")
        .unwrap_or(false)
}

/// Scan one PE file and write a line per cave to `out`
///
/// `prefix` is written before each line when several files share the output.
fn process_binary(
    cli: &Cli,
    binary_path: &Path,
    prefix: Option<&Path>,
    out: &mut impl Write,
) -> Result<ScanSummary> {
    trace!("Reading {}", binary_path.display());
    let image = fs::read(binary_path)
        .with_context(|| format!("Failed to read input file: {}", binary_path.display()))?;

    trace!("Read {} bytes from {}", image.len(), binary_path.display());

    let policy = if cli.lenient {
        TablePolicy::Truncate
    } else {
        TablePolicy::Strict
    };
    let table = SectionTable::parse_with_config(&image, &LocatorConfig::new().policy(policy))
        .with_context(|| format!("Failed to parse PE headers: {}", binary_path.display()))?;

    debug!(
        "Located {} section(s) in {}",
        table.len(),
        binary_path.display()
    );

    let config = ScannerConfig::new(cli.min_cave_size)?.max_results(cli.max_caves);
    let scanner = CaveScanner::new(config);

    // The sink cannot fail, so keep the first write error for later
    let mut write_result: io::Result<()> = Ok(());
    let summary = scanner
        .scan_image(&image, &table, &mut |cave: &CaveRecord| {
            if write_result.is_ok() {
                write_result = writeln!(out, "{}", format_cave(cli.format, cave, prefix));
            }
        })
        .with_context(|| format!("Failed to scan binary: {}", binary_path.display()))?;
    write_result.context("Failed to write report")?;

    if summary.limit_reached {
        info!(
            "Stopped after {} caves in {} (--max-caves)",
            summary.caves_found,
            binary_path.display()
        );
    }

    Ok(summary)
}

/// Format one report line
fn format_cave(format: OutputFormat, cave: &CaveRecord, prefix: Option<&Path>) -> String {
    match format {
        OutputFormat::Text => {
            let line = format!(
                "Cave found in {} at 0x{:X}, size: {} bytes",
                cave.section_name, cave.absolute_offset, cave.length
            );
            match prefix {
                Some(path) => format!("{}: {}", path.display(), line),
                None => line,
            }
        }
        OutputFormat::Csv => {
            let line = format!(
                "{},0x{:X},{}",
                cave.section_name, cave.absolute_offset, cave.length
            );
            match prefix {
                Some(path) => format!("{},{}", path.display(), line),
                None => line,
            }
        }
    }
}

fn print_summary(path: &Path, summary: &ScanSummary) {
    match summary.largest {
        Some(largest) => info!(
            "Summary for {}: {} sections scanned, {} caves ({} bytes), largest {} bytes in {} at 0x{:X}",
            path.display(),
            summary.sections_scanned,
            summary.caves_found,
            summary.cave_bytes,
            largest.length,
            largest.section_name,
            largest.absolute_offset
        ),
        None => info!(
            "Summary for {}: {} sections scanned, no caves found",
            path.display(),
            summary.sections_scanned
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grotto_core::fixtures::PeBuilder;
    use grotto_core::SectionName;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("grotto").chain(args.iter().copied())).unwrap()
    }

    fn sample_image() -> Vec<u8> {
        let mut text = vec![0x90; 64];
        text[8..40].fill(0);
        let mut data = vec![0x11; 32];
        data[16..32].fill(0);
        PeBuilder::new()
            .section(".text", &text)
            .section(".data", &data)
            .build()
    }

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_format_text() {
        let cave = CaveRecord {
            section_index: 0,
            section_name: SectionName::from(".text"),
            absolute_offset: 0x4a0,
            length: 96,
        };
        assert_eq!(
            format_cave(OutputFormat::Text, &cave, None),
            "Cave found in .text at 0x4A0, size: 96 bytes"
        );
        assert_eq!(
            format_cave(OutputFormat::Csv, &cave, Some(Path::new("a.exe"))),
            "a.exe,.text,0x4A0,96"
        );
    }

    #[test]
    fn test_process_binary_report() {
        let dir = TempDir::new().unwrap();
        let image = sample_image();
        let path = write_file(&dir, "sample.exe", &image);
        let table = SectionTable::parse(&image).unwrap();
        let text = table.sections()[0].raw_offset;
        let data = table.sections()[1].raw_offset;

        let args = cli(&[path.to_str().unwrap(), "16"]);
        let mut out = Vec::new();
        let summary = process_binary(&args, &path, None, &mut out).unwrap();

        let expected = format!(
            "Cave found in .text at 0x{:X}, size: 32 bytes\n\
             Cave found in .data at 0x{:X}, size: 16 bytes\n",
            text + 8,
            data + 16
        );
        assert_eq!(String::from_utf8(out).unwrap(), expected);
        assert_eq!(summary.caves_found, 2);
    }

    #[test]
    fn test_process_binary_max_caves() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "sample.exe", &sample_image());

        let args = cli(&[path.to_str().unwrap(), "16", "--max-caves", "1", "--format", "csv"]);
        let mut out = Vec::new();
        let summary = process_binary(&args, &path, None, &mut out).unwrap();

        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
        assert!(summary.limit_reached);
    }

    #[test]
    fn test_process_binary_malformed() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "short.exe", b"MZ\x90\x00");

        let args = cli(&[path.to_str().unwrap(), "4"]);
        let mut out = Vec::new();
        assert!(process_binary(&args, &path, None, &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_lenient_skips_out_of_bounds_section() {
        let dir = TempDir::new().unwrap();
        let mut text = vec![0x90; 32];
        text[0..16].fill(0);
        let image = PeBuilder::new()
            .section(".text", &text)
            .section_header(".bogus", 0x40_0000, 0x1000)
            .build();
        let path = write_file(&dir, "bogus.exe", &image);

        let strict = cli(&[path.to_str().unwrap(), "8"]);
        assert!(process_binary(&strict, &path, None, &mut Vec::<u8>::new()).is_err());

        let lenient = cli(&[path.to_str().unwrap(), "8", "--lenient"]);
        let mut out = Vec::new();
        let summary = process_binary(&lenient, &path, None, &mut out).unwrap();
        assert_eq!(summary.sections_scanned, 1);
        assert_eq!(summary.caves_found, 1);
    }

    #[test]
    fn test_process_directory() {
        let dir = TempDir::new().unwrap();
        let good = write_file(&dir, "a.exe", &sample_image());
        write_file(&dir, "b.txt", b"not a binary");
        write_file(&dir, "c.dll", b"MZ truncated");

        let args = cli(&[dir.path().to_str().unwrap(), "16"]);
        let mut out = Vec::new();
        process_directory(&args, dir.path(), &mut out).unwrap();

        let report = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines
            .iter()
            .all(|l| l.starts_with(&format!("{}: Cave found in ", good.display()))));
    }

    #[test]
    fn test_single_file_missing() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.exe");
        let args = cli(&[missing.to_str().unwrap(), "4"]);
        assert!(process_single_file(&args, &missing, &mut Vec::<u8>::new()).is_err());
    }

    #[test]
    fn test_has_mz_magic() {
        let dir = TempDir::new().unwrap();
        assert!(has_mz_magic(&write_file(&dir, "a", b"MZ")));
        assert!(!has_mz_magic(&write_file(&dir, "b", b"M")));
        assert!(!has_mz_magic(&write_file(&dir, "c", b"\x7fELF")));
    }

    #[test]
    fn test_min_cave_size_validation() {
        let parse = |size: &str| Cli::try_parse_from(["grotto", "file.exe", size]);
        assert!(parse("0").is_err());
        assert!(parse("-5").is_err());
        assert!(parse("abc").is_err());
        assert_eq!(parse("512").unwrap().min_cave_size, 512);
        assert!(Cli::try_parse_from(["grotto", "file.exe"]).is_err());
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
