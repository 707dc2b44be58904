//! Bounds-checked little-endian field access.
//!
//! All PE header fields are little-endian. Every read checks its full extent
//! against the buffer and reports the offset it attempted, so the locator
//! never indexes past the end of a truncated image.

use crate::error::{Error, Result};

/// Returns `data[offset..offset + len]`, or `MalformedImage` naming `what`.
pub(crate) fn bytes<'a>(data: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| {
            Error::malformed(
                offset as u64,
                format!(
                    "{} ({} bytes) extends past end of file ({} bytes)",
                    what,
                    len,
                    data.len()
                ),
            )
        })
}

/// Reads a fixed-size array at `offset`.
pub(crate) fn array<const N: usize>(data: &[u8], offset: usize, what: &str) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes(data, offset, N, what)?);
    Ok(out)
}

/// Reads a little-endian `u16` at `offset`.
pub(crate) fn u16_le(data: &[u8], offset: usize, what: &str) -> Result<u16> {
    array(data, offset, what).map(u16::from_le_bytes)
}

/// Reads a little-endian `u32` at `offset`.
pub(crate) fn u32_le(data: &[u8], offset: usize, what: &str) -> Result<u32> {
    array(data, offset, what).map(u32::from_le_bytes)
}
