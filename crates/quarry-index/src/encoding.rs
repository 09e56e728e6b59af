//! Source text decoding.
//!
//! Files are read as bytes and decoded here so that a single odd file never
//! aborts a session. Detection order: UTF-8 BOM, UTF-16 BOMs, NUL probe for
//! binary content, strict UTF-8, then Latin-1 as the lossless fallback.

use std::fmt;

/// Bytes scanned for a NUL when deciding whether a file is binary.
pub const BINARY_PROBE_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Latin1,
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Utf8 => "utf-8",
            Self::Utf8Bom => "utf-8-bom",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
            Self::Latin1 => "latin-1",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("binary content")]
    Binary,
    #[error("malformed {0} data")]
    Malformed(TextEncoding),
}

/// Decode `bytes` into text, reporting which encoding was used.
///
/// # Errors
///
/// [`DecodeError::Binary`] when a NUL byte appears in the probe window of a
/// file without a UTF-16 BOM, [`DecodeError::Malformed`] for a UTF-16 file
/// with an odd length or unpaired surrogates.
pub fn decode_source(bytes: &[u8]) -> Result<(String, TextEncoding), DecodeError> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return std::str::from_utf8(rest)
            .map(|s| (s.to_string(), TextEncoding::Utf8Bom))
            .or_else(|_| Ok((latin1(rest), TextEncoding::Latin1)));
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, TextEncoding::Utf16Le, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, TextEncoding::Utf16Be, u16::from_be_bytes);
    }
    if looks_binary(bytes) {
        return Err(DecodeError::Binary);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok((s.to_string(), TextEncoding::Utf8)),
        Err(_) => Ok((latin1(bytes), TextEncoding::Latin1)),
    }
}

/// NUL byte within the first [`BINARY_PROBE_LEN`] bytes.
#[must_use]
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_PROBE_LEN)].contains(&0)
}

fn decode_utf16(
    bytes: &[u8],
    encoding: TextEncoding,
    unit: fn([u8; 2]) -> u16,
) -> Result<(String, TextEncoding), DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::Malformed(encoding));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map(|s| (s, encoding))
        .map_err(|_| DecodeError::Malformed(encoding))
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
