//! Request path ("IOI") encoding for symbolic tag names.
//!
//! A tag name like `Recipe.Step[3].Active` becomes a sequence of CIP
//! logical segments: one ANSI-extended-symbol segment (`0x91`) per name
//! component, and one logical-segment (`0x28`/`0x29`) per numeric index.
//! Kept as small, independently testable pure functions in the style of
//! `rustradio::kiss::escape` rather than folded into the caller.

use crate::error::CipError;

/// One piece of a parsed tag name: either a symbolic segment (`Name`,
/// `.Member`) or an array index (`[3]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A symbolic name component, without the leading `.` separator.
    Name(String),
    /// A numeric array index.
    Index(u16),
}

/// Split a tag name into its name/index segments.
///
/// Grammar: `Name[.Member][`index`]*` where `index` is decimal.
/// `.` separates name components; `[` `]` bracket a decimal index
/// directly following the name it indexes.
pub fn parse_segments(name: &str) -> Result<Vec<PathSegment>, CipError> {
    let mut segments = Vec::new();
    let mut chars = name.char_indices().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, segments: &mut Vec<PathSegment>| {
        if !current.is_empty() {
            segments.push(PathSegment::Name(std::mem::take(current)));
        }
    };

    while let Some((_, c)) = chars.next() {
        match c {
            '.' => {
                flush(&mut current, &mut segments);
            }
            '[' => {
                flush(&mut current, &mut segments);
                let mut digits = String::new();
                for (_, c2) in chars.by_ref() {
                    if c2 == ']' {
                        break;
                    }
                    digits.push(c2);
                }
                let idx: u16 = digits.parse().map_err(|_| {
                    CipError::Resolver(format!("invalid array index '{digits}' in tag name '{name}'"))
                })?;
                segments.push(PathSegment::Index(idx));
            }
            _ => current.push(c),
        }
    }
    flush(&mut current, &mut segments);

    if segments.is_empty() {
        return Err(CipError::Resolver("empty tag name".to_string()));
    }
    Ok(segments)
}

/// Encode one symbolic name segment: `0x91, len, utf8-bytes[, pad]`.
fn encode_name_segment(out: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    out.push(0x91);
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    if bytes.len() % 2 != 0 {
        out.push(0x00);
    }
}

/// Encode one numeric index segment: `0x28, u8` if `<256`, else
/// `0x29, 0x00, u16 LE`.
fn encode_index_segment(out: &mut Vec<u8>, index: u16) {
    if index < 256 {
        out.push(0x28);
        out.push(index as u8);
    } else {
        out.push(0x29);
        out.push(0x00);
        out.extend_from_slice(&index.to_le_bytes());
    }
}

/// Build the full request path byte sequence for a tag name.
///
/// The result is always an even number of bytes; the
/// length-in-words field sent on the wire is `result.len() / 2`.
pub fn build_request_path(name: &str) -> Result<Vec<u8>, CipError> {
    let segments = parse_segments(name)?;
    let mut out = Vec::new();
    for segment in &segments {
        match segment {
            PathSegment::Name(n) => encode_name_segment(&mut out, n),
            PathSegment::Index(i) => encode_index_segment(&mut out, *i),
        }
    }
    debug_assert_eq!(out.len() % 2, 0, "request path must be an even length");
    Ok(out)
}

/// Parse an encoded request path back into its segments. Used by tests
/// and the mock-peer harness to verify what a request actually sent.
pub fn parse_request_path(mut data: &[u8]) -> Result<Vec<PathSegment>, CipError> {
    let mut segments = Vec::new();
    while !data.is_empty() {
        match data[0] {
            0x91 => {
                let len = *data
                    .get(1)
                    .ok_or_else(|| CipError::Resolver("truncated name segment".into()))?
                    as usize;
                let start = 2;
                let end = start + len;
                let name_bytes = data
                    .get(start..end)
                    .ok_or_else(|| CipError::Resolver("truncated name segment bytes".into()))?;
                let name = String::from_utf8(name_bytes.to_vec())
                    .map_err(|e| CipError::Resolver(format!("non-utf8 name segment: {e}")))?;
                segments.push(PathSegment::Name(name));
                let mut consumed = end;
                if len % 2 != 0 {
                    consumed += 1;
                }
                data = &data[consumed..];
            }
            0x28 => {
                let idx = *data
                    .get(1)
                    .ok_or_else(|| CipError::Resolver("truncated 8-bit index segment".into()))?;
                segments.push(PathSegment::Index(idx as u16));
                data = &data[2..];
            }
            0x29 => {
                let idx_bytes = data
                    .get(2..4)
                    .ok_or_else(|| CipError::Resolver("truncated 16-bit index segment".into()))?;
                segments.push(PathSegment::Index(u16::from_le_bytes(
                    idx_bytes.try_into().unwrap(),
                )));
                data = &data[4..];
            }
            other => {
                return Err(CipError::Resolver(format!(
                    "unrecognized request path segment tag 0x{other:02x}"
                )));
            }
        }
    }
    Ok(segments)
}
