// ============================================================================
// Value Codec
// ============================================================================
//
// Conversions between the caller's native representation (UTF-8 bytes and
// u64) and the provider's wire representation (UTF-16 strings and loosely
// typed variants).
//
// ============================================================================

use chrono::{DateTime, Utc};
use log::warn;

use super::value::Variant;
use super::{Result, StoreError};

/// FILETIME ticks (100ns since 1601-01-01) at the Unix epoch.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// An owned UTF-16 string, the provider's native text type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct WideString(Vec<u16>);

impl WideString {
    pub fn new(s: &str) -> Self {
        Self(s.encode_utf16().collect())
    }

    pub fn from_units(units: Vec<u16>) -> Self {
        Self(units)
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }

    /// Length in UTF-16 code units.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Narrow text; unpaired surrogates become U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

/// Convert caller bytes to a wire string.
///
/// The whole slice is converted; embedded NULs are kept. Bytes that are not
/// UTF-8 cannot be represented on the wire and produce a marshal error.
pub fn to_wide(bytes: &[u8]) -> Result<WideString> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        StoreError::Marshal(format!(
            "value of {} bytes is not valid UTF-8: {}",
            bytes.len(),
            e
        ))
    })?;
    Ok(WideString::new(text))
}

/// Convert a wire string back to caller bytes (UTF-8).
pub fn from_wide(wide: &WideString) -> Vec<u8> {
    wide.to_string_lossy().into_bytes()
}

/// Narrow `wide` into at most `max_bytes` bytes of UTF-8.
///
/// Used for fixed-size fields (interface name, MAC, address) where cutting
/// the value short is accepted. Truncation never splits a character.
pub fn bounded_narrow(wide: &WideString, max_bytes: usize) -> String {
    let full = wide.to_string_lossy();
    if full.len() <= max_bytes {
        return full;
    }

    let mut end = max_bytes;
    while !full.is_char_boundary(end) {
        end -= 1;
    }
    full[..end].to_string()
}

/// Decode a logically-u64 field from whatever wire type carried it.
///
/// Signed widths are reinterpreted as two's complement. Decimal text is
/// accepted because older providers return 64-bit values as strings.
/// Any other type (or unparsable text) decodes to `0` with a diagnostic.
pub fn variant_to_u64(value: &Variant) -> u64 {
    match value {
        Variant::I2(v) => *v as i64 as u64,
        Variant::I4(v) => *v as i64 as u64,
        Variant::I8(v) => *v as u64,
        Variant::UI2(v) => *v as u64,
        Variant::UI4(v) => *v as u64,
        Variant::UI8(v) => *v,
        Variant::Bstr(text) => {
            let text = text.to_string_lossy();
            parse_decimal_u64(&text).unwrap_or_else(|| {
                warn!("unparsable u64 text {:?}, using 0", text);
                0
            })
        }
        other => {
            warn!("bad u64 variant {}, using 0", other.type_name());
            0
        }
    }
}

fn parse_decimal_u64(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Escape `s` for use inside a double-quoted WQL string literal.
pub fn wql_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inverse of [`wql_quote`].
pub fn wql_unquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Convert FILETIME ticks to a UTC timestamp. Times before 1970 are `None`.
pub fn filetime_to_utc(ticks: u64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(FILETIME_UNIX_EPOCH)?;
    let secs = (since_epoch / FILETIME_TICKS_PER_SEC) as i64;
    let nanos = ((since_epoch % FILETIME_TICKS_PER_SEC) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Convert a UTC timestamp to FILETIME ticks.
pub fn utc_to_filetime(time: DateTime<Utc>) -> u64 {
    let secs = time.timestamp().max(0) as u64;
    let ticks = secs * FILETIME_TICKS_PER_SEC + (time.timestamp_subsec_nanos() / 100) as u64;
    ticks + FILETIME_UNIX_EPOCH
}
