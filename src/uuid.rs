//! Bluetooth UUIDs.
//!
//! Every service, characteristic and descriptor of a GATT application is keyed by a [`Uuid`].
//! BlueZ hands them to us as strings in any letter case; parsing normalizes them into a fixed
//! 16-Byte value so that lookups compare bytes, not text.

use core::fmt;
use std::str::FromStr;

/// A 128-bit UUID, identifying a Bluetooth service, characteristic or descriptor.
///
/// # Construction
///
/// This type can be constructed from a compile-time string via the [`Uuid::from_static`] function.
/// A [`FromStr`] implementation for fallible parsing is also provided; it accepts both the full
/// 36-character form and the 4-digit form of a Bluetooth SIG alias (eg. `180d`).
///
/// [`Uuid`]s can also be constructed from a 16-bit "alias" assigned by the Bluetooth SIG via the
/// [`Uuid::from_u16`] function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    const BASE: Self = Self::from_static("00000000-0000-1000-8000-00805f9b34fb");

    /// Byte offsets at which the canonical textual form has a `-`.
    const DASHES: [usize; 4] = [8, 13, 18, 23];

    const fn parse(s: &str) -> Result<Self, ParseUuidError> {
        let bytes = s.as_bytes();
        if bytes.len() == 4 {
            return Self::parse_alias(bytes);
        }
        if bytes.len() < 36 {
            return Err(ParseUuidError(ErrorKind::Eof));
        }
        if bytes.len() > 36 {
            return Err(ParseUuidError(ErrorKind::TrailingData));
        }

        let mut out = [0; 16];
        let mut i = 0;
        let mut n = 0;
        while i < bytes.len() {
            if i == Self::DASHES[0]
                || i == Self::DASHES[1]
                || i == Self::DASHES[2]
                || i == Self::DASHES[3]
            {
                if bytes[i] != b'-' {
                    return Err(ParseUuidError(ErrorKind::InvalidDash));
                }
                i += 1;
                continue;
            }

            let high = match nibble(bytes[i]) {
                Ok(v) => v,
                Err(e) => return Err(e),
            };
            let low = match nibble(bytes[i + 1]) {
                Ok(v) => v,
                Err(e) => return Err(e),
            };
            out[n] = (high << 4) | low;
            n += 1;
            i += 2;
        }

        Ok(Self(out))
    }

    const fn parse_alias(bytes: &[u8]) -> Result<Self, ParseUuidError> {
        let mut short: u16 = 0;
        let mut i = 0;
        while i < bytes.len() {
            match nibble(bytes[i]) {
                Ok(v) => short = (short << 4) | v as u16,
                Err(e) => return Err(e),
            }
            i += 1;
        }
        Ok(Self::from_u16(short))
    }

    /// Creates a [`Uuid`] from a static string, potentially at compile time.
    ///
    /// Panics if the string is invalid.
    ///
    /// This is typically the behavior you want when defining `const` [`Uuid`]s.
    pub const fn from_static(s: &'static str) -> Self {
        match Self::parse(s) {
            Ok(uuid) => uuid,
            Err(_) => panic!("malformed UUID"),
        }
    }

    /// Creates a [`Uuid`] from a 16-bit alias.
    pub const fn from_u16(short: u16) -> Self {
        let [hi, lo] = short.to_be_bytes();
        let mut uuid = Self::BASE;
        uuid.0[2] = hi;
        uuid.0[3] = lo;
        uuid
    }

    /// Creates a [`Uuid`] from its big-endian 128-bit integer representation.
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    /// Returns the 16-bit alias if this [`Uuid`] lives in the Bluetooth SIG base range.
    pub fn as_u16(&self) -> Option<u16> {
        let mut base = Self::BASE;
        base.0[2] = self.0[2];
        base.0[3] = self.0[3];
        if base == *self {
            Some(u16::from_be_bytes([self.0[2], self.0[3]]))
        } else {
            None
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

const fn nibble(digit: u8) -> Result<u8, ParseUuidError> {
    Ok(match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => return Err(ParseUuidError(ErrorKind::InvalidDigit)),
    })
}

impl FromStr for Uuid {
    type Err = ParseUuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Uuid`].
#[derive(Debug)]
pub struct ParseUuidError(ErrorKind);

#[derive(Debug)]
enum ErrorKind {
    Eof,
    InvalidDigit,
    InvalidDash,
    TrailingData,
}

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self.0 {
            ErrorKind::Eof => "unexpected end of input",
            ErrorKind::InvalidDigit => "invalid hex digit",
            ErrorKind::InvalidDash => "invalid character (`-` expected)",
            ErrorKind::TrailingData => "invalid trailing data",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ParseUuidError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        assert_eq!(
            Uuid::BASE.to_string(),
            "00000000-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn case_is_normalized() {
        let upper: Uuid = "00002A1C-0000-1000-8000-00805F9B34FB".parse().unwrap();
        let lower: Uuid = "00002a1c-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper, Uuid::from_u16(0x2a1c));
        assert_eq!(upper.as_u16(), Some(0x2a1c));
    }

    #[test]
    fn short_alias() {
        let uuid: Uuid = "180D".parse().unwrap();
        assert_eq!(uuid, Uuid::from_u16(0x180d));
    }

    #[test]
    fn vendor_uuid_has_no_alias() {
        let uuid = Uuid::from_static("7c9ac820-0886-4e50-bcca-588b883f8649");
        assert_eq!(uuid.as_u16(), None);
        assert_eq!(Uuid::from_u128(0x7c9ac820_0886_4e50_bcca_588b883f8649), uuid);
    }

    #[test]
    fn invalid() {
        "".parse::<Uuid>().unwrap_err();
        "18g0".parse::<Uuid>().unwrap_err();
        "00002a1c-0000-1000-8000-00805f9b34f".parse::<Uuid>().unwrap_err();
        "00002a1c-0000-1000-8000-00805f9b34fb0".parse::<Uuid>().unwrap_err();
        "00002a1c+0000-1000-8000-00805f9b34fb".parse::<Uuid>().unwrap_err();
    }
}
