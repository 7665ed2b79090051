//! Bluetooth device addresses.
//!
//! The address of a remote central is the stable key of the device directory kept by an
//! [`Adapter`][crate::adapter::Adapter]. BlueZ exposes it twice: as the `Address` property of a
//! `org.bluez.Device1` object, and encoded in the object path (`.../dev_AA_BB_CC_DD_EE_FF`).

use core::fmt;
use std::{fmt::Write, num::ParseIntError, str::FromStr};

/// Describes the meaning of the bytes in an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressType {
    /// Address follows the MAC address standard.
    Public,
    /// Address is randomly generated (static, or a resolvable/non-resolvable private address).
    Random,
}

impl AddressType {
    pub(crate) fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "public" => Ok(Self::Public),
            "random" => Ok(Self::Random),
            _ => Err(crate::Error::invalid(format!("invalid address type '{}'", s))),
        }
    }
}

/// A 6-Byte Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 6]);

impl Address {
    const PATH_PREFIX: &'static str = "dev_";

    #[inline]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Extracts the address from the last segment of a BlueZ device object path.
    ///
    /// Example: `/org/bluez/hci0/dev_AA_BB_CC_11_22_33`
    pub fn from_device_path(path: &str) -> Result<Self, ParseAddressError> {
        let segment = path.rsplit('/').next().unwrap_or(path);
        let hex = segment
            .strip_prefix(Self::PATH_PREFIX)
            .ok_or_else(ParseAddressError::other)?;
        Self::parse_with(hex, '_')
    }

    /// Returns the object path segment BlueZ uses for a device with this address.
    pub fn path_segment(&self) -> String {
        let mut s = String::from(Self::PATH_PREFIX);
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                s.push('_');
            }
            // Writing into a `String` cannot fail.
            let _ = write!(s, "{:02X}", byte);
        }
        s
    }

    fn parse_with(s: &str, separator: char) -> Result<Self, ParseAddressError> {
        let mut bytes = [0; 6];
        let mut parts = s.split(separator);
        for byte in &mut bytes {
            let part = parts.next().ok_or_else(ParseAddressError::other)?;
            if part.len() != 2 {
                return Err(ParseAddressError::other());
            }
            *byte = u8::from_str_radix(part, 16).map_err(ParseAddressError::parse_int)?;
        }
        if parts.next().is_some() {
            return Err(ParseAddressError::other());
        }
        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl From<Address> for [u8; 6] {
    #[inline]
    fn from(value: Address) -> Self {
        value.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_char(':')?;
            }

            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

/// Parses a Bluetooth [`Address`] from a colon-separated hex string.
///
/// Example: `aa:ff:00:33:22:11`
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with(s, ':')
    }
}

/// The error type returned when parsing an [`Address`] fails.
#[derive(Debug)]
pub struct ParseAddressError(ParseAddressErrorKind);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ParseAddressErrorKind::ParseInt(e) => e.fmt(f),
            ParseAddressErrorKind::Other => f.write_str("invalid device address"),
        }
    }
}

impl std::error::Error for ParseAddressError {}

#[derive(Debug)]
enum ParseAddressErrorKind {
    ParseInt(ParseIntError),
    Other,
}

impl ParseAddressError {
    fn parse_int(e: ParseIntError) -> Self {
        Self(ParseAddressErrorKind::ParseInt(e))
    }

    fn other() -> Self {
        Self(ParseAddressErrorKind::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let s = "AA:BB:CC:11:22:33";
        let addr = Address::from_str(s).unwrap();
        assert_eq!(addr.to_string(), s);
    }

    #[test]
    fn invalid() {
        Address::from_str("").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:3").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:333").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33:44").unwrap_err();
        Address::from_str("aa:bb:cc:11:22:33 ").unwrap_err();
        Address::from_str("za:bb:cc:11:22:33").unwrap_err();
    }

    #[test]
    fn device_path() {
        let addr = Address::from_device_path("/org/bluez/hci0/dev_AA_BB_CC_11_22_33").unwrap();
        assert_eq!(addr, "aa:bb:cc:11:22:33".parse().unwrap());
        assert_eq!(addr.path_segment(), "dev_AA_BB_CC_11_22_33");

        Address::from_device_path("/org/bluez/hci0").unwrap_err();
        Address::from_device_path("/org/bluez/hci0/dev_AA_BB_CC_11_22").unwrap_err();
    }
}
