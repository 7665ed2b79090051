use std::fmt;

use crate::{address::ParseAddressError, gatt::GattError, uuid::ParseUuidError, uuid::Uuid};

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type used throughout this library.
#[derive(Debug)]
pub struct Error {
    inner: Repr,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No service with the requested UUID exists in the application.
    UnknownService,
    /// No characteristic with the requested UUID exists in the given service.
    UnknownCharacteristic,
    /// No descriptor with the requested UUID exists on the given characteristic.
    UnknownDescriptor,
    /// An attribute with this UUID already exists at that level of the tree.
    DuplicateUuid,
    /// The operation needs a powered adapter.
    AdapterNotPowered,
    /// The object is already registered with the daemon.
    AlreadyRegistered,
    /// A D-Bus call failed or the connection is gone.
    TransportFailure,
    /// A GATT request was refused, by a user callback or by the attribute's permissions.
    Rejected,
    /// A value received from the daemon could not be interpreted.
    InvalidArgument,
    /// Anything else.
    Other,
}

impl Error {
    pub(crate) fn from(e: impl Into<Repr>) -> Self {
        Self { inner: e.into() }
    }

    /// Creates a [`ErrorKind::TransportFailure`] error from a message.
    ///
    /// Useful for [`Transport`][crate::transport::Transport] implementations that do not talk to
    /// D-Bus directly.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::from(Repr::Transport(msg.into()))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::from(Repr::Invalid(msg.into()))
    }

    pub(crate) fn unknown_service(service: Uuid) -> Self {
        Self::from(Repr::UnknownService(service))
    }

    pub(crate) fn unknown_characteristic(service: Uuid, characteristic: Uuid) -> Self {
        Self::from(Repr::UnknownCharacteristic(service, characteristic))
    }

    pub(crate) fn unknown_descriptor(characteristic: Uuid, descriptor: Uuid) -> Self {
        Self::from(Repr::UnknownDescriptor(characteristic, descriptor))
    }

    pub(crate) fn duplicate(uuid: Uuid) -> Self {
        Self::from(Repr::DuplicateUuid(uuid))
    }

    pub(crate) fn not_powered(adapter: &str) -> Self {
        Self::from(Repr::AdapterNotPowered(adapter.to_string()))
    }

    pub(crate) fn already_registered(what: &'static str) -> Self {
        Self::from(Repr::AlreadyRegistered(what))
    }

    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            Repr::UnknownService(_) => ErrorKind::UnknownService,
            Repr::UnknownCharacteristic(..) => ErrorKind::UnknownCharacteristic,
            Repr::UnknownDescriptor(..) => ErrorKind::UnknownDescriptor,
            Repr::DuplicateUuid(_) => ErrorKind::DuplicateUuid,
            Repr::AdapterNotPowered(_) => ErrorKind::AdapterNotPowered,
            Repr::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            Repr::Zbus(_) | Repr::Fdo(_) | Repr::Transport(_) => ErrorKind::TransportFailure,
            Repr::Rejected(_) => ErrorKind::Rejected,
            Repr::ParseAddressError(_) | Repr::ParseUuidError(_) | Repr::Invalid(_) => {
                ErrorKind::InvalidArgument
            }
            Repr::Other(_) => ErrorKind::Other,
        }
    }

    /// Returns the GATT refusal carried by a [`ErrorKind::Rejected`] error.
    pub fn rejection(&self) -> Option<GattError> {
        match &self.inner {
            Repr::Rejected(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Repr::UnknownService(s) => write!(f, "unknown service {}", s),
            Repr::UnknownCharacteristic(s, c) => {
                write!(f, "unknown characteristic {} in service {}", c, s)
            }
            Repr::UnknownDescriptor(c, d) => {
                write!(f, "unknown descriptor {} on characteristic {}", d, c)
            }
            Repr::DuplicateUuid(u) => write!(f, "duplicate UUID {}", u),
            Repr::AdapterNotPowered(a) => write!(f, "adapter {} is not powered", a),
            Repr::AlreadyRegistered(what) => write!(f, "{} is already registered", what),
            Repr::Zbus(e) => e.fmt(f),
            Repr::Fdo(e) => e.fmt(f),
            Repr::Transport(e) => f.write_str(e),
            Repr::Rejected(e) => write!(f, "request rejected: {}", e),
            Repr::ParseAddressError(e) => e.fmt(f),
            Repr::ParseUuidError(e) => e.fmt(f),
            Repr::Invalid(e) => f.write_str(e),
            Repr::Other(e) => f.write_str(e),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug)]
pub(crate) enum Repr {
    UnknownService(Uuid),
    UnknownCharacteristic(Uuid, Uuid),
    UnknownDescriptor(Uuid, Uuid),
    DuplicateUuid(Uuid),
    AdapterNotPowered(String),
    AlreadyRegistered(&'static str),
    Zbus(zbus::Error),
    Fdo(zbus::fdo::Error),
    Transport(String),
    Rejected(GattError),
    ParseAddressError(ParseAddressError),
    ParseUuidError(ParseUuidError),
    Invalid(String),
    Other(String),
}

impl From<zbus::Error> for Repr {
    fn from(value: zbus::Error) -> Self {
        Self::Zbus(value)
    }
}

impl From<zbus::fdo::Error> for Repr {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<zbus::zvariant::Error> for Repr {
    fn from(value: zbus::zvariant::Error) -> Self {
        Self::Zbus(zbus::Error::Variant(value))
    }
}

impl From<GattError> for Repr {
    fn from(value: GattError) -> Self {
        Self::Rejected(value)
    }
}

impl From<ParseAddressError> for Repr {
    fn from(value: ParseAddressError) -> Self {
        Self::ParseAddressError(value)
    }
}

impl From<ParseUuidError> for Repr {
    fn from(value: ParseUuidError) -> Self {
        Self::ParseUuidError(value)
    }
}

impl From<String> for Repr {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for Repr {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let uuid = Uuid::from_u16(0x180d);
        assert_eq!(Error::duplicate(uuid).kind(), ErrorKind::DuplicateUuid);
        assert_eq!(Error::transport("gone").kind(), ErrorKind::TransportFailure);
        assert_eq!(Error::from("no adapter found").kind(), ErrorKind::Other);

        let rejected = Error::from(GattError::NotPermitted);
        assert_eq!(rejected.kind(), ErrorKind::Rejected);
        assert_eq!(rejected.rejection(), Some(GattError::NotPermitted));
    }

    #[test]
    fn display_names_the_attribute() {
        let s = Uuid::from_u16(0x1809);
        let c = Uuid::from_u16(0x2a1c);
        let msg = Error::unknown_characteristic(s, c).to_string();
        assert!(msg.contains("00002a1c-0000-1000-8000-00805f9b34fb"));
        assert!(msg.contains("00001809-0000-1000-8000-00805f9b34fb"));
    }
}
