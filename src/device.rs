//! Remote centrals known to an adapter.
//!
//! A [`Device`] holds no connection to the daemon. It is a record of the last state BlueZ reported
//! for one remote address, updated from `org.bluez.Device1` property changes.

use core::fmt;

use crate::address::{Address, AddressType};

/// Link state of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Only entered through a local connection attempt, which a peripheral never makes; kept so
    /// the state set matches the daemon's model.
    Connecting,
    Connected,
    /// A local disconnect request is pending daemon confirmation.
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        })
    }
}

/// A connection state change, as reported to
/// [`PeripheralObserver::on_central_state_changed`][crate::peripheral::PeripheralObserver::on_central_state_changed].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Identifies a [`Device`] property by its `org.bluez.Device1` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PropertyName {
    Name,
    Alias,
    AddressType,
    Connected,
    Paired,
    Bonded,
    Trusted,
}

impl PropertyName {
    pub(crate) fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "Name" => Self::Name,
            "Alias" => Self::Alias,
            "AddressType" => Self::AddressType,
            "Connected" => Self::Connected,
            "Paired" => Self::Paired,
            "Bonded" => Self::Bonded,
            "Trusted" => Self::Trusted,
            _ => return None,
        })
    }
}

/// A partial set of device properties. `None` means "not part of this update".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub address_type: Option<AddressType>,
    pub connected: Option<bool>,
    pub paired: Option<bool>,
    pub bonded: Option<bool>,
    pub trusted: Option<bool>,
}

impl DeviceProperties {
    pub fn connected(connected: bool) -> Self {
        Self {
            connected: Some(connected),
            ..Self::default()
        }
    }
}

/// The last known state of a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    address: Address,
    address_type: Option<AddressType>,
    name: Option<String>,
    alias: Option<String>,
    connection_state: ConnectionState,
    paired: bool,
    bonded: bool,
    trusted: bool,
}

impl Device {
    pub(crate) fn new(address: Address) -> Self {
        Self {
            address,
            address_type: None,
            name: None,
            alias: None,
            connection_state: ConnectionState::Disconnected,
            paired: false,
            bonded: false,
            trusted: false,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn address_type(&self) -> Option<AddressType> {
        self.address_type
    }

    /// Returns the remote name, falling back to the alias BlueZ assigned.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().or(self.alias.as_deref())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    /// Whether the daemon holds long-term keys for this device. Older BlueZ versions only report
    /// `Paired`, which is taken to imply a bond.
    pub fn is_bonded(&self) -> bool {
        self.bonded
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Merges a property update and returns the connection transition it caused, if any.
    pub(crate) fn apply(&mut self, props: &DeviceProperties) -> Option<Transition> {
        if let Some(name) = &props.name {
            self.name = Some(name.clone());
        }
        if let Some(alias) = &props.alias {
            self.alias = Some(alias.clone());
        }
        if let Some(ty) = props.address_type {
            self.address_type = Some(ty);
        }
        if let Some(paired) = props.paired {
            self.paired = paired;
            if props.bonded.is_none() {
                self.bonded = paired;
            }
        }
        if let Some(bonded) = props.bonded {
            self.bonded = bonded;
        }
        if let Some(trusted) = props.trusted {
            self.trusted = trusted;
        }

        let connected = props.connected?;
        let to = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(to)
    }

    /// Moves to [`ConnectionState::Disconnecting`] ahead of the daemon's confirmation.
    pub(crate) fn begin_disconnect(&mut self) -> Option<Transition> {
        match self.connection_state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                self.set_state(ConnectionState::Disconnecting)
            }
            _ => None,
        }
    }

    /// A disconnect request failed; the link is still up unless the daemon said otherwise since.
    pub(crate) fn abort_disconnect(&mut self) -> Option<Transition> {
        if self.connection_state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Connected)
        } else {
            None
        }
    }

    fn set_state(&mut self, to: ConnectionState) -> Option<Transition> {
        let from = self.connection_state;
        if from == to {
            return None;
        }
        self.connection_state = to;
        Some(Transition { from, to })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device{{address={}, name={}, state={}, paired={}, bonded={}, trusted={}}}",
            self.address,
            self.name().unwrap_or("-"),
            self.connection_state,
            self.paired,
            self.bonded,
            self.trusted,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("AA:BB:CC:11:22:33".parse().unwrap())
    }

    #[test]
    fn connect_disconnect_transitions() {
        let mut dev = device();
        assert_eq!(dev.connection_state(), ConnectionState::Disconnected);

        let t = dev.apply(&DeviceProperties::connected(true)).unwrap();
        assert_eq!(
            t,
            Transition {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Connected
            }
        );
        assert_eq!(dev.apply(&DeviceProperties::connected(true)), None);

        let t = dev.apply(&DeviceProperties::connected(false)).unwrap();
        assert_eq!(t.to, ConnectionState::Disconnected);
    }

    #[test]
    fn unrelated_updates_do_not_transition() {
        let mut dev = device();
        let props = DeviceProperties {
            name: Some("central-1".into()),
            paired: Some(true),
            ..Default::default()
        };
        assert_eq!(dev.apply(&props), None);
        assert_eq!(dev.name(), Some("central-1"));
        assert!(dev.is_paired());
        assert!(dev.is_bonded());
    }

    #[test]
    fn local_disconnect() {
        let mut dev = device();
        assert_eq!(dev.begin_disconnect(), None);

        dev.apply(&DeviceProperties::connected(true));
        assert_eq!(
            dev.begin_disconnect().map(|t| t.to),
            Some(ConnectionState::Disconnecting)
        );
        assert_eq!(
            dev.abort_disconnect().map(|t| t.to),
            Some(ConnectionState::Connected)
        );

        dev.begin_disconnect();
        let t = dev.apply(&DeviceProperties::connected(false)).unwrap();
        assert_eq!(t.from, ConnectionState::Disconnecting);
        assert_eq!(t.to, ConnectionState::Disconnected);
    }

    #[test]
    fn alias_is_a_name_fallback() {
        let mut dev = device();
        dev.apply(&DeviceProperties {
            alias: Some("AA-BB-CC-11-22-33".into()),
            ..Default::default()
        });
        assert_eq!(dev.name(), Some("AA-BB-CC-11-22-33"));
        assert_eq!(PropertyName::from_str("Connected"), Some(PropertyName::Connected));
        assert_eq!(PropertyName::from_str("RSSI"), None);
    }
}
