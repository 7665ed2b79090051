//! The local GATT attribute tree served to remote centrals.
//!
//! An [`Application`] is a tree of [`Service`]s, [`Characteristic`]s and [`Descriptor`]s, built
//! by the caller before it is registered with BlueZ. Once registered, its shape is fixed and only
//! attribute values change. Requests from centrals are routed through a user-supplied
//! [`GattHandler`], which may validate or reject them before the tree is touched.

use std::{collections::HashMap, fmt};

use crate::{adapter::AdapterHandle, address::Address, transport::Request, uuid::Uuid, Error, Result};

bitflags::bitflags! {
    /// Operations a [`Characteristic`] supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_WITHOUT_RESPONSE = 1 << 2;
        const NOTIFY = 1 << 3;
        const INDICATE = 1 << 4;
    }
}

impl CharacteristicFlags {
    /// Returns the flag strings used by `org.bluez.GattCharacteristic1`.
    pub(crate) fn to_bluez(self) -> Vec<String> {
        let names = [
            (Self::READ, "read"),
            (Self::WRITE, "write"),
            (Self::WRITE_WITHOUT_RESPONSE, "write-without-response"),
            (Self::NOTIFY, "notify"),
            (Self::INDICATE, "indicate"),
        ];
        names
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name.to_string())
            .collect()
    }

    fn can_write(self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    fn can_subscribe(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

bitflags::bitflags! {
    /// Access permissions of a [`Descriptor`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl DescriptorFlags {
    /// Returns the flag strings used by `org.bluez.GattDescriptor1`.
    pub(crate) fn to_bluez(self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.contains(Self::READ) {
            flags.push("read".to_string());
        }
        if self.contains(Self::WRITE) {
            flags.push("write".to_string());
        }
        flags
    }
}

/// A protocol-level refusal sent back to the central that issued a request.
///
/// Returned by [`GattHandler`] callbacks to reject reads and writes; each variant maps onto one of
/// the `org.bluez.Error.*` names BlueZ translates into an ATT error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum GattError {
    Failed,
    InProgress,
    NotPermitted,
    NotAuthorized,
    InvalidOffset,
    InvalidValueLength,
    NotSupported,
}

impl GattError {
    /// The BlueZ error name (without the `org.bluez.Error.` prefix).
    pub fn name(&self) -> &'static str {
        match self {
            GattError::Failed => "Failed",
            GattError::InProgress => "InProgress",
            GattError::NotPermitted => "NotPermitted",
            GattError::NotAuthorized => "NotAuthorized",
            GattError::InvalidOffset => "InvalidOffset",
            GattError::InvalidValueLength => "InvalidValueLength",
            GattError::NotSupported => "NotSupported",
        }
    }
}

impl fmt::Display for GattError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A read request issued by a central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// The central that sent the request, if BlueZ told us.
    pub device: Option<Address>,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub mtu: u16,
    pub offset: u16,
}

/// A write request issued by a central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub device: Option<Address>,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub mtu: u16,
    pub offset: u16,
}

/// A descriptor attached to exactly one [`Characteristic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    uuid: Uuid,
    flags: DescriptorFlags,
    value: Vec<u8>,
}

impl Descriptor {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// A characteristic: a value plus the operations centrals may perform on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    uuid: Uuid,
    flags: CharacteristicFlags,
    value: Vec<u8>,
    descriptors: Keyed<Descriptor>,
    notifying: bool,
}

impl Characteristic {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn flags(&self) -> CharacteristicFlags {
        self.flags
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Returns `true` while a central is subscribed to notifications or indications.
    pub fn is_notifying(&self) -> bool {
        self.notifying
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter()
    }
}

/// A primary GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    uuid: Uuid,
    characteristics: Keyed<Characteristic>,
}

impl Service {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.characteristics.iter()
    }
}

/// Where an [`Application`] stands with the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

/// A GATT application: the attribute tree plus its registration state.
#[derive(Debug, Clone)]
pub struct Application {
    services: Keyed<Service>,
    state: RegistrationState,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    pub fn new() -> Self {
        Self {
            services: Keyed::default(),
            state: RegistrationState::Unregistered,
        }
    }

    /// Returns where the application stands with the daemon.
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Returns the services in the order they were added.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    /// Adds an empty primary service.
    ///
    /// Nothing is sent to BlueZ until the application is registered.
    pub fn add_service(&mut self, uuid: Uuid) -> Result<()> {
        self.ensure_unregistered()?;
        self.services.insert(
            uuid,
            Service {
                uuid,
                characteristics: Keyed::default(),
            },
        )
    }

    /// Adds a characteristic with an empty value to `service`.
    ///
    /// Fails with [`ErrorKind::UnknownService`][crate::ErrorKind::UnknownService] if the service
    /// does not exist, and with [`ErrorKind::DuplicateUuid`][crate::ErrorKind::DuplicateUuid] if
    /// the service already has a characteristic with this UUID.
    pub fn add_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        flags: CharacteristicFlags,
    ) -> Result<()> {
        self.ensure_unregistered()?;
        let s = self
            .services
            .get_mut(&service)
            .ok_or_else(|| Error::unknown_service(service))?;
        s.characteristics.insert(
            characteristic,
            Characteristic {
                uuid: characteristic,
                flags,
                value: Vec::new(),
                descriptors: Keyed::default(),
                notifying: false,
            },
        )
    }

    /// Adds a descriptor with an empty value to a characteristic.
    pub fn add_descriptor(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        flags: DescriptorFlags,
    ) -> Result<()> {
        self.ensure_unregistered()?;
        let c = self.characteristic_mut(service, characteristic)?;
        c.descriptors.insert(
            descriptor,
            Descriptor {
                uuid: descriptor,
                flags,
                value: Vec::new(),
            },
        )
    }

    /// Returns the characteristic `characteristic` of `service`.
    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<&Characteristic> {
        self.services
            .get(&service)
            .ok_or_else(|| Error::unknown_service(service))?
            .characteristics
            .get(&characteristic)
            .ok_or_else(|| Error::unknown_characteristic(service, characteristic))
    }

    fn characteristic_mut(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<&mut Characteristic> {
        self.services
            .get_mut(&service)
            .ok_or_else(|| Error::unknown_service(service))?
            .characteristics
            .get_mut(&characteristic)
            .ok_or_else(|| Error::unknown_characteristic(service, characteristic))
    }

    fn descriptor_mut(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<&mut Descriptor> {
        self.characteristic_mut(service, characteristic)?
            .descriptors
            .get_mut(&descriptor)
            .ok_or_else(|| Error::unknown_descriptor(characteristic, descriptor))
    }

    /// Returns the stored value of a characteristic.
    pub fn characteristic_value(&self, service: Uuid, characteristic: Uuid) -> Result<&[u8]> {
        Ok(&self.characteristic(service, characteristic)?.value)
    }

    /// Replaces the stored value of a characteristic without notifying anyone.
    ///
    /// This is how local data (eg. a fresh sensor sample) gets into the tree.
    pub fn set_characteristic_value(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.characteristic_mut(service, characteristic)?.value = value.into();
        Ok(())
    }

    /// Returns the stored value of a descriptor.
    pub fn descriptor_value(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<&[u8]> {
        self.characteristic(service, characteristic)?
            .descriptors
            .get(&descriptor)
            .map(|d| &*d.value)
            .ok_or_else(|| Error::unknown_descriptor(characteristic, descriptor))
    }

    /// Replaces the stored value of a descriptor.
    pub fn set_descriptor_value(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.descriptor_mut(service, characteristic, descriptor)?.value = value.into();
        Ok(())
    }

    /// Returns `true` while a central is subscribed to the characteristic.
    pub fn is_notifying(&self, service: Uuid, characteristic: Uuid) -> Result<bool> {
        Ok(self.characteristic(service, characteristic)?.notifying)
    }

    /// Replaces the value of a subscribed characteristic and queues a value-changed emission.
    pub(crate) fn notify(
        &mut self,
        adapter: &mut AdapterHandle<'_>,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<bool> {
        let c = self.characteristic_mut(service, characteristic)?;
        if !c.notifying {
            log::debug!("{} has no subscribers, not notifying", characteristic);
            return Ok(false);
        }

        c.value = value.into();
        adapter.submit(Request::Notify {
            service,
            characteristic,
            value: c.value.clone(),
        });
        Ok(true)
    }

    /// Registers the application with the daemon.
    ///
    /// The state becomes [`RegistrationState::Registering`] until the daemon acknowledges the
    /// call (see [`Application::registered`]).
    pub(crate) fn register(&mut self, adapter: &mut AdapterHandle<'_>) -> Result<()> {
        if self.state != RegistrationState::Unregistered {
            return Err(Error::already_registered("GATT application"));
        }

        log::debug!(
            "registering GATT application with {} service(s) on {}",
            self.services.len(),
            adapter.path()
        );
        self.state = RegistrationState::Registering;
        adapter.submit(Request::RegisterApplication {
            adapter: adapter.path().to_string(),
            services: self.services.iter().cloned().collect(),
        });
        Ok(())
    }

    /// Applies the daemon's answer to a registration call.
    ///
    /// A failed registration rolls the application back to [`RegistrationState::Unregistered`]
    /// and hands the error back to the caller.
    pub(crate) fn registered(&mut self, result: Result<()>) -> Result<()> {
        if self.state != RegistrationState::Registering {
            // Unregistered while the call was in flight.
            return Ok(());
        }
        match result {
            Ok(()) => {
                self.state = RegistrationState::Registered;
                Ok(())
            }
            Err(e) => {
                self.state = RegistrationState::Unregistered;
                Err(e)
            }
        }
    }

    /// Unregisters the application. Does nothing if it is not registered.
    pub(crate) fn unregister(&mut self, adapter: &mut AdapterHandle<'_>) {
        if self.state == RegistrationState::Unregistered {
            return;
        }
        adapter.submit(Request::UnregisterApplication {
            adapter: adapter.path().to_string(),
        });
        self.reset();
    }

    /// Forgets the registration without talking to the daemon (eg. after a power loss).
    pub(crate) fn reset(&mut self) {
        self.state = RegistrationState::Unregistered;
        for service in self.services.iter_mut() {
            for c in service.characteristics.iter_mut() {
                c.notifying = false;
            }
        }
    }

    fn ensure_unregistered(&self) -> Result<()> {
        match self.state {
            RegistrationState::Unregistered => Ok(()),
            _ => Err(Error::already_registered("GATT application")),
        }
    }

    /// Looks up a characteristic for a request coming from a central.
    fn checked(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        allowed: impl FnOnce(CharacteristicFlags) -> bool,
    ) -> Result<&mut Characteristic> {
        let c = self.characteristic_mut(service, characteristic)?;
        if !allowed(c.flags) {
            return Err(Error::from(GattError::NotPermitted));
        }
        Ok(c)
    }
}

/// Callbacks invoked for requests issued by centrals.
///
/// All methods run on the event loop and must return promptly. Every method has a default that
/// accepts the request, so implementors only override what they care about.
pub trait GattHandler {
    /// Called before a read is served.
    ///
    /// The callback may refresh the stored value via [`Gatt::set_characteristic_value`]; the
    /// (possibly updated) stored value is what the central receives. Returning an error rejects the
    /// read without touching the tree.
    fn on_read(
        &mut self,
        _gatt: &mut Gatt<'_>,
        _request: &ReadRequest,
    ) -> std::result::Result<(), GattError> {
        Ok(())
    }

    /// Validates a write. Only if this returns `Ok` is the value stored.
    fn on_write(
        &mut self,
        _gatt: &mut Gatt<'_>,
        _request: &WriteRequest,
    ) -> std::result::Result<(), GattError> {
        Ok(())
    }

    /// Called after an accepted write has been stored.
    fn on_updated(&mut self, _gatt: &mut Gatt<'_>, _service: Uuid, _characteristic: Uuid, _value: &[u8]) {}

    fn on_start_notify(&mut self, _gatt: &mut Gatt<'_>, _service: Uuid, _characteristic: Uuid) {}

    fn on_stop_notify(&mut self, _gatt: &mut Gatt<'_>, _service: Uuid, _characteristic: Uuid) {}

    fn on_descriptor_read(
        &mut self,
        _gatt: &mut Gatt<'_>,
        _request: &ReadRequest,
        _descriptor: Uuid,
    ) -> std::result::Result<(), GattError> {
        Ok(())
    }

    fn on_descriptor_write(
        &mut self,
        _gatt: &mut Gatt<'_>,
        _request: &WriteRequest,
        _descriptor: Uuid,
    ) -> std::result::Result<(), GattError> {
        Ok(())
    }
}

impl GattHandler for () {}

/// Access to the registered [`Application`] from inside a [`GattHandler`] callback.
pub struct Gatt<'a> {
    app: &'a mut Application,
    adapter: AdapterHandle<'a>,
}

impl<'a> Gatt<'a> {
    pub(crate) fn new(app: &'a mut Application, adapter: AdapterHandle<'a>) -> Self {
        Self { app, adapter }
    }

    pub fn application(&self) -> &Application {
        &*self.app
    }

    /// See [`Application::characteristic_value`].
    pub fn characteristic_value(&self, service: Uuid, characteristic: Uuid) -> Result<&[u8]> {
        self.app.characteristic_value(service, characteristic)
    }

    /// Replaces the stored value of a characteristic. Centrals see it on their next read.
    pub fn set_characteristic_value(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.app.set_characteristic_value(service, characteristic, value)
    }

    pub fn set_descriptor_value(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.app
            .set_descriptor_value(service, characteristic, descriptor, value)
    }

    /// Sends a value-changed notification for a characteristic.
    ///
    /// If no central is subscribed, this does nothing and returns `Ok(false)`; the stored value
    /// is left untouched. Otherwise the stored value is replaced and the notification is queued
    /// on the adapter, returning `Ok(true)`.
    pub fn notify(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<bool> {
        self.app
            .notify(&mut self.adapter, service, characteristic, value)
    }

    // Refusals come back as `ErrorKind::Rejected`, carrying the code sent to the central.

    pub(crate) fn serve_read(
        &mut self,
        handler: &mut dyn GattHandler,
        request: &ReadRequest,
    ) -> Result<Vec<u8>> {
        self.app.checked(request.service, request.characteristic, |f| {
            f.contains(CharacteristicFlags::READ)
        })?;
        handler.on_read(self, request).map_err(Error::from)?;
        let c = self.app.checked(request.service, request.characteristic, |_| true)?;
        slice_from(&c.value, request.offset).map_err(Error::from)
    }

    pub(crate) fn serve_write(
        &mut self,
        handler: &mut dyn GattHandler,
        request: &WriteRequest,
    ) -> Result<()> {
        let c = self.app.checked(request.service, request.characteristic, |f| {
            f.can_write()
        })?;
        if usize::from(request.offset) > c.value.len() {
            return Err(Error::from(GattError::InvalidOffset));
        }
        handler.on_write(self, request).map_err(Error::from)?;

        let c = self.app.checked(request.service, request.characteristic, |_| true)?;
        splice_at(&mut c.value, request.offset, &request.value).map_err(Error::from)?;
        let value = c.value.clone();
        handler.on_updated(self, request.service, request.characteristic, &value);
        Ok(())
    }

    /// Toggles the subscription state. Repeated subscribe or unsubscribe calls are harmless and
    /// only the first of each invokes the callback.
    pub(crate) fn serve_subscription(
        &mut self,
        handler: &mut dyn GattHandler,
        service: Uuid,
        characteristic: Uuid,
        subscribe: bool,
    ) -> Result<()> {
        let c = self
            .app
            .checked(service, characteristic, |f| f.can_subscribe())?;
        if c.notifying == subscribe {
            return Ok(());
        }
        c.notifying = subscribe;
        if subscribe {
            handler.on_start_notify(self, service, characteristic);
        } else {
            handler.on_stop_notify(self, service, characteristic);
        }
        Ok(())
    }

    pub(crate) fn serve_descriptor_read(
        &mut self,
        handler: &mut dyn GattHandler,
        request: &ReadRequest,
        descriptor: Uuid,
    ) -> Result<Vec<u8>> {
        self.descriptor_checked(request.service, request.characteristic, descriptor, DescriptorFlags::READ)?;
        handler
            .on_descriptor_read(self, request, descriptor)
            .map_err(Error::from)?;
        let d = self.descriptor_checked(request.service, request.characteristic, descriptor, DescriptorFlags::empty())?;
        slice_from(&d.value, request.offset).map_err(Error::from)
    }

    pub(crate) fn serve_descriptor_write(
        &mut self,
        handler: &mut dyn GattHandler,
        request: &WriteRequest,
        descriptor: Uuid,
    ) -> Result<()> {
        let d = self.descriptor_checked(request.service, request.characteristic, descriptor, DescriptorFlags::WRITE)?;
        if usize::from(request.offset) > d.value.len() {
            return Err(Error::from(GattError::InvalidOffset));
        }
        handler
            .on_descriptor_write(self, request, descriptor)
            .map_err(Error::from)?;
        let d = self.descriptor_checked(request.service, request.characteristic, descriptor, DescriptorFlags::empty())?;
        splice_at(&mut d.value, request.offset, &request.value).map_err(Error::from)
    }

    fn descriptor_checked(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        needed: DescriptorFlags,
    ) -> Result<&mut Descriptor> {
        let d = self.app.descriptor_mut(service, characteristic, descriptor)?;
        if !d.flags.contains(needed) {
            return Err(Error::from(GattError::NotPermitted));
        }
        Ok(d)
    }
}

fn slice_from(value: &[u8], offset: u16) -> std::result::Result<Vec<u8>, GattError> {
    value
        .get(usize::from(offset)..)
        .map(<[u8]>::to_vec)
        .ok_or(GattError::InvalidOffset)
}

fn splice_at(value: &mut Vec<u8>, offset: u16, data: &[u8]) -> std::result::Result<(), GattError> {
    let offset = usize::from(offset);
    if offset > value.len() {
        return Err(GattError::InvalidOffset);
    }
    value.truncate(offset);
    value.extend_from_slice(data);
    Ok(())
}

/// An insertion-ordered collection keyed by [`Uuid`].
///
/// Order matters because it determines the object paths handed to BlueZ.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Keyed<T> {
    items: Vec<T>,
    index: HashMap<Uuid, usize>,
}

impl<T> Default for Keyed<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Keyed<T> {
    fn insert(&mut self, uuid: Uuid, item: T) -> Result<()> {
        if self.index.contains_key(&uuid) {
            return Err(Error::duplicate(uuid));
        }
        self.index.insert(uuid, self.items.len());
        self.items.push(item);
        Ok(())
    }

    fn get(&self, uuid: &Uuid) -> Option<&T> {
        self.index.get(uuid).map(|&i| &self.items[i])
    }

    fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut T> {
        self.index.get(uuid).map(|&i| &mut self.items[i])
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }
}
