//! Objects this process serves to BlueZ: the GATT application tree, the advertisement, and the
//! pairing agent.
//!
//! None of these objects hold peripheral state. Every daemon call is forwarded as an [`Event`] to
//! the session loop and answered once the loop has handled it.

use std::collections::HashMap;

use futures_channel::mpsc::UnboundedSender;
use zbus::{
    dbus_interface,
    fdo::ObjectManager,
    zvariant::{DeserializeDict, OwnedObjectPath, Type, Value},
    Connection, DBusError,
};

use crate::{
    address::Address,
    advertisement,
    agent::Capability,
    event::{Event, Responder},
    gatt::{self, GattError, ReadRequest, WriteRequest},
    uuid::Uuid,
    Error, Result,
};

const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

/// Errors returned to BlueZ, which turns them into ATT error codes or pairing failures.
#[derive(Debug, DBusError)]
#[dbus_error(prefix = "org.bluez.Error")]
pub(crate) enum BluezError {
    #[dbus_error(zbus_error)]
    ZBus(zbus::Error),
    Failed(String),
    InProgress(String),
    NotPermitted(String),
    NotAuthorized(String),
    InvalidOffset(String),
    InvalidValueLength(String),
    NotSupported(String),
    Rejected(String),
    Canceled(String),
}

impl From<GattError> for BluezError {
    fn from(e: GattError) -> Self {
        let msg = e.to_string();
        match e {
            GattError::Failed => BluezError::Failed(msg),
            GattError::InProgress => BluezError::InProgress(msg),
            GattError::NotPermitted => BluezError::NotPermitted(msg),
            GattError::NotAuthorized => BluezError::NotAuthorized(msg),
            GattError::InvalidOffset => BluezError::InvalidOffset(msg),
            GattError::InvalidValueLength => BluezError::InvalidValueLength(msg),
            GattError::NotSupported => BluezError::NotSupported(msg),
        }
    }
}

/// Sends an event to the session loop and waits for its answer.
///
/// Returns `None` if the loop is gone or dropped the request unanswered.
async fn ask<T>(
    events: &UnboundedSender<Event>,
    make: impl FnOnce(Responder<T>) -> Event,
) -> Option<T> {
    let (responder, answer) = Responder::new();
    if events.unbounded_send(make(responder)).is_err() {
        log::warn!("dropping daemon call: peripheral is not running");
        return None;
    }
    answer.await.ok()
}

fn gatt_reply<T>(answer: Option<std::result::Result<T, GattError>>) -> std::result::Result<T, BluezError> {
    match answer {
        Some(res) => res.map_err(BluezError::from),
        None => Err(BluezError::Failed("request not handled".into())),
    }
}

fn device_address(device: &Option<OwnedObjectPath>) -> Option<Address> {
    let path = device.as_ref()?;
    match Address::from_device_path(path.as_str()) {
        Ok(addr) => Some(addr),
        Err(e) => {
            log::debug!("unexpected device path {}: {}", path.as_str(), e);
            None
        }
    }
}

#[derive(Debug, Default, DeserializeDict, Type)]
#[zvariant(signature = "dict")]
struct ReadOptions {
    offset: Option<u16>,
    mtu: Option<u16>,
    device: Option<OwnedObjectPath>,
}

impl ReadOptions {
    fn into_request(self, service: Uuid, characteristic: Uuid) -> ReadRequest {
        ReadRequest {
            device: device_address(&self.device),
            service,
            characteristic,
            mtu: self.mtu.unwrap_or(23),
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Default, DeserializeDict, Type)]
#[zvariant(signature = "dict")]
struct WriteOptions {
    offset: Option<u16>,
    mtu: Option<u16>,
    device: Option<OwnedObjectPath>,
    /// `command`, `request`, `reliable`
    #[zvariant(rename = "type")]
    ty: Option<String>,
    #[zvariant(rename = "prepare-authorize")]
    prepare_authorize: Option<bool>,
}

impl WriteOptions {
    fn into_request(self, service: Uuid, characteristic: Uuid, value: Vec<u8>) -> WriteRequest {
        WriteRequest {
            device: device_address(&self.device),
            service,
            characteristic,
            value,
            mtu: self.mtu.unwrap_or(23),
            offset: self.offset.unwrap_or(0),
        }
    }
}

struct Service {
    uuid: Uuid,
}

#[dbus_interface(name = "org.bluez.GattService1")]
impl Service {
    #[dbus_interface(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.to_string()
    }

    #[dbus_interface(property)]
    fn primary(&self) -> bool {
        true
    }
}

struct Characteristic {
    service: Uuid,
    uuid: Uuid,
    flags: Vec<String>,
    service_path: OwnedObjectPath,
    events: UnboundedSender<Event>,
}

#[dbus_interface(name = "org.bluez.GattCharacteristic1")]
impl Characteristic {
    async fn read_value(&self, options: ReadOptions) -> std::result::Result<Vec<u8>, BluezError> {
        let request = options.into_request(self.service, self.uuid);
        gatt_reply(ask(&self.events, |responder| Event::CharacteristicRead { request, responder }).await)
    }

    async fn write_value(
        &self,
        value: Vec<u8>,
        options: WriteOptions,
    ) -> std::result::Result<(), BluezError> {
        if options.prepare_authorize == Some(true) {
            // Only asks whether a prepared write would be allowed; the data arrives later.
            return Ok(());
        }
        log::trace!("write ({:?}) to {}", options.ty, self.uuid);
        let request = options.into_request(self.service, self.uuid, value);
        gatt_reply(ask(&self.events, |responder| Event::CharacteristicWrite { request, responder }).await)
    }

    async fn start_notify(&self) -> std::result::Result<(), BluezError> {
        self.subscription(true).await
    }

    async fn stop_notify(&self) -> std::result::Result<(), BluezError> {
        self.subscription(false).await
    }

    /// Acknowledgement of an indication. BlueZ expects the method to exist; there is nothing to
    /// do with it.
    fn confirm(&self) {
        log::trace!("{} indication confirmed", self.uuid);
    }

    #[dbus_interface(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.to_string()
    }

    #[dbus_interface(property)]
    fn service(&self) -> OwnedObjectPath {
        self.service_path.clone()
    }

    #[dbus_interface(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }
}

impl Characteristic {
    async fn subscription(&self, subscribed: bool) -> std::result::Result<(), BluezError> {
        let (service, characteristic) = (self.service, self.uuid);
        gatt_reply(
            ask(&self.events, |responder| Event::NotifySubscriptionChanged {
                service,
                characteristic,
                subscribed,
                responder,
            })
            .await,
        )
    }
}

struct Descriptor {
    service: Uuid,
    characteristic: Uuid,
    uuid: Uuid,
    flags: Vec<String>,
    characteristic_path: OwnedObjectPath,
    events: UnboundedSender<Event>,
}

#[dbus_interface(name = "org.bluez.GattDescriptor1")]
impl Descriptor {
    async fn read_value(&self, options: ReadOptions) -> std::result::Result<Vec<u8>, BluezError> {
        let request = options.into_request(self.service, self.characteristic);
        let descriptor = self.uuid;
        gatt_reply(
            ask(&self.events, |responder| Event::DescriptorRead {
                request,
                descriptor,
                responder,
            })
            .await,
        )
    }

    async fn write_value(
        &self,
        value: Vec<u8>,
        options: WriteOptions,
    ) -> std::result::Result<(), BluezError> {
        if options.prepare_authorize == Some(true) {
            return Ok(());
        }
        let request = options.into_request(self.service, self.characteristic, value);
        let descriptor = self.uuid;
        gatt_reply(
            ask(&self.events, |responder| Event::DescriptorWrite {
                request,
                descriptor,
                responder,
            })
            .await,
        )
    }

    #[dbus_interface(property, name = "UUID")]
    fn uuid(&self) -> String {
        self.uuid.to_string()
    }

    #[dbus_interface(property)]
    fn characteristic(&self) -> OwnedObjectPath {
        self.characteristic_path.clone()
    }

    #[dbus_interface(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }
}

struct Advertisement {
    advertisement: advertisement::Advertisement,
    events: UnboundedSender<Event>,
}

#[dbus_interface(name = "org.bluez.LEAdvertisement1")]
impl Advertisement {
    fn release(&self) {
        log::debug!("advertisement released by the daemon");
        self.events.unbounded_send(Event::AdvertisementReleased).ok();
    }

    #[dbus_interface(property, name = "Type")]
    fn kind(&self) -> String {
        "peripheral".into()
    }

    #[dbus_interface(property)]
    fn local_name(&self) -> String {
        self.advertisement.name().unwrap_or_default().to_string()
    }

    #[dbus_interface(property, name = "ServiceUUIDs")]
    fn service_uuids(&self) -> Vec<String> {
        self.advertisement
            .service_uuids()
            .iter()
            .map(Uuid::to_string)
            .collect()
    }

    #[dbus_interface(property)]
    fn discoverable(&self) -> bool {
        true
    }

    /// 127 lets the controller pick.
    #[dbus_interface(property)]
    fn tx_power(&self) -> i16 {
        self.advertisement.power().unwrap_or(127)
    }

    #[dbus_interface(property)]
    fn min_interval(&self) -> u32 {
        self.interval().0
    }

    #[dbus_interface(property)]
    fn max_interval(&self) -> u32 {
        self.interval().1
    }

    #[dbus_interface(property)]
    fn secondary_channel(&self) -> String {
        self.advertisement
            .channel()
            .map_or("1M", advertisement::SecondaryChannel::to_bluez)
            .to_string()
    }
}

impl Advertisement {
    /// Interval bounds in milliseconds.
    fn interval(&self) -> (u32, u32) {
        let millis = |d: std::time::Duration| u32::try_from(d.as_millis()).unwrap_or(u32::MAX);
        match self.advertisement.interval_range() {
            Some((min, max)) => (millis(min), millis(max)),
            None => (100, 100),
        }
    }
}

struct Agent {
    events: UnboundedSender<Event>,
}

impl Agent {
    fn address(device: &OwnedObjectPath) -> std::result::Result<Address, BluezError> {
        Address::from_device_path(device.as_str())
            .map_err(|e| BluezError::Rejected(format!("unexpected device path: {}", e)))
    }

    fn accept(answer: Option<bool>) -> std::result::Result<(), BluezError> {
        match answer {
            Some(true) => Ok(()),
            Some(false) => Err(BluezError::Rejected("rejected by user".into())),
            None => Err(BluezError::Canceled("no answer".into())),
        }
    }
}

#[dbus_interface(name = "org.bluez.Agent1")]
impl Agent {
    fn release(&self) {
        self.events.unbounded_send(Event::AgentReleased).ok();
    }

    fn request_pin_code(&self, _device: OwnedObjectPath) -> std::result::Result<String, BluezError> {
        Err(BluezError::Rejected("legacy PIN pairing is not supported".into()))
    }

    fn display_pin_code(
        &self,
        _device: OwnedObjectPath,
        _pincode: String,
    ) -> std::result::Result<(), BluezError> {
        Err(BluezError::Rejected("legacy PIN pairing is not supported".into()))
    }

    async fn request_passkey(&self, device: OwnedObjectPath) -> std::result::Result<u32, BluezError> {
        let device = Self::address(&device)?;
        match ask(&self.events, |responder| Event::RequestPasskey { device, responder }).await {
            Some(Some(passkey)) => Ok(passkey),
            Some(None) => Err(BluezError::Rejected("no passkey".into())),
            None => Err(BluezError::Canceled("no answer".into())),
        }
    }

    fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
        if let Ok(device) = Self::address(&device) {
            self.events
                .unbounded_send(Event::DisplayPasskey {
                    device,
                    passkey,
                    entered,
                })
                .ok();
        }
    }

    async fn request_confirmation(
        &self,
        device: OwnedObjectPath,
        passkey: u32,
    ) -> std::result::Result<(), BluezError> {
        let device = Self::address(&device)?;
        Self::accept(
            ask(&self.events, |responder| Event::RequestConfirmation {
                device,
                passkey,
                responder,
            })
            .await,
        )
    }

    async fn request_authorization(
        &self,
        device: OwnedObjectPath,
    ) -> std::result::Result<(), BluezError> {
        let device = Self::address(&device)?;
        Self::accept(ask(&self.events, |responder| Event::RequestAuthorization { device, responder }).await)
    }

    async fn authorize_service(
        &self,
        device: OwnedObjectPath,
        uuid: String,
    ) -> std::result::Result<(), BluezError> {
        let device = Self::address(&device)?;
        let service: Uuid = uuid
            .parse()
            .map_err(|_| BluezError::Rejected(format!("invalid service UUID {}", uuid)))?;
        Self::accept(
            ask(&self.events, |responder| Event::AuthorizeService {
                device,
                service,
                responder,
            })
            .await,
        )
    }

    fn cancel(&self) {
        self.events.unbounded_send(Event::PairingCancelled).ok();
    }
}

fn object_path(path: String) -> Result<OwnedObjectPath> {
    OwnedObjectPath::try_from(path).map_err(Error::from)
}

/// The objects currently served on the connection.
#[derive(Debug, Default)]
pub(crate) struct Exported {
    application: Option<ApplicationObjects>,
    advertisement: Option<OwnedObjectPath>,
    agent: Option<OwnedObjectPath>,
}

impl Exported {
    pub(crate) fn characteristic_path(&self, service: Uuid, characteristic: Uuid) -> Option<OwnedObjectPath> {
        self.application
            .as_ref()?
            .characteristics
            .get(&(service, characteristic))
            .cloned()
    }

    pub(crate) fn set_application(&mut self, objects: ApplicationObjects) {
        self.application = Some(objects);
    }

    pub(crate) fn take_application(&mut self) -> Option<ApplicationObjects> {
        self.application.take()
    }

    pub(crate) fn set_advertisement(&mut self, path: OwnedObjectPath) {
        self.advertisement = Some(path);
    }

    pub(crate) fn take_advertisement(&mut self) -> Option<OwnedObjectPath> {
        self.advertisement.take()
    }

    pub(crate) fn set_agent(&mut self, path: OwnedObjectPath) {
        self.agent = Some(path);
    }

    pub(crate) fn take_agent(&mut self) -> Option<OwnedObjectPath> {
        self.agent.take()
    }
}

/// Object paths of an exported GATT application.
#[derive(Debug)]
pub(crate) struct ApplicationObjects {
    pub(crate) root: OwnedObjectPath,
    services: Vec<OwnedObjectPath>,
    characteristics: HashMap<(Uuid, Uuid), OwnedObjectPath>,
    descriptors: Vec<OwnedObjectPath>,
}

impl ApplicationObjects {
    /// Serves the attribute tree below `{prefix}/app`, with an object manager at the root.
    pub(crate) async fn export(
        conn: &Connection,
        prefix: &str,
        services: &[gatt::Service],
        events: &UnboundedSender<Event>,
    ) -> Result<Self> {
        let server = conn.object_server();
        let root = object_path(format!("{}/app", prefix))?;
        let mut objects = ApplicationObjects {
            root: root.clone(),
            services: Vec::new(),
            characteristics: HashMap::new(),
            descriptors: Vec::new(),
        };

        server
            .at(root.as_str(), ObjectManager)
            .await
            .map_err(Error::from)?;

        for (i, service) in services.iter().enumerate() {
            let service_path = object_path(format!("{}/service{}", root.as_str(), i))?;
            server
                .at(service_path.as_str(), Service { uuid: service.uuid() })
                .await
                .map_err(Error::from)?;
            objects.services.push(service_path.clone());

            for (j, c) in service.characteristics().enumerate() {
                let char_path = object_path(format!("{}/char{}", service_path.as_str(), j))?;
                server
                    .at(
                        char_path.as_str(),
                        Characteristic {
                            service: service.uuid(),
                            uuid: c.uuid(),
                            flags: c.flags().to_bluez(),
                            service_path: service_path.clone(),
                            events: events.clone(),
                        },
                    )
                    .await
                    .map_err(Error::from)?;
                objects
                    .characteristics
                    .insert((service.uuid(), c.uuid()), char_path.clone());

                for (k, d) in c.descriptors().enumerate() {
                    let desc_path = object_path(format!("{}/desc{}", char_path.as_str(), k))?;
                    server
                        .at(
                            desc_path.as_str(),
                            Descriptor {
                                service: service.uuid(),
                                characteristic: c.uuid(),
                                uuid: d.uuid(),
                                flags: d.flags().to_bluez(),
                                characteristic_path: char_path.clone(),
                                events: events.clone(),
                            },
                        )
                        .await
                        .map_err(Error::from)?;
                    objects.descriptors.push(desc_path);
                }
            }
        }

        log::debug!(
            "exported GATT application at {} ({} service(s), {} characteristic(s))",
            root.as_str(),
            objects.services.len(),
            objects.characteristics.len()
        );
        Ok(objects)
    }

    /// Removes every exported object. Failures are logged: a missing object is already gone.
    pub(crate) async fn unexport(self, conn: &Connection) {
        let server = conn.object_server();
        for path in &self.descriptors {
            if let Err(e) = server.remove::<Descriptor, _>(path.as_str()).await {
                log::debug!("failed to remove {}: {}", path.as_str(), e);
            }
        }
        for path in self.characteristics.values() {
            if let Err(e) = server.remove::<Characteristic, _>(path.as_str()).await {
                log::debug!("failed to remove {}: {}", path.as_str(), e);
            }
        }
        for path in &self.services {
            if let Err(e) = server.remove::<Service, _>(path.as_str()).await {
                log::debug!("failed to remove {}: {}", path.as_str(), e);
            }
        }
        if let Err(e) = server.remove::<ObjectManager, _>(self.root.as_str()).await {
            log::debug!("failed to remove {}: {}", self.root.as_str(), e);
        }
    }
}

pub(crate) async fn export_advertisement(
    conn: &Connection,
    prefix: &str,
    advertisement: &advertisement::Advertisement,
    events: &UnboundedSender<Event>,
) -> Result<OwnedObjectPath> {
    let path = object_path(format!("{}/advertisement", prefix))?;
    conn.object_server()
        .at(
            path.as_str(),
            Advertisement {
                advertisement: advertisement.clone(),
                events: events.clone(),
            },
        )
        .await
        .map_err(Error::from)?;
    Ok(path)
}

pub(crate) async fn unexport_advertisement(conn: &Connection, path: &OwnedObjectPath) {
    if let Err(e) = conn
        .object_server()
        .remove::<Advertisement, _>(path.as_str())
        .await
    {
        log::debug!("failed to remove {}: {}", path.as_str(), e);
    }
}

pub(crate) async fn export_agent(
    conn: &Connection,
    path: &str,
    capability: Capability,
    events: &UnboundedSender<Event>,
) -> Result<OwnedObjectPath> {
    let path = object_path(path.to_string())?;
    conn.object_server()
        .at(
            path.as_str(),
            Agent {
                events: events.clone(),
            },
        )
        .await
        .map_err(Error::from)?;
    log::debug!("exported {} agent at {}", capability.to_bluez(), path.as_str());
    Ok(path)
}

pub(crate) async fn unexport_agent(conn: &Connection, path: &OwnedObjectPath) {
    if let Err(e) = conn.object_server().remove::<Agent, _>(path.as_str()).await {
        log::debug!("failed to remove {}: {}", path.as_str(), e);
    }
}

/// Emits a `PropertiesChanged` signal for a characteristic's `Value`, which BlueZ forwards to
/// subscribed centrals as a notification or indication.
pub(crate) async fn emit_value(conn: &Connection, path: &OwnedObjectPath, value: &[u8]) -> Result<()> {
    let mut changed: HashMap<&str, Value<'_>> = HashMap::new();
    changed.insert("Value", Value::from(value.to_vec()));
    let invalidated: Vec<&str> = Vec::new();
    conn.emit_signal(
        None::<&str>,
        path.as_str(),
        "org.freedesktop.DBus.Properties",
        "PropertiesChanged",
        &(CHARACTERISTIC_INTERFACE, changed, invalidated),
    )
    .await
    .map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gatt_errors_map_to_bluez_names() {
        let e = BluezError::from(GattError::InvalidOffset);
        assert!(matches!(e, BluezError::InvalidOffset(_)));
        let e = BluezError::from(GattError::NotPermitted);
        assert!(matches!(e, BluezError::NotPermitted(_)));
    }

    #[test]
    fn unanswered_requests_fail() {
        assert!(matches!(gatt_reply::<()>(None), Err(BluezError::Failed(_))));
        assert!(matches!(Agent::accept(Some(false)), Err(BluezError::Rejected(_))));
        assert!(matches!(Agent::accept(None), Err(BluezError::Canceled(_))));
        assert!(Agent::accept(Some(true)).is_ok());
    }

    #[test]
    fn indication_confirmations_are_acknowledged_locally() {
        let (events, mut calls) = futures_channel::mpsc::unbounded();
        let characteristic = Characteristic {
            service: Uuid::from_u16(0x1809),
            uuid: Uuid::from_u16(0x2a1c),
            flags: vec!["indicate".into()],
            service_path: OwnedObjectPath::try_from("/org/blues/peripheral/app/service0").unwrap(),
            events,
        };
        characteristic.confirm();
        assert!(calls.try_next().is_err());
    }

    #[test]
    fn advertisement_defaults() {
        let (events, _calls) = futures_channel::mpsc::unbounded();
        let adv = Advertisement {
            advertisement: advertisement::Advertisement::new(),
            events,
        };
        assert_eq!(adv.interval(), (100, 100));
        assert_eq!(adv.tx_power(), 127);
        assert_eq!(adv.secondary_channel(), "1M");
    }
}
