//! Talking to BlueZ: proxies for the daemon's managers, the [`Transport`] implementation for
//! [`Session`], and the [`Events`] stream built from D-Bus signals and incoming calls.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    task::Poll,
};

use futures_channel::mpsc::UnboundedReceiver;
use futures_util::{future::poll_fn, stream, Stream, StreamExt};
use zbus::{
    dbus_proxy,
    fdo::{InterfacesAdded, InterfacesRemoved, PropertiesChanged},
    zvariant::{ObjectPath, OwnedValue, Value},
    MatchRule, Message, MessageStream, MessageType, SignalStream,
};

use crate::{
    address::{Address, AddressType},
    advertisement::Advertisement,
    agent::Capability,
    device::{DeviceProperties, PropertyName},
    event::Event,
    export::{self, ApplicationObjects},
    gatt::Service,
    transport::Transport,
    uuid::Uuid,
    Adapter, Error, Result, Session,
};

pub(crate) const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub(crate) const GATT_MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub(crate) const ADVERTISING_MANAGER_INTERFACE: &str = "org.bluez.LEAdvertisingManager1";

#[dbus_proxy(
    interface = "org.bluez.GattManager1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait GattManager {
    fn register_application(
        &self,
        application: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_application(&self, application: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.bluez.LEAdvertisingManager1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait LEAdvertisingManager {
    fn register_advertisement(
        &self,
        advertisement: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;

    fn unregister_advertisement(&self, service: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.bluez.AgentManager1",
    default_service = "org.bluez",
    default_path = "/org/bluez",
    assume_defaults = false
)]
trait AgentManager {
    fn register_agent(&self, agent: &ObjectPath<'_>, capability: &str) -> zbus::Result<()>;
    fn request_default_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
    fn unregister_agent(&self, agent: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.bluez.Device1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Device {
    fn disconnect(&self) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Adapter {
    #[dbus_proxy(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[dbus_proxy(property)]
    fn set_powered(&self, value: bool) -> zbus::Result<()>;
}

pub(crate) fn as_bool(value: &Value<'_>) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

pub(crate) fn as_string(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn apply_device_property(props: &mut DeviceProperties, name: &str, value: &Value<'_>) {
    let Some(name) = PropertyName::from_str(name) else { return };
    match name {
        PropertyName::Name => props.name = as_string(value),
        PropertyName::Alias => props.alias = as_string(value),
        PropertyName::AddressType => {
            props.address_type = as_string(value).and_then(|s| AddressType::from_str(&s).ok())
        }
        PropertyName::Connected => props.connected = as_bool(value),
        PropertyName::Paired => props.paired = as_bool(value),
        PropertyName::Bonded => props.bonded = as_bool(value),
        PropertyName::Trusted => props.trusted = as_bool(value),
    }
}

impl Session {
    fn exported(&self) -> std::sync::MutexGuard<'_, export::Exported> {
        self.exported.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribes to `PropertiesChanged` of the adapter and of every object below it, devices
    /// that appear later included, with a single match rule.
    async fn property_changes(&self, adapter: &ObjectPath<'_>) -> Result<MessageStream> {
        MessageStream::for_match_rule(property_rule(adapter)?, &self.conn, None)
            .await
            .map_err(Error::from)
    }

    /// Opens the stream of [`Event`]s for `adapter`.
    ///
    /// Devices the daemon already knows are reported first, as [`Event::DeviceAdded`]. Only one
    /// stream can be opened per [`Session`], since it also carries the calls BlueZ makes into this
    /// process.
    pub async fn events(&self, adapter: &Adapter) -> Result<Events> {
        let calls = self
            .incoming
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::from("the event stream of this session is already open"))?;

        let adapter_path = ObjectPath::try_from(adapter.path().to_string()).map_err(Error::from)?;
        let manager = self.object_manager().await?;
        let signals = manager.receive_all_signals().await.map_err(Error::from)?;
        let properties = self.property_changes(&adapter_path).await?;

        let mut replay = VecDeque::new();
        let mut known = 0;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        for (path, intfs) in objects {
            if path.as_str() == adapter_path.as_str() {
                if let Some(powered) = intfs
                    .get(ADAPTER_INTERFACE)
                    .and_then(|props| props.get("Powered"))
                    .and_then(|v| as_bool(v))
                {
                    replay.push_back(Event::PoweredChanged(powered));
                }
                continue;
            }
            let Some(props) = intfs.get(DEVICE_INTERFACE) else { continue };
            let Some(address) = device_under(adapter_path.as_str(), path.as_str()) else { continue };

            known += 1;
            replay.push_back(Event::DeviceAdded {
                address,
                properties: owned_device_properties(props),
            });
        }

        log::debug!(
            "listening for events on {} ({} known device(s))",
            adapter_path,
            known
        );
        Ok(Events {
            adapter_path: adapter_path.to_string(),
            calls,
            signals,
            properties,
            replay,
        })
    }
}

/// Matches `PropertiesChanged` from BlueZ for `adapter` and every object below it.
fn property_rule<'a>(adapter: &ObjectPath<'a>) -> Result<MatchRule<'a>> {
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender("org.bluez")
        .map_err(Error::from)?
        .interface("org.freedesktop.DBus.Properties")
        .map_err(Error::from)?
        .member("PropertiesChanged")
        .map_err(Error::from)?
        .path_namespace(adapter.clone())
        .map_err(Error::from)?
        .build())
}

/// Returns the address of a device object directly below the adapter at `adapter`.
fn device_under(adapter: &str, path: &str) -> Option<Address> {
    let rest = path.strip_prefix(adapter)?.strip_prefix('/')?;
    if rest.contains('/') {
        return None;
    }
    Address::from_device_path(path).ok()
}

fn owned_device_properties(props: &HashMap<String, OwnedValue>) -> DeviceProperties {
    let mut out = DeviceProperties::default();
    for (name, value) in props {
        apply_device_property(&mut out, name, value);
    }
    out
}

enum Incoming {
    Call(Option<Event>),
    Signal(Option<Arc<Message>>),
    Properties(Option<zbus::Result<Arc<Message>>>),
}

/// The [`Event`]s of one adapter: daemon signals plus calls BlueZ makes into exported objects.
///
/// Returned by [`Session::events`].
pub struct Events {
    adapter_path: String,
    calls: UnboundedReceiver<Event>,
    signals: SignalStream<'static>,
    properties: MessageStream,
    replay: VecDeque<Event>,
}

impl Events {
    /// Waits for the next event. Returns `None` once the D-Bus connection is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.replay.pop_front() {
                return Some(event);
            }

            let incoming = poll_fn(|cx| {
                if let Poll::Ready(call) = self.calls.poll_next_unpin(cx) {
                    return Poll::Ready(Incoming::Call(call));
                }
                if let Poll::Ready(msg) = self.signals.poll_next_unpin(cx) {
                    return Poll::Ready(Incoming::Signal(msg));
                }
                if let Poll::Ready(msg) = self.properties.poll_next_unpin(cx) {
                    return Poll::Ready(Incoming::Properties(msg));
                }
                Poll::Pending
            })
            .await;

            match incoming {
                Incoming::Call(call) => return call,
                Incoming::Signal(None) | Incoming::Properties(None) => {
                    log::warn!("BlueZ signal stream ended (daemon gone?)");
                    return None;
                }
                Incoming::Signal(Some(msg)) => self.object_signal(msg),
                Incoming::Properties(Some(Ok(msg))) => {
                    let events = property_events(&self.adapter_path, msg);
                    self.replay.extend(events);
                }
                Incoming::Properties(Some(Err(e))) => {
                    log::warn!("dropping malformed signal: {}", e);
                }
            }
        }
    }

    /// Turns this into a [`Stream`], for [`Peripheral::run`][crate::peripheral::Peripheral::run].
    pub fn into_stream(self) -> impl Stream<Item = Event> {
        stream::unfold(self, |mut events| async move {
            let event = events.next().await?;
            Some((event, events))
        })
    }

    fn object_signal(&mut self, msg: Arc<Message>) {
        if let Some(added) = InterfacesAdded::from_message(msg.clone()) {
            let Ok(args) = added.args() else { return };
            let Some(props) = args.interfaces_and_properties.get(DEVICE_INTERFACE) else { return };
            let Some(address) = device_under(&self.adapter_path, args.object_path.as_str()) else {
                return;
            };

            let mut properties = DeviceProperties::default();
            for (name, value) in props {
                apply_device_property(&mut properties, name, value);
            }
            log::trace!("device added: {}", address);
            self.replay.push_back(Event::DeviceAdded {
                address,
                properties,
            });
        } else if let Some(removed) = InterfacesRemoved::from_message(msg) {
            let Ok(args) = removed.args() else { return };
            if !args.interfaces.contains(&DEVICE_INTERFACE) {
                return;
            }
            if let Some(address) = device_under(&self.adapter_path, args.object_path.as_str()) {
                log::trace!("device removed: {}", address);
                self.replay.push_back(Event::DeviceRemoved(address));
            }
        }
    }
}

/// Turns a `PropertiesChanged` signal from below the adapter at `adapter` into events.
fn property_events(adapter: &str, msg: Arc<Message>) -> Vec<Event> {
    let mut events = Vec::new();
    let Some(changed) = PropertiesChanged::from_message(msg) else { return events };
    let Some(path) = changed.path() else { return events };
    let Ok(args) = changed.args() else { return events };

    if path.as_str() == adapter {
        if args.interface_name.as_str() != ADAPTER_INTERFACE {
            return events;
        }
        log::trace!("adapter changed {:?}", args.changed_properties.keys());
        for (name, value) in &args.changed_properties {
            match (*name, as_bool(value)) {
                ("Powered", Some(powered)) => events.push(Event::PoweredChanged(powered)),
                ("Discoverable", Some(discoverable)) => {
                    events.push(Event::DiscoverableChanged(discoverable))
                }
                _ => {}
            }
        }
        return events;
    }

    let Some(address) = device_under(adapter, path.as_str()) else { return events };
    if args.interface_name.as_str() != DEVICE_INTERFACE {
        return events;
    }
    log::trace!("{}: changed {:?}", address, args.changed_properties.keys());
    let mut properties = DeviceProperties::default();
    for (name, value) in &args.changed_properties {
        apply_device_property(&mut properties, name, value);
    }
    if properties != DeviceProperties::default() {
        events.push(Event::DeviceChanged {
            address,
            properties,
        });
    }
    events
}

impl Transport for Session {
    async fn set_powered(&self, adapter: &str, powered: bool) -> Result<()> {
        let proxy = AdapterProxy::new(&self.conn, adapter.to_string())
            .await
            .map_err(Error::from)?;
        if proxy.powered().await.map_err(Error::from)? == powered {
            log::debug!("{} is already powered {}", adapter, if powered { "on" } else { "off" });
            return Ok(());
        }
        proxy.set_powered(powered).await.map_err(Error::from)
    }

    async fn register_application(&self, adapter: &str, services: &[Service]) -> Result<()> {
        let stale = self.exported().take_application();
        if let Some(stale) = stale {
            stale.unexport(&self.conn).await;
        }
        let objects = ApplicationObjects::export(&self.conn, &self.prefix, services, &self.calls).await?;
        let root = objects.root.clone();

        let result = async {
            let manager = GattManagerProxy::new(&self.conn, adapter.to_string())
                .await
                .map_err(Error::from)?;
            manager
                .register_application(&root, HashMap::new())
                .await
                .map_err(Error::from)
        }
        .await;

        match result {
            Ok(()) => {
                self.exported().set_application(objects);
                Ok(())
            }
            Err(e) => {
                objects.unexport(&self.conn).await;
                Err(e)
            }
        }
    }

    async fn unregister_application(&self, adapter: &str) -> Result<()> {
        let Some(objects) = self.exported().take_application() else {
            return Ok(());
        };
        let result = async {
            let manager = GattManagerProxy::new(&self.conn, adapter.to_string())
                .await
                .map_err(Error::from)?;
            manager
                .unregister_application(&objects.root)
                .await
                .map_err(Error::from)
        }
        .await;
        objects.unexport(&self.conn).await;
        result
    }

    async fn register_advertisement(
        &self,
        adapter: &str,
        advertisement: &Advertisement,
    ) -> Result<()> {
        let stale = self.exported().take_advertisement();
        if let Some(stale) = stale {
            export::unexport_advertisement(&self.conn, &stale).await;
        }
        let path = export::export_advertisement(&self.conn, &self.prefix, advertisement, &self.calls)
            .await?;

        let result = async {
            let manager = LEAdvertisingManagerProxy::new(&self.conn, adapter.to_string())
                .await
                .map_err(Error::from)?;
            manager
                .register_advertisement(&path, HashMap::new())
                .await
                .map_err(Error::from)
        }
        .await;

        match result {
            Ok(()) => {
                self.exported().set_advertisement(path);
                Ok(())
            }
            Err(e) => {
                export::unexport_advertisement(&self.conn, &path).await;
                Err(e)
            }
        }
    }

    async fn unregister_advertisement(&self, adapter: &str) -> Result<()> {
        let Some(path) = self.exported().take_advertisement() else {
            return Ok(());
        };
        let result = async {
            let manager = LEAdvertisingManagerProxy::new(&self.conn, adapter.to_string())
                .await
                .map_err(Error::from)?;
            manager
                .unregister_advertisement(&path)
                .await
                .map_err(Error::from)
        }
        .await;
        export::unexport_advertisement(&self.conn, &path).await;
        result
    }

    async fn register_agent(&self, path: &str, capability: Capability) -> Result<()> {
        let path = export::export_agent(&self.conn, path, capability, &self.calls).await?;

        let result = async {
            let manager = AgentManagerProxy::new(&self.conn)
                .await
                .map_err(Error::from)?;
            manager
                .register_agent(&path, capability.to_bluez())
                .await
                .map_err(Error::from)?;
            manager
                .request_default_agent(&path)
                .await
                .map_err(Error::from)
        }
        .await;

        match result {
            Ok(()) => {
                self.exported().set_agent(path);
                Ok(())
            }
            Err(e) => {
                export::unexport_agent(&self.conn, &path).await;
                Err(e)
            }
        }
    }

    async fn unregister_agent(&self, path: &str) -> Result<()> {
        let exported = self.exported().take_agent();
        let agent = ObjectPath::try_from(path).map_err(Error::from)?;
        let result = async {
            let manager = AgentManagerProxy::new(&self.conn)
                .await
                .map_err(Error::from)?;
            manager.unregister_agent(&agent).await.map_err(Error::from)
        }
        .await;
        if let Some(exported) = exported {
            export::unexport_agent(&self.conn, &exported).await;
        }
        result
    }

    async fn notify(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let path = self
            .exported()
            .characteristic_path(service, characteristic)
            .ok_or_else(|| Error::unknown_characteristic(service, characteristic))?;
        export::emit_value(&self.conn, &path, value).await
    }

    async fn disconnect_device(&self, adapter: &str, device: Address) -> Result<()> {
        let path = format!("{}/{}", adapter, device.path_segment());
        let proxy = DeviceProxy::new(&self.conn, path)
            .await
            .map_err(Error::from)?;
        proxy.disconnect().await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_paths() {
        let a = device_under("/org/bluez/hci0", "/org/bluez/hci0/dev_AA_BB_CC_11_22_33");
        assert_eq!(a, "AA:BB:CC:11:22:33".parse().ok());
        assert_eq!(
            device_under("/org/bluez/hci1", "/org/bluez/hci0/dev_AA_BB_CC_11_22_33"),
            None
        );
        assert_eq!(
            device_under(
                "/org/bluez/hci0",
                "/org/bluez/hci0/dev_AA_BB_CC_11_22_33/service0001"
            ),
            None
        );
    }

    #[test]
    fn device_property_values() {
        let mut props = DeviceProperties::default();
        apply_device_property(&mut props, "Connected", &Value::Bool(true));
        apply_device_property(&mut props, "Alias", &Value::from("central-1"));
        apply_device_property(&mut props, "AddressType", &Value::from("random"));
        apply_device_property(&mut props, "RSSI", &Value::I16(-40));
        apply_device_property(&mut props, "Paired", &Value::from("not a bool"));

        assert_eq!(props.connected, Some(true));
        assert_eq!(props.alias.as_deref(), Some("central-1"));
        assert_eq!(props.address_type, Some(AddressType::Random));
        assert_eq!(props.paired, None);
        assert_eq!(PropertyName::from_str("Bonded"), Some(PropertyName::Bonded));
    }

    fn properties_changed(path: &str, interface: &str, name: &str, value: Value<'_>) -> Arc<Message> {
        let changed = HashMap::from([(name, value)]);
        let msg = zbus::MessageBuilder::signal(
            path,
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
        )
        .unwrap()
        .build(&(interface, changed, Vec::<&str>::new()))
        .unwrap();
        Arc::new(msg)
    }

    #[test]
    fn one_rule_covers_the_adapter_subtree() {
        let adapter = ObjectPath::try_from("/org/bluez/hci0").unwrap();
        let rule = property_rule(&adapter).unwrap().to_string();
        assert!(rule.contains("type='signal'"));
        assert!(rule.contains("sender='org.bluez'"));
        assert!(rule.contains("member='PropertiesChanged'"));
        assert!(rule.contains("path_namespace='/org/bluez/hci0'"));
    }

    #[test]
    fn property_changes_are_routed_by_path() {
        const HCI0: &str = "/org/bluez/hci0";

        let events = property_events(
            HCI0,
            properties_changed(HCI0, ADAPTER_INTERFACE, "Powered", Value::Bool(false)),
        );
        assert!(matches!(events[..], [Event::PoweredChanged(false)]));

        let device = "/org/bluez/hci0/dev_AA_BB_CC_11_22_33";
        let events = property_events(
            HCI0,
            properties_changed(device, DEVICE_INTERFACE, "Connected", Value::Bool(true)),
        );
        match &events[..] {
            [Event::DeviceChanged {
                address,
                properties,
            }] => {
                assert_eq!(address.to_string(), "AA:BB:CC:11:22:33");
                assert_eq!(properties.connected, Some(true));
            }
            _ => panic!("expected a single DeviceChanged"),
        }

        // Other interfaces, unknown properties and foreign adapters yield nothing.
        let ignored = [
            properties_changed(device, "org.bluez.MediaControl1", "Connected", Value::Bool(true)),
            properties_changed(device, DEVICE_INTERFACE, "RSSI", Value::I16(-40)),
            properties_changed(
                "/org/bluez/hci1/dev_AA_BB_CC_11_22_33",
                DEVICE_INTERFACE,
                "Connected",
                Value::Bool(true),
            ),
        ];
        for msg in ignored {
            assert!(property_events(HCI0, msg).is_empty());
        }
    }
}
