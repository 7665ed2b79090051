use std::collections::{BTreeMap, VecDeque};

use zbus::zvariant::OwnedValue;

use crate::{
    address::Address,
    advertisement::{Advertisement, Advertising, AdvertisingState},
    bluez,
    device::{Device, DeviceProperties, Transition},
    gatt::{Application, Gatt},
    transport::{Outbox, Request},
    Error, Result, Session,
};

/// A local BlueZ Bluetooth adapter acting as a peripheral.
///
/// The adapter owns everything the peripheral registers with the daemon: the GATT
/// [`Application`], the [`Advertisement`], and the directory of remote [`Device`]s. It is also the
/// only place daemon calls are queued from (see [`Outbox`]).
#[derive(Debug)]
pub struct Adapter {
    path: String,
    address: Option<Address>,
    powered: bool,
    discoverable: bool,
    devices: BTreeMap<Address, Device>,
    evicted: VecDeque<Address>,
    application: Option<Application>,
    advertising: Option<Advertising>,
    outbox: Outbox,
}

/// A non-owning handle to an [`Adapter`], used by the objects it owns to queue daemon calls.
pub struct AdapterHandle<'a> {
    path: &'a str,
    outbox: &'a mut Outbox,
}

impl<'a> AdapterHandle<'a> {
    pub(crate) fn new(path: &'a str, outbox: &'a mut Outbox) -> Self {
        Self { path, outbox }
    }

    /// The adapter's object path (eg. `/org/bluez/hci0`).
    pub fn path(&self) -> &str {
        self.path
    }

    pub(crate) fn submit(&mut self, request: Request) {
        self.outbox.push(request);
    }
}

impl Adapter {
    const PATH_PREFIX: &'static str = "/org/bluez/";

    /// How many removed devices are remembered to filter their trailing signals.
    const MAX_EVICTED: usize = 64;

    /// Creates an unpowered adapter record for the given object path.
    ///
    /// [`Adapter::open`] is the usual way to get one; this constructor is for callers that
    /// bring their own [`Transport`][crate::transport::Transport].
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            address: None,
            powered: false,
            discoverable: false,
            devices: BTreeMap::new(),
            evicted: VecDeque::new(),
            application: None,
            advertising: None,
            outbox: Outbox::default(),
        }
    }

    /// Opens the system's default Bluetooth adapter.
    pub async fn open(session: &Session) -> Result<Self> {
        let mut adapters = Self::enumerate(session).await?.collect::<Vec<_>>();
        adapters.sort_by(|a, b| a.path.cmp(&b.path));

        match adapters.into_iter().next() {
            Some(a) => Ok(a),
            None => Err(Error::from("no adapter found")),
        }
    }

    /// Returns an iterator yielding all Bluetooth adapters on the system that can act as a
    /// peripheral (ie. that offer both GATT and LE advertising managers).
    pub async fn enumerate(session: &Session) -> Result<impl Iterator<Item = Self>> {
        log::debug!(
            "enumerating BlueZ adapters on connection {}",
            session.conn.server_guid()
        );

        let manager = session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        let mut adapters = Vec::new();
        for (obj_path, intfs) in &objects {
            let Some(props) = intfs.get(bluez::ADAPTER_INTERFACE) else { continue };
            if !obj_path.starts_with(Self::PATH_PREFIX) {
                log::warn!("skipping adapter with unexpected path {}", obj_path);
                continue;
            }
            if !intfs.contains_key(bluez::GATT_MANAGER_INTERFACE)
                || !intfs.contains_key(bluez::ADVERTISING_MANAGER_INTERFACE)
            {
                log::warn!("skipping adapter {} without LE peripheral support", obj_path);
                continue;
            }

            log::debug!("found BlueZ adapter at path {}", obj_path);
            let mut adapter = Adapter::new(obj_path.as_str());
            adapter.apply_properties(props);
            adapters.push(adapter);
        }

        Ok(adapters.into_iter())
    }

    fn apply_properties(&mut self, props: &std::collections::HashMap<String, OwnedValue>) {
        let value = |name: &str| props.get(name).map(|v| &**v);
        self.powered = value("Powered").and_then(bluez::as_bool).unwrap_or(false);
        self.discoverable = value("Discoverable").and_then(bluez::as_bool).unwrap_or(false);
        self.address = value("Address")
            .and_then(bluez::as_string)
            .and_then(|s| s.parse().ok());
    }

    /// Returns the adapter's object path (eg. `/org/bluez/hci0`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the adapter's device name (eg. `hci0`).
    pub fn device_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns the Bluetooth device [`Address`] of this [`Adapter`], if the daemon reported one.
    pub fn address(&self) -> Option<Address> {
        self.address
    }

    /// Returns the last power state reported by the daemon.
    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn is_discoverable(&self) -> bool {
        self.discoverable
    }

    pub(crate) fn handle(&mut self) -> AdapterHandle<'_> {
        AdapterHandle::new(&self.path, &mut self.outbox)
    }

    /// Asks the daemon to power the adapter on.
    ///
    /// The new state is only known once the daemon reports it; [`Adapter::is_powered`] will keep
    /// returning `false` until then.
    pub fn power_on(&mut self) {
        log::debug!("powering on {}", self.path);
        self.outbox.push(Request::SetPowered {
            adapter: self.path.clone(),
            powered: true,
        });
    }

    /// Asks the daemon to power the adapter off.
    pub fn power_off(&mut self) {
        log::debug!("powering off {}", self.path);
        self.outbox.push(Request::SetPowered {
            adapter: self.path.clone(),
            powered: false,
        });
    }

    /// Attaches the GATT application this adapter will serve, replacing any previous one.
    pub fn set_application(&mut self, app: Application) {
        self.application = Some(app);
    }

    pub fn application(&self) -> Option<&Application> {
        self.application.as_ref()
    }

    pub fn application_mut(&mut self) -> Option<&mut Application> {
        self.application.as_mut()
    }

    /// Registers the attached application with the daemon.
    pub fn register_application(&mut self) -> Result<()> {
        if !self.powered {
            return Err(Error::not_powered(&self.path));
        }
        let app = self
            .application
            .as_mut()
            .ok_or_else(|| Error::from("no GATT application attached"))?;
        app.register(&mut AdapterHandle::new(&self.path, &mut self.outbox))
    }

    /// Unregisters the attached application. Does nothing if it is not registered.
    pub fn unregister_application(&mut self) {
        if let Some(app) = self.application.as_mut() {
            app.unregister(&mut AdapterHandle::new(&self.path, &mut self.outbox));
        }
    }

    /// Sets the advertisement used by [`Adapter::start_advertising`].
    pub fn set_advertisement(&mut self, advertisement: Advertisement) {
        self.advertising = Some(Advertising::new(advertisement));
    }

    pub fn advertising_state(&self) -> Option<AdvertisingState> {
        self.advertising.as_ref().map(Advertising::state)
    }

    /// Starts advertising, or does nothing if already advertising.
    ///
    /// On an unpowered adapter the request is remembered and carried out once power comes up.
    pub fn start_advertising(&mut self) -> Result<()> {
        let adv = self
            .advertising
            .as_mut()
            .ok_or_else(|| Error::from("no advertisement set"))?;
        if !self.powered {
            log::debug!("{} is not powered, deferring advertising", self.path);
            adv.want(true);
            return Ok(());
        }
        adv.start(&mut AdapterHandle::new(&self.path, &mut self.outbox));
        Ok(())
    }

    /// Stops advertising, or does nothing if not advertising.
    pub fn stop_advertising(&mut self) {
        if let Some(adv) = self.advertising.as_mut() {
            adv.stop(&mut AdapterHandle::new(&self.path, &mut self.outbox));
        }
    }

    pub(crate) fn gatt(&mut self) -> Option<Gatt<'_>> {
        let app = self.application.as_mut()?;
        Some(Gatt::new(app, AdapterHandle::new(&self.path, &mut self.outbox)))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, address: Address) -> Option<&Device> {
        self.devices.get(&address)
    }

    pub fn connected_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_connected())
    }

    /// Returns the device record for `address`, creating it if this is the first time the
    /// address shows up.
    pub(crate) fn device_entry(&mut self, address: Address) -> &mut Device {
        self.evicted.retain(|a| *a != address);
        self.devices
            .entry(address)
            .or_insert_with(|| Device::new(address))
    }

    /// Applies a property update from the daemon.
    ///
    /// Updates for devices the daemon already removed are dropped: BlueZ may still deliver
    /// trailing signals for them.
    pub(crate) fn update_device(
        &mut self,
        address: Address,
        props: &DeviceProperties,
    ) -> Option<Transition> {
        if self.evicted.contains(&address) {
            log::trace!("ignoring update for removed device {}", address);
            return None;
        }
        self.devices
            .entry(address)
            .or_insert_with(|| Device::new(address))
            .apply(props)
    }

    /// Drops a device the daemon removed, remembering the most recent ones so that late
    /// property updates do not bring them back.
    pub(crate) fn remove_device(&mut self, address: Address) -> Option<Device> {
        self.evicted.retain(|a| *a != address);
        if self.evicted.len() == Self::MAX_EVICTED {
            self.evicted.pop_front();
        }
        self.evicted.push_back(address);
        self.devices.remove(&address)
    }

    /// Asks the daemon to drop the link to a connected central.
    pub fn disconnect_device(&mut self, address: Address) -> Result<Option<Transition>> {
        let device = self
            .devices
            .get_mut(&address)
            .ok_or_else(|| Error::invalid(format!("unknown device {}", address)))?;
        let transition = device.begin_disconnect();
        if transition.is_some() {
            self.outbox.push(Request::Disconnect {
                adapter: self.path.clone(),
                device: address,
            });
        }
        Ok(transition)
    }

    /// Applies a power state change and returns `true` if it differs from the previous one.
    ///
    /// Losing power drops every registration on the daemon side, so the application and the
    /// advertisement fall back to their unregistered states.
    pub(crate) fn set_powered(&mut self, powered: bool) -> bool {
        if self.powered == powered {
            return false;
        }
        self.powered = powered;
        if !powered {
            if let Some(app) = self.application.as_mut() {
                app.reset();
            }
            if let Some(adv) = self.advertising.as_mut() {
                adv.reset();
            }
        }
        true
    }

    pub(crate) fn set_discoverable(&mut self, discoverable: bool) {
        self.discoverable = discoverable;
    }

    pub(crate) fn advertisement_released(&mut self) {
        if let Some(adv) = self.advertising.as_mut() {
            adv.released();
        }
    }

    pub(crate) fn next_request(&mut self) -> Option<Request> {
        self.outbox.pop()
    }

    /// Drops every queued call without issuing it and returns how many there were.
    pub(crate) fn abandon_requests(&mut self) -> usize {
        self.outbox.drain().count()
    }

    pub fn pending_requests(&self) -> &Outbox {
        &self.outbox
    }

    /// Feeds back the outcome of a call taken from the outbox.
    ///
    /// Returns the error of a failed registration; failures of steady-state calls are logged and
    /// swallowed. The second value is a connection transition caused by the completion (a failed
    /// disconnect).
    pub(crate) fn complete(
        &mut self,
        request: &Request,
        result: Result<()>,
    ) -> (Result<()>, Option<(Address, Transition)>) {
        let mut handle = AdapterHandle::new(&self.path, &mut self.outbox);
        match request {
            Request::RegisterApplication { .. } => {
                let res = match self.application.as_mut() {
                    Some(app) => app.registered(result),
                    None => Ok(()),
                };
                (res, None)
            }
            Request::RegisterAdvertisement { .. } => {
                let res = match self.advertising.as_mut() {
                    Some(adv) => adv.started(&mut handle, result),
                    None => Ok(()),
                };
                (res, None)
            }
            Request::UnregisterAdvertisement { .. } => {
                if let Some(adv) = self.advertising.as_mut() {
                    adv.stopped(&mut handle, result);
                }
                (Ok(()), None)
            }
            Request::Disconnect { device, .. } => {
                let transition = match result {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("failed to disconnect {}: {}", device, e);
                        self.devices
                            .get_mut(device)
                            .and_then(Device::abort_disconnect)
                            .map(|t| (*device, t))
                    }
                };
                (Ok(()), transition)
            }
            other => {
                if let Err(e) = result {
                    log::warn!("{} failed: {}", other.name(), e);
                }
                (Ok(()), None)
            }
        }
    }

    /// Drops the device directory. Part of session teardown.
    pub(crate) fn release(&mut self) {
        log::debug!("releasing {} ({} device(s))", self.path, self.devices.len());
        self.devices.clear();
        self.evicted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::ConnectionState, error::ErrorKind, uuid::Uuid};

    const PATH: &str = "/org/bluez/hci0";

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn register_needs_power() {
        let mut adapter = Adapter::new(PATH);
        let mut app = Application::new();
        app.add_service(Uuid::from_u16(0x1809)).unwrap();
        adapter.set_application(app);

        assert_eq!(
            adapter.register_application().unwrap_err().kind(),
            ErrorKind::AdapterNotPowered
        );
        adapter.set_powered(true);
        adapter.register_application().unwrap();
        assert_eq!(
            adapter.next_request().map(|r| r.name()),
            Some("RegisterApplication")
        );
    }

    #[test]
    fn advertising_waits_for_power() {
        let mut adapter = Adapter::new(PATH);
        adapter.set_advertisement(Advertisement::new().local_name("BINC"));
        adapter.start_advertising().unwrap();
        assert!(adapter.pending_requests().is_empty());
        assert_eq!(adapter.advertising_state(), Some(AdvertisingState::Inactive));
        assert_eq!(adapter.device_name(), "hci0");
    }

    #[test]
    fn device_directory() {
        let mut adapter = Adapter::new(PATH);
        let a = addr("AA:BB:CC:11:22:33");

        let t = adapter.update_device(a, &DeviceProperties::connected(true));
        assert_eq!(t.map(|t| t.to), Some(ConnectionState::Connected));
        assert_eq!(adapter.connected_devices().count(), 1);

        assert!(adapter.remove_device(a).is_some());
        assert_eq!(adapter.update_device(a, &DeviceProperties::connected(false)), None);
        assert!(adapter.device(a).is_none());

        // The daemon announcing the device again brings it back.
        adapter.device_entry(a);
        assert!(adapter.update_device(a, &DeviceProperties::connected(true)).is_some());
    }

    #[test]
    fn tombstones_are_bounded() {
        let mut adapter = Adapter::new(PATH);
        let first = Address::from_bytes([0, 0, 0, 0, 0, 0]);
        adapter.remove_device(first);

        for i in 1..=Adapter::MAX_EVICTED as u8 {
            adapter.remove_device(Address::from_bytes([0, 0, 0, 0, 1, i]));
        }
        assert_eq!(adapter.evicted.len(), Adapter::MAX_EVICTED);
        assert!(!adapter.evicted.contains(&first));

        // The oldest tombstone is gone, so the daemon may report that address again.
        assert!(adapter.update_device(first, &DeviceProperties::connected(true)).is_some());
        let last = Address::from_bytes([0, 0, 0, 0, 1, Adapter::MAX_EVICTED as u8]);
        assert_eq!(adapter.update_device(last, &DeviceProperties::connected(true)), None);

        // Removing the same device twice keeps one entry.
        adapter.remove_device(last);
        assert_eq!(adapter.evicted.iter().filter(|a| **a == last).count(), 1);
    }

    #[test]
    fn power_requests_are_queued() {
        let mut adapter = Adapter::new(PATH);
        adapter.power_on();
        adapter.power_off();

        let queued: Vec<_> = std::iter::from_fn(|| adapter.next_request())
            .map(|r| match r {
                Request::SetPowered { adapter, powered } => (adapter, powered),
                other => panic!("unexpected {}", other.name()),
            })
            .collect();
        assert_eq!(queued, [(PATH.to_string(), true), (PATH.to_string(), false)]);
    }

    #[test]
    fn failed_disconnect_restores_connected() {
        let mut adapter = Adapter::new(PATH);
        let a = addr("AA:BB:CC:11:22:33");
        adapter.update_device(a, &DeviceProperties::connected(true));

        let t = adapter.disconnect_device(a).unwrap();
        assert_eq!(t.map(|t| t.to), Some(ConnectionState::Disconnecting));
        let request = adapter.next_request().unwrap();
        assert_eq!(request.name(), "Disconnect");

        let (res, transition) = adapter.complete(&request, Err(Error::transport("busy")));
        res.unwrap();
        assert_eq!(
            transition.map(|(_, t)| t.to),
            Some(ConnectionState::Connected)
        );
    }

    #[test]
    fn power_loss_resets_registrations() {
        let mut adapter = Adapter::new(PATH);
        let mut app = Application::new();
        app.add_service(Uuid::from_u16(0x1809)).unwrap();
        adapter.set_application(app);
        adapter.set_advertisement(Advertisement::new());
        adapter.set_powered(true);

        adapter.register_application().unwrap();
        adapter.start_advertising().unwrap();
        while let Some(request) = adapter.next_request() {
            adapter.complete(&request, Ok(())).0.unwrap();
        }
        assert_eq!(adapter.advertising_state(), Some(AdvertisingState::Active));

        assert!(adapter.set_powered(false));
        assert!(!adapter.set_powered(false));
        assert_eq!(adapter.advertising_state(), Some(AdvertisingState::Inactive));
        assert_eq!(
            adapter.application().map(Application::state),
            Some(crate::gatt::RegistrationState::Unregistered)
        );
    }
}
