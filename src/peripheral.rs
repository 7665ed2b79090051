//! The peripheral session: startup, the connect/disconnect advertising policy, and shutdown.
//!
//! A [`Peripheral`] owns the [`Adapter`] (and through it the GATT [`Application`] and the
//! [`Advertisement`]), the optional pairing [`Agent`], and the user callbacks. All of its state is
//! touched from a single task: [`Peripheral::run`] alternates between handing queued daemon calls
//! to the [`Transport`] and feeding incoming [`Event`]s to [`Peripheral::dispatch`].

use std::{
    future::Future,
    pin::{pin, Pin},
    task::Poll,
    time::Duration,
};

use async_io::Timer;
use futures_util::{
    future::{self, poll_fn, Either, LocalBoxFuture},
    FutureExt, Stream,
};

use crate::{
    adapter::Adapter,
    address::Address,
    advertisement::Advertisement,
    agent::Agent,
    device::{ConnectionState, Device, Transition},
    event::Event,
    gatt::{Application, GattError, GattHandler, RegistrationState},
    transport::{Request, Transport},
    uuid::Uuid,
    Error, Result,
};

/// Session settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long [`Peripheral::run`] serves centrals before shutting down on its own. `None` runs
    /// until interrupted.
    pub timeout: Option<Duration>,
    /// Whether to power on the adapter if it is off.
    pub power_on: bool,
    /// How long a single daemon call may take before it is treated as failed.
    pub call_timeout: Duration,
    /// How long teardown may take once shutdown begins. Calls still queued or in flight when it
    /// runs out are abandoned.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(600)),
            power_on: true,
            call_timeout: Duration::from_secs(25),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Callbacks for adapter-level changes. All methods default to doing nothing.
pub trait PeripheralObserver {
    /// The adapter's power state changed.
    fn on_powered_changed(&mut self, _powered: bool) {}

    /// A central's connection state changed.
    fn on_central_state_changed(&mut self, _device: &Device, _transition: Transition) {}

    /// Registering the application, the advertisement or the agent failed. The session keeps
    /// running without it.
    fn on_registration_failed(&mut self, _what: &'static str, _error: &Error) {}
}

impl PeripheralObserver for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    ShuttingDown,
}

enum Step {
    Completed(Request, Result<()>),
    Event(Option<Event>),
    Timeout,
    TeardownExpired,
}

/// A GATT peripheral session on one adapter.
pub struct Peripheral {
    adapter: Adapter,
    agent: Option<Agent>,
    handler: Box<dyn GattHandler>,
    observer: Box<dyn PeripheralObserver>,
    config: Config,
    phase: Phase,
}

impl Peripheral {
    /// Creates an idle session serving `application` and advertising `advertisement` on
    /// `adapter`. Nothing is sent to the daemon before [`Peripheral::start`].
    pub fn new(mut adapter: Adapter, application: Application, advertisement: Advertisement) -> Self {
        adapter.set_application(application);
        adapter.set_advertisement(advertisement);
        Self {
            adapter,
            agent: None,
            handler: Box::new(()),
            observer: Box::new(()),
            config: Config::default(),
            phase: Phase::Idle,
        }
    }

    /// Registers `agent` for pairing prompts while the session runs.
    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Routes read, write and subscription requests through `handler`.
    pub fn with_gatt_handler(mut self, handler: impl GattHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Reports power, connection and registration changes to `observer`.
    pub fn with_observer(mut self, observer: impl PeripheralObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Replaces the default [`Config`].
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Returns the adapter this session runs on.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut Adapter {
        &mut self.adapter
    }

    /// Returns the pairing agent, if one was set.
    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.phase == Phase::ShuttingDown
    }

    /// Sends a value-changed notification to subscribed centrals.
    ///
    /// Returns `Ok(false)` without touching the stored value when nobody is subscribed.
    pub fn notify(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<bool> {
        self.adapter
            .gatt()
            .ok_or_else(|| Error::from("no GATT application attached"))?
            .notify(service, characteristic, value)
    }

    /// Replaces the stored value of a characteristic without notifying anyone.
    pub fn set_characteristic_value(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.adapter
            .application_mut()
            .ok_or_else(|| Error::from("no GATT application attached"))?
            .set_characteristic_value(service, characteristic, value)
    }

    /// Queues the startup sequence: power on, agent, application, advertisement.
    ///
    /// If the adapter is not powered yet, the application and advertisement are registered once
    /// the daemon reports it powered. Called by [`Peripheral::run`]; does nothing when called again.
    pub fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Idle {
            return Ok(());
        }
        log::debug!("starting peripheral on {}", self.adapter.path());
        self.phase = Phase::Running;

        if !self.adapter.is_powered() && self.config.power_on {
            self.adapter.power_on();
        }
        if let Some(agent) = self.agent.as_mut() {
            agent.register(&mut self.adapter.handle())?;
        }
        if self.adapter.is_powered() {
            self.bring_up();
        } else {
            log::info!("waiting for {} to be powered on", self.adapter.path());
        }
        Ok(())
    }

    /// Queues the teardown sequence: agent, application, advertisement, then the adapter's own
    /// state. Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        if self.phase == Phase::ShuttingDown {
            return;
        }
        log::info!("shutting down peripheral on {}", self.adapter.path());
        self.phase = Phase::ShuttingDown;

        if let Some(agent) = self.agent.as_mut() {
            agent.unregister(&mut self.adapter.handle());
        }
        self.adapter.unregister_application();
        self.adapter.stop_advertising();
        self.adapter.release();
    }

    /// Applies one incoming event.
    pub fn dispatch(&mut self, event: Event) {
        log::trace!("dispatching {}", event.name());
        match event {
            Event::PoweredChanged(powered) => {
                if !self.adapter.set_powered(powered) {
                    return;
                }
                log::info!(
                    "{} powered {}",
                    self.adapter.path(),
                    if powered { "on" } else { "off" }
                );
                self.observer.on_powered_changed(powered);
                if powered && self.phase == Phase::Running {
                    self.bring_up();
                }
            }
            Event::DiscoverableChanged(discoverable) => {
                self.adapter.set_discoverable(discoverable);
            }
            Event::DeviceAdded {
                address,
                properties,
            } => {
                self.adapter.device_entry(address);
                let transition = self.adapter.update_device(address, &properties);
                self.central_transition(address, transition);
            }
            Event::DeviceChanged {
                address,
                properties,
            } => {
                let transition = self.adapter.update_device(address, &properties);
                self.central_transition(address, transition);
            }
            Event::DeviceRemoved(address) => {
                if let Some(device) = self.adapter.remove_device(address) {
                    log::debug!("{} removed", device);
                    if device.is_connected() {
                        self.resume_advertising();
                    }
                }
            }
            Event::CharacteristicRead { request, responder } => {
                let result = match self.adapter.gatt() {
                    Some(mut gatt) => gatt.serve_read(&mut *self.handler, &request).map_err(refusal),
                    None => Err(GattError::Failed),
                };
                responder.send(result);
            }
            Event::CharacteristicWrite { request, responder } => {
                let result = match self.adapter.gatt() {
                    Some(mut gatt) => gatt.serve_write(&mut *self.handler, &request).map_err(refusal),
                    None => Err(GattError::Failed),
                };
                responder.send(result);
            }
            Event::DescriptorRead {
                request,
                descriptor,
                responder,
            } => {
                let result = match self.adapter.gatt() {
                    Some(mut gatt) => {
                        gatt.serve_descriptor_read(&mut *self.handler, &request, descriptor)
                            .map_err(refusal)
                    }
                    None => Err(GattError::Failed),
                };
                responder.send(result);
            }
            Event::DescriptorWrite {
                request,
                descriptor,
                responder,
            } => {
                let result = match self.adapter.gatt() {
                    Some(mut gatt) => {
                        gatt.serve_descriptor_write(&mut *self.handler, &request, descriptor)
                            .map_err(refusal)
                    }
                    None => Err(GattError::Failed),
                };
                responder.send(result);
            }
            Event::NotifySubscriptionChanged {
                service,
                characteristic,
                subscribed,
                responder,
            } => {
                let result = match self.adapter.gatt() {
                    Some(mut gatt) => gatt
                        .serve_subscription(&mut *self.handler, service, characteristic, subscribed)
                        .map_err(refusal),
                    None => Err(GattError::Failed),
                };
                responder.send(result);
            }
            Event::AdvertisementReleased => self.adapter.advertisement_released(),
            Event::AgentReleased => {
                if let Some(agent) = self.agent.as_mut() {
                    agent.released();
                }
            }
            Event::RequestAuthorization { device, responder } => {
                let allowed = self.prompt_agent(device, |agent, dev| agent.request_authorization(dev));
                responder.send(allowed.unwrap_or(false));
            }
            Event::RequestPasskey { device, responder } => {
                let passkey = self.prompt_agent(device, |agent, dev| agent.request_passkey(dev));
                responder.send(passkey.flatten());
            }
            Event::RequestConfirmation {
                device,
                passkey,
                responder,
            } => {
                let confirmed = self.prompt_agent(device, |agent, dev| {
                    agent.request_confirmation(dev, passkey)
                });
                responder.send(confirmed.unwrap_or(false));
            }
            Event::DisplayPasskey {
                device,
                passkey,
                entered,
            } => {
                self.prompt_agent(device, |agent, dev| agent.display_passkey(dev, passkey, entered));
            }
            Event::AuthorizeService {
                device,
                service,
                responder,
            } => {
                let allowed =
                    self.prompt_agent(device, |agent, dev| agent.authorize_service(dev, service));
                responder.send(allowed.unwrap_or(false));
            }
            Event::PairingCancelled => {
                if let Some(agent) = self.agent.as_mut() {
                    agent.cancel();
                }
            }
            Event::Interrupt => {
                log::info!("interrupted");
                self.shutdown();
            }
        }
    }

    /// Drives the session until it has shut down.
    ///
    /// Queued daemon calls are issued one at a time, in order, and each one fails with
    /// [`ErrorKind::TransportFailure`][crate::ErrorKind::TransportFailure] if it takes longer than
    /// [`Config::call_timeout`]. Events keep being dispatched while a call is in flight. The
    /// session shuts down on [`Event::Interrupt`], when `events` ends, or when the configured
    /// timeout expires; this returns once every teardown call has completed, or once
    /// [`Config::shutdown_timeout`] has passed. The transport itself is left open for the caller
    /// to close.
    pub async fn run<T, S>(&mut self, transport: &T, events: S) -> Result<()>
    where
        T: Transport,
        S: Stream<Item = Event>,
    {
        self.start()?;

        let call_timeout = self.config.call_timeout;
        let mut events = pin!(events);
        let mut listening = true;
        let mut deadline = self.config.timeout.map(Timer::after);
        let mut teardown: Option<Timer> = None;
        let mut in_flight: Option<LocalBoxFuture<'_, (Request, Result<()>)>> = None;

        loop {
            if self.phase == Phase::ShuttingDown && teardown.is_none() {
                teardown = Some(Timer::after(self.config.shutdown_timeout));
            }
            if in_flight.is_none() {
                if let Some(request) = self.adapter.next_request() {
                    log::debug!("issuing {}", request.name());
                    in_flight = Some(
                        async move {
                            let call = request.execute(transport);
                            let timer = Timer::after(call_timeout);
                            let result = match future::select(pin!(call), timer).await {
                                Either::Left((result, _)) => result,
                                Either::Right(_) => Err(Error::transport(format!(
                                    "{} timed out after {:?}",
                                    request.name(),
                                    call_timeout
                                ))),
                            };
                            (request, result)
                        }
                        .boxed_local(),
                    );
                } else if self.phase == Phase::ShuttingDown {
                    break;
                }
            }

            let accepting = listening && self.phase != Phase::ShuttingDown;
            let step = poll_fn(|cx| {
                if let Some(call) = in_flight.as_mut() {
                    if let Poll::Ready((request, result)) = call.as_mut().poll(cx) {
                        return Poll::Ready(Step::Completed(request, result));
                    }
                }
                if accepting {
                    if let Poll::Ready(event) = events.as_mut().poll_next(cx) {
                        return Poll::Ready(Step::Event(event));
                    }
                }
                if let Some(timer) = deadline.as_mut() {
                    if Pin::new(timer).poll(cx).is_ready() {
                        return Poll::Ready(Step::Timeout);
                    }
                }
                if let Some(timer) = teardown.as_mut() {
                    if Pin::new(timer).poll(cx).is_ready() {
                        return Poll::Ready(Step::TeardownExpired);
                    }
                }
                Poll::Pending
            })
            .await;

            match step {
                Step::Completed(request, result) => {
                    in_flight = None;
                    self.complete(&request, result);
                }
                Step::Event(Some(event)) => self.dispatch(event),
                Step::Event(None) => {
                    log::info!("event stream ended");
                    listening = false;
                    self.shutdown();
                }
                Step::Timeout => {
                    log::info!("session timed out");
                    deadline = None;
                    self.shutdown();
                }
                Step::TeardownExpired => {
                    let abandoned = self.adapter.abandon_requests() + usize::from(in_flight.is_some());
                    log::warn!(
                        "teardown of {} did not finish in {:?}, abandoning {} call(s)",
                        self.adapter.path(),
                        self.config.shutdown_timeout,
                        abandoned
                    );
                    break;
                }
            }
        }

        log::debug!("peripheral on {} stopped", self.adapter.path());
        Ok(())
    }

    /// Registers whatever the daemon dropped and resumes advertising. Runs on startup and after
    /// every power-on.
    fn bring_up(&mut self) {
        let unregistered = self
            .adapter
            .application()
            .map_or(false, |app| app.state() == RegistrationState::Unregistered);
        if unregistered {
            if let Err(e) = self.adapter.register_application() {
                self.report("RegisterApplication", e);
            }
        }
        self.resume_advertising();
    }

    fn resume_advertising(&mut self) {
        if self.phase != Phase::Running || !self.adapter.is_powered() {
            return;
        }
        if let Some(device) = self.adapter.connected_devices().next() {
            log::debug!("{} is still connected, not advertising", device.address());
            return;
        }
        if let Err(e) = self.adapter.start_advertising() {
            self.report("RegisterAdvertisement", e);
        }
    }

    fn central_transition(&mut self, address: Address, transition: Option<Transition>) {
        let Some(transition) = transition else { return };
        if let Some(device) = self.adapter.device(address) {
            log::info!("{}: {} -> {}", address, transition.from, transition.to);
            self.observer.on_central_state_changed(device, transition);
        }

        match transition.to {
            ConnectionState::Connected => self.adapter.stop_advertising(),
            ConnectionState::Disconnected => self.resume_advertising(),
            ConnectionState::Connecting | ConnectionState::Disconnecting => {}
        }
    }

    fn prompt_agent<R>(
        &mut self,
        device: Address,
        f: impl FnOnce(&mut Agent, &Device) -> R,
    ) -> Option<R> {
        let Some(agent) = self.agent.as_mut() else {
            log::warn!("pairing prompt for {} without an agent", device);
            return None;
        };
        let device = self.adapter.device_entry(device);
        Some(f(agent, device))
    }

    fn complete(&mut self, request: &Request, result: Result<()>) {
        let outcome = match request {
            Request::RegisterAgent { .. } => match self.agent.as_mut() {
                Some(agent) => agent.registered(result),
                None => Ok(()),
            },
            Request::UnregisterAgent { path } => {
                if let Err(e) = result {
                    log::debug!("unregistering agent {} failed: {}", path, e);
                }
                Ok(())
            }
            _ => {
                let (outcome, transition) = self.adapter.complete(request, result);
                if let Some((address, transition)) = transition {
                    self.central_transition(address, Some(transition));
                }
                outcome
            }
        };
        if let Err(e) = outcome {
            self.report(request.name(), e);
        }
    }

    fn report(&mut self, what: &'static str, error: Error) {
        log::error!("{} failed: {}", what, error);
        self.observer.on_registration_failed(what, &error);
    }
}

/// Turns a failed GATT request into the code BlueZ sends back to the central.
fn refusal(error: Error) -> GattError {
    match error.rejection() {
        Some(code) => {
            log::debug!("{}", error);
            code
        }
        None => {
            log::error!("request for attribute not in the tree: {}", error);
            GattError::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use futures_util::{stream, StreamExt};

    use super::*;
    use crate::{
        advertisement::AdvertisingState,
        agent::{AgentHandler, Capability},
        device::DeviceProperties,
        event::Responder,
        gatt::{CharacteristicFlags, Gatt, ReadRequest, WriteRequest},
    };

    const PATH: &str = "/org/bluez/hci0";
    const HTS: Uuid = Uuid::from_u16(0x1809);
    const TEMPERATURE: Uuid = Uuid::from_u16(0x2a1c);

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<&'static str>>,
        failing: Vec<&'static str>,
        /// Calls that never complete.
        hanging: Vec<&'static str>,
        /// Calls that return `Pending` once before completing.
        yielding: Vec<&'static str>,
    }

    impl Recorder {
        async fn call(&self, name: &'static str) -> Result<()> {
            self.calls.borrow_mut().push(name);
            if self.hanging.contains(&name) {
                future::pending::<()>().await;
            }
            if self.yielding.contains(&name) {
                let mut yielded = false;
                poll_fn(|cx| {
                    if yielded {
                        Poll::Ready(())
                    } else {
                        yielded = true;
                        cx.waker().wake_by_ref();
                        Poll::Pending
                    }
                })
                .await;
            }
            if self.failing.contains(&name) {
                Err(Error::transport("injected failure"))
            } else {
                Ok(())
            }
        }
    }

    impl Transport for Recorder {
        async fn set_powered(&self, _: &str, _: bool) -> Result<()> {
            self.call("SetPowered").await
        }
        async fn register_application(&self, _: &str, _: &[crate::gatt::Service]) -> Result<()> {
            self.call("RegisterApplication").await
        }
        async fn unregister_application(&self, _: &str) -> Result<()> {
            self.call("UnregisterApplication").await
        }
        async fn register_advertisement(&self, _: &str, _: &Advertisement) -> Result<()> {
            self.call("RegisterAdvertisement").await
        }
        async fn unregister_advertisement(&self, _: &str) -> Result<()> {
            self.call("UnregisterAdvertisement").await
        }
        async fn register_agent(&self, _: &str, _: Capability) -> Result<()> {
            self.call("RegisterAgent").await
        }
        async fn unregister_agent(&self, _: &str) -> Result<()> {
            self.call("UnregisterAgent").await
        }
        async fn notify(&self, _: Uuid, _: Uuid, _: &[u8]) -> Result<()> {
            self.call("Notify").await
        }
        async fn disconnect_device(&self, _: &str, _: Address) -> Result<()> {
            self.call("Disconnect").await
        }
    }

    struct Keypad {
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl AgentHandler for Keypad {
        fn on_request_authorization(&mut self, _: &Device) -> bool {
            true
        }

        fn on_request_passkey(&mut self, device: &Device) -> Option<u32> {
            self.seen
                .borrow_mut()
                .push(device.name().unwrap_or_default().to_string());
            Some(123456)
        }
    }

    #[derive(Clone, Default)]
    struct Log(Rc<RefCell<Vec<String>>>);

    impl PeripheralObserver for Log {
        fn on_powered_changed(&mut self, powered: bool) {
            self.0.borrow_mut().push(format!("powered {}", powered));
        }
        fn on_central_state_changed(&mut self, device: &Device, transition: Transition) {
            self.0
                .borrow_mut()
                .push(format!("{} {}", device.address(), transition.to));
        }
        fn on_registration_failed(&mut self, what: &'static str, _: &Error) {
            self.0.borrow_mut().push(format!("{} failed", what));
        }
    }

    fn central() -> Address {
        "AA:BB:CC:11:22:33".parse().unwrap()
    }

    fn connected(connected: bool) -> Event {
        Event::DeviceChanged {
            address: central(),
            properties: DeviceProperties::connected(connected),
        }
    }

    fn peripheral() -> Peripheral {
        let mut app = Application::new();
        app.add_service(HTS).unwrap();
        app.add_characteristic(
            HTS,
            TEMPERATURE,
            CharacteristicFlags::READ | CharacteristicFlags::WRITE | CharacteristicFlags::INDICATE,
        )
        .unwrap();
        Peripheral::new(
            Adapter::new(PATH),
            app,
            Advertisement::new().local_name("BINC"),
        )
        .with_config(Config {
            timeout: None,
            ..Config::default()
        })
    }

    /// Completes every queued call successfully and returns their names.
    fn settle(p: &mut Peripheral) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Some(request) = p.adapter.next_request() {
            names.push(request.name());
            p.complete(&request, Ok(()));
        }
        names
    }

    fn advertising(p: &Peripheral) -> Option<AdvertisingState> {
        p.adapter().advertising_state()
    }

    fn started() -> Peripheral {
        let mut p = peripheral();
        p.start().unwrap();
        p.dispatch(Event::PoweredChanged(true));
        assert_eq!(
            settle(&mut p),
            ["SetPowered", "RegisterApplication", "RegisterAdvertisement"]
        );
        assert_eq!(advertising(&p), Some(AdvertisingState::Active));
        p
    }

    #[test]
    fn connect_stops_and_disconnect_resumes() {
        let mut p = started();

        p.dispatch(connected(true));
        assert_eq!(settle(&mut p), ["UnregisterAdvertisement"]);
        assert_eq!(advertising(&p), Some(AdvertisingState::Inactive));

        p.dispatch(connected(false));
        assert_eq!(settle(&mut p), ["RegisterAdvertisement"]);
        assert_eq!(advertising(&p), Some(AdvertisingState::Active));
    }

    #[test]
    fn rapid_reconnect_ends_inactive() {
        let mut p = started();

        p.dispatch(connected(true));
        p.dispatch(connected(false));
        p.dispatch(connected(true));
        assert_eq!(settle(&mut p), ["UnregisterAdvertisement"]);
        assert_eq!(advertising(&p), Some(AdvertisingState::Inactive));
    }

    #[test]
    fn advertising_stays_off_while_another_central_is_connected() {
        let mut p = started();
        let other: Address = "11:22:33:44:55:66".parse().unwrap();

        p.dispatch(connected(true));
        p.dispatch(Event::DeviceChanged {
            address: other,
            properties: DeviceProperties::connected(true),
        });
        settle(&mut p);
        p.dispatch(connected(false));
        assert!(settle(&mut p).is_empty());

        p.dispatch(Event::DeviceRemoved(other));
        assert_eq!(settle(&mut p), ["RegisterAdvertisement"]);
    }

    #[test]
    fn passkey_is_forwarded_unmodified() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut p = peripheral().with_agent(Agent::new(
            Capability::KeyboardDisplay,
            Keypad { seen: seen.clone() },
        ));
        p.start().unwrap();
        p.dispatch(Event::DeviceAdded {
            address: central(),
            properties: DeviceProperties {
                name: Some("central-1".into()),
                ..Default::default()
            },
        });

        let (responder, mut answer) = Responder::new();
        p.dispatch(Event::RequestPasskey {
            device: central(),
            responder,
        });
        assert_eq!(answer.try_recv().unwrap(), Some(Some(123456)));
        assert_eq!(*seen.borrow(), ["central-1"]);
    }

    #[test]
    fn prompts_without_agent_are_refused() {
        let mut p = peripheral();
        let (responder, mut answer) = Responder::new();
        p.dispatch(Event::RequestAuthorization {
            device: central(),
            responder,
        });
        assert_eq!(answer.try_recv().unwrap(), Some(false));
    }

    #[test]
    fn read_goes_through_the_tree() {
        let mut p = started();
        p.set_characteristic_value(HTS, TEMPERATURE, [0x06, 0x6f, 0x01, 0x00])
            .unwrap();

        let (responder, mut answer) = Responder::new();
        p.dispatch(Event::CharacteristicRead {
            request: ReadRequest {
                device: Some(central()),
                service: HTS,
                characteristic: TEMPERATURE,
                mtu: 23,
                offset: 0,
            },
            responder,
        });
        assert_eq!(
            answer.try_recv().unwrap(),
            Some(Ok(vec![0x06, 0x6f, 0x01, 0x00]))
        );
        assert!(!p.notify(HTS, TEMPERATURE, [1]).unwrap());
    }

    #[test]
    fn refusals_reach_the_central() {
        struct ReadOnly;
        impl GattHandler for ReadOnly {
            fn on_write(
                &mut self,
                _: &mut Gatt<'_>,
                _: &WriteRequest,
            ) -> std::result::Result<(), GattError> {
                Err(GattError::NotAuthorized)
            }
        }

        let mut p = started().with_gatt_handler(ReadOnly);
        let (responder, mut answer) = Responder::new();
        p.dispatch(Event::CharacteristicWrite {
            request: WriteRequest {
                device: Some(central()),
                service: HTS,
                characteristic: TEMPERATURE,
                value: vec![1],
                mtu: 23,
                offset: 0,
            },
            responder,
        });
        assert_eq!(answer.try_recv().unwrap(), Some(Err(GattError::NotAuthorized)));

        let (responder, mut answer) = Responder::new();
        p.dispatch(Event::CharacteristicRead {
            request: ReadRequest {
                device: None,
                service: HTS,
                characteristic: Uuid::from_u16(0x2a1e),
                mtu: 23,
                offset: 0,
            },
            responder,
        });
        assert_eq!(answer.try_recv().unwrap(), Some(Err(GattError::Failed)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut p = started();
        p.shutdown();
        assert_eq!(
            settle(&mut p),
            ["UnregisterApplication", "UnregisterAdvertisement"]
        );
        p.shutdown();
        assert!(settle(&mut p).is_empty());
        assert_eq!(advertising(&p), Some(AdvertisingState::Inactive));
        assert!(p.is_shutting_down());
    }

    #[test]
    fn power_cycle_re_registers() {
        let log = Log::default();
        let mut p = started().with_observer(log.clone());

        p.dispatch(Event::PoweredChanged(false));
        assert!(settle(&mut p).is_empty());
        assert_eq!(advertising(&p), Some(AdvertisingState::Inactive));

        p.dispatch(Event::PoweredChanged(true));
        assert_eq!(
            settle(&mut p),
            ["RegisterApplication", "RegisterAdvertisement"]
        );
        assert_eq!(*log.0.borrow(), ["powered false", "powered true"]);
    }

    #[test]
    fn run_until_events_end() {
        let recorder = Recorder::default();
        let log = Log::default();
        let mut p = peripheral().with_observer(log.clone());

        let events = stream::iter([Event::PoweredChanged(true), connected(true), connected(false)]);
        pollster::block_on(p.run(&recorder, events)).unwrap();

        assert_eq!(
            *recorder.calls.borrow(),
            [
                "SetPowered",
                "RegisterApplication",
                "RegisterAdvertisement",
                "UnregisterAdvertisement",
                "RegisterAdvertisement",
                "UnregisterApplication",
                "UnregisterAdvertisement",
            ]
        );
        assert_eq!(
            *log.0.borrow(),
            [
                "powered true",
                "AA:BB:CC:11:22:33 connected",
                "AA:BB:CC:11:22:33 disconnected"
            ]
        );
        assert!(p.adapter().devices().next().is_none());
    }

    #[test]
    fn failed_advertising_is_not_fatal() {
        let recorder = Recorder {
            failing: vec!["RegisterAdvertisement"],
            ..Default::default()
        };
        let log = Log::default();
        let mut p = peripheral().with_observer(log.clone());

        let events = stream::iter([Event::PoweredChanged(true)]);
        pollster::block_on(p.run(&recorder, events)).unwrap();

        assert_eq!(advertising(&p), Some(AdvertisingState::Inactive));
        assert!(log
            .0
            .borrow()
            .contains(&"RegisterAdvertisement failed".to_string()));
        assert_eq!(
            recorder.calls.borrow().last().copied(),
            Some("UnregisterApplication")
        );
    }

    #[test]
    fn timeout_shuts_down() {
        let recorder = Recorder::default();
        let mut p = peripheral().with_config(Config {
            timeout: Some(Duration::from_millis(20)),
            power_on: false,
            ..Config::default()
        });

        pollster::block_on(p.run(&recorder, stream::pending())).unwrap();
        assert!(p.is_shutting_down());
        assert!(recorder.calls.borrow().is_empty());
    }

    #[test]
    fn interrupt_shuts_down() {
        let recorder = Recorder::default();
        let mut p = peripheral();
        let events = stream::iter([Event::PoweredChanged(true), Event::Interrupt]).chain(stream::pending());

        pollster::block_on(p.run(&recorder, events)).unwrap();
        assert_eq!(
            recorder.calls.borrow().last().copied(),
            Some("UnregisterAdvertisement")
        );
    }

    #[test]
    fn agent_goes_up_first_and_down_first() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut p = peripheral().with_agent(Agent::new(Capability::KeyboardDisplay, Keypad { seen }));
        p.start().unwrap();
        p.dispatch(Event::PoweredChanged(true));
        assert_eq!(
            settle(&mut p),
            [
                "SetPowered",
                "RegisterAgent",
                "RegisterApplication",
                "RegisterAdvertisement"
            ]
        );

        p.shutdown();
        p.shutdown();
        assert_eq!(
            settle(&mut p),
            [
                "UnregisterAgent",
                "UnregisterApplication",
                "UnregisterAdvertisement"
            ]
        );
        assert!(settle(&mut p).is_empty());
    }

    #[test]
    fn connect_during_advertising_start_ends_inactive() {
        let recorder = Recorder {
            yielding: vec!["RegisterAdvertisement"],
            ..Default::default()
        };
        let log = Log::default();
        let mut p = peripheral().with_observer(log.clone());

        let events = stream::iter([Event::PoweredChanged(true), connected(true)]);
        pollster::block_on(p.run(&recorder, events)).unwrap();

        assert_eq!(
            *recorder.calls.borrow(),
            [
                "SetPowered",
                "RegisterApplication",
                "RegisterAdvertisement",
                "UnregisterAdvertisement",
                "UnregisterApplication",
            ]
        );
        assert_eq!(advertising(&p), Some(AdvertisingState::Inactive));
        assert!(log
            .0
            .borrow()
            .contains(&"AA:BB:CC:11:22:33 connected".to_string()));
    }

    #[test]
    fn hung_call_times_out() {
        let recorder = Recorder {
            hanging: vec!["RegisterAdvertisement"],
            ..Default::default()
        };
        let log = Log::default();
        let mut p = peripheral().with_observer(log.clone()).with_config(Config {
            timeout: None,
            call_timeout: Duration::from_millis(20),
            ..Config::default()
        });

        let events = stream::iter([Event::PoweredChanged(true)]);
        pollster::block_on(p.run(&recorder, events)).unwrap();

        assert_eq!(advertising(&p), Some(AdvertisingState::Inactive));
        assert!(log
            .0
            .borrow()
            .contains(&"RegisterAdvertisement failed".to_string()));
        assert_eq!(
            recorder.calls.borrow().last().copied(),
            Some("UnregisterApplication")
        );
    }

    #[test]
    fn interrupt_with_hung_call_still_returns() {
        let recorder = Recorder {
            hanging: vec!["SetPowered"],
            ..Default::default()
        };
        let mut p = peripheral().with_config(Config {
            timeout: Some(Duration::from_millis(50)),
            shutdown_timeout: Duration::from_millis(50),
            ..Config::default()
        });
        let events = stream::iter([Event::Interrupt]).chain(stream::pending());

        pollster::block_on(p.run(&recorder, events)).unwrap();
        assert!(p.is_shutting_down());
        assert_eq!(*recorder.calls.borrow(), ["SetPowered"]);
        assert!(p.adapter().pending_requests().is_empty());
    }
}
