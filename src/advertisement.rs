//! LE advertisements and the advertising state machine.

use std::time::Duration;

use crate::{adapter::AdapterHandle, transport::Request, uuid::Uuid, Result};

/// Secondary advertising channel PHY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryChannel {
    OneM,
    TwoM,
    Coded,
}

impl SecondaryChannel {
    pub(crate) fn to_bluez(self) -> &'static str {
        match self {
            SecondaryChannel::OneM => "1M",
            SecondaryChannel::TwoM => "2M",
            SecondaryChannel::Coded => "Coded",
        }
    }
}

/// The broadcast payload of a peripheral.
///
/// Built with chained setters:
///
/// ```
/// # use std::time::Duration;
/// # use blues_peripheral::{advertisement::{Advertisement, SecondaryChannel}, uuid::Uuid};
/// let adv = Advertisement::new()
///     .local_name("BINC")
///     .service_uuid(Uuid::from_u16(0x1809))
///     .secondary_channel(SecondaryChannel::TwoM)
///     .interval(Duration::from_millis(500), Duration::from_millis(500))
///     .tx_power(5);
/// assert_eq!(adv.service_uuids(), [Uuid::from_u16(0x1809)]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    local_name: Option<String>,
    service_uuids: Vec<Uuid>,
    tx_power: Option<i16>,
    interval: Option<(Duration, Duration)>,
    secondary_channel: Option<SecondaryChannel>,
}

impl Advertisement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Adds a service UUID to the payload. Adding the same UUID twice has no effect.
    pub fn service_uuid(mut self, uuid: Uuid) -> Self {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
        self
    }

    pub fn tx_power(mut self, dbm: i16) -> Self {
        self.tx_power = Some(dbm);
        self
    }

    /// Sets the advertising interval range. The bounds are swapped if given in the wrong order.
    pub fn interval(mut self, min: Duration, max: Duration) -> Self {
        self.interval = Some(if min <= max { (min, max) } else { (max, min) });
        self
    }

    pub fn secondary_channel(mut self, channel: SecondaryChannel) -> Self {
        self.secondary_channel = Some(channel);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }

    pub fn power(&self) -> Option<i16> {
        self.tx_power
    }

    pub fn interval_range(&self) -> Option<(Duration, Duration)> {
        self.interval
    }

    pub fn channel(&self) -> Option<SecondaryChannel> {
        self.secondary_channel
    }
}

/// Where an advertisement stands with the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisingState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

/// An [`Advertisement`] plus its registration state.
///
/// At most one registration call is in flight. A start or stop requested while a call is pending
/// only updates the wanted state, which is reconciled once the pending call completes. Repeated
/// requests therefore never pile up.
#[derive(Debug)]
pub(crate) struct Advertising {
    advertisement: Advertisement,
    state: AdvertisingState,
    wanted: bool,
}

impl Advertising {
    pub(crate) fn new(advertisement: Advertisement) -> Self {
        Self {
            advertisement,
            state: AdvertisingState::Inactive,
            wanted: false,
        }
    }

    pub(crate) fn state(&self) -> AdvertisingState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn is_wanted(&self) -> bool {
        self.wanted
    }

    /// Records that advertising is wanted without issuing anything.
    pub(crate) fn want(&mut self, wanted: bool) {
        self.wanted = wanted;
    }

    pub(crate) fn start(&mut self, adapter: &mut AdapterHandle<'_>) {
        self.wanted = true;
        if self.state == AdvertisingState::Inactive {
            self.issue_start(adapter);
        }
    }

    pub(crate) fn stop(&mut self, adapter: &mut AdapterHandle<'_>) {
        self.wanted = false;
        if self.state == AdvertisingState::Active {
            self.issue_stop(adapter);
        }
    }

    /// Applies the daemon's answer to a registration call.
    pub(crate) fn started(&mut self, adapter: &mut AdapterHandle<'_>, result: Result<()>) -> Result<()> {
        if self.state != AdvertisingState::Starting {
            return Ok(());
        }
        if let Err(e) = result {
            self.state = AdvertisingState::Inactive;
            self.wanted = false;
            return Err(e);
        }

        log::debug!("advertising on {}", adapter.path());
        self.state = AdvertisingState::Active;
        if !self.wanted {
            self.issue_stop(adapter);
        }
        Ok(())
    }

    /// Applies the daemon's answer to an unregistration call.
    ///
    /// A failed unregistration still leaves the advertisement inactive: the only way it fails is
    /// the daemon no longer knowing about it.
    pub(crate) fn stopped(&mut self, adapter: &mut AdapterHandle<'_>, result: Result<()>) {
        if self.state != AdvertisingState::Stopping {
            return;
        }
        if let Err(e) = result {
            log::warn!("failed to unregister advertisement: {}", e);
        }

        log::debug!("stopped advertising on {}", adapter.path());
        self.state = AdvertisingState::Inactive;
        if self.wanted {
            self.issue_start(adapter);
        }
    }

    /// The daemon dropped the advertisement on its own (`Release`, power loss).
    pub(crate) fn released(&mut self) {
        if self.state == AdvertisingState::Active {
            self.state = AdvertisingState::Inactive;
        }
    }

    /// Forgets all registration state. Used when the adapter loses power.
    pub(crate) fn reset(&mut self) {
        self.state = AdvertisingState::Inactive;
    }

    fn issue_start(&mut self, adapter: &mut AdapterHandle<'_>) {
        self.state = AdvertisingState::Starting;
        adapter.submit(Request::RegisterAdvertisement {
            adapter: adapter.path().to_string(),
            advertisement: self.advertisement.clone(),
        });
    }

    fn issue_stop(&mut self, adapter: &mut AdapterHandle<'_>) {
        self.state = AdvertisingState::Stopping;
        adapter.submit(Request::UnregisterAdvertisement {
            adapter: adapter.path().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, transport::Outbox, Error};

    const PATH: &str = "/org/bluez/hci0";

    fn names(outbox: &mut Outbox) -> Vec<&'static str> {
        outbox.drain().map(|r| r.name()).collect()
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut outbox = Outbox::default();
        let mut adv = Advertising::new(Advertisement::new().local_name("BINC"));

        let mut adapter = AdapterHandle::new(PATH, &mut outbox);
        adv.start(&mut adapter);
        adv.start(&mut adapter);
        assert_eq!(adv.state(), AdvertisingState::Starting);
        adv.started(&mut adapter, Ok(())).unwrap();
        adv.start(&mut adapter);
        assert_eq!(adv.state(), AdvertisingState::Active);

        adv.stop(&mut adapter);
        adv.stop(&mut adapter);
        adv.stopped(&mut adapter, Ok(()));
        adv.stop(&mut adapter);
        assert_eq!(adv.state(), AdvertisingState::Inactive);

        assert_eq!(
            names(&mut outbox),
            ["RegisterAdvertisement", "UnregisterAdvertisement"]
        );
    }

    #[test]
    fn requests_while_in_flight_are_coalesced() {
        let mut outbox = Outbox::default();
        let mut adv = Advertising::new(Advertisement::new());
        let mut adapter = AdapterHandle::new(PATH, &mut outbox);
        adv.start(&mut adapter);
        adv.started(&mut adapter, Ok(())).unwrap();

        // stop, start, stop while the first stop is still pending
        adv.stop(&mut adapter);
        adv.start(&mut adapter);
        adv.stop(&mut adapter);
        adv.stopped(&mut adapter, Ok(()));

        assert_eq!(adv.state(), AdvertisingState::Inactive);
        assert_eq!(
            names(&mut outbox),
            ["RegisterAdvertisement", "UnregisterAdvertisement"]
        );
    }

    #[test]
    fn start_queued_behind_stop() {
        let mut outbox = Outbox::default();
        let mut adv = Advertising::new(Advertisement::new());
        let mut adapter = AdapterHandle::new(PATH, &mut outbox);
        adv.start(&mut adapter);
        adv.started(&mut adapter, Ok(())).unwrap();
        adv.stop(&mut adapter);
        adv.start(&mut adapter);
        assert_eq!(adv.state(), AdvertisingState::Stopping);

        adv.stopped(&mut adapter, Ok(()));
        assert_eq!(adv.state(), AdvertisingState::Starting);
        assert_eq!(
            names(&mut outbox),
            [
                "RegisterAdvertisement",
                "UnregisterAdvertisement",
                "RegisterAdvertisement"
            ]
        );
    }

    #[test]
    fn failed_start_rolls_back() {
        let mut outbox = Outbox::default();
        let mut adv = Advertising::new(Advertisement::new());
        let mut adapter = AdapterHandle::new(PATH, &mut outbox);
        adv.start(&mut adapter);
        let err = adv
            .started(&mut adapter, Err(Error::transport("no reply")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert_eq!(adv.state(), AdvertisingState::Inactive);
        assert!(!adv.is_wanted());
    }

    #[test]
    fn builder() {
        let adv = Advertisement::new()
            .service_uuid(Uuid::from_u16(0x1809))
            .service_uuid(Uuid::from_u16(0x1809))
            .interval(Duration::from_millis(600), Duration::from_millis(500));
        assert_eq!(adv.service_uuids().len(), 1);
        assert_eq!(
            adv.interval_range(),
            Some((Duration::from_millis(500), Duration::from_millis(600)))
        );
        assert_eq!(SecondaryChannel::TwoM.to_bluez(), "2M");
    }
}
