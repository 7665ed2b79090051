//! Everything the daemon tells a peripheral, as one typed stream.

use std::fmt;

use futures_channel::oneshot;

use crate::{
    address::Address,
    device::DeviceProperties,
    gatt::{GattError, ReadRequest, WriteRequest},
    uuid::Uuid,
};

/// The answer to a GATT request: the bytes to send, or a protocol-level refusal.
pub type GattResult<T> = std::result::Result<T, GattError>;

/// Sends the answer to an [`Event`] back to whoever is waiting for it.
///
/// Dropping a `Responder` without answering makes the waiting side see a cancellation.
pub struct Responder<T> {
    sender: oneshot::Sender<T>,
}

impl<T> Responder<T> {
    /// Creates a responder and the receiver its answer will arrive on.
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    pub fn send(self, value: T) {
        if self.sender.send(value).is_err() {
            log::debug!("requester went away before the answer was ready");
        }
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("canceled", &self.sender.is_canceled())
            .finish()
    }
}

/// A daemon signal or incoming method call.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    PoweredChanged(bool),
    DiscoverableChanged(bool),
    /// The daemon knows a new remote device (or already knew it when the stream opened).
    DeviceAdded {
        address: Address,
        properties: DeviceProperties,
    },
    DeviceChanged {
        address: Address,
        properties: DeviceProperties,
    },
    DeviceRemoved(Address),
    CharacteristicRead {
        request: ReadRequest,
        responder: Responder<GattResult<Vec<u8>>>,
    },
    CharacteristicWrite {
        request: WriteRequest,
        responder: Responder<GattResult<()>>,
    },
    DescriptorRead {
        request: ReadRequest,
        descriptor: Uuid,
        responder: Responder<GattResult<Vec<u8>>>,
    },
    DescriptorWrite {
        request: WriteRequest,
        descriptor: Uuid,
        responder: Responder<GattResult<()>>,
    },
    /// A central called `StartNotify` (`subscribed == true`) or `StopNotify`.
    NotifySubscriptionChanged {
        service: Uuid,
        characteristic: Uuid,
        subscribed: bool,
        responder: Responder<GattResult<()>>,
    },
    /// The daemon dropped the advertisement on its own.
    AdvertisementReleased,
    AgentReleased,
    RequestAuthorization {
        device: Address,
        responder: Responder<bool>,
    },
    RequestPasskey {
        device: Address,
        responder: Responder<Option<u32>>,
    },
    RequestConfirmation {
        device: Address,
        passkey: u32,
        responder: Responder<bool>,
    },
    DisplayPasskey {
        device: Address,
        passkey: u32,
        entered: u16,
    },
    AuthorizeService {
        device: Address,
        service: Uuid,
        responder: Responder<bool>,
    },
    PairingCancelled,
    /// The process was asked to stop (eg. SIGINT).
    Interrupt,
}

impl Event {
    /// Short name of the event, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::PoweredChanged(_) => "PoweredChanged",
            Event::DiscoverableChanged(_) => "DiscoverableChanged",
            Event::DeviceAdded { .. } => "DeviceAdded",
            Event::DeviceChanged { .. } => "DeviceChanged",
            Event::DeviceRemoved(_) => "DeviceRemoved",
            Event::CharacteristicRead { .. } => "CharacteristicRead",
            Event::CharacteristicWrite { .. } => "CharacteristicWrite",
            Event::DescriptorRead { .. } => "DescriptorRead",
            Event::DescriptorWrite { .. } => "DescriptorWrite",
            Event::NotifySubscriptionChanged { .. } => "NotifySubscriptionChanged",
            Event::AdvertisementReleased => "AdvertisementReleased",
            Event::AgentReleased => "AgentReleased",
            Event::RequestAuthorization { .. } => "RequestAuthorization",
            Event::RequestPasskey { .. } => "RequestPasskey",
            Event::RequestConfirmation { .. } => "RequestConfirmation",
            Event::DisplayPasskey { .. } => "DisplayPasskey",
            Event::AuthorizeService { .. } => "AuthorizeService",
            Event::PairingCancelled => "PairingCancelled",
            Event::Interrupt => "Interrupt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_delivers() {
        let (responder, mut receiver) = Responder::new();
        responder.send(Some(123456u32));
        assert_eq!(receiver.try_recv().unwrap(), Some(Some(123456)));
    }

    #[test]
    fn dropped_receiver_is_harmless() {
        let (responder, receiver) = Responder::<bool>::new();
        drop(receiver);
        responder.send(true);
    }
}
