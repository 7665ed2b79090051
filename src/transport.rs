//! The boundary between the peripheral state machine and the daemon.
//!
//! Components never talk to BlueZ directly. They push [`Request`]s into the adapter's [`Outbox`],
//! and [`Peripheral::run`][crate::peripheral::Peripheral::run] hands them to a [`Transport`] one at
//! a time. [`Session`][crate::Session] is the D-Bus implementation; tests use an in-memory one.

use std::collections::VecDeque;

use crate::{
    address::Address, advertisement::Advertisement, agent::Capability, gatt::Service, uuid::Uuid,
    Result,
};

/// The daemon calls the peripheral stack relies on.
///
/// Every method is a single asynchronous call whose completion is reported back to the state
/// machine. Implementations do not need to be thread-safe: calls are issued from one task and
/// never overlap.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn set_powered(&self, adapter: &str, powered: bool) -> Result<()>;

    /// Exports the attribute tree and registers it with the adapter's GATT manager.
    async fn register_application(&self, adapter: &str, services: &[Service]) -> Result<()>;

    async fn unregister_application(&self, adapter: &str) -> Result<()>;

    async fn register_advertisement(
        &self,
        adapter: &str,
        advertisement: &Advertisement,
    ) -> Result<()>;

    async fn unregister_advertisement(&self, adapter: &str) -> Result<()>;

    /// Registers a pairing agent and asks for it to become the default agent.
    async fn register_agent(&self, path: &str, capability: Capability) -> Result<()>;

    async fn unregister_agent(&self, path: &str) -> Result<()>;

    /// Emits a value change for a characteristic, delivered to subscribed centrals.
    async fn notify(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<()>;

    async fn disconnect_device(&self, adapter: &str, device: Address) -> Result<()>;
}

/// A daemon call waiting to be issued.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SetPowered {
        adapter: String,
        powered: bool,
    },
    RegisterApplication {
        adapter: String,
        services: Vec<Service>,
    },
    UnregisterApplication {
        adapter: String,
    },
    RegisterAdvertisement {
        adapter: String,
        advertisement: Advertisement,
    },
    UnregisterAdvertisement {
        adapter: String,
    },
    RegisterAgent {
        path: String,
        capability: Capability,
    },
    UnregisterAgent {
        path: String,
    },
    Notify {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnect {
        adapter: String,
        device: Address,
    },
}

impl Request {
    /// Short name of the call, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::SetPowered { .. } => "SetPowered",
            Request::RegisterApplication { .. } => "RegisterApplication",
            Request::UnregisterApplication { .. } => "UnregisterApplication",
            Request::RegisterAdvertisement { .. } => "RegisterAdvertisement",
            Request::UnregisterAdvertisement { .. } => "UnregisterAdvertisement",
            Request::RegisterAgent { .. } => "RegisterAgent",
            Request::UnregisterAgent { .. } => "UnregisterAgent",
            Request::Notify { .. } => "Notify",
            Request::Disconnect { .. } => "Disconnect",
        }
    }

    pub(crate) async fn execute<T: Transport>(&self, transport: &T) -> Result<()> {
        match self {
            Request::SetPowered { adapter, powered } => {
                transport.set_powered(adapter, *powered).await
            }
            Request::RegisterApplication { adapter, services } => {
                transport.register_application(adapter, services).await
            }
            Request::UnregisterApplication { adapter } => {
                transport.unregister_application(adapter).await
            }
            Request::RegisterAdvertisement {
                adapter,
                advertisement,
            } => {
                transport
                    .register_advertisement(adapter, advertisement)
                    .await
            }
            Request::UnregisterAdvertisement { adapter } => {
                transport.unregister_advertisement(adapter).await
            }
            Request::RegisterAgent { path, capability } => {
                transport.register_agent(path, *capability).await
            }
            Request::UnregisterAgent { path } => transport.unregister_agent(path).await,
            Request::Notify {
                service,
                characteristic,
                value,
            } => transport.notify(*service, *characteristic, value).await,
            Request::Disconnect { adapter, device } => {
                transport.disconnect_device(adapter, *device).await
            }
        }
    }
}

/// FIFO queue of [`Request`]s owned by an [`Adapter`][crate::adapter::Adapter].
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Request>,
}

impl Outbox {
    pub(crate) fn push(&mut self, request: Request) {
        log::trace!("queued {}", request.name());
        self.queue.push_back(request);
    }

    pub(crate) fn pop(&mut self) -> Option<Request> {
        self.queue.pop_front()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Request> + '_ {
        self.queue.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.queue.iter()
    }
}
