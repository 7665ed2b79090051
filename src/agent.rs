//! Pairing agent.
//!
//! BlueZ asks the default agent whenever a central wants to pair or access a protected service.
//! An [`Agent`] answers those prompts by calling into a user-supplied [`AgentHandler`].
//!
//! Handler methods are called from the event loop and the loop waits for them to return. A handler
//! that blocks (eg. reading a passkey from the console) holds up every other event until it is
//! done. This is accepted: while a pairing prompt is outstanding, the central that triggered it
//! cannot do anything else either, and the daemon will time the prompt out if nobody answers.

use crate::{
    adapter::AdapterHandle, device::Device, gatt::RegistrationState, transport::Request,
    uuid::Uuid, Error, Result,
};

/// Largest passkey BlueZ accepts (six decimal digits).
pub const MAX_PASSKEY: u32 = 999_999;

/// The input and output abilities an [`Agent`] declares to the daemon.
///
/// This decides which pairing method BlueZ picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    DisplayOnly,
    DisplayYesNo,
    KeyboardOnly,
    NoInputNoOutput,
    KeyboardDisplay,
}

impl Capability {
    pub(crate) fn to_bluez(self) -> &'static str {
        match self {
            Capability::DisplayOnly => "DisplayOnly",
            Capability::DisplayYesNo => "DisplayYesNo",
            Capability::KeyboardOnly => "KeyboardOnly",
            Capability::NoInputNoOutput => "NoInputNoOutput",
            Capability::KeyboardDisplay => "KeyboardDisplay",
        }
    }
}

/// Decisions taken on behalf of the local user during pairing.
///
/// Only [`AgentHandler::on_request_passkey`] and [`AgentHandler::on_request_authorization`] need
/// an implementation; the remaining prompts accept by default.
pub trait AgentHandler {
    /// Asks whether `device` may pair without any user interaction.
    fn on_request_authorization(&mut self, device: &Device) -> bool;

    /// Asks for the passkey shown on `device`. Returning `None` rejects the pairing.
    fn on_request_passkey(&mut self, device: &Device) -> Option<u32>;

    fn on_request_confirmation(&mut self, device: &Device, passkey: u32) -> bool {
        log::debug!("confirming passkey {:06} for {}", passkey, device.address());
        true
    }

    fn on_display_passkey(&mut self, device: &Device, passkey: u32, entered: u16) {
        log::info!(
            "passkey for {}: {:06} ({} digit(s) entered)",
            device.address(),
            passkey,
            entered
        );
    }

    fn on_authorize_service(&mut self, device: &Device, service: Uuid) -> bool {
        log::debug!("authorizing {} for service {}", device.address(), service);
        true
    }

    /// The daemon gave up on the outstanding prompt.
    fn on_cancel(&mut self) {}
}

/// A pairing agent registered with BlueZ.
pub struct Agent {
    path: String,
    capability: Capability,
    state: RegistrationState,
    handler: Box<dyn AgentHandler>,
}

impl Agent {
    pub const DEFAULT_PATH: &'static str = "/org/blues/peripheral/agent";

    pub fn new(capability: Capability, handler: impl AgentHandler + 'static) -> Self {
        Self {
            path: Self::DEFAULT_PATH.to_string(),
            capability,
            state: RegistrationState::Unregistered,
            handler: Box::new(handler),
        }
    }

    /// Exports the agent at `path` instead of [`Agent::DEFAULT_PATH`].
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub(crate) fn register(&mut self, adapter: &mut AdapterHandle<'_>) -> Result<()> {
        if self.state != RegistrationState::Unregistered {
            return Err(Error::already_registered("pairing agent"));
        }
        log::debug!(
            "registering {} agent at {}",
            self.capability.to_bluez(),
            self.path
        );
        self.state = RegistrationState::Registering;
        adapter.submit(Request::RegisterAgent {
            path: self.path.clone(),
            capability: self.capability,
        });
        Ok(())
    }

    pub(crate) fn registered(&mut self, result: Result<()>) -> Result<()> {
        if self.state != RegistrationState::Registering {
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

    pub(crate) fn unregister(&mut self, adapter: &mut AdapterHandle<'_>) {
        if self.state == RegistrationState::Unregistered {
            return;
        }
        adapter.submit(Request::UnregisterAgent {
            path: self.path.clone(),
        });
        self.state = RegistrationState::Unregistered;
    }

    /// The daemon no longer uses this agent.
    pub(crate) fn released(&mut self) {
        log::debug!("agent {} released", self.path);
        self.state = RegistrationState::Unregistered;
    }

    pub(crate) fn request_authorization(&mut self, device: &Device) -> bool {
        self.handler.on_request_authorization(device)
    }

    pub(crate) fn request_passkey(&mut self, device: &Device) -> Option<u32> {
        let passkey = self.handler.on_request_passkey(device)?;
        if passkey > MAX_PASSKEY {
            log::warn!("rejecting out-of-range passkey {} for {}", passkey, device.address());
            return None;
        }
        Some(passkey)
    }

    pub(crate) fn request_confirmation(&mut self, device: &Device, passkey: u32) -> bool {
        self.handler.on_request_confirmation(device, passkey)
    }

    pub(crate) fn display_passkey(&mut self, device: &Device, passkey: u32, entered: u16) {
        self.handler.on_display_passkey(device, passkey, entered)
    }

    pub(crate) fn authorize_service(&mut self, device: &Device, service: Uuid) -> bool {
        self.handler.on_authorize_service(device, service)
    }

    pub(crate) fn cancel(&mut self) {
        self.handler.on_cancel()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("path", &self.path)
            .field("capability", &self.capability)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::DeviceProperties, transport::Outbox};

    struct Fixed(u32);

    impl AgentHandler for Fixed {
        fn on_request_authorization(&mut self, _: &Device) -> bool {
            false
        }

        fn on_request_passkey(&mut self, _: &Device) -> Option<u32> {
            Some(self.0)
        }
    }

    fn device() -> Device {
        let mut dev = Device::new("AA:BB:CC:11:22:33".parse().unwrap());
        dev.apply(&DeviceProperties {
            name: Some("central-1".into()),
            ..Default::default()
        });
        dev
    }

    #[test]
    fn passkey_range() {
        let dev = device();
        assert_eq!(
            Agent::new(Capability::KeyboardDisplay, Fixed(123456)).request_passkey(&dev),
            Some(123456)
        );
        assert_eq!(
            Agent::new(Capability::KeyboardDisplay, Fixed(1_000_000)).request_passkey(&dev),
            None
        );
    }

    #[test]
    fn default_prompts() {
        let dev = device();
        let mut agent = Agent::new(Capability::DisplayYesNo, Fixed(0));
        assert!(!agent.request_authorization(&dev));
        assert!(agent.request_confirmation(&dev, 42));
        assert!(agent.authorize_service(&dev, Uuid::from_u16(0x1809)));
    }

    #[test]
    fn registration() {
        let mut outbox = Outbox::default();
        let mut adapter = AdapterHandle::new("/org/bluez/hci0", &mut outbox);
        let mut agent = Agent::new(Capability::KeyboardDisplay, Fixed(0)).with_path("/test/agent");

        agent.unregister(&mut adapter);
        agent.register(&mut adapter).unwrap();
        assert!(agent.register(&mut adapter).is_err());
        agent.registered(Ok(())).unwrap();
        assert_eq!(agent.state(), RegistrationState::Registered);
        agent.unregister(&mut adapter);
        agent.unregister(&mut adapter);

        let requests: Vec<_> = outbox.drain().collect();
        assert_eq!(
            requests,
            [
                Request::RegisterAgent {
                    path: "/test/agent".into(),
                    capability: Capability::KeyboardDisplay,
                },
                Request::UnregisterAgent {
                    path: "/test/agent".into(),
                },
            ]
        );
        assert_eq!(Capability::KeyboardDisplay.to_bluez(), "KeyboardDisplay");
    }
}
