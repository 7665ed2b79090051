//! A BLE GATT peripheral on top of BlueZ's D-Bus API.
//!
//! The local adapter is driven by a [`Peripheral`][peripheral::Peripheral]: it owns the
//! [`Adapter`], the GATT [`Application`][gatt::Application], the advertisement and an optional
//! pairing [`Agent`][agent::Agent], and turns daemon [`Event`][event::Event]s into calls issued
//! through a [`Transport`][transport::Transport]. [`Session`] is the transport that talks to the
//! real daemon.
//!
//! ```no_run
//! # use blues_peripheral::{*, advertisement::Advertisement, gatt::Application, uuid::Uuid};
//! # async fn run() -> Result<()> {
//! let session = Session::new().await?;
//! let adapter = Adapter::open(&session).await?;
//! let events = session.events(&adapter).await?;
//!
//! let mut app = Application::new();
//! app.add_service(Uuid::from_u16(0x1809))?;
//! let mut peripheral = peripheral::Peripheral::new(adapter, app, Advertisement::new());
//! peripheral.run(&session, events.into_stream()).await?;
//! session.close().await;
//! # Ok(()) }
//! ```

pub mod adapter;
pub mod address;
pub mod advertisement;
pub mod agent;
mod bluez;
pub mod device;
mod error;
pub mod event;
mod export;
pub mod gatt;
pub mod peripheral;
pub mod transport;
pub mod uuid;

use std::sync::{Arc, Mutex};

pub use adapter::Adapter;
pub use bluez::Events;
pub use error::{Error, ErrorKind, Result};

use event::Event;
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use zbus::{fdo::ObjectManagerProxy, Connection};

/// A cloneable handle to a D-Bus connection.
///
/// Besides issuing calls to BlueZ, a session serves the objects BlueZ calls back into (the GATT
/// application, the advertisement and the pairing agent) and implements
/// [`Transport`][transport::Transport] for [`Peripheral::run`][peripheral::Peripheral::run].
#[derive(Clone)]
pub struct Session {
    conn: Connection,
    prefix: Arc<str>,
    calls: UnboundedSender<Event>,
    incoming: Arc<Mutex<Option<UnboundedReceiver<Event>>>>,
    exported: Arc<Mutex<export::Exported>>,
}

impl Session {
    pub const DEFAULT_PREFIX: &'static str = "/org/blues/peripheral";

    /// Creates a new D-Bus connection.
    pub async fn new() -> Result<Self> {
        let (calls, incoming) = mpsc::unbounded();
        Ok(Self {
            conn: Connection::system().await.map_err(Error::from)?,
            prefix: Arc::from(Self::DEFAULT_PREFIX),
            calls,
            incoming: Arc::new(Mutex::new(Some(incoming))),
            exported: Arc::default(),
        })
    }

    /// Serves the application and advertisement objects below `prefix` instead of
    /// [`Session::DEFAULT_PREFIX`].
    pub fn with_prefix(mut self, prefix: &str) -> Result<Self> {
        zbus::zvariant::ObjectPath::try_from(prefix).map_err(Error::from)?;
        self.prefix = Arc::from(prefix.trim_end_matches('/'));
        Ok(self)
    }

    /// Returns a handle that stops a running [`Peripheral`][peripheral::Peripheral] from anywhere,
    /// eg. a signal handler.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            calls: self.calls.clone(),
        }
    }

    /// Removes every object this session still serves.
    ///
    /// After a clean shutdown there is nothing left to remove; this catches what an aborted
    /// session leaves behind.
    pub async fn close(&self) {
        let (application, advertisement, agent) = {
            let mut exported = self
                .exported
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (
                exported.take_application(),
                exported.take_advertisement(),
                exported.take_agent(),
            )
        };
        if let Some(application) = application {
            application.unexport(&self.conn).await;
        }
        if let Some(path) = advertisement {
            export::unexport_advertisement(&self.conn, &path).await;
        }
        if let Some(path) = agent {
            export::unexport_agent(&self.conn, &path).await;
        }
    }

    /// Connects to the BlueZ D-Bus object manager.
    pub(crate) async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>> {
        ObjectManagerProxy::builder(&self.conn)
            .destination("org.bluez")
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)
    }
}

/// Delivers [`Event::Interrupt`] to a session's event stream.
#[derive(Debug, Clone)]
pub struct Interrupter {
    calls: UnboundedSender<Event>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        if self.calls.unbounded_send(Event::Interrupt).is_err() {
            log::debug!("interrupt after the event stream was closed");
        }
    }
}
