use std::{
    io::{self, BufRead, Write},
    time::Duration,
};

use blues_peripheral::{
    advertisement::{Advertisement, SecondaryChannel},
    agent::{Agent, AgentHandler, Capability},
    device::{Device, Transition},
    gatt::{
        Application, CharacteristicFlags, DescriptorFlags, Gatt, GattError, GattHandler,
        ReadRequest,
    },
    peripheral::{Config, Peripheral, PeripheralObserver},
    uuid::Uuid,
    Adapter, Error, Session,
};

// https://www.bluetooth.com/specifications/assigned-numbers/
const HEALTH_THERMOMETER_SERVICE: Uuid = Uuid::from_u16(0x1809);
const TEMPERATURE_CHARACTERISTIC: Uuid = Uuid::from_u16(0x2A1C);
const USER_DESCRIPTION_DESCRIPTOR: Uuid = Uuid::from_u16(0x2901);

/// 36.6 °C as an IEEE-11073 FLOAT, flags byte first.
const DEFAULT_MEASUREMENT: [u8; 5] = [0x00, 0x6E, 0x01, 0x00, 0xFF];

struct Thermometer;

impl GattHandler for Thermometer {
    fn on_read(&mut self, gatt: &mut Gatt<'_>, request: &ReadRequest) -> Result<(), GattError> {
        log::info!(
            "read of {} by {:?} (offset {})",
            request.characteristic,
            request.device,
            request.offset
        );
        if request.characteristic == TEMPERATURE_CHARACTERISTIC {
            let empty = gatt
                .characteristic_value(request.service, request.characteristic)
                .map_or(true, |v| v.is_empty());
            if empty {
                gatt.set_characteristic_value(
                    request.service,
                    request.characteristic,
                    DEFAULT_MEASUREMENT,
                )
                .map_err(|_| GattError::Failed)?;
            }
        }
        Ok(())
    }

    fn on_updated(&mut self, _gatt: &mut Gatt<'_>, _service: Uuid, characteristic: Uuid, value: &[u8]) {
        log::info!("{} is now {:02x?}", characteristic, value);
    }

    fn on_start_notify(&mut self, gatt: &mut Gatt<'_>, service: Uuid, characteristic: Uuid) {
        log::info!("indications enabled for {}", characteristic);
        if let Err(e) = gatt.notify(service, characteristic, DEFAULT_MEASUREMENT) {
            log::error!("failed to indicate: {}", e);
        }
    }

    fn on_stop_notify(&mut self, _gatt: &mut Gatt<'_>, _service: Uuid, characteristic: Uuid) {
        log::info!("indications disabled for {}", characteristic);
    }
}

struct Console;

impl AgentHandler for Console {
    fn on_request_authorization(&mut self, device: &Device) -> bool {
        log::info!("allowing {} to pair", device);
        true
    }

    fn on_request_passkey(&mut self, device: &Device) -> Option<u32> {
        print!("enter the passkey shown on {}: ", device.address());
        io::stdout().flush().ok()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        line.trim().parse().ok()
    }
}

struct Logger;

impl PeripheralObserver for Logger {
    fn on_powered_changed(&mut self, powered: bool) {
        log::info!("adapter powered: {}", powered);
    }

    fn on_central_state_changed(&mut self, device: &Device, transition: Transition) {
        log::info!("{}: {} -> {}", device.address(), transition.from, transition.to);
    }

    fn on_registration_failed(&mut self, what: &'static str, error: &Error) {
        eprintln!("warning: couldn't register {}: {}", what, error);
    }
}

#[pollster::main]
async fn main() -> blues_peripheral::Result<()> {
    env_logger::builder()
        .filter_module("blues_peripheral", log::LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    let session = Session::new().await?;
    let adapter = Adapter::open(&session).await?;
    log::debug!("using adapter {} ({:?})", adapter.path(), adapter.address());
    let events = session.events(&adapter).await?;

    let interrupter = session.interrupter();
    simple_signal::set_handler(
        &[simple_signal::Signal::Int, simple_signal::Signal::Term],
        move |_| interrupter.interrupt(),
    );

    let mut app = Application::new();
    app.add_service(HEALTH_THERMOMETER_SERVICE)?;
    app.add_characteristic(
        HEALTH_THERMOMETER_SERVICE,
        TEMPERATURE_CHARACTERISTIC,
        CharacteristicFlags::READ | CharacteristicFlags::WRITE | CharacteristicFlags::INDICATE,
    )?;
    app.add_descriptor(
        HEALTH_THERMOMETER_SERVICE,
        TEMPERATURE_CHARACTERISTIC,
        USER_DESCRIPTION_DESCRIPTOR,
        DescriptorFlags::READ | DescriptorFlags::WRITE,
    )?;
    app.set_descriptor_value(
        HEALTH_THERMOMETER_SERVICE,
        TEMPERATURE_CHARACTERISTIC,
        USER_DESCRIPTION_DESCRIPTOR,
        "hello there",
    )?;

    let advertisement = Advertisement::new()
        .local_name("BINC")
        .service_uuid(HEALTH_THERMOMETER_SERVICE)
        .secondary_channel(SecondaryChannel::TwoM)
        .interval(Duration::from_millis(500), Duration::from_millis(500))
        .tx_power(5);

    let mut peripheral = Peripheral::new(adapter, app, advertisement)
        .with_agent(Agent::new(Capability::KeyboardDisplay, Console))
        .with_gatt_handler(Thermometer)
        .with_observer(Logger)
        .with_config(Config {
            timeout: Some(Duration::from_secs(600)),
            ..Config::default()
        });

    log::info!("serving; press Ctrl+C to stop");
    let result = peripheral.run(&session, events.into_stream()).await;
    session.close().await;
    result
}
