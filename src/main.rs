//! Heart-Rate Peripheral Demo
//!
//! Runs the peripheral against the simulated radio and sensor. A scripted
//! central connects, subscribes, reads and leaves in a loop until Ctrl-C.

use anyhow::{Context, Result};
use btleplug::api::BDAddr;
use env_logger::Env;
use hrs_peripheral::components::peripheral::GattPeripheral;
use hrs_peripheral::components::simulation::{SimulatedRadio, SimulatedSensor};
use hrs_peripheral::core::config::PeripheralConfig;
use hrs_peripheral::core::events::StatusEvent;
use hrs_peripheral::model::service::ServiceDescriptor;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;

const RESTING_BPM: u16 = 68;
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const ADVERTISE_ATTEMPTS: u32 = 5;

/// Plays a central that comes and goes.
async fn scripted_central(radio: Arc<SimulatedRadio>) {
    let watch = BDAddr::from([0xD4, 0x36, 0x39, 0x01, 0x02, 0x03]);
    let phone = BDAddr::from([0x5C, 0xF3, 0x70, 0xAA, 0xBB, 0xCC]);
    let mut request_id = 0;
    loop {
        radio.connect(watch);
        radio.subscribe(watch);
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Connected but never subscribed.
        radio.connect(phone);
        request_id += 1;
        radio.read(phone, request_id);
        tokio::time::sleep(Duration::from_secs(5)).await;

        radio.unsubscribe(watch);
        tokio::time::sleep(Duration::from_secs(2)).await;
        radio.disconnect(watch);
        radio.disconnect(phone);
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
}

async fn load_config() -> Result<PeripheralConfig> {
    match std::env::var("HRS_CONFIG") {
        Ok(path) => PeripheralConfig::load(&path).await,
        Err(_) => Ok(PeripheralConfig::default()),
    }
}

async fn run() -> Result<()> {
    let config = load_config().await?;
    let radio = Arc::new(SimulatedRadio::new());
    let (peripheral, handle) =
        GattPeripheral::open(radio.clone(), ServiceDescriptor::heart_rate(), config).await?;
    let event_loop = peripheral.spawn();

    let mut status = handle.subscribe_status();
    let observer = tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(StatusEvent::Dispatched(report)) => info!("{}", report),
                Ok(event) => info!("{:?}", event),
                Err(RecvError::Lagged(missed)) => warn!("status observer missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    handle
        .start_advertising_with_retry(ADVERTISE_ATTEMPTS)
        .await
        .context("could not start advertising")?;
    let sensor = SimulatedSensor::new(RESTING_BPM).spawn(handle.clone(), SAMPLE_INTERVAL);
    let central = tokio::spawn(scripted_central(radio));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    sensor.abort();
    central.abort();
    handle.shutdown().await?;
    event_loop.await?;
    observer.abort();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        Env::default()
            .filter_or("HRS_LOG_LEVEL", "info")
            .write_style_or("HRS_LOG_STYLE", "always"),
    )
    .init();

    let rt = Runtime::new().context("unable to create runtime")?;
    rt.block_on(run())
}
