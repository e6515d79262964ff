//! Fog node gateway
//!
//! Scans for BLE sensor peripherals, keeps them connected, forwards their
//! readings to the device service and to REST subscribers, and serves the
//! device façade until Ctrl-C or SIGTERM.
//!
//! Built without the `ble-central` feature, the node runs against the
//! in-process simulated host with one demo Smart Vase in range.

use std::sync::Arc;

use anyhow::Context;
use fognode::ble::BleHost;
use fognode::config::Config;
use fognode::device::DeviceCatalog;
use fognode::device_service::HttpDeviceService;
use fognode::runner::TransportRunner;
use fognode::server;
use fognode::signal::{self, Signal};
use fognode::transport::BleTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load().context("loading configuration")?;
    log::info!(
        "Fog node starting (REST port {}, device service {}:{})",
        config.server.port,
        config.device_service.host,
        config.device_service.port
    );

    let device_service = HttpDeviceService::new(&config.device_service.host, config.device_service.port)
        .context("building device service client")?;
    let host = open_host().await?;

    let catalog = DeviceCatalog::standard(config.ble.smart_vase, config.ble.generic_name_filters.clone());
    log::info!("Recognizing device kinds: {:?}", catalog.kinds());
    let transport = Arc::new(
        BleTransport::new(host, catalog)
            .with_scan_period(config.ble.scan_period())
            .with_mtu(config.ble.mtu)
            .with_room(config.ble.room.clone())
            .with_device_service(Arc::new(device_service)),
    );

    let stop_requested = signal::shutdown_requested().context("installing signal handlers")?;

    let mut runner = TransportRunner::new();
    runner.add(transport.clone());
    runner.run().await?;

    let server_shutdown = Signal::new();
    let client = server::callback_client().context("building callback client")?;
    let server = tokio::spawn(server::serve(
        transport,
        client,
        config.server.port,
        server_shutdown.listener(),
    ));

    let cause = stop_requested.await;
    log::info!("{} received, shutting down", cause);

    server_shutdown.fire();
    runner.stop().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("REST server failed: {}", e),
        Err(e) => log::error!("REST server task failed: {}", e),
    }
    Ok(())
}

#[cfg(feature = "ble-central")]
async fn open_host() -> anyhow::Result<Arc<dyn BleHost>> {
    let host = fognode::ble::central::BtleplugHost::new()
        .await
        .context("opening Bluetooth adapter")?;
    Ok(host as Arc<dyn BleHost>)
}

#[cfg(not(feature = "ble-central"))]
async fn open_host() -> anyhow::Result<Arc<dyn BleHost>> {
    demo::start().await
}

#[cfg(not(feature = "ble-central"))]
mod demo {
    use std::sync::Arc;
    use std::time::Duration;

    use fognode::ble::simulated::SimBleHost;
    use fognode::ble::BleHost;
    use fognode::device::smart_vase;
    use fognode::model::PeripheralId;

    const DEMO_VASE_ID: &str = "sim-vase-1";
    const DEMO_INTERVAL: Duration = Duration::from_secs(5);

    /// Power up a simulated adapter with one vase that keeps advertising and,
    /// once connected, reports a slowly changing temperature.
    pub async fn start() -> anyhow::Result<Arc<dyn BleHost>> {
        log::warn!("Built without ble-central, running against the simulated host");

        let host = SimBleHost::new();
        let vase = host
            .add_peripheral(smart_vase::simulated_peripheral(DEMO_VASE_ID, "Smart Vase demo"))
            .await;
        host.power_on();

        let air = Arc::clone(&host);
        tokio::spawn(async move {
            let id = PeripheralId::new(DEMO_VASE_ID);
            let mut ticker = tokio::time::interval(DEMO_INTERVAL);
            let mut temperature: u8 = 18;
            loop {
                ticker.tick().await;
                if !vase.is_connected() {
                    air.advertise(&id).await;
                    continue;
                }
                temperature = if temperature >= 26 { 18 } else { temperature + 1 };
                vase.notify(smart_vase::TEMPERATURE_CHARACTERISTIC, &[temperature]).await;
                vase.notify(smart_vase::MOISTURE_CHARACTERISTIC, &[42]).await;
            }
        });

        Ok(host as Arc<dyn BleHost>)
    }
}
