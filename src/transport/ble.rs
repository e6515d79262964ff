//! BLE transport
//!
//! Drives the host stack: scans while the adapter is powered, connects to
//! recognized peripherals, runs each device session on its own task and
//! tears everything down on shutdown.
//!
//! All host events, re-scan ticks and the shutdown signal are consumed by a
//! single biased select loop, so shutdown always wins a tie.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use super::{Transport, TransportError};
use crate::ble::{AdapterState, Advertisement, BleHost, HostEvent};
use crate::callback::{Callback, CallbackError, CallbackRegistry, ReadingSink};
use crate::connection::{ConnectionRegistry, LinkState, Session};
use crate::device::{Device, DeviceCatalog, DeviceContext};
use crate::device_service::DeviceService;
use crate::model::{PeripheralId, Reading};
use crate::signal::SignalListener;

/// How often a scan is re-issued while the adapter is powered on.
pub const DEFAULT_SCAN_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not started, or the adapter is not powered on.
    Idle,
    Scanning,
    /// Shut down; every connection has been torn down.
    Stopped,
}

pub struct BleTransport {
    host: Arc<dyn BleHost>,
    catalog: DeviceCatalog,
    ctx: DeviceContext,
    connections: Arc<ConnectionRegistry>,
    callbacks: Arc<CallbackRegistry>,
    scan_period: Duration,
    state: watch::Sender<TransportState>,
}

impl BleTransport {
    pub fn new(host: Arc<dyn BleHost>, catalog: DeviceCatalog) -> Self {
        let callbacks = Arc::new(CallbackRegistry::new());
        let ctx = DeviceContext::new(ReadingSink::new(Arc::clone(&callbacks)));
        let (state, _) = watch::channel(TransportState::Idle);

        Self {
            host,
            catalog,
            ctx,
            connections: Arc::new(ConnectionRegistry::new()),
            callbacks,
            scan_period: DEFAULT_SCAN_PERIOD,
            state,
        }
    }

    pub fn with_scan_period(mut self, scan_period: Duration) -> Self {
        self.scan_period = scan_period;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.ctx.mtu = mtu;
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.ctx.room = room.into();
        self
    }

    pub fn with_device_service(mut self, service: Arc<dyn DeviceService>) -> Self {
        self.ctx = self.ctx.with_device_service(service);
        self
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub async fn get_devices(&self) -> Vec<Arc<dyn Device>> {
        self.connections.list().await
    }

    pub async fn get_device_by_id(&self, id: &PeripheralId) -> Option<Arc<dyn Device>> {
        self.connections.get(id).await
    }

    /// Subscribe to readings. A key that is already registered yields
    /// [`CallbackError::AlreadyRegistered`] carrying the existing id.
    pub async fn add_callback(&self, key: impl Into<String>, deliver: Callback) -> Result<Uuid, CallbackError> {
        self.callbacks.add(key, deliver).await
    }

    pub async fn remove_callback(&self, id: Uuid) -> bool {
        self.callbacks.remove(id).await
    }

    pub async fn get_callback_uuid(&self, key: &str) -> Option<Uuid> {
        self.callbacks.id_for(key).await
    }

    /// Fan a reading out to every subscriber and wait for the round to finish.
    pub async fn on_reading_produced(&self, peripheral_id: &PeripheralId, reading: &Reading) {
        self.callbacks.dispatch(peripheral_id, reading).await;
    }

    fn set_state(&self, state: TransportState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::info!("BLE transport {:?} -> {:?}", previous, state);
        }
    }

    async fn begin_scanning(&self, rescan: &mut Interval) {
        if self.state() == TransportState::Scanning {
            return;
        }
        self.set_state(TransportState::Scanning);
        self.scan().await;
        rescan.reset();
    }

    async fn scan(&self) {
        if let Err(e) = self.host.start_scan().await {
            log::warn!("Failed to start scanning: {}", e);
        }
    }

    async fn handle_event(&self, event: HostEvent, sessions: &mut JoinSet<()>, rescan: &mut Interval) {
        match event {
            HostEvent::StateChanged(AdapterState::PoweredOn) => self.begin_scanning(rescan).await,
            HostEvent::StateChanged(state) => {
                log::warn!("Adapter is {:?}, scanning paused", state);
                if self.state() == TransportState::Scanning {
                    if let Err(e) = self.host.stop_scan().await {
                        log::warn!("Failed to stop scanning: {}", e);
                    }
                }
                self.set_state(TransportState::Idle);
            }
            HostEvent::Discovered(adv) => self.on_discovered(adv).await,
            HostEvent::Connected(id) => self.on_connected(id, sessions).await,
            HostEvent::ConnectFailed { id, reason } => {
                if self.connections.remove(&id).await.is_some() {
                    log::warn!("Failed to connect to {}: {}", id, reason);
                }
            }
            HostEvent::Disconnected(id) => self.on_disconnected(id, sessions).await,
        }
    }

    async fn on_discovered(&self, adv: Advertisement) {
        if self.state() != TransportState::Scanning {
            return;
        }
        let id = adv.peripheral_id.clone();
        if self.connections.contains(&id).await {
            return;
        }

        let Some(device) = self.catalog.recognize(&adv, &self.ctx) else {
            log::debug!("Ignoring unrecognized peripheral {}", id);
            return;
        };

        // A concurrent discovery may have claimed the id since the check above.
        if !self.connections.add(id.clone(), Arc::clone(&device)).await {
            return;
        }

        log::info!("Connecting to {} ({})", device.name(), id);
        if let Err(e) = self.host.connect(&id).await {
            log::warn!("Failed to connect to {}: {}", id, e);
            self.connections.remove(&id).await;
        }
    }

    async fn on_connected(&self, id: PeripheralId, sessions: &mut JoinSet<()>) {
        if self.connections.state(&id).await != Some(LinkState::Connecting) {
            log::debug!("Ignoring connection to untracked peripheral {}", id);
            return;
        }

        let peripheral = match self.host.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                log::warn!("Connected to {} but could not open it: {}", id, e);
                if let Some(connection) = self.connections.remove(&id).await {
                    connection.close();
                }
                if let Err(e) = self.host.cancel_connection(&id).await {
                    log::warn!("Failed to cancel connection to {}: {}", id, e);
                }
                return;
            }
        };

        let Some(session) = self.connections.mark_connected(&id, Arc::clone(&peripheral)).await else {
            return;
        };

        log::info!("Connected to {} ({})", session.device.name(), id);
        let host = Arc::clone(&self.host);
        let connections = Arc::clone(&self.connections);
        sessions.spawn(async move {
            let Session {
                device,
                teardown,
                generation,
            } = session;
            match device.on_connected(peripheral, teardown).await {
                Ok(()) => log::info!("Session with {} ended", id),
                Err(e) => log::warn!("Session with {} failed: {}", id, e),
            }
            // Once the host reported the link gone, or a newer connection
            // took the id, the link is no longer this session's to drop.
            if !connections.owns_link(&id, generation).await {
                return;
            }
            if let Err(e) = host.cancel_connection(&id).await {
                log::warn!("Failed to cancel connection to {}: {}", id, e);
            }
        });
    }

    /// Run the disconnect hook, then fire the teardown, then forget the entry.
    async fn on_disconnected(&self, id: PeripheralId, sessions: &mut JoinSet<()>) {
        let Some(departure) = self.connections.mark_disconnecting(&id).await else {
            return;
        };
        log::info!("Disconnected from {} ({})", departure.device.name(), id);

        let connections = Arc::clone(&self.connections);
        sessions.spawn(async move {
            if let Some(peripheral) = departure.peripheral {
                if let Err(e) = departure.device.on_disconnected(peripheral).await {
                    log::warn!("Disconnect hook of {} failed: {}", id, e);
                }
            }
            departure.teardown.fire();
            connections.remove_generation(&id, departure.generation).await;
        });
    }

    /// Bring the registry back in line with the host after host events were
    /// dropped.
    async fn reconcile(&self, sessions: &mut JoinSet<()>) {
        for id in self.connections.ids_in(LinkState::Connected).await {
            if !self.host.is_connected(&id).await {
                log::warn!("Link to {} is gone without a disconnect event", id);
                self.on_disconnected(id, sessions).await;
            }
        }
        for id in self.connections.ids_in(LinkState::Connecting).await {
            if self.host.is_connected(&id).await {
                self.on_connected(id, sessions).await;
            }
        }
    }

    async fn shut_down(&self, mut sessions: JoinSet<()>) {
        let closed = self.connections.close_all().await;
        log::info!("BLE transport shutting down, closing {} connections", closed);

        if let Err(e) = self.host.stop_scan().await {
            log::warn!("Failed to stop scanning: {}", e);
        }

        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                log::warn!("Device session task failed: {}", e);
            }
        }

        // Disconnects are no longer observed; forget whatever is left.
        for id in self.connections.ids().await {
            self.connections.remove(&id).await;
        }
        self.set_state(TransportState::Stopped);
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn name(&self) -> &str {
        "ble"
    }

    async fn start(&self, mut shutdown: SignalListener) -> Result<(), TransportError> {
        // Subscribe before reading the adapter state so no power-on is missed.
        let mut events = self.host.events();
        let mut rescan = tokio::time::interval(self.scan_period);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sessions = JoinSet::new();
        let mut host_open = true;

        self.set_state(TransportState::Idle);
        if self.host.adapter_state().await == AdapterState::PoweredOn {
            self.begin_scanning(&mut rescan).await;
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown.fired() => break,

                event = events.recv(), if host_open => match event {
                    Ok(event) => self.handle_event(event, &mut sessions, &mut rescan).await,
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("BLE transport fell behind, {} host events dropped", missed);
                        self.reconcile(&mut sessions).await;
                    }
                    Err(RecvError::Closed) => {
                        log::warn!("BLE host event stream closed");
                        host_open = false;
                    }
                },

                _ = rescan.tick() => {
                    if self.state() == TransportState::Scanning {
                        log::debug!("Re-issuing scan");
                        self.scan().await;
                    }
                }

                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = result {
                        log::warn!("Device session task failed: {}", e);
                    }
                }
            }
        }

        self.shut_down(sessions).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimBleHost, SimPeripheral};
    use crate::callback::callback_fn;
    use crate::device::smart_vase;
    use crate::ble::RemotePeripheral;
    use crate::device::{Characteristic, DeviceError, DeviceFactory};
    use crate::model::ActionData;
    use crate::signal::Signal;
    use std::sync::Mutex as StdMutex;

    /// Records the order in which the transport drives its hooks.
    struct RecordingDevice {
        id: PeripheralId,
        log: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl RecordingDevice {
        fn record(&self, entry: &'static str) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl Device for RecordingDevice {
        fn id(&self) -> &PeripheralId {
            &self.id
        }

        fn name(&self) -> &str {
            "Recorder"
        }

        fn kind(&self) -> &'static str {
            "recorder"
        }

        async fn on_connected(
            &self,
            _peripheral: Arc<dyn RemotePeripheral>,
            mut teardown: SignalListener,
        ) -> Result<(), DeviceError> {
            self.record("connected");
            teardown.fired().await;
            self.record("session ended");
            Ok(())
        }

        async fn on_disconnected(&self, peripheral: Arc<dyn RemotePeripheral>) -> Result<(), DeviceError> {
            assert_eq!(peripheral.id(), &self.id);
            self.record("disconnected");
            Ok(())
        }

        async fn available_characteristics(&self) -> Vec<Characteristic> {
            Vec::new()
        }

        async fn trigger_action(&self, name: &str, _data: ActionData) -> Result<(), DeviceError> {
            Err(DeviceError::ActionNotRecognized(name.to_string()))
        }
    }

    struct RecordingFactory {
        log: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl DeviceFactory for RecordingFactory {
        fn kind(&self) -> &'static str {
            "recorder"
        }

        fn recognizes(&self, adv: &Advertisement) -> bool {
            adv.name.as_deref() == Some("Recorder")
        }

        fn build(&self, adv: &Advertisement, _ctx: &DeviceContext) -> Arc<dyn Device> {
            Arc::new(RecordingDevice {
                id: adv.peripheral_id.clone(),
                log: Arc::clone(&self.log),
            })
        }
    }

    fn transport(host: &Arc<SimBleHost>) -> Arc<BleTransport> {
        let host: Arc<dyn BleHost> = host.clone();
        Arc::new(BleTransport::new(host, DeviceCatalog::standard(true, None)))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_callback_accessors() {
        let host = SimBleHost::new();
        let transport = transport(&host);
        let noop = || callback_fn(|_, _| async { Ok(()) });

        let id = transport.add_callback("http://a", noop()).await.unwrap();
        match transport.add_callback("http://a", noop()).await {
            Err(CallbackError::AlreadyRegistered { id: existing, .. }) => assert_eq!(existing, id),
            other => panic!("expected AlreadyRegistered, got {:?}", other),
        }
        assert_eq!(transport.get_callback_uuid("http://a").await, Some(id));
        assert!(transport.remove_callback(id).await);
        assert!(!transport.remove_callback(id).await);
        assert_eq!(transport.get_callback_uuid("http://a").await, None);

        transport
            .on_reading_produced(&PeripheralId::new("p1"), &Reading::new("light", "[1]", ""))
            .await;
    }

    #[tokio::test]
    async fn test_connects_recognized_and_ignores_others() {
        let host = SimBleHost::new();
        let vase = host
            .add_peripheral(smart_vase::simulated_peripheral("vase", "BBC micro:bit [zavog]"))
            .await;
        let thermo = host.add_peripheral(SimPeripheral::new("thermo").with_name("Thermo")).await;

        let transport = transport(&host);
        let shutdown = Signal::new();
        let task = {
            let transport = Arc::clone(&transport);
            let listener = shutdown.listener();
            tokio::spawn(async move { transport.start(listener).await })
        };

        host.power_on();
        while !host.is_scanning() {
            settle().await;
        }
        assert_eq!(transport.state(), TransportState::Scanning);

        host.advertise(&PeripheralId::new("thermo")).await;
        host.advertise(&PeripheralId::new("vase")).await;
        while transport.get_devices().await.is_empty() {
            settle().await;
        }

        let device = transport.get_device_by_id(&PeripheralId::new("vase")).await.unwrap();
        assert_eq!(device.kind(), "smart_vase");
        assert_eq!(thermo.connect_attempts(), 0);
        assert_eq!(vase.connect_attempts(), 1);

        shutdown.fire();
        task.await.unwrap().unwrap();
        assert_eq!(transport.state(), TransportState::Stopped);
        assert!(transport.connections().is_empty().await);
        assert!(!host.is_scanning());
        assert!(!vase.is_connected());
    }

    #[tokio::test]
    async fn test_refused_connection_is_forgotten() {
        let host = SimBleHost::new();
        let vase = host
            .add_peripheral(smart_vase::simulated_peripheral("vase", "BBC micro:bit").refusing_connections())
            .await;
        host.power_on();

        let transport = transport(&host);
        let shutdown = Signal::new();
        let task = {
            let transport = Arc::clone(&transport);
            let listener = shutdown.listener();
            tokio::spawn(async move { transport.start(listener).await })
        };

        while !host.is_scanning() {
            settle().await;
        }
        host.advertise(&PeripheralId::new("vase")).await;
        while vase.connect_attempts() == 0 || !transport.connections().is_empty().await {
            settle().await;
        }

        shutdown.fire();
        task.await.unwrap().unwrap();
        assert_eq!(vase.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_power_off_returns_to_idle() {
        let host = SimBleHost::new();
        let transport = transport(&host);
        let shutdown = Signal::new();
        let task = {
            let transport = Arc::clone(&transport);
            let listener = shutdown.listener();
            tokio::spawn(async move { transport.start(listener).await })
        };

        let mut state = transport.watch_state();
        host.power_on();
        state.wait_for(|s| *s == TransportState::Scanning).await.unwrap();

        host.set_state(AdapterState::PoweredOff);
        state.wait_for(|s| *s == TransportState::Idle).await.unwrap();
        assert!(!host.is_scanning());

        shutdown.fire();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_hook_runs_before_teardown() {
        let host = SimBleHost::new();
        let recorder = host.add_peripheral(SimPeripheral::new("rec").with_name("Recorder")).await;
        let log = Arc::new(StdMutex::new(Vec::new()));
        let catalog = DeviceCatalog::new().with_factory(RecordingFactory { log: Arc::clone(&log) });
        let host_dyn: Arc<dyn BleHost> = host.clone();
        let transport = Arc::new(BleTransport::new(host_dyn, catalog));
        let shutdown = Signal::new();
        let task = {
            let transport = Arc::clone(&transport);
            let listener = shutdown.listener();
            tokio::spawn(async move { transport.start(listener).await })
        };

        host.power_on();
        while !host.is_scanning() {
            settle().await;
        }
        let id = PeripheralId::new("rec");
        host.advertise(&id).await;
        while log.lock().unwrap().is_empty() {
            settle().await;
        }

        host.drop_link(&id).await;
        while !transport.connections().is_empty().await {
            settle().await;
        }
        settle().await;
        assert_eq!(*log.lock().unwrap(), vec!["connected", "disconnected", "session ended"]);
        assert_eq!(recorder.connect_attempts(), 1);

        shutdown.fire();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_lost_to_lag_is_reconciled() {
        let host = SimBleHost::new();
        let vase = host
            .add_peripheral(smart_vase::simulated_peripheral("vase", "BBC micro:bit"))
            .await;
        let transport = transport(&host);
        let shutdown = Signal::new();
        let task = {
            let transport = Arc::clone(&transport);
            let listener = shutdown.listener();
            tokio::spawn(async move { transport.start(listener).await })
        };

        host.power_on();
        while !host.is_scanning() {
            settle().await;
        }
        let id = PeripheralId::new("vase");
        host.advertise(&id).await;
        while transport.get_devices().await.is_empty() {
            settle().await;
        }

        // The disconnect is pushed out of the event queue before the
        // transport gets to run.
        host.drop_link(&id).await;
        host.repeat_state(300);
        while !transport.connections().is_empty().await {
            settle().await;
        }
        assert!(transport.get_device_by_id(&id).await.is_none());

        host.advertise(&id).await;
        while transport.get_devices().await.is_empty() {
            settle().await;
        }
        assert_eq!(vase.connect_attempts(), 2);

        shutdown.fire();
        task.await.unwrap().unwrap();
    }
}
