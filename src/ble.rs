//! [`Transport`] over a real Bluetooth Low Energy link, via `btleplug`.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use flowstate_rs::ble::{BleConfig, BleTransport};
//!
//! let config = BleConfig::default();
//! let devices = BleTransport::scan_all(&config).await?;
//! if let Some(device) = devices.into_iter().next() {
//!     let link = BleTransport::connect(device, &config).await?;
//!     println!("connected to {}", link.name());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every GATT operation is bounded by [`BleConfig::io_timeout_ms`] and fails
//! with [`TransportError::Timeout`] when it runs over.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::FLOWSTATE_SERVICE_UUID;
use crate::transport::{Subscription, Transport};

// ── BleConfig ─────────────────────────────────────────────────────────────────

/// Scan and connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// BLE scan duration in seconds. Default: `15`.
    pub scan_timeout_secs: u64,
    /// Match devices whose advertised name starts with this string, in
    /// addition to those advertising the FlowState service.
    /// Default: `"FlowState"`.
    pub name_prefix: String,
    /// Hard limit on `connect()` plus service discovery. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Limit for each subscribe, write, and read. Default: `5000`.
    pub io_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            name_prefix: "FlowState".into(),
            connect_timeout_secs: 10,
            io_timeout_ms: 5000,
        }
    }
}

// ── FlowStateDevice ───────────────────────────────────────────────────────────

/// A headset discovered during a BLE scan.
#[derive(Clone, Debug)]
pub struct FlowStateDevice {
    /// Advertised device name (e.g. `"FlowState-7F21"`).
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub id: String,
    peripheral: Peripheral,
    adapter: Adapter,
}

// ── Adapter helpers ───────────────────────────────────────────────────────────

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
    wait_powered_on(&adapter).await;
    Ok(adapter)
}

/// CoreBluetooth starts in an "unknown" state and silently ignores scans
/// until it reports PoweredOn.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => {
                info!("macOS: adapter is PoweredOn");
                break;
            }
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
            Err(e) => {
                warn!("macOS: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

fn ble_error(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        other => TransportError::Ble(other.to_string()),
    }
}

// ── BleTransport ──────────────────────────────────────────────────────────────

/// A connected FlowState headset.
pub struct BleTransport {
    name: String,
    peripheral: Peripheral,
    characteristics: BTreeSet<Characteristic>,
    io_timeout: Duration,
    connected: Arc<AtomicBool>,
}

impl BleTransport {
    /// Scan for `config.scan_timeout_secs` and return every FlowState headset
    /// in range.
    pub async fn scan_all(config: &BleConfig) -> Result<Vec<FlowStateDevice>> {
        let adapter = first_adapter().await?;

        info!("scan_all: scanning for {} s …", config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            let Ok(Some(props)) = p.properties().await else {
                continue;
            };
            let advertises_service = props.services.contains(&FLOWSTATE_SERVICE_UUID);
            let name = props.local_name.unwrap_or_default();
            if advertises_service || (!name.is_empty() && name.starts_with(&config.name_prefix)) {
                let id = p.id().to_string();
                info!("scan_all: found {name}  id={id}");
                found.push(FlowStateDevice {
                    name,
                    id,
                    peripheral: p,
                    adapter: adapter.clone(),
                });
            }
        }
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    /// Scan and connect to the first headset found.
    pub async fn connect_first(config: &BleConfig) -> Result<Self> {
        let device = Self::scan_all(config)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                anyhow!(
                    "No FlowState headset found after {} s of scanning",
                    config.scan_timeout_secs
                )
            })?;
        Self::connect(device, config).await
    }

    /// Connect, discover services, and verify the FlowState characteristics.
    pub async fn connect(device: FlowStateDevice, config: &BleConfig) -> Result<Self> {
        let FlowStateDevice {
            name,
            peripheral,
            adapter,
            ..
        } = device;
        let limit = Duration::from_secs(config.connect_timeout_secs);

        // BlueZ's Device1.Connect can block forever when the device is out of
        // range.
        tokio::time::timeout(limit, peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after {limit:?}"))??;

        // BlueZ reports the connection before the GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(limit, peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after {limit:?}"))??;
        info!("Connected and services discovered: {name}");

        let characteristics = peripheral.characteristics();
        for uuid in [
            crate::protocol::TELEMETRY_CHARACTERISTIC,
            crate::protocol::STATUS_CHARACTERISTIC,
            crate::protocol::CONTROL_CHARACTERISTIC,
        ] {
            if !characteristics.iter().any(|c| c.uuid == uuid) {
                warn!("{name}: characteristic {uuid} missing");
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        spawn_disconnect_watcher(adapter, &peripheral, Arc::clone(&connected));

        Ok(Self {
            name,
            peripheral,
            characteristics,
            io_timeout: Duration::from_millis(config.io_timeout_ms.max(1)),
            connected,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link state as last reported by the adapter.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = btleplug::Result<T>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result.map_err(ble_error),
            Err(_) => Err(TransportError::Timeout {
                op,
                millis: self.io_timeout.as_millis() as u64,
            }),
        }
    }
}

/// Watch the adapter's event stream for this peripheral going away; faster
/// than waiting for the notification stream to close.
fn spawn_disconnect_watcher(adapter: Adapter, peripheral: &Peripheral, connected: Arc<AtomicBool>) {
    let peripheral_id = peripheral.id();
    tokio::spawn(async move {
        match adapter.events().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == peripheral_id {
                            info!("Disconnect watcher: device {id:?} disconnected.");
                            connected.store(false, Ordering::Release);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {e}"),
        }
    });
}

#[async_trait]
impl Transport for BleTransport {
    async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, TransportError> {
        let c = self.characteristic(characteristic)?;
        self.bounded("subscribe", self.peripheral.subscribe(&c)).await?;
        let notifications = self.bounded("notifications", self.peripheral.notifications()).await?;
        debug!("{}: subscribed to {characteristic}", self.name);

        let stream = notifications
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| Ok(n.value));

        let peripheral = self.peripheral.clone();
        Ok(Subscription::new(stream).on_cancel(move || {
            // Unsubscribing is async; hand it to the runtime if there is one.
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    if let Err(e) = peripheral.unsubscribe(&c).await {
                        debug!("unsubscribe {}: {e}", c.uuid);
                    }
                });
            }
        }))
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        let c = self.characteristic(characteristic)?;
        self.bounded(
            "write",
            self.peripheral.write(&c, payload, WriteType::WithResponse),
        )
        .await
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let c = self.characteristic(characteristic)?;
        self.bounded("read", self.peripheral.read(&c)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let c = BleConfig::default();
        assert_eq!(c.name_prefix, "FlowState");
        assert_eq!(c.io_timeout_ms, 5000);
    }

    #[test]
    fn test_config_fills_missing_fields() {
        let c: BleConfig = serde_json::from_str(r#"{"scan_timeout_secs": 3}"#).unwrap();
        assert_eq!(c.scan_timeout_secs, 3);
        assert_eq!(c.connect_timeout_secs, 10);
    }

    #[test]
    fn test_not_connected_maps_to_transport_error() {
        assert_eq!(
            ble_error(btleplug::Error::NotConnected),
            TransportError::NotConnected
        );
        assert!(matches!(
            ble_error(btleplug::Error::NoSuchCharacteristic),
            TransportError::Ble(_)
        ));
    }
}
