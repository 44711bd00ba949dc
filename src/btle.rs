//! [`BleTransport`] on top of the host Bluetooth stack via `btleplug`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{BleTransport, NameFilter};
use crate::types::{Advertisement, GattStatus};

/// How often the adapter's peripheral list is re-checked while scanning.
const SCAN_POLL: Duration = Duration::from_millis(250);

/// BlueZ's `Device1.Connect` can block forever when the device is out of
/// range or the stack is wedged.  A BLE connect normally takes < 2 s.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// The first Bluetooth adapter of the host.
#[derive(Clone)]
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Open the first adapter reported by the platform.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        if let Ok(info) = adapter.adapter_info().await {
            info!("Using adapter {info}");
        }
        wait_powered_on(&adapter).await;
        Ok(Self { adapter })
    }

    async fn peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address))
    }
}

/// CoreBluetooth starts in an "unknown" state after launch and silently
/// ignores scan requests until it reports `PoweredOn`.
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
            Ok(state) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                    break;
                }
                debug!("macOS: adapter state = {state:?}, waiting…");
            }
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

/// Stops the adapter scan when a `scan()` future finishes or is dropped
/// (e.g. by a caller's timeout).
struct ScanGuard {
    adapter: Adapter,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let adapter = self.adapter.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    debug!("stop_scan: {e}");
                }
            });
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    type Device = Peripheral;
    type Service = Service;
    type Characteristic = Characteristic;

    async fn scan(&self, filter: &NameFilter) -> Result<Advertisement> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let _guard = ScanGuard {
            adapter: self.adapter.clone(),
        };

        loop {
            let peripherals = match self.adapter.peripherals().await {
                Ok(peripherals) => peripherals,
                Err(e) => {
                    warn!("scan: listing peripherals failed: {e}");
                    vec![]
                }
            };
            for p in peripherals {
                let Ok(Some(props)) = p.properties().await else {
                    continue;
                };
                if filter.matches(props.local_name.as_deref()) {
                    let name = props.local_name.unwrap_or_default();
                    let address = p.id().to_string();
                    info!("scan: {name} matched  id={address}  rssi={:?}", props.rssi);
                    return Ok(Advertisement { name, address });
                }
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    }

    async fn connect(&self, address: &str) -> Result<Option<Peripheral>> {
        let Some(peripheral) = self.peripheral(address).await? else {
            return Ok(None);
        };

        if !peripheral.is_connected().await.unwrap_or(false) {
            tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
                .await
                .map_err(|_| anyhow!("BLE connect() timed out after {CONNECT_TIMEOUT:?}"))??;
        }

        // BlueZ reports the connection before its GATT cache is populated;
        // discovering too early yields an empty service list.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVERY_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after {DISCOVERY_TIMEOUT:?}"))??;
        info!("Connected and services discovered: {address}");
        Ok(Some(peripheral))
    }

    async fn list_services(&self, device: &Peripheral) -> Result<Vec<(Uuid, Service)>> {
        Ok(device.services().into_iter().map(|s| (s.uuid, s)).collect())
    }

    async fn list_characteristics(
        &self,
        _device: &Peripheral,
        service: &Service,
    ) -> Result<Vec<(Uuid, Characteristic)>> {
        Ok(service
            .characteristics
            .iter()
            .map(|c| (c.uuid, c.clone()))
            .collect())
    }

    async fn write(
        &self,
        device: &Peripheral,
        characteristic: &Characteristic,
        payload: &[u8],
    ) -> GattStatus {
        match device
            .write(characteristic, payload, WriteType::WithResponse)
            .await
        {
            Ok(()) => GattStatus::Success,
            Err(e) => {
                warn!("write {}: {e}", characteristic.uuid);
                GattStatus::Failure
            }
        }
    }

    async fn enable_notify(&self, device: &Peripheral, characteristic: &Characteristic) -> GattStatus {
        match device.subscribe(characteristic).await {
            Ok(()) => GattStatus::Success,
            Err(e) => {
                warn!("subscribe {}: {e}", characteristic.uuid);
                GattStatus::Failure
            }
        }
    }

    async fn notifications(
        &self,
        device: &Peripheral,
        characteristic: &Characteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        let uuid = characteristic.uuid;
        let values = device
            .notifications()
            .await?
            .filter_map(move |n| futures::future::ready((n.uuid == uuid).then_some(n.value)));

        // The notification stream does not end on every platform when the
        // link drops; the adapter's DeviceDisconnected event does.
        let id = device.id();
        let mut events = self.adapter.events().await?;
        let link_lost = async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(lost) = event {
                    if lost == id {
                        info!("device {lost:?} disconnected");
                        return;
                    }
                }
            }
        };

        Ok(values.take_until(link_lost).boxed())
    }

    async fn disconnect(&self, device: &Peripheral) -> Result<()> {
        device.disconnect().await?;
        Ok(())
    }
}
