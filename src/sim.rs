//! In-memory sound meter implementing [`BleTransport`].
//!
//! Used by the test-suite and by `soundmeter --simulate`.  Every failure the
//! session handles can be scripted: an unmatched name, a refused connection,
//! a missing service or characteristic, a rejected CCCD write, failing
//! trigger writes, malformed notifications and a dropped link.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{
    READING_CHARACTERISTIC, SOUND_METER_SERVICE, TRIGGER_CHARACTERISTIC, TRIGGER_COMMAND,
};
use crate::transport::{BleTransport, NameFilter};
use crate::types::{Advertisement, GattStatus};

/// Standard Battery Service, advertised when the meter service is hidden.
const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Handle of a connected simulated meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub address: String,
}

#[derive(Debug)]
struct SimState {
    name: String,
    address: String,
    connectable: bool,
    has_service: bool,
    missing: Vec<Uuid>,
    services_error: bool,
    characteristics_error: bool,
    notify_status: GattStatus,
    write_status: GattStatus,
    auto_respond: bool,
    connected: bool,
    notify_enabled: bool,
    sink: Option<mpsc::UnboundedSender<Vec<u8>>>,
    writes: Vec<Vec<u8>>,
    responses: u64,
}

/// A scriptable sound meter.
///
/// Cloning shares the same device, so a test can hand one clone to the
/// session and keep another to drive notifications.
#[derive(Debug, Clone)]
pub struct SimulatedMeter {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedMeter {
    /// A well-behaved meter advertising `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                name: name.into(),
                address: "5A:11:00:00:00:42".into(),
                connectable: true,
                has_service: true,
                missing: vec![],
                services_error: false,
                characteristics_error: false,
                notify_status: GattStatus::Success,
                write_status: GattStatus::Success,
                auto_respond: false,
                connected: false,
                notify_enabled: false,
                sink: None,
                writes: vec![],
                responses: 0,
            })),
        }
    }

    // ── Scripting ────────────────────────────────────────────────────────────

    /// Make `connect()` find no device for the advertised address.
    pub fn refuse_connect(self) -> Self {
        self.lock().connectable = false;
        self
    }

    /// Hide the `fff0` service.
    pub fn without_service(self) -> Self {
        self.lock().has_service = false;
        self
    }

    /// Hide one characteristic of the `fff0` service.
    pub fn without_characteristic(self, uuid: Uuid) -> Self {
        self.lock().missing.push(uuid);
        self
    }

    /// Make service discovery fail outright.
    pub fn fail_service_listing(self) -> Self {
        self.lock().services_error = true;
        self
    }

    /// Make characteristic discovery on `fff0` fail outright.
    pub fn fail_characteristic_listing(self) -> Self {
        self.lock().characteristics_error = true;
        self
    }

    pub fn with_notify_status(self, status: GattStatus) -> Self {
        self.lock().notify_status = status;
        self
    }

    /// Answer every successful trigger write with a synthetic reading.
    pub fn with_auto_respond(self, enabled: bool) -> Self {
        self.lock().auto_respond = enabled;
        self
    }

    /// Status returned by subsequent trigger writes.
    pub fn set_write_status(&self, status: GattStatus) {
        self.lock().write_status = status;
    }

    // ── Driving ──────────────────────────────────────────────────────────────

    /// Push a raw notification on `fff1`.
    ///
    /// Returns `false` when nobody is subscribed (not connected or notify
    /// not enabled).
    pub fn notify(&self, payload: &[u8]) -> bool {
        let state = self.lock();
        match (&state.sink, state.notify_enabled) {
            (Some(sink), true) => sink.send(payload.to_vec()).is_ok(),
            _ => false,
        }
    }

    /// Drop the link from the device side; the notification stream ends.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.notify_enabled = false;
        state.sink = None;
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Every payload written to `fff2`, oldest first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Level in tenths of a dB for the `n`th synthetic response: a slow swell
/// between roughly 43 and 67 dB(A).
fn synthetic_level(n: u64) -> u16 {
    let swell = (n as f64 * 0.3).sin() * 120.0;
    (550.0 + swell).round() as u16
}

/// Payload the meter sends for a level of `tenths` × 0.1 dB.
pub fn reading_payload(tenths: u16) -> Vec<u8> {
    let [hi, lo] = tenths.to_be_bytes();
    vec![0x00, hi, lo]
}

#[async_trait]
impl BleTransport for SimulatedMeter {
    type Device = SimDevice;
    type Service = Uuid;
    type Characteristic = Uuid;

    async fn scan(&self, filter: &NameFilter) -> Result<Advertisement> {
        let advert = {
            let state = self.lock();
            filter.matches(Some(state.name.as_str())).then(|| Advertisement {
                name: state.name.clone(),
                address: state.address.clone(),
            })
        };
        match advert {
            Some(advert) => Ok(advert),
            None => futures::future::pending::<Result<Advertisement>>().await,
        }
    }

    async fn connect(&self, address: &str) -> Result<Option<SimDevice>> {
        let mut state = self.lock();
        if !state.connectable || state.address != address {
            return Ok(None);
        }
        state.connected = true;
        Ok(Some(SimDevice {
            address: address.to_owned(),
        }))
    }

    async fn list_services(&self, _device: &SimDevice) -> Result<Vec<(Uuid, Uuid)>> {
        let state = self.lock();
        anyhow::ensure!(!state.services_error, "GATT service discovery failed");
        let uuid = if state.has_service {
            SOUND_METER_SERVICE
        } else {
            BATTERY_SERVICE
        };
        Ok(vec![(uuid, uuid)])
    }

    async fn list_characteristics(
        &self,
        _device: &SimDevice,
        service: &Uuid,
    ) -> Result<Vec<(Uuid, Uuid)>> {
        if *service != SOUND_METER_SERVICE {
            return Ok(vec![]);
        }
        let state = self.lock();
        anyhow::ensure!(
            !state.characteristics_error,
            "GATT characteristic discovery failed"
        );
        Ok([READING_CHARACTERISTIC, TRIGGER_CHARACTERISTIC]
            .into_iter()
            .filter(|uuid| !state.missing.contains(uuid))
            .map(|uuid| (uuid, uuid))
            .collect())
    }

    async fn write(&self, _device: &SimDevice, characteristic: &Uuid, payload: &[u8]) -> GattStatus {
        let mut state = self.lock();
        if !state.connected || *characteristic != TRIGGER_CHARACTERISTIC {
            return GattStatus::Failure;
        }
        state.writes.push(payload.to_vec());
        if state.write_status.is_success()
            && state.auto_respond
            && state.notify_enabled
            && payload == TRIGGER_COMMAND
        {
            let level = synthetic_level(state.responses);
            state.responses += 1;
            if let Some(sink) = &state.sink {
                let _ = sink.send(reading_payload(level));
            }
        }
        state.write_status
    }

    async fn enable_notify(&self, _device: &SimDevice, characteristic: &Uuid) -> GattStatus {
        let mut state = self.lock();
        if !state.connected || *characteristic != READING_CHARACTERISTIC {
            return GattStatus::Failure;
        }
        if state.notify_status.is_success() {
            state.notify_enabled = true;
        }
        state.notify_status
    }

    async fn notifications(
        &self,
        _device: &SimDevice,
        characteristic: &Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        anyhow::ensure!(
            *characteristic == READING_CHARACTERISTIC,
            "characteristic {characteristic} does not notify"
        );
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().sink = Some(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        })
        .boxed())
    }

    async fn disconnect(&self, device: &SimDevice) -> Result<()> {
        debug!("sim: disconnect {}", device.address);
        self.drop_link();
        Ok(())
    }
}
