//! The BLE capabilities a [`crate::session::BleSession`] needs.
//!
//! [`crate::btle::BtleplugTransport`] implements them on top of the host's
//! Bluetooth stack; [`crate::sim::SimulatedMeter`] implements them in memory.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::types::{Advertisement, GattStatus};

/// Matches advertisements whose local name contains a fixed substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    needle: String,
}

impl NameFilter {
    pub fn new(needle: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
        }
    }

    pub fn needle(&self) -> &str {
        &self.needle
    }

    /// Nameless advertisements never match.
    pub fn matches(&self, local_name: Option<&str>) -> bool {
        local_name.is_some_and(|name| !name.is_empty() && name.contains(&self.needle))
    }
}

/// GATT central operations, one peripheral at a time.
///
/// Handles are opaque to the session: it only compares UUIDs and passes the
/// handles back in.  Handles become meaningless after
/// [`disconnect`](BleTransport::disconnect).
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// A connected peripheral.
    type Device: Clone + Send + Sync + 'static;
    /// A GATT service on a connected peripheral.
    type Service: Send + Sync + 'static;
    /// A GATT characteristic on a connected peripheral.
    type Characteristic: Clone + Send + Sync + 'static;

    /// Actively scan until an advertisement matches `filter`, then stop
    /// scanning and return it.
    ///
    /// Never gives up on its own; callers bound it with a timeout.
    async fn scan(&self, filter: &NameFilter) -> Result<Advertisement>;

    /// Open a connection to a previously scanned address.
    ///
    /// `Ok(None)` means the stack has no device for that address.
    async fn connect(&self, address: &str) -> Result<Option<Self::Device>>;

    async fn list_services(&self, device: &Self::Device) -> Result<Vec<(Uuid, Self::Service)>>;

    async fn list_characteristics(
        &self,
        device: &Self::Device,
        service: &Self::Service,
    ) -> Result<Vec<(Uuid, Self::Characteristic)>>;

    /// Write with response.  Resolves once the peripheral acknowledged (or
    /// rejected) the write.
    async fn write(
        &self,
        device: &Self::Device,
        characteristic: &Self::Characteristic,
        payload: &[u8],
    ) -> GattStatus;

    /// Write the client characteristic configuration descriptor to enable
    /// notifications.
    async fn enable_notify(
        &self,
        device: &Self::Device,
        characteristic: &Self::Characteristic,
    ) -> GattStatus;

    /// Value-change payloads for `characteristic`, in arrival order.
    ///
    /// The stream ends when the link to the peripheral is lost.  Call before
    /// [`enable_notify`](BleTransport::enable_notify) so no early
    /// notification is missed.
    async fn notifications(
        &self,
        device: &Self::Device,
        characteristic: &Self::Characteristic,
    ) -> Result<BoxStream<'static, Vec<u8>>>;

    async fn disconnect(&self, device: &Self::Device) -> Result<()>;
}
