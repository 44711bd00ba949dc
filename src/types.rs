use std::fmt;

/// One calibrated sound-level sample.
///
/// Produced by [`crate::parse::decode_reading`].  The `sequence` field is
/// stamped when the reading enters the rolling history
/// ([`crate::buffer::SampleBuffer::push`]); a freshly decoded reading
/// carries `0` until then.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Sound pressure level in dB(A), resolution 0.1 dB.
    pub value_db: f64,
    /// Arrival counter, strictly increasing within one connection.
    pub sequence: u64,
}

/// Lifecycle of a [`crate::session::BleSession`].
///
/// ```text
/// Disconnected → Discovering → Resolving → Subscribing → Ready ⇄ Polling
///                                                          ↑        │
///                                                          └ Stopping
/// ```
///
/// Any failure during the connect sequence drops straight back to
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Scanning for an advertisement whose name matches the filter.
    Discovering,
    /// Connected; looking up the `fff0` service and its characteristics.
    Resolving,
    /// Enabling notifications on the reading characteristic.
    Subscribing,
    /// Subscribed and idle; notifications are still ingested.
    Ready,
    /// Trigger loop running.
    Polling,
    /// Cancellation requested; the trigger loop has not yet observed it.
    Stopping,
}

impl SessionState {
    /// `true` once the link is up and subscribed.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Polling | Self::Stopping)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Discovering => "discovering",
            Self::Resolving => "resolving",
            Self::Subscribing => "subscribing",
            Self::Ready => "ready",
            Self::Polling => "polling",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// A scan hit returned by [`crate::transport::BleTransport::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised local name (e.g. `"SoundMeter-42"`).
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows: a UUID string
    /// • Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
    pub address: String,
}

/// Completion status of a GATT write or CCCD update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure,
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Everything a [`crate::presenter::ChannelPresenter`] forwards to its
/// consumer, in the order the session produced it.
#[derive(Debug, Clone)]
pub enum SoundMeterEvent {
    /// Human-readable progress or failure line.
    Log(String),
    /// A decoded sample, already stamped with its sequence number.
    Reading(Reading),
    /// The rolling window after the preceding `Reading` was inserted,
    /// oldest first.
    History(Vec<Reading>),
}
