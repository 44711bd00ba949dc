//! GATT UUIDs, timing constants, and the trigger wire format for the meter.
//!
//! The meter exposes a single vendor service on the Bluetooth SIG base UUID
//! `0000XXXX-0000-1000-8000-00805f9b34fb` with two characteristics: one the
//! host writes to request a measurement, one the device notifies the
//! measurement on.

use std::time::Duration;

use uuid::Uuid;

// ── Service ──────────────────────────────────────────────────────────────────

/// Vendor service carrying both meter characteristics (`fff0`).
pub const SOUND_METER_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Notify characteristic (`fff1`).
///
/// Every notification carries one status byte followed by the level in
/// tenths of a decibel as a big-endian `u16`.  See
/// [`crate::parse::decode_reading`].
pub const READING_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

/// Write characteristic (`fff2`).
///
/// Writing [`TRIGGER_COMMAND`] with response makes the meter emit a fresh
/// notification on [`READING_CHARACTERISTIC`].
pub const TRIGGER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Substring every meter puts in its advertised local name
/// (e.g. `"SoundMeter-42"`).
pub const DEVICE_NAME_FILTER: &str = "SoundMeter";

// ── Timing / history ──────────────────────────────────────────────────────────

/// Delay between the end of one trigger write and the start of the next.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Number of readings retained for the rolling history window.
pub const HISTORY_CAPACITY: usize = 100;

// ── Trigger command ───────────────────────────────────────────────────────────

/// Raw bytes of the "measure now" command.
pub const TRIGGER_COMMAND: [u8; 2] = [0x30, 0x3B];

/// Encode the trigger command for [`TRIGGER_CHARACTERISTIC`].
///
/// ```
/// # use soundmeter_rs::protocol::encode_trigger;
/// assert_eq!(encode_trigger(), vec![0x30, 0x3B]);
/// ```
pub fn encode_trigger() -> Vec<u8> {
    TRIGGER_COMMAND.to_vec()
}
