//! # soundmeter-rs
//!
//! Async Rust client for Bluetooth Low Energy sound-level meters that
//! advertise as `SoundMeter…` and expose the `fff0` vendor service.
//!
//! The client finds the meter by name, subscribes to its reading
//! characteristic (`fff1`), and, while measuring, writes a two-byte trigger
//! to `fff2` every 500 ms.  Every notification is decoded to dB(A), kept in a
//! 100-sample rolling history, and handed to a [`presenter::Presenter`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use soundmeter_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (presenter, mut events) = ChannelPresenter::new();
//!     let transport = BtleplugTransport::new().await?;
//!     let session = BleSession::new(transport, Arc::new(presenter), SessionConfig::default());
//!
//!     session.connect().await?;
//!     session.start().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let SoundMeterEvent::Reading(r) = event {
//!             println!("{:.1} dB(A)", r.value_db);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`session`] | [`session::BleSession`]: connect / start / stop / disconnect |
//! | [`transport`] | The [`transport::BleTransport`] capability trait |
//! | [`btle`] | `btleplug`-backed transport for real hardware |
//! | [`sim`] | In-memory meter for tests and `--simulate` |
//! | [`presenter`] | Where log lines and readings go |
//! | [`buffer`] | Thread-safe rolling history |
//! | [`protocol`] | GATT UUIDs, constants, trigger encoding |
//! | [`parse`] | Notification decoding |
//! | [`types`] | Readings, states and events |
//! | [`error`] | Session error taxonomy |

pub mod btle;
pub mod buffer;
pub mod error;
pub mod parse;
pub mod presenter;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::error::SessionError;
    pub use crate::session::{BleSession, SessionConfig};

    // ── Transports ────────────────────────────────────────────────────────────
    pub use crate::btle::BtleplugTransport;
    pub use crate::sim::SimulatedMeter;
    pub use crate::transport::{BleTransport, NameFilter};

    // ── Presentation and data ─────────────────────────────────────────────────
    pub use crate::buffer::SampleBuffer;
    pub use crate::parse::{decode_reading, DecodeError};
    pub use crate::presenter::{ChannelPresenter, Presenter};
    pub use crate::types::{Advertisement, GattStatus, Reading, SessionState, SoundMeterEvent};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{
        encode_trigger, HISTORY_CAPACITY, POLL_INTERVAL, READING_CHARACTERISTIC,
        SOUND_METER_SERVICE, TRIGGER_CHARACTERISTIC,
    };
}
