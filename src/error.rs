use thiserror::Error;

use crate::types::SessionState;

/// Failures reported by [`crate::session::BleSession`].
///
/// None of these are fatal: after any of them the session is still usable
/// and `connect()` / `start()` / `stop()` may be called again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no device advertising \"{filter}\" was found")]
    DeviceNotFound { filter: String },

    #[error("could not connect to {address}")]
    ConnectFailed { address: String },

    #[error("service {0} not found")]
    ServiceNotFound(uuid::Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("enabling notifications failed")]
    NotifyEnableFailed,

    #[error("trigger write failed")]
    TriggerWriteFailed,

    #[error("session is {0}, not ready")]
    NotReady(SessionState),

    #[error("operation cancelled")]
    Cancelled,
}
