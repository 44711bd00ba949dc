//! Binary decoder for sound-level notifications.
//!
//! Pure and allocation-free; safe to call from the notification path.
//!
//! # Wire format (`fff1` notification)
//!
//! ```text
//! byte 0     : status (ignored)
//! bytes 1..2 : level × 10, u16 big-endian
//! bytes 3..  : ignored if present
//! ```

use thiserror::Error;

use crate::types::Reading;

/// Why a notification could not be turned into a [`Reading`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {len} byte(s), need at least 3")]
    TooShort { len: usize },
}

/// Decode one notification from the reading characteristic.
///
/// `value_db = u16::from_be_bytes([payload[1], payload[2]]) / 10.0`.
/// The returned reading has `sequence == 0`; the history buffer assigns the
/// real sequence number on insertion.
///
/// ```
/// # use soundmeter_rs::parse::decode_reading;
/// let r = decode_reading(&[0x00, 0x02, 0x71]).unwrap();
/// assert_eq!(r.value_db, 62.5);
/// ```
pub fn decode_reading(payload: &[u8]) -> Result<Reading, DecodeError> {
    let &[_status, hi, lo, ..] = payload else {
        return Err(DecodeError::TooShort { len: payload.len() });
    };
    let raw = u16::from_be_bytes([hi, lo]);
    Ok(Reading {
        value_db: f64::from(raw) / 10.0,
        sequence: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payloads_rejected() {
        for payload in [&[][..], &[0x01], &[0x01, 0x02]] {
            assert_eq!(
                decode_reading(payload),
                Err(DecodeError::TooShort { len: payload.len() })
            );
        }
    }

    #[test]
    fn test_decode_known_value() {
        let r = decode_reading(&[0x00, 0x02, 0x71]).unwrap();
        assert_eq!(r.value_db, 62.5);
        assert_eq!(r.sequence, 0);
    }

    #[test]
    fn test_status_byte_ignored() {
        assert_eq!(decode_reading(&[0xFF, 0x00, 0x00]).unwrap().value_db, 0.0);
        assert_eq!(decode_reading(&[0x01, 0x02, 0x00]).unwrap().value_db, 51.2);
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let r = decode_reading(&[0x00, 0x03, 0xE8, 0xAA, 0xBB]).unwrap();
        assert_eq!(r.value_db, 100.0);
    }

    #[test]
    fn test_full_range() {
        assert_eq!(decode_reading(&[0x00, 0xFF, 0xFF]).unwrap().value_db, 6553.5);
    }

    #[test]
    fn test_error_display() {
        let err = DecodeError::TooShort { len: 2 };
        assert_eq!(err.to_string(), "payload too short: 2 byte(s), need at least 3");
    }
}
