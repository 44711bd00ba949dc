//! The outbound side of a session: whatever shows log lines and readings.

use tokio::sync::mpsc;

use crate::types::{Reading, SoundMeterEvent};

/// Receives everything a [`crate::session::BleSession`] wants to show.
///
/// Methods are called from the session's background tasks, not from the
/// thread that created the session.  Implementations must return quickly;
/// marshal onto a UI thread if one is involved.
pub trait Presenter: Send + Sync + 'static {
    /// A human-readable status line (connection milestones, write failures).
    fn log(&self, line: &str);

    /// A newly decoded reading.  Called once per notification, in arrival
    /// order.
    fn on_reading(&self, reading: &Reading);

    /// The rolling window right after `on_reading`, oldest first.
    fn on_buffer_update(&self, snapshot: &[Reading]);
}

/// A [`Presenter`] that turns every call into a [`SoundMeterEvent`] on an
/// unbounded channel.
///
/// The channel is unbounded so the session never waits on a slow consumer.
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<SoundMeterEvent>,
}

impl ChannelPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SoundMeterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SoundMeterEvent) {
        // A dropped receiver just means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

impl Presenter for ChannelPresenter {
    fn log(&self, line: &str) {
        self.emit(SoundMeterEvent::Log(line.to_owned()));
    }

    fn on_reading(&self, reading: &Reading) {
        self.emit(SoundMeterEvent::Reading(*reading));
    }

    fn on_buffer_update(&self, snapshot: &[Reading]) {
        self.emit(SoundMeterEvent::History(snapshot.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_presenter_preserves_order() {
        let (presenter, mut rx) = ChannelPresenter::new();
        let r = Reading {
            value_db: 51.2,
            sequence: 3,
        };
        presenter.log("hello");
        presenter.on_reading(&r);
        presenter.on_buffer_update(&[r]);

        assert!(matches!(rx.try_recv(), Ok(SoundMeterEvent::Log(l)) if l == "hello"));
        assert!(matches!(rx.try_recv(), Ok(SoundMeterEvent::Reading(x)) if x == r));
        assert!(matches!(rx.try_recv(), Ok(SoundMeterEvent::History(h)) if h == vec![r]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (presenter, rx) = ChannelPresenter::new();
        drop(rx);
        presenter.log("nobody listening");
    }
}
