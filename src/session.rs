//! Connection lifecycle, trigger polling and notification ingestion.
//!
//! A [`BleSession`] drives one meter through
//! discover → connect → resolve → subscribe, then on request runs a trigger
//! loop that asks the meter for a fresh reading every
//! [`SessionConfig::poll_interval`].  Readings arrive independently on the
//! notification stream, are decoded, pushed into the rolling
//! [`SampleBuffer`], and forwarded to the [`Presenter`].
//!
//! Two background tasks exist while connected:
//!
//! * **ingest** – owns the notification stream for the lifetime of the link.
//!   It never calls back into the transport.
//! * **poll** – only while polling; writes the trigger, then sleeps.  Both
//!   suspension points observe the same [`CancellationToken`].
//!
//! State transitions that talk to the transport (`connect`, `start`,
//! `disconnect`) are serialized by an async mutex over the link.  `stop()`
//! only flips state and cancels a token, so it never waits.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::SampleBuffer;
use crate::error::SessionError;
use crate::parse::decode_reading;
use crate::presenter::Presenter;
use crate::protocol::{
    encode_trigger, DEVICE_NAME_FILTER, HISTORY_CAPACITY, POLL_INTERVAL, READING_CHARACTERISTIC,
    SOUND_METER_SERVICE, TRIGGER_CHARACTERISTIC,
};
use crate::transport::{BleTransport, NameFilter};
use crate::types::{Reading, SessionState};

// ── SessionConfig ─────────────────────────────────────────────────────────────

/// Configuration for [`BleSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connect to the first device whose advertised name contains this
    /// string.  Default: `"SoundMeter"`.
    pub name_filter: String,
    /// Give up scanning after this long.  `None` scans until a device shows
    /// up or [`BleSession::disconnect`] is called.  Default: `None`.
    pub scan_timeout: Option<Duration>,
    /// Pause between the end of one trigger write and the next.
    /// Default: 500 ms.
    pub poll_interval: Duration,
    /// Readings kept in the rolling history.  Default: `100`.
    pub history_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name_filter: DEVICE_NAME_FILTER.into(),
            scan_timeout: None,
            poll_interval: POLL_INTERVAL,
            history_capacity: HISTORY_CAPACITY,
        }
    }
}

// ── Internal state ────────────────────────────────────────────────────────────

/// Transport handles for an established link.
struct Link<T: BleTransport> {
    device: T::Device,
    trigger: T::Characteristic,
    ingest: JoinHandle<()>,
}

/// Small, synchronously-locked part of the session.
struct Control {
    state: SessionState,
    /// Bumped on every connect attempt; lets a finished ingest task tell
    /// whether the link it served is still the current one.
    epoch: u64,
    /// Cancels the scan of an in-flight `connect()`.
    connecting: Option<CancellationToken>,
    /// Id and token of the running trigger loop.
    poll: Option<(u64, CancellationToken)>,
    next_poll_id: u64,
}

struct Shared<T: BleTransport> {
    transport: T,
    presenter: Arc<dyn Presenter>,
    config: SessionConfig,
    buffer: SampleBuffer,
    control: Mutex<Control>,
    link: tokio::sync::Mutex<Option<Link<T>>>,
}

// ── BleSession ────────────────────────────────────────────────────────────────

/// One meter, one connection, one rolling history.
///
/// Cloning is cheap and every clone drives the same session, so the handle
/// can be given to a UI and to background tasks alike.  Call
/// [`disconnect`](Self::disconnect) to release the device.
pub struct BleSession<T: BleTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: BleTransport> Clone for BleSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: BleTransport> BleSession<T> {
    pub fn new(transport: T, presenter: Arc<dyn Presenter>, config: SessionConfig) -> Self {
        let buffer = SampleBuffer::new(config.history_capacity);
        Self {
            shared: Arc::new(Shared {
                transport,
                presenter,
                config,
                buffer,
                control: Mutex::new(Control {
                    state: SessionState::Disconnected,
                    epoch: 0,
                    connecting: None,
                    poll: None,
                    next_poll_id: 0,
                }),
                link: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.control().state
    }

    /// The rolling history, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.shared.buffer.snapshot()
    }

    // ── connect ──────────────────────────────────────────────────────────────

    /// Scan for the meter, connect, resolve its characteristics and enable
    /// notifications.
    ///
    /// Clears the history.  Any failure is reported to the presenter and
    /// leaves the session `Disconnected`; there is no automatic retry.
    /// Returns `Ok(())` without doing anything when already connected, and
    /// `NotReady` straight away while another `connect()` is in flight.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let cancel = CancellationToken::new();
        let busy = {
            let mut control = self.shared.control();
            if control.connecting.is_some() {
                Some(control.state)
            } else {
                control.connecting = Some(cancel.clone());
                None
            }
        };
        if let Some(state) = busy {
            self.shared.report("Connect already in progress.");
            return Err(SessionError::NotReady(state));
        }

        let result = self.connect_with(&cancel).await;
        self.shared.control().connecting = None;
        result
    }

    async fn connect_with(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let mut link = self.shared.link.lock().await;

        if link.is_some() && self.state().is_connected() {
            self.shared.report("Already connected.");
            return Ok(());
        }
        // Left behind by a link the device dropped.
        if let Some(stale) = link.take() {
            self.shared.teardown(stale).await;
        }

        self.shared.buffer.clear();
        let epoch = {
            let mut control = self.shared.control();
            control.state = SessionState::Discovering;
            control.epoch += 1;
            control.epoch
        };

        match self.shared.establish(epoch, cancel).await {
            Ok(new_link) => {
                *link = Some(new_link);
                self.shared
                    .report("✅ Device connected and ready. Send 'start' to measure.");
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(SessionState::Disconnected);
                match &err {
                    SessionError::Cancelled => self.shared.report("Connect cancelled."),
                    other => self.shared.report(&format!("❌ {other}")),
                }
                Err(err)
            }
        }
    }

    // ── start / stop ─────────────────────────────────────────────────────────

    /// Begin the trigger loop.
    ///
    /// Only valid in `Ready`; a second `start()` while polling is a no-op.
    /// Any other state is rejected without waiting on a pending `connect()`.
    pub async fn start(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Ready | SessionState::Polling => {}
            state => return Err(SessionError::NotReady(state)),
        }
        let link = self.shared.link.lock().await;
        let Some(current) = link.as_ref() else {
            return Err(SessionError::NotReady(self.state()));
        };

        let (id, token) = {
            let mut control = self.shared.control();
            match control.state {
                SessionState::Polling => return Ok(()),
                SessionState::Ready => {}
                state => return Err(SessionError::NotReady(state)),
            }
            let id = control.next_poll_id;
            control.next_poll_id += 1;
            let token = CancellationToken::new();
            control.state = SessionState::Polling;
            control.poll = Some((id, token.clone()));
            (id, token)
        };

        self.shared.report(&format!(
            "▶️ Measurement started (every {} ms).",
            self.shared.config.poll_interval.as_millis()
        ));
        tokio::spawn(Arc::clone(&self.shared).poll(
            current.device.clone(),
            current.trigger.clone(),
            token,
            id,
        ));
        Ok(())
    }

    /// Ask the trigger loop to stop.
    ///
    /// Returns immediately; the loop finishes its current write (if any) and
    /// then moves the session back to `Ready`.  No-op unless polling.
    pub fn stop(&self) {
        let mut control = self.shared.control();
        if control.state != SessionState::Polling {
            debug!("stop: session is {}, nothing to stop", control.state);
            return;
        }
        control.state = SessionState::Stopping;
        if let Some((_, token)) = &control.poll {
            token.cancel();
        }
    }

    // ── disconnect ───────────────────────────────────────────────────────────

    /// Stop polling, stop ingesting and release the device.
    ///
    /// Also aborts a `connect()` that is still scanning; that call then
    /// fails with [`SessionError::Cancelled`].
    pub async fn disconnect(&self) {
        // The pending connect() clears its own token once it has unwound.
        if let Some(cancel) = &self.shared.control().connecting {
            cancel.cancel();
        }

        let mut link = self.shared.link.lock().await;
        let previous = {
            let mut control = self.shared.control();
            if let Some((_, token)) = control.poll.take() {
                token.cancel();
            }
            std::mem::replace(&mut control.state, SessionState::Disconnected)
        };

        let had_link = link.is_some();
        if let Some(old) = link.take() {
            self.shared.teardown(old).await;
        }
        if had_link || previous != SessionState::Disconnected {
            self.shared.report("Disconnected.");
        }
    }
}

impl<T: BleTransport> Shared<T> {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        debug!("session → {state}");
        self.control().state = state;
    }

    fn report(&self, line: &str) {
        info!("{line}");
        self.presenter.log(line);
    }

    /// Discover → connect → resolve → subscribe.  On any failure after the
    /// connection opened, the device is disconnected again before returning.
    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Result<Link<T>, SessionError> {
        let filter = NameFilter::new(self.config.name_filter.as_str());
        self.report(&format!("🔍 Searching for '{}' …", filter.needle()));

        let not_found = || SessionError::DeviceNotFound {
            filter: filter.needle().to_owned(),
        };
        let scan = async {
            match self.config.scan_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.transport.scan(&filter)).await {
                    Ok(found) => found,
                    Err(_) => Err(anyhow::anyhow!("scan timed out after {limit:?}")),
                },
                None => self.transport.scan(&filter).await,
            }
        };
        let advert = tokio::select! {
            found = scan => found.map_err(|e| {
                warn!("scan: {e:#}");
                not_found()
            })?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        };
        info!("Found {} ({})", advert.name, advert.address);

        self.set_state(SessionState::Resolving);
        let connect_failed = || SessionError::ConnectFailed {
            address: advert.address.clone(),
        };
        let device = match self.transport.connect(&advert.address).await {
            Ok(Some(device)) => device,
            Ok(None) => return Err(connect_failed()),
            Err(e) => {
                warn!("connect {}: {e:#}", advert.address);
                return Err(connect_failed());
            }
        };

        match self.subscribe(&device, epoch).await {
            Ok((trigger, ingest)) => Ok(Link {
                device,
                trigger,
                ingest,
            }),
            Err(err) => {
                if let Err(e) = self.transport.disconnect(&device).await {
                    debug!("disconnect after failed setup: {e:#}");
                }
                Err(err)
            }
        }
    }

    /// Resolve `fff0` / `fff1` / `fff2`, enable notifications and spawn the
    /// ingest task.  Leaves the session `Ready` on success.
    async fn subscribe(
        self: &Arc<Self>,
        device: &T::Device,
        epoch: u64,
    ) -> Result<(T::Characteristic, JoinHandle<()>), SessionError> {
        let services = self.transport.list_services(device).await.map_err(|e| {
            warn!("list_services: {e:#}");
            SessionError::ServiceNotFound(SOUND_METER_SERVICE)
        })?;
        let service = services
            .into_iter()
            .find(|(uuid, _)| *uuid == SOUND_METER_SERVICE)
            .map(|(_, service)| service)
            .ok_or(SessionError::ServiceNotFound(SOUND_METER_SERVICE))?;

        let chars = self
            .transport
            .list_characteristics(device, &service)
            .await
            .map_err(|e| {
                warn!("list_characteristics: {e:#}");
                SessionError::CharacteristicNotFound(READING_CHARACTERISTIC)
            })?;
        let find_char = |uuid: Uuid| {
            chars
                .iter()
                .find(|(u, _)| *u == uuid)
                .map(|(_, c)| c.clone())
                .ok_or(SessionError::CharacteristicNotFound(uuid))
        };
        let reading = find_char(READING_CHARACTERISTIC)?;
        let trigger = find_char(TRIGGER_CHARACTERISTIC)?;

        self.set_state(SessionState::Subscribing);
        // Register for values before the CCCD write so nothing is missed.
        let notifications = self
            .transport
            .notifications(device, &reading)
            .await
            .map_err(|e| {
                warn!("notifications: {e:#}");
                SessionError::NotifyEnableFailed
            })?;
        if !self.transport.enable_notify(device, &reading).await.is_success() {
            return Err(SessionError::NotifyEnableFailed);
        }

        self.set_state(SessionState::Ready);
        let ingest = tokio::spawn(Arc::clone(self).ingest(notifications, epoch));
        Ok((trigger, ingest))
    }

    /// Decode every notification until the stream ends.
    async fn ingest(self: Arc<Self>, mut notifications: BoxStream<'static, Vec<u8>>, epoch: u64) {
        let mut count: u64 = 0;
        while let Some(payload) = notifications.next().await {
            count += 1;
            let decoded = match decode_reading(&payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("dropping notification #{count}: {e}");
                    continue;
                }
            };
            let reading = self.buffer.push(decoded.value_db);
            debug!(
                "notification #{count}: {:.1} dB (seq {})",
                reading.value_db, reading.sequence
            );
            self.presenter.on_reading(&reading);
            self.presenter.on_buffer_update(&self.buffer.snapshot());
        }

        info!("notification stream ended after {count} notification(s)");
        if self.link_lost(epoch) {
            self.report("❌ Device disconnected.");
        }
    }

    /// Mark the link of `epoch` as gone.  Returns `false` if a newer
    /// connect or an explicit disconnect already moved on.
    fn link_lost(&self, epoch: u64) -> bool {
        let mut control = self.control();
        if control.epoch != epoch || !control.state.is_connected() {
            return false;
        }
        control.state = SessionState::Disconnected;
        if let Some((_, token)) = control.poll.take() {
            token.cancel();
        }
        true
    }

    /// Trigger loop.  A write is always awaited to completion before the
    /// token is checked.
    async fn poll(
        self: Arc<Self>,
        device: T::Device,
        trigger: T::Characteristic,
        token: CancellationToken,
        id: u64,
    ) {
        let command = encode_trigger();
        let mut cycle: u64 = 0;
        let outcome = loop {
            if token.is_cancelled() {
                break SessionError::Cancelled;
            }
            cycle += 1;
            if !self.transport.write(&device, &trigger, &command).await.is_success() {
                warn!("trigger write #{cycle} failed");
                self.presenter
                    .log(&format!("❌ {}.", SessionError::TriggerWriteFailed));
            }
            if token.is_cancelled() {
                break SessionError::Cancelled;
            }
            tokio::select! {
                _ = token.cancelled() => break SessionError::Cancelled,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        };
        debug!("trigger loop {id} exited after {cycle} cycle(s): {outcome}");

        {
            let mut control = self.control();
            if control.poll.as_ref().is_some_and(|(current, _)| *current == id) {
                control.poll = None;
                if matches!(
                    control.state,
                    SessionState::Polling | SessionState::Stopping
                ) {
                    control.state = SessionState::Ready;
                }
            }
        }
        self.report("⏹️ Measurement stopped.");
    }

    async fn teardown(&self, link: Link<T>) {
        link.ingest.abort();
        // Wait so no late reading lands after the caller moves on.
        let _ = link.ingest.await;
        if let Err(e) = self.transport.disconnect(&link.device).await {
            warn!("disconnect: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;
    use crate::sim::SimulatedMeter;
    use crate::types::GattStatus;

    // ── Helpers ──────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct Recorder {
        logs: Mutex<Vec<String>>,
        readings: Mutex<Vec<Reading>>,
        snapshots: Mutex<Vec<Vec<Reading>>>,
    }

    impl Recorder {
        fn logs(&self) -> Vec<String> {
            self.logs.lock().unwrap().clone()
        }
        fn readings(&self) -> Vec<Reading> {
            self.readings.lock().unwrap().clone()
        }
        fn snapshots(&self) -> Vec<Vec<Reading>> {
            self.snapshots.lock().unwrap().clone()
        }
        fn logged(&self, needle: &str) -> bool {
            self.logs().iter().any(|l| l.contains(needle))
        }
    }

    impl Presenter for Recorder {
        fn log(&self, line: &str) {
            self.logs.lock().unwrap().push(line.to_owned());
        }
        fn on_reading(&self, reading: &Reading) {
            self.readings.lock().unwrap().push(*reading);
        }
        fn on_buffer_update(&self, snapshot: &[Reading]) {
            self.snapshots.lock().unwrap().push(snapshot.to_vec());
        }
    }

    fn session(
        meter: &SimulatedMeter,
        config: SessionConfig,
    ) -> (BleSession<SimulatedMeter>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let session = BleSession::new(meter.clone(), recorder.clone(), config);
        (session, recorder)
    }

    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    async fn within<F: Future>(fut: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(2), fut)
            .await
            .expect("operation hung")
    }

    fn meter() -> SimulatedMeter {
        SimulatedMeter::new("SoundMeter-42")
    }

    // ── Connect sequence ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        assert_eq!(session.state(), SessionState::Disconnected);

        within(session.connect()).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(meter.is_connected());
        assert!(rec.logged("Searching for 'SoundMeter'"));
        assert!(rec.logged("connected and ready"));
        assert_eq!(meter.write_count(), 0, "no trigger before start()");
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();
        within(session.connect()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(rec.logged("Already connected"));
    }

    #[tokio::test]
    async fn test_scan_timeout_reports_device_not_found() {
        let meter = SimulatedMeter::new("Thermo-7");
        let config = SessionConfig {
            scan_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (session, rec) = session(&meter, config);

        let err = within(session.connect()).await.unwrap_err();

        assert_eq!(
            err,
            SessionError::DeviceNotFound {
                filter: "SoundMeter".into()
            }
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(rec.logged("no device advertising"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let meter = meter().refuse_connect();
        let (session, _rec) = session(&meter, SessionConfig::default());
        let err = within(session.connect()).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectFailed { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let meter = meter().without_service();
        let (session, rec) = session(&meter, SessionConfig::default());
        let err = within(session.connect()).await.unwrap_err();
        assert_eq!(err, SessionError::ServiceNotFound(SOUND_METER_SERVICE));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!meter.is_connected(), "device released after failed setup");
        assert!(rec.logged("service 0000fff0"));
    }

    #[tokio::test]
    async fn test_missing_trigger_characteristic() {
        let meter = meter().without_characteristic(TRIGGER_CHARACTERISTIC);
        let (session, _rec) = session(&meter, SessionConfig::default());
        let err = within(session.connect()).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::CharacteristicNotFound(TRIGGER_CHARACTERISTIC)
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_notify_failure_blocks_start() {
        let meter = meter().with_notify_status(GattStatus::Failure);
        let (session, rec) = session(&meter, SessionConfig::default());

        let err = within(session.connect()).await.unwrap_err();
        assert_eq!(err, SessionError::NotifyEnableFailed);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(rec.logged("enabling notifications failed"));

        let err = within(session.start()).await.unwrap_err();
        assert_eq!(err, SessionError::NotReady(SessionState::Disconnected));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(meter.write_count(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_scan() {
        let meter = SimulatedMeter::new("Thermo-7");
        let (session, rec) = session(&meter, SessionConfig::default());

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });
        eventually("discovering", || session.state() == SessionState::Discovering).await;

        within(session.disconnect()).await;

        let res = within(pending).await.unwrap();
        assert_eq!(res, Err(SessionError::Cancelled));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(rec.logged("Connect cancelled"));
    }

    #[tokio::test]
    async fn test_missing_reading_characteristic() {
        let meter = meter().without_characteristic(READING_CHARACTERISTIC);
        let (session, rec) = session(&meter, SessionConfig::default());
        let err = within(session.connect()).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::CharacteristicNotFound(READING_CHARACTERISTIC)
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!meter.is_connected());
        assert!(rec.logged("characteristic 0000fff1"));
    }

    #[tokio::test]
    async fn test_service_listing_error() {
        let meter = meter().fail_service_listing();
        let (session, _rec) = session(&meter, SessionConfig::default());
        let err = within(session.connect()).await.unwrap_err();
        assert_eq!(err, SessionError::ServiceNotFound(SOUND_METER_SERVICE));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!meter.is_connected());
    }

    #[tokio::test]
    async fn test_characteristic_listing_error() {
        let meter = meter().fail_characteristic_listing();
        let (session, _rec) = session(&meter, SessionConfig::default());
        let err = within(session.connect()).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::CharacteristicNotFound(READING_CHARACTERISTIC)
        );
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!meter.is_connected());
    }

    #[tokio::test]
    async fn test_calls_during_pending_scan_return_immediately() {
        let meter = SimulatedMeter::new("Thermo-7");
        let (session, rec) = session(&meter, SessionConfig::default());

        let pending = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });
        eventually("discovering", || session.state() == SessionState::Discovering).await;

        assert_eq!(
            within(session.start()).await,
            Err(SessionError::NotReady(SessionState::Discovering))
        );
        assert_eq!(
            within(session.connect()).await,
            Err(SessionError::NotReady(SessionState::Discovering))
        );
        assert!(rec.logged("Connect already in progress"));
        session.stop();
        assert_eq!(session.state(), SessionState::Discovering);
        assert_eq!(meter.write_count(), 0);

        within(session.disconnect()).await;
        assert_eq!(within(pending).await.unwrap(), Err(SessionError::Cancelled));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(rec.logged("Connect cancelled"));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_quiet() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.disconnect()).await;
        assert!(!rec.logged("Disconnected."));
        within(session.connect()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    // ── Notifications ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_burst_of_notifications_while_polling() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();
        within(session.start()).await.unwrap();

        for _ in 0..5 {
            assert!(meter.notify(&[0x01, 0x02, 0x00]));
        }
        eventually("five readings", || rec.readings().len() == 5).await;

        let readings = rec.readings();
        assert!(readings.iter().all(|r| r.value_db == 51.2));
        assert!(readings.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(session.snapshot().len(), 5);
        assert_eq!(rec.snapshots().last().map(Vec::len), Some(5));
        session.stop();
    }

    #[tokio::test]
    async fn test_notifications_ingested_while_ready() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();

        meter.notify(&[0x00, 0x02, 0x71]);
        eventually("one reading", || rec.readings().len() == 1).await;

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(rec.readings()[0].value_db, 62.5);
        assert_eq!(rec.readings()[0].sequence, 0);
    }

    #[tokio::test]
    async fn test_short_notification_dropped() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();

        meter.notify(&[0x01, 0x02]);
        meter.notify(&[]);
        meter.notify(&[0xFF, 0x00, 0x00]);
        eventually("one reading", || rec.readings().len() == 1).await;

        assert_eq!(rec.readings()[0].value_db, 0.0);
        assert_eq!(session.snapshot().len(), 1);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_snapshot_follows_each_reading() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();

        for tenths in [400u16, 410, 420] {
            let [hi, lo] = tenths.to_be_bytes();
            meter.notify(&[0x00, hi, lo]);
        }
        eventually("three snapshots", || rec.snapshots().len() == 3).await;

        let lens: Vec<usize> = rec.snapshots().iter().map(Vec::len).collect();
        assert_eq!(lens, vec![1, 2, 3]);
        let last: Vec<f64> = rec.snapshots()[2].iter().map(|r| r.value_db).collect();
        assert_eq!(last, vec![40.0, 41.0, 42.0]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let meter = meter();
        let config = SessionConfig {
            history_capacity: 4,
            ..Default::default()
        };
        let (session, rec) = session(&meter, config);
        within(session.connect()).await.unwrap();

        for tenths in 0..6u16 {
            let [hi, lo] = (tenths * 10).to_be_bytes();
            meter.notify(&[0x00, hi, lo]);
        }
        eventually("six readings", || rec.readings().len() == 6).await;

        let values: Vec<f64> = session.snapshot().iter().map(|r| r.value_db).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0, 5.0]);
    }

    // ── Polling ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let meter = meter();
        let (session, _rec) = session(&meter, SessionConfig::default());
        session.stop();
        assert_eq!(session.state(), SessionState::Disconnected);

        within(session.connect()).await.unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_start_sends_trigger_and_stop_returns_to_ready() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();
        within(session.start()).await.unwrap();
        assert_eq!(session.state(), SessionState::Polling);

        eventually("first trigger", || meter.write_count() >= 1).await;
        assert_eq!(meter.writes()[0], vec![0x30, 0x3B]);

        session.stop();
        session.stop();
        eventually("ready again", || session.state() == SessionState::Ready).await;
        assert!(rec.logged("Measurement stopped"));

        // Stopped loops stay stopped.
        let writes = meter.write_count();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(meter.write_count(), writes);

        // And can be restarted.
        within(session.start()).await.unwrap();
        eventually("another trigger", || meter.write_count() > writes).await;
        session.stop();
    }

    #[tokio::test]
    async fn test_start_while_polling_is_noop() {
        let meter = meter();
        let (session, _rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();
        within(session.start()).await.unwrap();
        within(session.start()).await.unwrap();
        eventually("first trigger", || meter.write_count() >= 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(meter.write_count(), 1, "only one loop running");
        session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_cadence() {
        let meter = meter();
        let (session, _rec) = session(&meter, SessionConfig::default());
        session.connect().await.unwrap();
        session.start().await.unwrap();

        // Triggers at t = 0, 500 and 1000 ms.
        tokio::time::sleep(Duration::from_millis(1250)).await;
        assert_eq!(meter.write_count(), 3);

        session.stop();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(meter.write_count(), 3);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_failed_trigger_write_keeps_polling() {
        let meter = meter();
        meter.set_write_status(GattStatus::Failure);
        let config = SessionConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (session, rec) = session(&meter, config);
        within(session.connect()).await.unwrap();
        within(session.start()).await.unwrap();

        eventually("two failed writes", || meter.write_count() >= 2).await;
        assert!(rec.logged("trigger write failed"));
        assert_eq!(session.state(), SessionState::Polling);

        meter.set_write_status(GattStatus::Success);
        session.stop();
        eventually("ready again", || session.state() == SessionState::Ready).await;
    }

    #[tokio::test]
    async fn test_auto_responding_meter_fills_history() {
        let meter = meter().with_auto_respond(true);
        let config = SessionConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let (session, rec) = session(&meter, config);
        within(session.connect()).await.unwrap();
        within(session.start()).await.unwrap();

        eventually("three readings", || rec.readings().len() >= 3).await;
        session.stop();

        let readings = rec.readings();
        assert!(readings.iter().all(|r| (43.0..=67.0).contains(&r.value_db)));
        assert!(readings.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_disconnect_while_polling() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();
        within(session.start()).await.unwrap();
        eventually("first trigger", || meter.write_count() >= 1).await;

        within(session.disconnect()).await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!meter.is_connected());
        assert!(rec.logged("Disconnected."));
        assert_eq!(
            within(session.start()).await,
            Err(SessionError::NotReady(SessionState::Disconnected))
        );
        assert!(!meter.notify(&[0x00, 0x01, 0x00]));
    }

    #[tokio::test]
    async fn test_link_loss_and_reconnect() {
        let meter = meter();
        let (session, rec) = session(&meter, SessionConfig::default());
        within(session.connect()).await.unwrap();
        meter.notify(&[0x00, 0x02, 0x00]);
        eventually("one reading", || rec.readings().len() == 1).await;
        within(session.start()).await.unwrap();

        meter.drop_link();
        eventually("link loss", || session.state() == SessionState::Disconnected).await;
        assert!(rec.logged("Device disconnected"));
        eventually("loop exit", || rec.logged("Measurement stopped")).await;
        assert_eq!(session.state(), SessionState::Disconnected);

        within(session.connect()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.snapshot().is_empty(), "history reset on connect");

        meter.notify(&[0x00, 0x02, 0x71]);
        eventually("fresh reading", || rec.readings().len() == 2).await;
        assert_eq!(rec.readings()[1].sequence, 0);
    }
}
