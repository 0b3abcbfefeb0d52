//! Stateful wrappers around the three FlowState characteristics.
//!
//! Each handler owns one characteristic on one [`Transport`].  Notification
//! handlers run a background pump task between [`StreamHandler::start`] and
//! [`StreamHandler::stop`]; when `stop` returns, that task has been dropped
//! and with it the [`crate::transport::Subscription`], so the link has been
//! asked to unsubscribe.
//!
//! Callbacks are attached with builder methods before `start` and run on the
//! pump task, in transport delivery order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::{ControlError, StreamError, TransportError};
use crate::parse::{decode_status, decode_telemetry};
use crate::protocol::encode_command;
use crate::transport::Transport;
use crate::types::{now_ms, ControlCommand, ControlResult, DeviceStatus, TelemetryPacket};

/// Capability shared by every handler.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Open the characteristic.  A no-op when already active.
    async fn start(&mut self) -> Result<(), TransportError>;

    /// Close the characteristic and wait for the pump task to finish.
    /// A no-op when inactive.
    async fn stop(&mut self);

    fn is_active(&self) -> bool;
}

type ErrorCallback = Arc<dyn Fn(StreamError) + Send + Sync>;

/// Abort a pump task and wait until its future (and the subscription it owns)
/// has been dropped.
async fn shut_down(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
        let _ = task.await;
    }
}

fn report(on_error: &Option<ErrorCallback>, label: &str, e: StreamError) {
    warn!("{label}: {e}");
    if let Some(cb) = on_error {
        cb(e);
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// Counters for one telemetry handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub packets_received: u64,
    pub dropped_packets: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
struct TelemetryCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
}

/// Decodes telemetry frames and watches the sequence counter.
///
/// Every decoded frame is forwarded, including the one after a gap; a gap
/// only bumps [`dropped_packets`](Self::dropped_packets) by one regardless of
/// how many frames went missing.  Sequence tracking starts fresh on every
/// `start`.
pub struct TelemetryHandler {
    transport: Arc<dyn Transport>,
    characteristic: Uuid,
    on_data: Option<Arc<dyn Fn(TelemetryPacket) + Send + Sync>>,
    on_error: Option<ErrorCallback>,
    counters: Arc<TelemetryCounters>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryHandler {
    pub fn new(transport: Arc<dyn Transport>, characteristic: Uuid) -> Self {
        Self {
            transport,
            characteristic,
            on_data: None,
            on_error: None,
            counters: Arc::default(),
            task: None,
        }
    }

    pub fn on_data(mut self, f: impl Fn(TelemetryPacket) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(StreamError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn dropped_packets(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_dropped_packets(&self) {
        self.counters.dropped.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            packets_received: self.counters.received.load(Ordering::Relaxed),
            dropped_packets: self.counters.dropped.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl StreamHandler for TelemetryHandler {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.is_active() {
            return Ok(());
        }
        let mut sub = self.transport.subscribe(self.characteristic).await?;
        info!("telemetry: subscribed to {}", self.characteristic);

        let counters = Arc::clone(&self.counters);
        let on_data = self.on_data.clone();
        let on_error = self.on_error.clone();
        self.task = Some(tokio::spawn(async move {
            let mut last_sequence: Option<u16> = None;
            while let Some(item) = sub.next().await {
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        report(&on_error, "telemetry", e.into());
                        continue;
                    }
                };
                let packet = match decode_telemetry(&bytes) {
                    Ok(p) => p,
                    Err(e) => {
                        counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                        report(&on_error, "telemetry", e.into());
                        continue;
                    }
                };

                if let Some(prev) = last_sequence {
                    let expected = prev.wrapping_add(1);
                    if packet.sequence_number != expected {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "telemetry: sequence gap, expected {expected} got {}",
                            packet.sequence_number
                        );
                    }
                }
                last_sequence = Some(packet.sequence_number);

                let n = counters.received.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= 3 || n % 500 == 0 {
                    info!(
                        "telemetry: packet #{n} seq={} samples={} (dropped so far: {})",
                        packet.sequence_number,
                        packet.samples.len(),
                        counters.dropped.load(Ordering::Relaxed)
                    );
                }

                if let Some(cb) = &on_data {
                    cb(packet);
                }
            }
            // `stop` aborts this task, so reaching here means the link went away.
            report(&on_error, "telemetry", TransportError::NotConnected.into());
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if self.task.is_some() {
            shut_down(self.task.take()).await;
            info!("telemetry: stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// How status snapshots are obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMode {
    /// Subscribe to status notifications.
    #[default]
    Notify,
    /// Read the characteristic every `interval`.
    Poll {
        #[serde(with = "millis")]
        interval: Duration,
    },
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Keeps the newest [`DeviceStatus`] and forwards each one to the callback.
pub struct StatusHandler {
    transport: Arc<dyn Transport>,
    characteristic: Uuid,
    mode: StatusMode,
    on_status: Option<Arc<dyn Fn(DeviceStatus) + Send + Sync>>,
    on_error: Option<ErrorCallback>,
    latest: watch::Sender<Option<DeviceStatus>>,
    task: Option<JoinHandle<()>>,
}

impl StatusHandler {
    pub fn new(transport: Arc<dyn Transport>, characteristic: Uuid, mode: StatusMode) -> Self {
        Self {
            transport,
            characteristic,
            mode,
            on_status: None,
            on_error: None,
            latest: watch::Sender::new(None),
            task: None,
        }
    }

    pub fn on_status(mut self, f: impl Fn(DeviceStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(StreamError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// The most recent snapshot, if any arrived yet.
    pub fn latest(&self) -> Option<DeviceStatus> {
        self.latest.borrow().clone()
    }

    /// Receiver that is notified whenever a new snapshot replaces the old one.
    pub fn watch(&self) -> watch::Receiver<Option<DeviceStatus>> {
        self.latest.subscribe()
    }

    pub fn mode(&self) -> StatusMode {
        self.mode
    }
}

#[async_trait]
impl StreamHandler for StatusHandler {
    async fn start(&mut self) -> Result<(), TransportError> {
        if self.is_active() {
            return Ok(());
        }
        let latest = self.latest.clone();
        let on_status = self.on_status.clone();
        let on_error = self.on_error.clone();
        let publish = move |bytes: &[u8]| match decode_status(bytes) {
            Ok(status) => {
                debug!(
                    "status: battery {}% quality {} streaming={}",
                    status.battery_level, status.signal_quality, status.streaming
                );
                latest.send_replace(Some(status.clone()));
                if let Some(cb) = &on_status {
                    cb(status);
                }
            }
            Err(e) => report(&on_error, "status", e.into()),
        };

        match self.mode {
            StatusMode::Notify => {
                let mut sub = self.transport.subscribe(self.characteristic).await?;
                info!("status: subscribed to {}", self.characteristic);
                let on_error = self.on_error.clone();
                self.task = Some(tokio::spawn(async move {
                    while let Some(item) = sub.next().await {
                        match item {
                            Ok(bytes) => publish(&bytes),
                            Err(e) => report(&on_error, "status", e.into()),
                        }
                    }
                    report(&on_error, "status", TransportError::NotConnected.into());
                }));
            }
            StatusMode::Poll { interval } => {
                info!("status: polling {} every {interval:?}", self.characteristic);
                let transport = Arc::clone(&self.transport);
                let characteristic = self.characteristic;
                let on_error = self.on_error.clone();
                let period = interval.max(Duration::from_millis(1));
                self.task = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        match transport.read(characteristic).await {
                            Ok(bytes) => publish(&bytes),
                            Err(e) => report(&on_error, "status", e.into()),
                        }
                    }
                }));
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if self.task.is_some() {
            shut_down(self.task.take()).await;
            info!("status: stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

// ── Control ───────────────────────────────────────────────────────────────────

/// Validates, encodes and writes [`ControlCommand`]s.
///
/// Writes are not retried; a failed write (including one attempted while the
/// link is reconnecting) is returned to the caller as-is.
pub struct ControlHandler {
    transport: Arc<dyn Transport>,
    characteristic: Uuid,
    active: bool,
}

impl ControlHandler {
    pub fn new(transport: Arc<dyn Transport>, characteristic: Uuid) -> Self {
        Self {
            transport,
            characteristic,
            active: false,
        }
    }

    pub async fn send(&self, command: ControlCommand) -> Result<ControlResult, ControlError> {
        let bytes = encode_command(&command)?;
        if !self.active {
            return Err(TransportError::NotConnected.into());
        }
        self.transport.write(self.characteristic, &bytes).await?;
        info!("control: sent {command:?}");
        Ok(ControlResult {
            success: true,
            command,
            timestamp_ms: now_ms(),
        })
    }
}

#[async_trait]
impl StreamHandler for ControlHandler {
    async fn start(&mut self) -> Result<(), TransportError> {
        self.active = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::error::{DecodeError, ValidationError};
    use crate::protocol::{
        encode_status, encode_telemetry, CONTROL_CHARACTERISTIC, STATUS_CHARACTERISTIC,
        TELEMETRY_CHARACTERISTIC,
    };
    use crate::transport::LoopbackTransport;

    fn frame(seq: u16) -> Vec<u8> {
        encode_telemetry(&TelemetryPacket {
            timestamp: seq as u32 * 100,
            sequence_number: seq,
            samples: vec![seq as f32; 4],
        })
        .unwrap()
    }

    fn status(battery: u8) -> DeviceStatus {
        DeviceStatus {
            battery_level: battery,
            charging: false,
            streaming: true,
            entrainment_active: false,
            error: false,
            error_code: 0,
            firmware_version: "1.2.3".into(),
            signal_strength: -60,
            signal_quality: 67,
        }
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    fn telemetry(link: &LoopbackTransport) -> (TelemetryHandler, mpsc::UnboundedReceiver<TelemetryPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = TelemetryHandler::new(Arc::new(link.clone()), TELEMETRY_CHARACTERISTIC)
            .on_data(move |p| {
                let _ = tx.send(p);
            });
        (h, rx)
    }

    #[tokio::test]
    async fn test_sequence_gap_counts_once_and_still_forwards() {
        let link = LoopbackTransport::new();
        let (mut h, mut rx) = telemetry(&link);
        h.start().await.unwrap();
        for seq in [0, 1, 3, 4] {
            link.notify(TELEMETRY_CHARACTERISTIC, &frame(seq));
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(recv(&mut rx).await.sequence_number);
        }
        assert_eq!(seen, vec![0, 1, 3, 4]);
        assert_eq!(h.dropped_packets(), 1);
        assert_eq!(h.stats().packets_received, 4);
        h.reset_dropped_packets();
        assert_eq!(h.dropped_packets(), 0);
    }

    #[tokio::test]
    async fn test_sequence_wraps_without_gap() {
        let link = LoopbackTransport::new();
        let (mut h, mut rx) = telemetry(&link);
        h.start().await.unwrap();
        for seq in [0xFFFE, 0xFFFF, 0, 1] {
            link.notify(TELEMETRY_CHARACTERISTIC, &frame(seq));
        }
        for _ in 0..4 {
            recv(&mut rx).await;
        }
        assert_eq!(h.dropped_packets(), 0);
    }

    #[tokio::test]
    async fn test_decode_error_reported_and_stream_continues() {
        let link = LoopbackTransport::new();
        let (etx, mut erx) = mpsc::unbounded_channel();
        let (mut h, mut rx) = telemetry(&link);
        h = h.on_error(move |e| {
            let _ = etx.send(e);
        });
        h.start().await.unwrap();
        link.notify(TELEMETRY_CHARACTERISTIC, &[1, 2, 3]);
        link.notify(TELEMETRY_CHARACTERISTIC, &frame(9));

        assert!(matches!(
            recv(&mut erx).await,
            StreamError::Decode(DecodeError::Truncated { .. })
        ));
        assert_eq!(recv(&mut rx).await.sequence_number, 9);
        assert_eq!(h.stats().decode_errors, 1);
        assert!(h.is_active());
    }

    #[tokio::test]
    async fn test_link_loss_is_reported() {
        let link = LoopbackTransport::new();
        let (etx, mut erx) = mpsc::unbounded_channel();
        let (h, _rx) = telemetry(&link);
        let mut h = h.on_error(move |e| {
            let _ = etx.send(e);
        });
        h.start().await.unwrap();
        link.set_connected(false);
        assert_eq!(
            recv(&mut erx).await,
            StreamError::Transport(TransportError::NotConnected)
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.is_active() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_status_link_loss_is_reported() {
        let link = LoopbackTransport::new();
        let (etx, mut erx) = mpsc::unbounded_channel();
        let mut h = StatusHandler::new(
            Arc::new(link.clone()),
            STATUS_CHARACTERISTIC,
            StatusMode::Notify,
        )
        .on_error(move |e| {
            let _ = etx.send(e);
        });
        h.start().await.unwrap();
        link.set_connected(false);
        assert_eq!(
            recv(&mut erx).await,
            StreamError::Transport(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_stop_does_not_report_link_loss() {
        let link = LoopbackTransport::new();
        let (etx, mut erx) = mpsc::unbounded_channel::<StreamError>();
        let (h, _rx) = telemetry(&link);
        let mut h = h.on_error(move |e| {
            let _ = etx.send(e);
        });
        h.start().await.unwrap();
        h.stop().await;
        assert!(erx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_releases_subscription() {
        let link = LoopbackTransport::new();
        let (mut h, _rx) = telemetry(&link);
        h.start().await.unwrap();
        h.start().await.unwrap();
        assert_eq!(link.subscriber_count(TELEMETRY_CHARACTERISTIC), 1);
        h.stop().await;
        assert!(!h.is_active());
        assert_eq!(link.subscriber_count(TELEMETRY_CHARACTERISTIC), 0);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_restart_resets_sequence_tracking() {
        let link = LoopbackTransport::new();
        let (mut h, mut rx) = telemetry(&link);
        h.start().await.unwrap();
        link.notify(TELEMETRY_CHARACTERISTIC, &frame(10));
        recv(&mut rx).await;
        h.stop().await;
        h.start().await.unwrap();
        link.notify(TELEMETRY_CHARACTERISTIC, &frame(50));
        recv(&mut rx).await;
        assert_eq!(h.dropped_packets(), 0);
    }

    #[tokio::test]
    async fn test_start_fails_when_disconnected() {
        let link = LoopbackTransport::new();
        link.set_connected(false);
        let (mut h, _rx) = telemetry(&link);
        assert_eq!(h.start().await, Err(TransportError::NotConnected));
        assert!(!h.is_active());
    }

    #[tokio::test]
    async fn test_status_notify_keeps_latest() {
        let link = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut h = StatusHandler::new(
            Arc::new(link.clone()),
            STATUS_CHARACTERISTIC,
            StatusMode::Notify,
        )
        .on_status(move |s| {
            let _ = tx.send(s);
        });
        assert_eq!(h.latest(), None);
        h.start().await.unwrap();
        link.notify(STATUS_CHARACTERISTIC, &encode_status(&status(80)));
        link.notify(STATUS_CHARACTERISTIC, &encode_status(&status(79)));
        recv(&mut rx).await;
        assert_eq!(recv(&mut rx).await.battery_level, 79);
        assert_eq!(h.latest().map(|s| s.battery_level), Some(79));
        h.stop().await;
        assert_eq!(link.subscriber_count(STATUS_CHARACTERISTIC), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poll_reads_on_interval() {
        let link = LoopbackTransport::new();
        link.set_read_value(STATUS_CHARACTERISTIC, &encode_status(&status(55)));
        let mut h = StatusHandler::new(
            Arc::new(link.clone()),
            STATUS_CHARACTERISTIC,
            StatusMode::Poll {
                interval: Duration::from_secs(5),
            },
        );
        let mut latest = h.watch();
        h.start().await.unwrap();
        latest.changed().await.unwrap();
        assert_eq!(h.latest().map(|s| s.battery_level), Some(55));

        link.set_read_value(STATUS_CHARACTERISTIC, &encode_status(&status(54)));
        latest.changed().await.unwrap();
        assert_eq!(h.latest().map(|s| s.battery_level), Some(54));
        h.stop().await;
        assert!(!h.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poll_reports_read_errors() {
        let link = LoopbackTransport::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        let mut h = StatusHandler::new(
            Arc::new(link.clone()),
            STATUS_CHARACTERISTIC,
            StatusMode::Poll {
                interval: Duration::from_secs(1),
            },
        )
        .on_error(move |err| e.lock().unwrap().push(err));
        h.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        h.stop().await;
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| *e
            == StreamError::Transport(TransportError::CharacteristicNotFound(
                STATUS_CHARACTERISTIC
            ))));
    }

    #[tokio::test]
    async fn test_control_rejects_when_inactive() {
        let link = LoopbackTransport::new();
        let h = ControlHandler::new(Arc::new(link.clone()), CONTROL_CHARACTERISTIC);
        assert_eq!(
            h.send(ControlCommand::StartEntrainment).await,
            Err(ControlError::Transport(TransportError::NotConnected))
        );
        assert!(link.writes().is_empty());
    }

    #[tokio::test]
    async fn test_control_validation_does_not_depend_on_link() {
        let link = LoopbackTransport::new();
        let h = ControlHandler::new(Arc::new(link.clone()), CONTROL_CHARACTERISTIC);
        assert!(matches!(
            h.send(ControlCommand::SetVolume(1.5)).await,
            Err(ControlError::Validation(ValidationError::Volume(_)))
        ));
        assert!(link.writes().is_empty());
    }

    #[tokio::test]
    async fn test_control_validates_before_writing() {
        let link = LoopbackTransport::new();
        let mut h = ControlHandler::new(Arc::new(link.clone()), CONTROL_CHARACTERISTIC);
        h.start().await.unwrap();
        let err = h.send(ControlCommand::SetFrequency(12.0)).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::Validation(ValidationError::Frequency { .. })
        ));
        assert!(link.writes().is_empty());
    }

    #[tokio::test]
    async fn test_control_writes_encoded_command() {
        let link = LoopbackTransport::new();
        let mut h = ControlHandler::new(Arc::new(link.clone()), CONTROL_CHARACTERISTIC);
        h.start().await.unwrap();
        let result = h.send(ControlCommand::SetVolume(0.25)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.command, ControlCommand::SetVolume(0.25));
        assert_eq!(
            link.writes(),
            vec![(
                CONTROL_CHARACTERISTIC,
                encode_command(&ControlCommand::SetVolume(0.25)).unwrap()
            )]
        );

        link.set_connected(false);
        assert_eq!(
            h.send(ControlCommand::StopEntrainment).await,
            Err(ControlError::Transport(TransportError::NotConnected))
        );
    }
}
