//! The wireless link as seen by the session core.
//!
//! The core needs three primitives from whatever owns the radio: subscribe to
//! a characteristic's notifications, write a characteristic, and read one
//! (for status polling).  [`Transport`] captures exactly that; stream handlers
//! receive an `Arc<dyn Transport>` in their constructor instead of looking up a
//! global driver, so several sessions (or tests) can run side by side.
//!
//! Implementations shipped with the crate:
//!
//! | Type | Backing |
//! |---|---|
//! | [`crate::ble::BleTransport`] | a connected `btleplug` peripheral |
//! | [`crate::simulator::SimulatedDevice`] | an in-process headset model |
//! | [`LoopbackTransport`] | host-fed notifications, recorded writes |

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// One item delivered on a subscription: raw bytes, or a link error.
pub type Notification = Result<Vec<u8>, TransportError>;

/// The radio-facing half of the core.
///
/// Timeouts are the implementation's responsibility; none of these calls may
/// wait forever.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enable notifications on `characteristic` and return a handle that
    /// yields them in delivery order.  Dropping the handle unsubscribes.
    async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, TransportError>;

    /// Write `payload` and wait for the peripheral's acknowledgement.
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError>;

    /// Read the current value of `characteristic`.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;
}

// ── Subscription ──────────────────────────────────────────────────────────────

/// A live notification subscription.
///
/// Owns the notification stream and an optional cancel hook.  The hook runs
/// exactly once, when the subscription is dropped or [`cancel`](Self::cancel)led,
/// so releasing a subscription is tied to ownership rather than to a call the
/// caller might forget.
pub struct Subscription {
    stream: BoxStream<'static, Notification>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(stream: impl Stream<Item = Notification> + Send + 'static) -> Self {
        Self {
            stream: stream.boxed(),
            on_cancel: None,
        }
    }

    /// Subscription fed by an mpsc channel; closes when every sender is gone.
    pub fn from_receiver(mut rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self::new(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    /// Attach a hook that runs when the subscription is released.
    pub fn on_cancel(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(hook));
        self
    }

    /// Next notification, or `None` once the link closed the stream.
    pub async fn next(&mut self) -> Option<Notification> {
        self.stream.next().await
    }

    /// Release the subscription now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("has_cancel_hook", &self.on_cancel.is_some())
            .finish_non_exhaustive()
    }
}

// ── LoopbackTransport ─────────────────────────────────────────────────────────

/// A transport whose notifications are pushed by the host and whose writes are
/// recorded.
///
/// Useful when the radio is owned by another layer (a mobile OS BLE stack
/// bridged over FFI, a replay file) and for exercising handlers in tests.
/// Clones share state.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<LoopbackState>>,
}

#[derive(Default)]
struct LoopbackState {
    disconnected: bool,
    subscribers: HashMap<Uuid, Vec<mpsc::UnboundedSender<Notification>>>,
    read_values: HashMap<Uuid, Vec<u8>>,
    writes: Vec<(Uuid, Vec<u8>)>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        // A panic while holding the lock cannot leave this state half-updated,
        // so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `bytes` to every live subscriber of `characteristic`.
    /// Returns how many subscribers received it.
    pub fn notify(&self, characteristic: Uuid, bytes: &[u8]) -> usize {
        self.push(characteristic, Ok(bytes.to_vec()))
    }

    /// Deliver a link error to every live subscriber of `characteristic`.
    pub fn notify_error(&self, characteristic: Uuid, error: TransportError) -> usize {
        self.push(characteristic, Err(error))
    }

    fn push(&self, characteristic: Uuid, item: Notification) -> usize {
        let mut state = self.state();
        let Some(subs) = state.subscribers.get_mut(&characteristic) else {
            return 0;
        };
        subs.retain(|tx| tx.send(item.clone()).is_ok());
        subs.len()
    }

    /// Value returned by subsequent reads of `characteristic`.
    pub fn set_read_value(&self, characteristic: Uuid, bytes: &[u8]) {
        self.state().read_values.insert(characteristic, bytes.to_vec());
    }

    /// Simulate the link dropping (`false`) or coming back (`true`).
    ///
    /// Dropping the link closes every open subscription.
    pub fn set_connected(&self, connected: bool) {
        let mut state = self.state();
        state.disconnected = !connected;
        if !connected {
            state.subscribers.clear();
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.state().disconnected
    }

    /// Live subscriptions on `characteristic`.
    pub fn subscriber_count(&self, characteristic: Uuid) -> usize {
        let mut state = self.state();
        match state.subscribers.get_mut(&characteristic) {
            Some(subs) => {
                subs.retain(|tx| !tx.is_closed());
                subs.len()
            }
            None => 0,
        }
    }

    /// Every successful write so far, oldest first.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state().writes.clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, TransportError> {
        let mut state = self.state();
        if state.disconnected {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.entry(characteristic).or_default().push(tx);
        Ok(Subscription::from_receiver(rx))
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.disconnected {
            return Err(TransportError::NotConnected);
        }
        state.writes.push((characteristic, payload.to_vec()));
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let state = self.state();
        if state.disconnected {
            return Err(TransportError::NotConnected);
        }
        state
            .read_values
            .get(&characteristic)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const CHAR: Uuid = Uuid::from_u128(0x1234);

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let t = LoopbackTransport::new();
        let mut sub = t.subscribe(CHAR).await.unwrap();
        assert_eq!(t.notify(CHAR, &[1]), 1);
        assert_eq!(t.notify(CHAR, &[2]), 1);
        t.notify_error(CHAR, TransportError::NotConnected);
        assert_eq!(sub.next().await, Some(Ok(vec![1])));
        assert_eq!(sub.next().await, Some(Ok(vec![2])));
        assert_eq!(sub.next().await, Some(Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_dropping_subscription_runs_cancel_hook_once() {
        let t = LoopbackTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = t
            .subscribe(CHAR)
            .await
            .unwrap()
            .on_cancel(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        assert_eq!(t.subscriber_count(CHAR), 1);
        sub.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(t.subscriber_count(CHAR), 0);
        assert_eq!(t.notify(CHAR, &[0]), 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_streams_and_rejects_io() {
        let t = LoopbackTransport::new();
        let mut sub = t.subscribe(CHAR).await.unwrap();
        t.set_connected(false);
        assert_eq!(sub.next().await, None);
        assert_eq!(
            t.write(CHAR, &[1]).await,
            Err(TransportError::NotConnected)
        );
        assert!(t.subscribe(CHAR).await.is_err());
        t.set_connected(true);
        assert!(t.write(CHAR, &[1]).await.is_ok());
        assert_eq!(t.writes(), vec![(CHAR, vec![1])]);
    }

    #[tokio::test]
    async fn test_read_returns_configured_value() {
        let t = LoopbackTransport::new();
        assert_eq!(
            t.read(CHAR).await,
            Err(TransportError::CharacteristicNotFound(CHAR))
        );
        t.set_read_value(CHAR, &[7, 7]);
        assert_eq!(t.read(CHAR).await, Ok(vec![7, 7]));
    }
}
