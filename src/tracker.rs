//! QoS 1 publish tracking
//!
//! Owns every in-flight QoS 1 publish: packet-id allocation, the pending
//! table keyed in enqueue order, retransmission deadlines with exponential
//! backoff, and completion receipts. The facade's retry task asks this
//! module what is due; the tracker itself never touches the transport.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{MqttError, MqttResult, PublishFailure};

/// Retransmission policy for QoS 1 publishes
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Delay before retransmission `attempt` (1-based): initial * 2^(n-1), capped.
fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    config
        .initial_backoff
        .saturating_mul(1u32 << exponent)
        .min(config.max_backoff)
}

struct PendingPublish {
    packet_id: u16,
    topic: String,
    payload: Bytes,
    retry_count: u32,
    next_retry_at: Instant,
    done: oneshot::Sender<MqttResult<()>>,
}

struct TrackerInner {
    /// Enqueue order; never reordered so session resends replay in order.
    pending: Vec<PendingPublish>,
    next_packet_id: u16,
}

impl TrackerInner {
    /// Monotonic id that wraps modulo 2^16, skipping 0 and in-flight ids.
    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if id == 0 {
                continue;
            }
            if self.pending.iter().any(|p| p.packet_id == id) {
                continue;
            }
            return id;
        }
    }
}

/// A publish that should go back out on the wire with the DUP flag set.
#[derive(Debug, Clone, PartialEq)]
pub struct Retransmission {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Bytes,
}

/// Pending QoS 1 state carried across connections when clean-session is off.
pub struct Session {
    pending: Vec<PendingPublish>,
    next_packet_id: u16,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            next_packet_id: 1,
        }
    }
}

impl Session {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pending", &self.pending.len())
            .field("next_packet_id", &self.next_packet_id)
            .finish()
    }
}

/// Resolves when a publish is acknowledged or given up on.
///
/// QoS 0 receipts are already resolved at creation.
#[derive(Debug)]
pub struct PublishReceipt {
    rx: Option<oneshot::Receiver<MqttResult<()>>>,
}

impl PublishReceipt {
    pub(crate) fn resolved() -> Self {
        Self { rx: None }
    }

    pub async fn wait(self) -> MqttResult<()> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.await.map_err(|_| MqttError::ConnectionClosed)?,
        }
    }
}

/// Shared table of in-flight QoS 1 publishes
pub struct PublishTracker {
    config: RetryConfig,
    inner: Mutex<TrackerInner>,
    notify: tokio::sync::Notify,
}

impl PublishTracker {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_session(config, Session::default())
    }

    /// Resume from a preserved session: pending publishes keep their packet
    /// ids and completion receipts; retry state restarts from zero.
    pub fn with_session(config: RetryConfig, mut session: Session) -> Self {
        let now = Instant::now();
        for entry in &mut session.pending {
            entry.retry_count = 0;
            entry.next_retry_at = now + backoff_delay(&config, 1);
        }
        Self {
            config,
            inner: Mutex::new(TrackerInner {
                pending: session.pending,
                next_packet_id: session.next_packet_id,
            }),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Allocate a packet id without registering pending state.
    ///
    /// Used for SUBSCRIBE/UNSUBSCRIBE so the whole connection draws ids
    /// from one counter.
    pub fn allocate_packet_id(&self) -> u16 {
        let mut inner = self.inner.lock().unwrap();
        inner.allocate_packet_id()
    }

    /// Record a new QoS 1 publish. Returns the assigned packet id and the
    /// receipt the caller can await.
    pub fn register(&self, topic: String, payload: Bytes) -> (u16, PublishReceipt) {
        let (tx, rx) = oneshot::channel();
        let packet_id = {
            let mut inner = self.inner.lock().unwrap();
            let packet_id = inner.allocate_packet_id();
            inner.pending.push(PendingPublish {
                packet_id,
                topic,
                payload,
                retry_count: 0,
                next_retry_at: Instant::now() + backoff_delay(&self.config, 1),
                done: tx,
            });
            packet_id
        };
        self.notify.notify_one();
        (packet_id, PublishReceipt { rx: Some(rx) })
    }

    /// Resolve the pending publish matching a PUBACK. Unknown ids are
    /// logged and ignored.
    pub fn acknowledge(&self, packet_id: u16) -> bool {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            match inner.pending.iter().position(|p| p.packet_id == packet_id) {
                Some(index) => Some(inner.pending.remove(index)),
                None => None,
            }
        };
        match entry {
            Some(entry) => {
                let _ = entry.done.send(Ok(()));
                self.notify.notify_one();
                true
            }
            None => {
                warn!(packet_id, "PUBACK for unknown packet id, ignoring");
                false
            }
        }
    }

    /// Earliest retransmission deadline among pending publishes
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.pending.iter().map(|p| p.next_retry_at).min()
    }

    /// Collect publishes whose deadline has passed. Entries that still have
    /// retries left are rescheduled and returned for resending; entries out
    /// of retries resolve their receipt with `PublishFailed`.
    pub fn due_retransmissions(&self, now: Instant) -> Vec<Retransmission> {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let mut index = 0;
            while index < inner.pending.len() {
                if inner.pending[index].next_retry_at > now {
                    index += 1;
                    continue;
                }
                if inner.pending[index].retry_count >= self.config.max_retries {
                    exhausted.push(inner.pending.remove(index));
                    continue;
                }
                let entry = &mut inner.pending[index];
                entry.retry_count += 1;
                entry.next_retry_at = now + backoff_delay(&self.config, entry.retry_count + 1);
                resend.push(Retransmission {
                    packet_id: entry.packet_id,
                    topic: entry.topic.clone(),
                    payload: entry.payload.clone(),
                });
                index += 1;
            }
        }
        for entry in exhausted {
            warn!(
                packet_id = entry.packet_id,
                topic = %entry.topic,
                retries = entry.retry_count,
                "giving up on unacknowledged publish"
            );
            let _ = entry.done.send(Err(MqttError::max_retries_exceeded()));
        }
        resend
    }

    /// Fail every pending publish, e.g. when the connection is lost with
    /// clean-session on.
    pub fn fail_all(&self, reason: PublishFailure) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.pending)
        };
        for entry in drained {
            let _ = entry
                .done
                .send(Err(MqttError::PublishFailed { reason }));
        }
        self.notify.notify_one();
    }

    /// Move all pending state into a `Session` for a later connection.
    pub fn take_session(&self) -> Session {
        let mut inner = self.inner.lock().unwrap();
        Session {
            pending: std::mem::take(&mut inner.pending),
            next_packet_id: inner.next_packet_id,
        }
    }

    /// Pending publishes in enqueue order, for resending after a session
    /// resume.
    pub fn pending_for_resend(&self) -> Vec<Retransmission> {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .iter()
            .map(|p| Retransmission {
                packet_id: p.packet_id,
                topic: p.topic.clone(),
                payload: p.payload.clone(),
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Wait until the pending set changes (registration, ack or drain).
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig::default()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_packet_ids_skip_zero_and_in_flight() {
        let tracker = PublishTracker::new(config());
        let (first, _r1) = tracker.register("t".to_string(), Bytes::new());
        let (second, _r2) = tracker.register("t".to_string(), Bytes::new());
        assert_ne!(first, 0);
        assert_ne!(second, 0);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_packet_id_wraps_past_in_flight_entry() {
        let tracker = PublishTracker::with_session(
            config(),
            Session {
                pending: Vec::new(),
                next_packet_id: u16::MAX,
            },
        );
        let (a, _ra) = tracker.register("t".to_string(), Bytes::new());
        // Counter wraps past 0 to 1.
        let (b, _rb) = tracker.register("t".to_string(), Bytes::new());
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 1);
    }

    #[tokio::test]
    async fn test_acknowledge_resolves_receipt() {
        let tracker = PublishTracker::new(config());
        let (packet_id, receipt) = tracker.register("t".to_string(), Bytes::from_static(b"x"));

        assert!(tracker.acknowledge(packet_id));
        assert_eq!(tracker.pending_count(), 0);
        receipt.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_ack_is_ignored() {
        let tracker = PublishTracker::new(config());
        let (_packet_id, _receipt) = tracker.register("t".to_string(), Bytes::new());

        assert!(!tracker.acknowledge(9999));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_resolved_receipt_is_immediate() {
        PublishReceipt::resolved().wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_retransmissions_then_exhaustion() {
        let tracker = PublishTracker::new(config());
        let (packet_id, receipt) = tracker.register("t".to_string(), Bytes::from_static(b"x"));

        // Three deadlines produce three retransmissions.
        for attempt in 1..=3u32 {
            let deadline = tracker.next_deadline().unwrap();
            let due = tracker.due_retransmissions(deadline);
            assert_eq!(due.len(), 1, "retry {attempt} should be due");
            assert_eq!(due[0].packet_id, packet_id);
        }

        // The fourth deadline gives up instead of resending.
        let deadline = tracker.next_deadline().unwrap();
        assert!(tracker.due_retransmissions(deadline).is_empty());
        assert_eq!(tracker.pending_count(), 0);
        let error = receipt.wait().await.unwrap_err();
        assert!(matches!(
            error,
            MqttError::PublishFailed {
                reason: PublishFailure::MaxRetriesExceeded
            }
        ));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_with_connection_lost() {
        let tracker = PublishTracker::new(config());
        let (_id, receipt) = tracker.register("t".to_string(), Bytes::new());

        tracker.fail_all(PublishFailure::ConnectionLost);

        let error = receipt.wait().await.unwrap_err();
        assert!(matches!(
            error,
            MqttError::PublishFailed {
                reason: PublishFailure::ConnectionLost
            }
        ));
    }

    #[tokio::test]
    async fn test_session_preserves_ids_order_and_receipts() {
        let tracker = PublishTracker::new(config());
        let (first, receipt) = tracker.register("a".to_string(), Bytes::from_static(b"1"));
        let (second, _r2) = tracker.register("b".to_string(), Bytes::from_static(b"2"));

        let session = tracker.take_session();
        assert_eq!(session.len(), 2);
        assert_eq!(tracker.pending_count(), 0);

        let resumed = PublishTracker::with_session(config(), session);
        let resend = resumed.pending_for_resend();
        assert_eq!(resend.len(), 2);
        assert_eq!(resend[0].packet_id, first);
        assert_eq!(resend[1].packet_id, second);

        // A receipt taken before the handover still resolves afterwards.
        assert!(resumed.acknowledge(first));
        receipt.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_resumed_allocator_continues_past_session_ids() {
        let tracker = PublishTracker::new(config());
        let (first, _r) = tracker.register("a".to_string(), Bytes::new());
        let session = tracker.take_session();

        let resumed = PublishTracker::with_session(config(), session);
        let (next, _r2) = resumed.register("b".to_string(), Bytes::new());
        assert_ne!(next, first);
    }
}
