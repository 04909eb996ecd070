//! MQTT client facade
//!
//! Composes the codec, connection handshake, publish tracker and
//! subscription registry over a caller-supplied transport. After the
//! handshake succeeds the transport is split; four background tasks own
//! the runtime behavior:
//!
//! - the writer task serializes every outbound packet through one queue,
//! - the read loop decodes inbound packets and routes them,
//! - the keep-alive task sends pings and detects broker silence,
//! - the retry task drives QoS 1 retransmission deadlines.
//!
//! A supervisor performs the single teardown when any task reports a
//! fatal reason; the first reason wins and is published on the
//! disconnect watch channel. The core never reconnects by itself.

use std::collections::HashMap;
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::{Codec, Packet, Publish, QoS, Subscribe, Unsubscribe, SUBACK_FAILURE};
use crate::connection::{self, ConnectionState, KeepAliveSchedule, MqttOptions};
use crate::error::{DisconnectReason, MqttError, MqttResult, PublishFailure};
use crate::registry::{InboundMessage, MessageHandler, SubscriptionRegistry};
use crate::tracker::{PublishReceipt, PublishTracker, RetryConfig, Session};
use crate::transport::Transport;

/// Outbound queue depth; writes are serialized through one channel
const WRITE_QUEUE_DEPTH: usize = 64;

/// How long `disconnect` waits for each task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type ControlReply = oneshot::Sender<MqttResult<Vec<u8>>>;

/// State shared between the facade and its background tasks
struct Shared {
    codec: Codec,
    tracker: PublishTracker,
    registry: SubscriptionRegistry,
    /// SUBACK waiters keyed by packet id
    pending_control: Mutex<HashMap<u16, ControlReply>>,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    disconnect_tx: watch::Sender<Option<DisconnectReason>>,
    torn_down: AtomicBool,
}

impl Shared {
    fn stamp_read(&self) {
        *self.last_read.lock().unwrap() = Instant::now();
    }

    fn stamp_write(&self) {
        *self.last_write.lock().unwrap() = Instant::now();
    }

    /// Record the first teardown reason and move the state machine to
    /// Disconnected. Later reasons are dropped. The reason is published
    /// on the disconnect channel only once the state settled.
    fn tear_down(&self, reason: DisconnectReason, clean_session: bool) {
        if self.torn_down.swap(true, atomic::Ordering::SeqCst) {
            return;
        }

        self.state_tx.send_replace(ConnectionState::Disconnecting);
        let waiters: Vec<ControlReply> = {
            let mut pending = self.pending_control.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(reason.as_error()));
        }
        if clean_session {
            self.tracker.fail_all(PublishFailure::ConnectionLost);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.disconnect_tx.send_replace(Some(reason));
    }
}

/// Handle to an established MQTT connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self` except
/// `disconnect`, which consumes the client and returns the preserved
/// session.
pub struct MqttClient {
    options: MqttOptions,
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<Packet>,
    state_rx: watch::Receiver<ConnectionState>,
    disconnect_rx: watch::Receiver<Option<DisconnectReason>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MqttClient {
    /// Connect with a fresh session.
    pub async fn connect<T: Transport>(transport: T, options: MqttOptions) -> MqttResult<Self> {
        Self::connect_with_session(transport, options, Session::default()).await
    }

    /// Connect and resume a session preserved by a previous `disconnect`.
    ///
    /// Pending QoS 1 publishes are resent with the DUP flag and their
    /// original packet ids, in enqueue order, as soon as the connection
    /// is up. Receipts taken before the disconnect resolve normally.
    pub async fn connect_with_session<T: Transport>(
        mut transport: T,
        options: MqttOptions,
        session: Session,
    ) -> MqttResult<Self> {
        let codec = Codec::new(options.max_packet_size);
        info!(client_id = %options.client_id, "connecting");
        let handshake = connection::handshake(&mut transport, &options, &codec).await?;

        let retry = RetryConfig {
            max_retries: options.max_retries,
            initial_backoff: options.retry_initial_backoff,
            max_backoff: options.retry_max_backoff,
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (disconnect_tx, disconnect_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            codec,
            tracker: PublishTracker::with_session(retry, session),
            registry: SubscriptionRegistry::new(),
            pending_control: Mutex::new(HashMap::new()),
            last_read: Mutex::new(Instant::now()),
            last_write: Mutex::new(Instant::now()),
            state_tx,
            disconnect_tx,
            torn_down: AtomicBool::new(false),
        });

        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (read_half, write_half) = tokio::io::split(transport);

        let mut tasks = Vec::with_capacity(5);
        tasks.push(tokio::spawn(writer_task(
            write_half,
            writer_rx,
            shutdown_rx.clone(),
            Arc::clone(&shared),
            fatal_tx.clone(),
        )));
        tasks.push(tokio::spawn(read_loop(
            read_half,
            handshake.leftover,
            shutdown_rx.clone(),
            Arc::clone(&shared),
            writer_tx.clone(),
            fatal_tx.clone(),
        )));
        tasks.push(tokio::spawn(keep_alive_task(
            KeepAliveSchedule::new(options.keep_alive),
            shutdown_rx.clone(),
            Arc::clone(&shared),
            writer_tx.clone(),
            fatal_tx.clone(),
        )));
        tasks.push(tokio::spawn(retry_task(
            shutdown_rx.clone(),
            Arc::clone(&shared),
            writer_tx.clone(),
        )));
        tasks.push(tokio::spawn(supervisor_task(
            fatal_rx,
            shutdown_rx,
            shutdown_tx.clone(),
            Arc::clone(&shared),
            options.clean_session,
        )));

        // Session resends go out before any new publish.
        for entry in shared.tracker.pending_for_resend() {
            debug!(packet_id = entry.packet_id, "resending preserved publish");
            let packet = Packet::Publish(Publish {
                topic: entry.topic,
                payload: entry.payload,
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: true,
                packet_id: Some(entry.packet_id),
            });
            writer_tx
                .send(packet)
                .await
                .map_err(|_| MqttError::ConnectionClosed)?;
        }

        shared.state_tx.send_replace(ConnectionState::Connected);
        info!(
            client_id = %options.client_id,
            session_present = handshake.connack.session_present,
            "connected"
        );

        Ok(Self {
            options,
            shared,
            writer_tx,
            state_rx,
            disconnect_rx,
            shutdown_tx,
            tasks,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch channel that carries the reason once the connection ends
    pub fn disconnect_events(&self) -> watch::Receiver<Option<DisconnectReason>> {
        self.disconnect_rx.clone()
    }

    fn ensure_connected(&self) -> MqttResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(MqttError::ConnectionClosed),
        }
    }

    /// Publish a message.
    ///
    /// QoS 0 returns an already-resolved receipt once the packet is
    /// queued. QoS 1 returns a receipt that resolves on PUBACK or fails
    /// after the configured retransmissions.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> MqttResult<PublishReceipt> {
        self.ensure_connected()?;
        let payload = payload.into();
        match qos {
            QoS::AtMostOnce => {
                let packet = Packet::Publish(Publish {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain: false,
                    dup: false,
                    packet_id: None,
                });
                self.writer_tx
                    .send(packet)
                    .await
                    .map_err(|_| MqttError::ConnectionClosed)?;
                Ok(PublishReceipt::resolved())
            }
            QoS::AtLeastOnce => {
                let (packet_id, receipt) =
                    self.shared.tracker.register(topic.to_string(), payload.clone());
                let packet = Packet::Publish(Publish {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain: false,
                    dup: false,
                    packet_id: Some(packet_id),
                });
                self.writer_tx
                    .send(packet)
                    .await
                    .map_err(|_| MqttError::ConnectionClosed)?;
                trace!(packet_id, topic, "publish registered");
                Ok(receipt)
            }
        }
    }

    /// Subscribe to a topic filter and install `handler` for matching
    /// inbound messages. Resolves with the granted QoS once the broker
    /// acknowledges the filter.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> MqttResult<QoS> {
        crate::registry::validate_filter(filter)?;
        self.ensure_connected()?;

        let packet_id = self.shared.tracker.allocate_packet_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending_control
            .lock()
            .unwrap()
            .insert(packet_id, reply_tx);

        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![(filter.to_string(), qos)],
        });
        if self.writer_tx.send(packet).await.is_err() {
            self.shared.pending_control.lock().unwrap().remove(&packet_id);
            return Err(MqttError::ConnectionClosed);
        }

        let reply = tokio::time::timeout(self.options.ack_timeout, reply_rx).await;
        let return_codes = match reply {
            Err(_) => {
                self.shared.pending_control.lock().unwrap().remove(&packet_id);
                return Err(MqttError::ResponseTimeout {
                    operation: "subscribe",
                });
            }
            Ok(Err(_)) => return Err(MqttError::ConnectionClosed),
            Ok(Ok(result)) => result?,
        };

        let code = return_codes.first().copied().ok_or_else(|| {
            MqttError::MalformedPacket("SUBACK without return codes".to_string())
        })?;
        if code >= SUBACK_FAILURE {
            return Err(MqttError::SubscribeRejected { reason_code: code });
        }
        let granted = QoS::try_from(code)?;
        self.shared
            .registry
            .insert(filter.to_string(), granted, handler);
        debug!(filter, granted = code, "subscription installed");
        Ok(granted)
    }

    /// Remove a subscription. Unknown filters are a no-op; for known
    /// filters the local mapping is removed immediately and UNSUBSCRIBE
    /// is sent best-effort without waiting for UNSUBACK.
    pub async fn unsubscribe(&self, filter: &str) -> MqttResult<()> {
        self.ensure_connected()?;
        if !self.shared.registry.remove(filter) {
            return Ok(());
        }
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id: self.shared.tracker.allocate_packet_id(),
            filters: vec![filter.to_string()],
        });
        let _ = self.writer_tx.send(packet).await;
        debug!(filter, "subscription removed");
        Ok(())
    }

    /// Gracefully close the connection.
    ///
    /// Sends DISCONNECT best-effort, stops every task and always reaches
    /// the Disconnected state. Returns the preserved session; it is empty
    /// when clean-session is on.
    pub async fn disconnect(mut self) -> Session {
        debug!(client_id = %self.options.client_id, "disconnecting");
        let _ = self.writer_tx.send(Packet::Disconnect).await;
        let _ = self.shutdown_tx.send(true);

        for mut task in std::mem::take(&mut self.tasks) {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("task did not stop in time, aborting");
                task.abort();
            }
        }

        self.shared
            .tear_down(DisconnectReason::ClientRequested, self.options.clean_session);
        self.shared.tracker.take_session()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Owns the write half; every outbound packet flows through here.
async fn writer_task<W: tokio::io::AsyncWrite + Send + Unpin + 'static>(
    mut write_half: W,
    mut writer_rx: mpsc::Receiver<Packet>,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    fatal_tx: mpsc::Sender<DisconnectReason>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    // Flush anything already queued, e.g. the final DISCONNECT.
                    while let Ok(packet) = writer_rx.try_recv() {
                        let _ = write_packet(&mut write_half, &shared, &mut buf, &packet).await;
                    }
                    break;
                }
            }
            received = writer_rx.recv() => {
                let Some(packet) = received else { break };
                if let Err(error) = write_packet(&mut write_half, &shared, &mut buf, &packet).await {
                    let _ = fatal_tx
                        .send(DisconnectReason::TransportLost(error.to_string()))
                        .await;
                    break;
                }
            }
        }
    }
    trace!("writer task stopped");
}

async fn write_packet<W: tokio::io::AsyncWrite + Unpin>(
    write_half: &mut W,
    shared: &Shared,
    buf: &mut BytesMut,
    packet: &Packet,
) -> std::io::Result<()> {
    buf.clear();
    if let Err(error) = shared.codec.encode(packet, buf) {
        // Encode failures are caller bugs, not transport faults.
        warn!(%error, "dropping unencodable packet");
        return Ok(());
    }
    write_half.write_all(buf).await?;
    write_half.flush().await?;
    shared.stamp_write();
    Ok(())
}

/// Owns the read half; decodes and routes every inbound packet.
async fn read_loop<R: tokio::io::AsyncRead + Send + Unpin + 'static>(
    mut read_half: R,
    leftover: BytesMut,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<Packet>,
    fatal_tx: mpsc::Sender<DisconnectReason>,
) {
    let mut buf = leftover;
    loop {
        loop {
            match shared.codec.decode(&mut buf) {
                Ok(Some(packet)) => {
                    if !route_inbound(&shared, &writer_tx, &fatal_tx, packet).await {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let detail = match error {
                        MqttError::MalformedPacket(detail) => detail,
                        other => other.to_string(),
                    };
                    let _ = fatal_tx
                        .send(DisconnectReason::MalformedPacket(detail))
                        .await;
                    return;
                }
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            result = read_half.read_buf(&mut buf) => match result {
                Ok(0) => {
                    let _ = fatal_tx
                        .send(DisconnectReason::TransportLost(
                            "connection closed by peer".to_string(),
                        ))
                        .await;
                    return;
                }
                Ok(_) => shared.stamp_read(),
                Err(error) => {
                    let _ = fatal_tx
                        .send(DisconnectReason::TransportLost(error.to_string()))
                        .await;
                    return;
                }
            }
        }
    }
}

/// Route one decoded packet. Returns false when the read loop must stop.
async fn route_inbound(
    shared: &Shared,
    writer_tx: &mpsc::Sender<Packet>,
    fatal_tx: &mpsc::Sender<DisconnectReason>,
    packet: Packet,
) -> bool {
    match packet {
        Packet::PubAck { packet_id } => {
            shared.tracker.acknowledge(packet_id);
        }
        Packet::SubAck(suback) => {
            let waiter = shared
                .pending_control
                .lock()
                .unwrap()
                .remove(&suback.packet_id);
            match waiter {
                Some(reply) => {
                    let _ = reply.send(Ok(suback.return_codes));
                }
                None => debug!(packet_id = suback.packet_id, "SUBACK for unknown packet id"),
            }
        }
        Packet::UnsubAck { packet_id } => {
            trace!(packet_id, "unsubscribe acknowledged");
        }
        Packet::Publish(publish) => {
            let message = InboundMessage {
                topic: publish.topic,
                payload: publish.payload,
                qos: publish.qos,
                retain: publish.retain,
            };
            shared.registry.dispatch(&message);
            // The ack must follow handler completion for QoS 1.
            if let Some(packet_id) = publish.packet_id {
                if writer_tx.send(Packet::PubAck { packet_id }).await.is_err() {
                    return false;
                }
            }
        }
        Packet::PingResp => {
            trace!("ping acknowledged");
        }
        Packet::Disconnect => {
            let _ = fatal_tx.send(DisconnectReason::ServerDisconnect).await;
            return false;
        }
        other => {
            warn!(?other, "unexpected packet from broker, ignoring");
        }
    }
    true
}

/// Sends PINGREQ on write-idle links and declares loss after prolonged
/// broker silence.
async fn keep_alive_task(
    schedule: KeepAliveSchedule,
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<Packet>,
    fatal_tx: mpsc::Sender<DisconnectReason>,
) {
    if !schedule.enabled() {
        return;
    }
    let mut ticker = tokio::time::interval(schedule.ping_interval());
    ticker.tick().await; // first tick completes immediately
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let since_read = shared.last_read.lock().unwrap().elapsed();
                if schedule.is_lost(since_read) {
                    warn!(silent_for = ?since_read, "keep-alive expired");
                    let _ = fatal_tx.send(DisconnectReason::KeepAliveTimeout).await;
                    return;
                }
                let since_write = shared.last_write.lock().unwrap().elapsed();
                if schedule.needs_ping(since_write) {
                    trace!("sending ping");
                    if writer_tx.send(Packet::PingReq).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Drives the tracker's retransmission deadlines.
async fn retry_task(
    mut shutdown_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<Packet>,
) {
    loop {
        let deadline = shared.tracker.next_deadline();
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = shared.tracker.changed() => {}
            _ = sleep_until_or_forever(deadline) => {
                for entry in shared.tracker.due_retransmissions(Instant::now()) {
                    debug!(packet_id = entry.packet_id, "retransmitting publish");
                    let packet = Packet::Publish(Publish {
                        topic: entry.topic,
                        payload: entry.payload,
                        qos: QoS::AtLeastOnce,
                        retain: false,
                        dup: true,
                        packet_id: Some(entry.packet_id),
                    });
                    if writer_tx.send(packet).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Waits for the first fatal reason and performs the single teardown.
async fn supervisor_task(
    mut fatal_rx: mpsc::Receiver<DisconnectReason>,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    shared: Arc<Shared>,
    clean_session: bool,
) {
    let reason = tokio::select! {
        _ = shutdown_rx.changed() => return,
        received = fatal_rx.recv() => match received {
            Some(reason) => reason,
            None => return,
        }
    };

    info!(%reason, "connection lost, tearing down");
    let _ = shutdown_tx.send(true);
    shared.tear_down(reason, clean_session);
}
