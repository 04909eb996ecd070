//! Connection options, lifecycle state and the CONNECT/CONNACK handshake
//!
//! The handshake runs on the raw transport before any background task
//! starts, so a rejected or timed-out connect never leaves tasks behind.
//! Keep-alive arithmetic lives here as pure functions so the timing rules
//! can be tested without a transport.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::codec::{Codec, ConnAck, Connect, Packet, CONNECT_ACCEPTED};
use crate::error::{MqttError, MqttResult};
use crate::transport::Transport;

/// Lifecycle state of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Options for a single client connection
#[derive(Debug, Clone)]
pub struct MqttOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// How long to wait for CONNACK before failing the connect
    pub connect_timeout: Duration,
    /// How long to wait for SUBACK before failing a subscribe
    pub ack_timeout: Duration,
    /// QoS 1 retransmissions before a publish fails
    pub max_retries: u32,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub max_packet_size: usize,
}

impl MqttOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_initial_backoff: Duration::from_secs(1),
            retry_max_backoff: Duration::from_secs(30),
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Client id with a random suffix, for when the caller does not care
    pub fn with_generated_id(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::new(format!("{prefix}-{}", &suffix[..8]))
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: Option<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn connect_packet(&self) -> Packet {
        Packet::Connect(Connect {
            client_id: self.client_id.clone(),
            keep_alive_secs: self.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            clean_session: self.clean_session,
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

/// Keep-alive timing rules for an established connection.
///
/// Pings go out at half the keep-alive interval when the link is
/// write-idle; the connection counts as lost once nothing has been read
/// for one and a half keep-alive intervals.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveSchedule {
    keep_alive: Duration,
}

impl KeepAliveSchedule {
    pub fn new(keep_alive: Duration) -> Self {
        Self { keep_alive }
    }

    /// Keep-alive 0 disables pings and loss detection per the protocol.
    pub fn enabled(&self) -> bool {
        !self.keep_alive.is_zero()
    }

    pub fn ping_interval(&self) -> Duration {
        self.keep_alive / 2
    }

    pub fn loss_threshold(&self) -> Duration {
        self.keep_alive * 3 / 2
    }

    /// Whether the broker has been silent long enough to declare loss
    pub fn is_lost(&self, since_last_read: Duration) -> bool {
        self.enabled() && since_last_read >= self.loss_threshold()
    }

    /// Whether the link has been write-idle long enough to need a ping
    pub fn needs_ping(&self, since_last_write: Duration) -> bool {
        self.enabled() && since_last_write >= self.ping_interval()
    }
}

/// Outcome of a successful handshake: the broker's CONNACK plus any bytes
/// read past it, which the read loop must consume first.
pub struct Handshake {
    pub connack: ConnAck,
    pub leftover: BytesMut,
}

/// Run the CONNECT/CONNACK exchange on a freshly opened transport.
pub async fn handshake<T: Transport>(
    transport: &mut T,
    options: &MqttOptions,
    codec: &Codec,
) -> MqttResult<Handshake> {
    let mut out = BytesMut::new();
    codec.encode(&options.connect_packet(), &mut out)?;

    let exchange = async {
        transport
            .write_all(&out)
            .await
            .map_err(|e| MqttError::TransportLost(e.to_string()))?;
        transport
            .flush()
            .await
            .map_err(|e| MqttError::TransportLost(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if let Some(packet) = codec.decode(&mut buf)? {
                return match packet {
                    Packet::ConnAck(connack) => Ok((connack, buf)),
                    other => Err(MqttError::MalformedPacket(format!(
                        "expected CONNACK, got {other:?}"
                    ))),
                };
            }
            let n = transport
                .read_buf(&mut buf)
                .await
                .map_err(|e| MqttError::TransportLost(e.to_string()))?;
            if n == 0 {
                return Err(MqttError::TransportLost(
                    "connection closed during handshake".to_string(),
                ));
            }
        }
    };

    let (connack, leftover) = tokio::time::timeout(options.connect_timeout, exchange)
        .await
        .map_err(|_| MqttError::ConnectTimeout)??;

    if connack.return_code != CONNECT_ACCEPTED {
        return Err(MqttError::ConnectRejected {
            reason_code: connack.return_code,
        });
    }

    debug!(
        client_id = %options.client_id,
        session_present = connack.session_present,
        "connection accepted"
    );
    Ok(Handshake { connack, leftover })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_keep_alive_schedule_intervals() {
        let schedule = KeepAliveSchedule::new(Duration::from_secs(10));
        assert_eq!(schedule.ping_interval(), Duration::from_secs(5));
        assert_eq!(schedule.loss_threshold(), Duration::from_secs(15));
    }

    #[test]
    fn test_keep_alive_loss_boundary() {
        let schedule = KeepAliveSchedule::new(Duration::from_secs(10));
        assert!(!schedule.is_lost(Duration::from_secs(14)));
        assert!(schedule.is_lost(Duration::from_secs(15)));
        assert!(schedule.is_lost(Duration::from_secs(16)));
    }

    #[test]
    fn test_keep_alive_zero_disables_everything() {
        let schedule = KeepAliveSchedule::new(Duration::ZERO);
        assert!(!schedule.enabled());
        assert!(!schedule.is_lost(Duration::from_secs(3600)));
        assert!(!schedule.needs_ping(Duration::from_secs(3600)));
    }

    #[test]
    fn test_options_defaults() {
        let options = MqttOptions::new("client1");
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert!(options.clean_session);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_generated_id_has_prefix_and_suffix() {
        let options = MqttOptions::with_generated_id("sample");
        assert!(options.client_id.starts_with("sample-"));
        assert!(options.client_id.len() > "sample-".len());
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        // Arrange: a broker end that answers CONNECT with a clean CONNACK
        let (mut client_end, mut broker_end) = tokio::io::duplex(4096);
        let codec = Codec::default();
        let broker = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let broker_codec = Codec::default();
            let connect = loop {
                if let Some(packet) = broker_codec.decode(&mut buf).unwrap() {
                    break packet;
                }
                broker_end.read_buf(&mut buf).await.unwrap();
            };
            assert!(matches!(connect, Packet::Connect(_)));
            let mut out = BytesMut::new();
            broker_codec
                .encode(
                    &Packet::ConnAck(ConnAck {
                        session_present: false,
                        return_code: CONNECT_ACCEPTED,
                    }),
                    &mut out,
                )
                .unwrap();
            broker_end.write_all(&out).await.unwrap();
            broker_end
        });

        // Act
        let options = MqttOptions::new("client1");
        let result = handshake(&mut client_end, &options, &codec).await;

        // Assert
        let outcome = result.unwrap();
        assert!(!outcome.connack.session_present);
        assert!(outcome.leftover.is_empty());
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejected_surfaces_reason_code() {
        let (mut client_end, mut broker_end) = tokio::io::duplex(4096);
        let codec = Codec::default();
        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            let broker_codec = Codec::default();
            loop {
                if broker_codec.decode(&mut buf).unwrap().is_some() {
                    break;
                }
                broker_end.read_buf(&mut buf).await.unwrap();
            }
            let mut out = BytesMut::new();
            broker_codec
                .encode(
                    &Packet::ConnAck(ConnAck {
                        session_present: false,
                        return_code: 5,
                    }),
                    &mut out,
                )
                .unwrap();
            broker_end.write_all(&out).await.unwrap();
            // Hold the broker end open until the client is done.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let options = MqttOptions::new("client1");
        let result = handshake(&mut client_end, &options, &codec).await;

        assert!(matches!(
            result,
            Err(MqttError::ConnectRejected { reason_code: 5 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out_on_silence() {
        // Broker end never answers; keep it alive so reads pend instead of EOF.
        let (mut client_end, _broker_end) = tokio::io::duplex(4096);
        let codec = Codec::default();
        let options = MqttOptions::new("client1").connect_timeout(Duration::from_secs(10));

        let result = handshake(&mut client_end, &options, &codec).await;

        assert!(matches!(result, Err(MqttError::ConnectTimeout)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_connack_reply() {
        let (mut client_end, mut broker_end) = tokio::io::duplex(4096);
        let codec = Codec::default();
        tokio::spawn(async move {
            let mut out = BytesMut::new();
            Codec::default()
                .encode(&Packet::PingResp, &mut out)
                .unwrap();
            broker_end.write_all(&out).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let options = MqttOptions::new("client1");
        let result = handshake(&mut client_end, &options, &codec).await;

        assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
    }
}
