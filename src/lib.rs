//! Embeddable MQTT 3.1.1 publish/subscribe client core
//!
//! The crate is organized around five pieces:
//!
//! - [`codec`]: encode/decode for the MQTT control packets a client needs
//! - [`connection`]: options, lifecycle state and the CONNECT handshake
//! - [`tracker`]: QoS 1 acknowledgment tracking with retransmission
//! - [`registry`]: subscriptions, wildcard matching and handler dispatch
//! - [`client`]: the facade composing them over any async byte stream
//!
//! The transport is caller-supplied: anything implementing
//! [`transport::Transport`] works, from `tokio::io::duplex` in tests to
//! the mutual-TLS stream opened by [`transport::connect_tls`]. The core
//! never reconnects on its own; when the connection ends, the reason is
//! published on the client's disconnect watch channel and policy stays
//! with the caller.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mqttcore::{MqttClient, MqttOptions, QoS};
//!
//! # async fn run(transport: tokio::net::TcpStream) -> mqttcore::MqttResult<()> {
//! let options = MqttOptions::new("client1").clean_session(true);
//! let client = MqttClient::connect(transport, options).await?;
//!
//! client
//!     .subscribe("sensors/+/temperature", QoS::AtLeastOnce, Arc::new(|message| {
//!         println!("{}: {} bytes", message.topic, message.payload.len());
//!     }))
//!     .await?;
//!
//! let receipt = client.publish("sensors/kitchen/temperature", "21.5", QoS::AtLeastOnce).await?;
//! receipt.wait().await?;
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod registry;
pub mod tracker;
pub mod transport;

pub use client::MqttClient;
pub use codec::{Packet, QoS};
pub use connection::{ConnectionState, MqttOptions};
pub use error::{DisconnectReason, MqttError, MqttResult, PublishFailure};
pub use registry::{InboundMessage, MessageHandler};
pub use tracker::{PublishReceipt, Session};
pub use transport::{connect_tls, TlsSettings, Transport};
