//! MQTT 3.1.1 control-packet codec
//!
//! Encodes and decodes the control packets a client needs: CONNECT/CONNACK,
//! PUBLISH/PUBACK, SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK, PINGREQ/PINGRESP
//! and DISCONNECT. Decoding works against a growable byte buffer: a packet
//! that is not yet complete yields `Ok(None)` so the caller can read more
//! bytes and retry. A declared remaining-length above the configured
//! maximum is rejected before any allocation happens, so a corrupt or
//! hostile stream cannot grow memory without bound.
//!
//! Packet identifiers and string lengths are fixed-width big-endian u16;
//! the remaining length uses the standard 7-bits-per-byte continuation
//! encoding capped at 4 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MqttError, MqttResult};

/// Upper bound for a single packet's remaining length (256 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Quality of Service levels supported by this client.
///
/// QoS 2 (exactly once) is out of scope and is rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Err(MqttError::MalformedPacket(
                "QoS 2 is not supported".to_string(),
            )),
            other => Err(MqttError::MalformedPacket(format!("invalid QoS: {other}"))),
        }
    }
}

/// CONNACK return code for a successful connection.
pub const CONNECT_ACCEPTED: u8 = 0x00;

/// SUBACK return codes at or above this value signal a rejected filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// An MQTT control packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present exactly when `qos` is `AtLeastOnce`.
    pub packet_id: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// Stateless packet codec with a configurable size ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_packet_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl Codec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Append the wire form of `packet` to `dst`.
    pub fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> MqttResult<()> {
        let (first_byte, body) = match packet {
            Packet::Connect(connect) => (0x10, encode_connect(connect)?),
            Packet::ConnAck(connack) => {
                let mut body = BytesMut::with_capacity(2);
                body.put_u8(u8::from(connack.session_present));
                body.put_u8(connack.return_code);
                (0x20, body)
            }
            Packet::Publish(publish) => {
                let mut flags = (publish.qos as u8) << 1;
                if publish.retain {
                    flags |= 0x01;
                }
                if publish.dup {
                    flags |= 0x08;
                }
                (0x30 | flags, encode_publish(publish)?)
            }
            Packet::PubAck { packet_id } => (0x40, encode_packet_id(*packet_id)),
            Packet::Subscribe(subscribe) => (0x82, encode_subscribe(subscribe)?),
            Packet::SubAck(suback) => {
                let mut body = BytesMut::with_capacity(2 + suback.return_codes.len());
                body.put_u16(suback.packet_id);
                body.put_slice(&suback.return_codes);
                (0x90, body)
            }
            Packet::Unsubscribe(unsubscribe) => (0xA2, encode_unsubscribe(unsubscribe)?),
            Packet::UnsubAck { packet_id } => (0xB0, encode_packet_id(*packet_id)),
            Packet::PingReq => (0xC0, BytesMut::new()),
            Packet::PingResp => (0xD0, BytesMut::new()),
            Packet::Disconnect => (0xE0, BytesMut::new()),
        };

        if body.len() > self.max_packet_size {
            return Err(MqttError::MalformedPacket(format!(
                "packet of {} bytes exceeds maximum of {}",
                body.len(),
                self.max_packet_size
            )));
        }

        dst.put_u8(first_byte);
        write_remaining_length(dst, body.len())?;
        dst.put_slice(&body);
        Ok(())
    }

    /// Try to decode one packet from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete packet;
    /// the consumed bytes are only removed once a whole packet is present.
    pub fn decode(&self, src: &mut BytesMut) -> MqttResult<Option<Packet>> {
        if src.is_empty() {
            return Ok(None);
        }
        let first = src[0];

        // Remaining length: up to 4 continuation bytes after the type byte.
        let mut remaining: usize = 0;
        let mut shift = 0u32;
        let mut len_bytes = 0usize;
        loop {
            let Some(&byte) = src.get(1 + len_bytes) else {
                return Ok(None);
            };
            len_bytes += 1;
            if len_bytes > 4 {
                return Err(MqttError::MalformedPacket(
                    "remaining length exceeds 4 bytes".to_string(),
                ));
            }
            remaining |= ((byte & 0x7F) as usize) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }

        if remaining > self.max_packet_size {
            return Err(MqttError::MalformedPacket(format!(
                "declared length {} exceeds maximum of {}",
                remaining, self.max_packet_size
            )));
        }

        let header_len = 1 + len_bytes;
        if src.len() < header_len + remaining {
            return Ok(None);
        }

        src.advance(header_len);
        let mut body = src.split_to(remaining).freeze();

        let packet_type = first >> 4;
        let flags = first & 0x0F;
        let packet = match packet_type {
            1 => Packet::Connect(decode_connect(&mut body)?),
            2 => Packet::ConnAck(decode_connack(&mut body)?),
            3 => Packet::Publish(decode_publish(flags, &mut body)?),
            4 => Packet::PubAck {
                packet_id: read_u16(&mut body)?,
            },
            8 => Packet::Subscribe(decode_subscribe(&mut body)?),
            9 => Packet::SubAck(decode_suback(&mut body)?),
            10 => Packet::Unsubscribe(decode_unsubscribe(&mut body)?),
            11 => Packet::UnsubAck {
                packet_id: read_u16(&mut body)?,
            },
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => Packet::Disconnect,
            other => {
                return Err(MqttError::MalformedPacket(format!(
                    "unknown packet type {other}"
                )));
            }
        };
        Ok(Some(packet))
    }
}

fn encode_packet_id(packet_id: u16) -> BytesMut {
    let mut body = BytesMut::with_capacity(2);
    body.put_u16(packet_id);
    body
}

fn encode_connect(connect: &Connect) -> MqttResult<BytesMut> {
    let mut body = BytesMut::new();
    write_string(&mut body, "MQTT")?;
    body.put_u8(4); // protocol level for 3.1.1

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive_secs);
    write_string(&mut body, &connect.client_id)?;
    if let Some(username) = &connect.username {
        write_string(&mut body, username)?;
    }
    if let Some(password) = &connect.password {
        write_string(&mut body, password)?;
    }
    Ok(body)
}

fn decode_connect(body: &mut Bytes) -> MqttResult<Connect> {
    let protocol = read_string(body)?;
    if protocol != "MQTT" {
        return Err(MqttError::MalformedPacket(format!(
            "unexpected protocol name {protocol:?}"
        )));
    }
    let level = read_u8(body)?;
    if level != 4 {
        return Err(MqttError::MalformedPacket(format!(
            "unsupported protocol level {level}"
        )));
    }
    let flags = read_u8(body)?;
    let keep_alive_secs = read_u16(body)?;
    let client_id = read_string(body)?;
    let username = if flags & 0x80 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    Ok(Connect {
        client_id,
        keep_alive_secs,
        clean_session: flags & 0x02 != 0,
        username,
        password,
    })
}

fn decode_connack(body: &mut Bytes) -> MqttResult<ConnAck> {
    let acknowledge_flags = read_u8(body)?;
    let return_code = read_u8(body)?;
    Ok(ConnAck {
        session_present: acknowledge_flags & 0x01 != 0,
        return_code,
    })
}

fn encode_publish(publish: &Publish) -> MqttResult<BytesMut> {
    let mut body = BytesMut::with_capacity(2 + publish.topic.len() + 2 + publish.payload.len());
    write_string(&mut body, &publish.topic)?;
    if publish.qos != QoS::AtMostOnce {
        let packet_id = publish.packet_id.ok_or_else(|| {
            MqttError::MalformedPacket("QoS 1 publish without packet identifier".to_string())
        })?;
        body.put_u16(packet_id);
    }
    body.put_slice(&publish.payload);
    Ok(body)
}

fn decode_publish(flags: u8, body: &mut Bytes) -> MqttResult<Publish> {
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let topic = read_string(body)?;
    let packet_id = if qos != QoS::AtMostOnce {
        Some(read_u16(body)?)
    } else {
        None
    };
    Ok(Publish {
        topic,
        payload: body.split_off(0),
        qos,
        retain: flags & 0x01 != 0,
        dup: flags & 0x08 != 0,
        packet_id,
    })
}

fn encode_subscribe(subscribe: &Subscribe) -> MqttResult<BytesMut> {
    if subscribe.filters.is_empty() {
        return Err(MqttError::MalformedPacket(
            "SUBSCRIBE without filters".to_string(),
        ));
    }
    let mut body = BytesMut::new();
    body.put_u16(subscribe.packet_id);
    for (filter, qos) in &subscribe.filters {
        write_string(&mut body, filter)?;
        body.put_u8(*qos as u8);
    }
    Ok(body)
}

fn decode_subscribe(body: &mut Bytes) -> MqttResult<Subscribe> {
    let packet_id = read_u16(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        let filter = read_string(body)?;
        let qos = QoS::try_from(read_u8(body)?)?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(MqttError::MalformedPacket(
            "SUBSCRIBE without filters".to_string(),
        ));
    }
    Ok(Subscribe { packet_id, filters })
}

fn decode_suback(body: &mut Bytes) -> MqttResult<SubAck> {
    let packet_id = read_u16(body)?;
    if !body.has_remaining() {
        return Err(MqttError::MalformedPacket(
            "SUBACK without return codes".to_string(),
        ));
    }
    Ok(SubAck {
        packet_id,
        return_codes: body.split_off(0).to_vec(),
    })
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe) -> MqttResult<BytesMut> {
    if unsubscribe.filters.is_empty() {
        return Err(MqttError::MalformedPacket(
            "UNSUBSCRIBE without filters".to_string(),
        ));
    }
    let mut body = BytesMut::new();
    body.put_u16(unsubscribe.packet_id);
    for filter in &unsubscribe.filters {
        write_string(&mut body, filter)?;
    }
    Ok(body)
}

fn decode_unsubscribe(body: &mut Bytes) -> MqttResult<Unsubscribe> {
    let packet_id = read_u16(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        filters.push(read_string(body)?);
    }
    if filters.is_empty() {
        return Err(MqttError::MalformedPacket(
            "UNSUBSCRIBE without filters".to_string(),
        ));
    }
    Ok(Unsubscribe { packet_id, filters })
}

fn write_remaining_length(dst: &mut BytesMut, mut len: usize) -> MqttResult<()> {
    if len >= 268_435_456 {
        return Err(MqttError::MalformedPacket(
            "remaining length does not fit in 4 bytes".to_string(),
        ));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn read_u8(buf: &mut Bytes) -> MqttResult<u8> {
    if !buf.has_remaining() {
        return Err(MqttError::MalformedPacket("truncated packet".to_string()));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> MqttResult<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket("truncated packet".to_string()));
    }
    Ok(buf.get_u16())
}

fn read_string(buf: &mut Bytes) -> MqttResult<String> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket("truncated string".to_string()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| MqttError::MalformedPacket("string is not valid UTF-8".to_string()))
}

fn write_string(dst: &mut BytesMut, value: &str) -> MqttResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        MqttError::MalformedPacket("string longer than 65535 bytes".to_string())
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(packet: Packet) {
        let codec = Codec::default();
        let mut buf = BytesMut::new();
        codec.encode(&packet, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().expect("complete packet");
        assert_eq!(decoded, packet);
        assert!(buf.is_empty(), "decode should consume the whole packet");
    }

    #[test]
    fn test_roundtrip_connect() {
        roundtrip(Packet::Connect(Connect {
            client_id: "client1-session1".to_string(),
            keep_alive_secs: 60,
            clean_session: true,
            username: Some("client1-authnID".to_string()),
            password: Some(String::new()),
        }));
        roundtrip(Packet::Connect(Connect {
            client_id: "bare".to_string(),
            keep_alive_secs: 0,
            clean_session: false,
            username: None,
            password: None,
        }));
    }

    #[test]
    fn test_roundtrip_connack() {
        roundtrip(Packet::ConnAck(ConnAck {
            session_present: true,
            return_code: CONNECT_ACCEPTED,
        }));
        roundtrip(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: 5,
        }));
    }

    #[test]
    fn test_roundtrip_publish_qos0() {
        roundtrip(Packet::Publish(Publish {
            topic: "contosotopics/topic1".to_string(),
            payload: Bytes::from_static(b"hello world"),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
        }));
    }

    #[test]
    fn test_roundtrip_publish_qos1_with_flags() {
        roundtrip(Packet::Publish(Publish {
            topic: "t".to_string(),
            payload: Bytes::from_static(b"hello"),
            qos: QoS::AtLeastOnce,
            retain: true,
            dup: true,
            packet_id: Some(42),
        }));
    }

    #[test]
    fn test_roundtrip_acks_and_pings() {
        roundtrip(Packet::PubAck { packet_id: 7 });
        roundtrip(Packet::UnsubAck { packet_id: 9 });
        roundtrip(Packet::PingReq);
        roundtrip(Packet::PingResp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn test_roundtrip_subscribe_suback() {
        roundtrip(Packet::Subscribe(Subscribe {
            packet_id: 3,
            filters: vec![
                ("a/+/c".to_string(), QoS::AtLeastOnce),
                ("a/#".to_string(), QoS::AtMostOnce),
            ],
        }));
        roundtrip(Packet::SubAck(SubAck {
            packet_id: 3,
            return_codes: vec![0x01, 0x00],
        }));
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 4,
            filters: vec!["a/#".to_string()],
        }));
    }

    #[test]
    fn test_incomplete_input_yields_none() {
        let codec = Codec::default();
        let mut full = BytesMut::new();
        codec
            .encode(
                &Packet::Publish(Publish {
                    topic: "t".to_string(),
                    payload: Bytes::from_static(b"payload"),
                    qos: QoS::AtMostOnce,
                    retain: false,
                    dup: false,
                    packet_id: None,
                }),
                &mut full,
            )
            .unwrap();

        // Feed the packet one byte at a time; only the final byte completes it.
        let mut partial = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let result = codec.decode(&mut partial).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none(), "byte {i} should not complete the packet");
            } else {
                assert!(result.is_some());
            }
        }
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let codec = Codec::default();
        let mut buf = BytesMut::new();
        codec.encode(&Packet::PingReq, &mut buf).unwrap();
        codec.encode(&Packet::PubAck { packet_id: 1 }, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingReq));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::PubAck { packet_id: 1 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_declared_length_is_malformed() {
        let codec = Codec::new(1024);
        // PUBLISH header declaring 16384 bytes of body.
        let mut buf = BytesMut::from(&[0x30, 0x80, 0x80, 0x01][..]);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_remaining_length_over_four_bytes_is_malformed() {
        let codec = Codec::default();
        let mut buf = BytesMut::from(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F][..]);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_unknown_packet_type_is_malformed() {
        let codec = Codec::default();
        let mut buf = BytesMut::from(&[0xF0, 0x00][..]);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_qos2_publish_is_rejected() {
        let codec = Codec::default();
        // PUBLISH with QoS bits set to 2, minimal body.
        let mut buf = BytesMut::from(&[0x34, 0x05, 0x00, 0x01, b't', 0x00, 0x01][..]);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_truncated_connack_body_is_malformed() {
        let codec = Codec::default();
        let mut buf = BytesMut::from(&[0x20, 0x01, 0x00][..]);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
    }

    #[test]
    fn test_invalid_utf8_topic_is_malformed() {
        let codec = Codec::default();
        // PUBLISH QoS 0 with a 2-byte topic that is not UTF-8.
        let mut buf = BytesMut::from(&[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28][..]);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MqttError::MalformedPacket(_))));
    }

    proptest! {
        #[test]
        fn prop_publish_roundtrip(
            topic in "[a-z0-9/]{1,40}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            retain in any::<bool>(),
            qos1 in any::<bool>(),
            packet_id in 1u16..,
        ) {
            let packet = Packet::Publish(Publish {
                topic,
                payload: Bytes::from(payload),
                qos: if qos1 { QoS::AtLeastOnce } else { QoS::AtMostOnce },
                retain,
                dup: false,
                packet_id: qos1.then_some(packet_id),
            });
            let codec = Codec::default();
            let mut buf = BytesMut::new();
            codec.encode(&packet, &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, packet);
        }
    }
}
