//! Client codec tests
//!
//! Outbound packets are checked byte for byte; inbound packets are decoded
//! from hand-assembled broker frames.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use crate::codec::{
    read_string, read_variable_int, write_binary, write_string, write_variable_int, Decoder, Encoder,
};
use crate::protocol::{
    Connect, DecodeError, Disconnect, EncodeError, Packet, Properties, PubAck, PubRel, Publish,
    QoS, ReasonCode, SubAck, Subscribe, Subscription, SubscriptionOptions,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// Outbound
// ============================================================================

#[test]
fn test_connect_persistent_session() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "c1".to_string(),
        clean_start: false,
        keep_alive: 60,
        properties: Properties {
            session_expiry_interval: Some(300),
            ..Default::default()
        },
        ..Default::default()
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[
            0x10, 20, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, // protocol name + level
            0x00, // flags: clean start off, no credentials
            0x00, 0x3C, // keep alive
            0x05, 0x11, 0x00, 0x00, 0x01, 0x2C, // session expiry 300
            0x00, 0x02, b'c', b'1',
        ][..]
    );
}

#[test]
fn test_connect_with_credentials_sets_flags() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "c".to_string(),
        clean_start: true,
        username: Some("u".to_string()),
        password: Some(Bytes::from_static(b"p")),
        ..Default::default()
    }));

    let encoded = encode_packet(&packet);
    // flags byte follows protocol name (6) and level (1)
    assert_eq!(encoded[2 + 7], 0x80 | 0x40 | 0x02);
    assert!(encoded.ends_with(&[0x00, 0x01, b'u', 0x00, 0x01, b'p']));
}

#[test]
fn test_subscribe_shared_filter() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 7,
        subscriptions: vec![Subscription {
            filter: "$share/g/t".to_string(),
            options: SubscriptionOptions::with_qos(QoS::ExactlyOnce),
        }],
        properties: Properties::default(),
    });

    let encoded = encode_packet(&packet);
    let mut expected = vec![0x82, 16, 0x00, 0x07, 0x00, 0x00, 0x0A];
    expected.extend_from_slice(b"$share/g/t");
    expected.push(0x02);
    assert_eq!(&encoded[..], &expected[..]);
}

#[test]
fn test_publish_qos1_with_message_expiry() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: Arc::from("t"),
        packet_id: Some(1),
        payload: Bytes::from_static(b"p#1"),
        properties: Properties {
            message_expiry_interval: Some(10),
            ..Default::default()
        },
        ..Default::default()
    });

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[
            0x32, 14, 0x00, 0x01, b't', 0x00, 0x01, 0x05, 0x02, 0x00, 0x00, 0x00, 0x0A, b'p',
            b'#', b'1',
        ][..]
    );
}

#[test_case(Packet::PubAck(PubAck::new(3)), &[0x40, 0x02, 0x00, 0x03] ; "puback")]
#[test_case(Packet::PubRel(PubRel::new(3)), &[0x62, 0x02, 0x00, 0x03] ; "pubrel")]
#[test_case(Packet::Disconnect(Disconnect::default()), &[0xE0, 0x00] ; "disconnect")]
#[test_case(Packet::PingReq, &[0xC0, 0x00] ; "pingreq")]
fn test_short_form_packets(packet: Packet, expected: &[u8]) {
    assert_eq!(&encode_packet(&packet)[..], expected);
}

#[test]
fn test_pubrec_with_error_reason_uses_long_form() {
    let packet = Packet::PubRec(crate::protocol::PubRec {
        packet_id: 9,
        reason_code: ReasonCode::QuotaExceeded,
        properties: Properties::default(),
    });
    assert_eq!(
        &encode_packet(&packet)[..],
        &[0x50, 0x04, 0x00, 0x09, 0x97, 0x00]
    );
}

#[test]
fn test_server_only_packet_is_not_encoded() {
    let mut buf = BytesMut::new();
    let err = Encoder::new()
        .encode(&Packet::PingResp, &mut buf)
        .unwrap_err();
    assert_eq!(err, EncodeError::UnsupportedPacket(13));
}

// ============================================================================
// Inbound
// ============================================================================

#[test]
fn test_connack_session_present_with_properties() {
    // session present, success, receive maximum 10
    let frame = [0x20, 0x06, 0x01, 0x00, 0x03, 0x21, 0x00, 0x0A];
    match decode_packet(&frame).unwrap() {
        Packet::ConnAck(ack) => {
            assert!(ack.session_present);
            assert_eq!(ack.reason_code, ReasonCode::Success);
            assert_eq!(ack.properties.receive_maximum, Some(10));
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

#[test]
fn test_connack_refused() {
    let frame = [0x20, 0x03, 0x00, 0x86, 0x00];
    match decode_packet(&frame).unwrap() {
        Packet::ConnAck(ack) => assert_eq!(ack.reason_code, ReasonCode::BadUserNameOrPassword),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

#[test]
fn test_suback_granted_qos() {
    let frame = [0x90, 0x04, 0x00, 0x07, 0x00, 0x01];
    assert_eq!(
        decode_packet(&frame).unwrap(),
        Packet::SubAck(SubAck {
            packet_id: 7,
            reason_codes: vec![ReasonCode::GrantedQoS1],
            properties: Properties::default(),
        })
    );
}

#[test]
fn test_publish_skips_unmodeled_properties() {
    // QoS 2 publish carrying a content type and a subscription identifier
    let mut frame = vec![0x34, 0];
    frame.extend_from_slice(&[0x00, 0x01, b't', 0x00, 0x2A]);
    let props = [0x03, 0x00, 0x01, b'x', 0x0B, 0x05];
    frame.push(props.len() as u8);
    frame.extend_from_slice(&props);
    frame.extend_from_slice(b"pub-0#4");
    frame[1] = (frame.len() - 2) as u8;

    match decode_packet(&frame).unwrap() {
        Packet::Publish(p) => {
            assert_eq!(p.qos, QoS::ExactlyOnce);
            assert_eq!(p.packet_id, Some(42));
            assert_eq!(&*p.topic, "t");
            assert_eq!(&p.payload[..], b"pub-0#4");
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_encoded_publish_decodes_back() {
    let publish = Publish {
        qos: QoS::ExactlyOnce,
        topic: Arc::from("verify/inflight"),
        packet_id: Some(513),
        payload: Bytes::from_static(b"pub-1#99@1700000000000000"),
        ..Default::default()
    };
    let encoded = encode_packet(&Packet::Publish(publish.clone()));
    assert_eq!(decode_packet(&encoded).unwrap(), Packet::Publish(publish));
}

#[test]
fn test_partial_frame_needs_more_data() {
    let frame = [0x90, 0x04, 0x00, 0x07, 0x00];
    assert_eq!(Decoder::new().decode(&frame).unwrap(), None);
    assert_eq!(Decoder::new().decode(&frame[..1]).unwrap(), None);
}

#[test]
fn test_two_frames_in_one_buffer() {
    let frames = [0x40, 0x02, 0x00, 0x01, 0xD0, 0x00];
    let decoder = Decoder::new();

    let (first, used) = decoder.decode(&frames).unwrap().unwrap();
    assert_eq!(first, Packet::PubAck(PubAck::new(1)));
    let (second, _) = decoder.decode(&frames[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::PingResp);
}

#[test]
fn test_disconnect_from_peer_with_reason_string() {
    let buf = [0xE0, 0x07, 0x8E, 0x05, 0x1F, 0x00, 0x02, b'b', b'y'];

    match decode_packet(&buf).unwrap() {
        Packet::Disconnect(d) => {
            assert_eq!(d.reason_code, ReasonCode::SessionTakenOver);
            assert_eq!(d.properties.reason_string.as_deref(), Some("by"));
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
}

#[test]
fn test_unknown_property_id_is_rejected() {
    let frame = [0x20, 0x05, 0x00, 0x00, 0x02, 0x7F, 0x00];
    assert_eq!(
        decode_packet(&frame).unwrap_err(),
        DecodeError::InvalidPropertyId(0x7F)
    );
}

#[test]
fn test_client_bound_packet_types_only() {
    // A SUBSCRIBE is never sent to a client
    let frame = [0x82, 0x02, 0x00, 0x01];
    assert_eq!(
        decode_packet(&frame).unwrap_err(),
        DecodeError::InvalidPacketType(8)
    );
}

#[test]
fn test_oversized_packet_is_rejected() {
    let decoder = Decoder::new().with_max_packet_size(4);
    let frame = [0x30, 0x05, 0x00, 0x01, b't', b'x', b'y'];
    assert_eq!(decoder.decode(&frame).unwrap_err(), DecodeError::PacketTooLarge);
}

// ============================================================================
// Primitives
// ============================================================================

#[test_case(0, &[0x00] ; "zero")]
#[test_case(127, &[0x7F] ; "one byte max")]
#[test_case(128, &[0x80, 0x01] ; "two byte min")]
#[test_case(16_383, &[0xFF, 0x7F] ; "two byte max")]
#[test_case(2_097_152, &[0x80, 0x80, 0x80, 0x01] ; "four byte min")]
#[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F] ; "four byte max")]
fn test_variable_int_boundaries(value: u32, wire: &[u8]) {
    let mut buf = BytesMut::new();
    assert_eq!(write_variable_int(&mut buf, value).unwrap(), wire.len());
    assert_eq!(&buf[..], wire);
    assert_eq!(read_variable_int(wire).unwrap(), (value, wire.len()));
}

#[test]
fn test_variable_int_errors() {
    assert_eq!(read_variable_int(&[0x80, 0x80]), Err(DecodeError::InsufficientData));
    assert_eq!(
        read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
    let mut buf = BytesMut::new();
    assert_eq!(
        write_variable_int(&mut buf, 268_435_456),
        Err(EncodeError::PacketTooLarge)
    );
}

#[test]
fn test_string_primitives() {
    assert_eq!(read_string(&[0x00, 0x02, b'o', b'k', 0xAA]).unwrap(), ("ok", 4));
    assert_eq!(read_string(&[0x00, 0x03, b'o']), Err(DecodeError::InsufficientData));
    assert_eq!(read_string(&[0x00, 0x01, 0xFF]), Err(DecodeError::InvalidUtf8));
    assert!(matches!(
        read_string(&[0x00, 0x01, 0x00]),
        Err(DecodeError::MalformedPacket(_))
    ));

    let mut buf = BytesMut::new();
    write_string(&mut buf, "t/1").unwrap();
    assert_eq!(&buf[..], &[0x00, 0x03, b't', b'/', b'1']);
    assert_eq!(
        write_binary(&mut buf, &vec![0u8; 65_536]),
        Err(EncodeError::StringTooLong)
    );
}
