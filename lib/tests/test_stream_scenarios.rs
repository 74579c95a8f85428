//! End-to-end fixtures through the router and both codecs, using the byte
//! sequences observed on the reference meters.

use ivygate::bcd;
use ivygate::dlms::apdu::{extract_telemetry, Apdu, GetResult};
use ivygate::dlt645::codec::{self, response_code};
use ivygate::dlt645::frame::append_checksum;
use ivygate::dlt645::registers;
use ivygate::heartbeat::HEARTBEAT_SIGNATURE;
use ivygate::router::{ProtocolRouter, ProtocolType, RouterEvent};
use ivygate::telemetry::ReadingValue;

fn meter_reply(address: &str, control: u8, plain_payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x68];
    frame.extend(bcd::address_to_buffer(address).unwrap());
    frame.push(0x68);
    frame.push(control);
    frame.push(plain_payload.len() as u8);
    frame.extend(bcd::apply_offset(plain_payload));
    append_checksum(&mut frame);
    frame
}

fn heartbeat(address: &str) -> Vec<u8> {
    let mut frame = HEARTBEAT_SIGNATURE.to_vec();
    frame.extend(address.as_bytes());
    frame.extend([0x00, 0x12, 0x34]);
    frame
}

#[test]
fn test_read_total_energy() {
    // request: total active energy from meter 000012345678
    let request = codec::build_read_frame("000012345678", 0x0000_0000).unwrap();
    assert_eq!(request[8], 0x11);

    // the meter replies with data id + BCD 12345678 (two implied decimals)
    let reply = meter_reply(
        "000012345678",
        response_code(0x11),
        &[0x00, 0x00, 0x00, 0x00, 0x78, 0x56, 0x34, 0x12],
    );

    let mut router = ProtocolRouter::default();
    let events = router.push(&reply);
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        RouterEvent::ProtocolDetected(ProtocolType::Dlt645)
    );
    let RouterEvent::Dlt645Frame(frame) = &events[1] else {
        panic!("expected a DL/T 645 frame");
    };
    assert!(!frame.is_error());

    let spec = registers::lookup(0x0000_0000);
    let response = codec::parse_read_response(frame, spec).unwrap();
    assert_eq!(response.data_id, 0x0000_0000);
    assert_eq!(response.value, ReadingValue::Number(123456.78));
    assert_eq!(response.unit, Some("kWh"));
}

#[test]
fn test_heartbeat_then_raw_event_notification() {
    let mut stream = heartbeat("311501114070");
    stream.extend([
        0xc2, 0x00, 0x03, 0x01, 0x00, 0x01, 0x08, 0x00, 0xff, 0x02, 0x06, 0x00, 0x00, 0x27, 0x10,
    ]);

    let mut router = ProtocolRouter::default();
    let events = router.push(&stream);
    assert_eq!(events.len(), 3);

    let RouterEvent::Heartbeat(parsed) = &events[1] else {
        panic!("expected heartbeat first");
    };
    assert_eq!(parsed.address, "311501114070");

    let RouterEvent::DlmsApdu { apdu, .. } = &events[2] else {
        panic!("expected APDU");
    };
    let telemetry = extract_telemetry(apdu, None).unwrap();
    let reading = &telemetry.readings["TOTAL_ACTIVE_IMPORT"];
    assert_eq!(reading.value, ReadingValue::Number(10000.0));
    assert_eq!(reading.unit, Some("kWh"));
}

#[test]
fn test_wrapped_get_response_error() {
    let stream = [
        0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x05, 0xc4, 0x01, 0x05, 0x01, 0x04,
    ];
    let mut router = ProtocolRouter::default();
    let events = router.push(&stream);
    assert_eq!(events.len(), 2);
    let RouterEvent::DlmsApdu { apdu, .. } = &events[1] else {
        panic!("expected APDU");
    };
    let Apdu::GetResponse { invoke_id, result } = apdu else {
        panic!("expected GET.response");
    };
    assert_eq!(*invoke_id, 5);
    assert_eq!(
        *result,
        GetResult::Error {
            code: 4,
            name: "object-undefined"
        }
    );
    assert!(extract_telemetry(apdu, None).is_none());
}

#[test]
fn test_two_concatenated_raw_apdus() {
    let stream = [
        0xc2, 0x00, 0x03, 0x01, 0x00, 0x20, 0x07, 0x00, 0xff, 0x02, 0x12, 0x00, 0xe6, 0xc2, 0x00,
        0x03, 0x01, 0x00, 0x1f, 0x07, 0x00, 0xff, 0x02, 0x12, 0x00, 0x0a,
    ];
    let mut router = ProtocolRouter::default();
    let events = router.push(&stream);
    assert_eq!(events.len(), 3);

    let RouterEvent::DlmsApdu { apdu: first, .. } = &events[1] else {
        panic!("expected APDU");
    };
    let telemetry = extract_telemetry(first, None).unwrap();
    let reading = &telemetry.readings["PHASE_A_VOLTAGE"];
    assert_eq!(reading.value, ReadingValue::Number(230.0));
    assert_eq!(reading.unit, Some("V"));
    let Apdu::EventNotification(event) = first else {
        panic!("expected EventNotification");
    };
    assert_eq!(event.obis.to_string(), "1-0:32.7.0.255");

    let RouterEvent::DlmsApdu { apdu: second, .. } = &events[2] else {
        panic!("expected APDU");
    };
    let telemetry = extract_telemetry(second, None).unwrap();
    let reading = &telemetry.readings["PHASE_A_CURRENT"];
    assert_eq!(reading.value, ReadingValue::Number(10.0));
    assert_eq!(reading.unit, Some("A"));
    let Apdu::EventNotification(event) = second else {
        panic!("expected EventNotification");
    };
    assert_eq!(event.obis.to_string(), "1-0:31.7.0.255");
}

#[test]
fn test_arbitrary_chunking_is_transparent() {
    let mut stream = heartbeat("311501114070");
    stream.extend([
        0xc2, 0x00, 0x03, 0x01, 0x00, 0x20, 0x07, 0x00, 0xff, 0x02, 0x12, 0x00, 0xe6,
    ]);
    stream.extend([
        0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x05, 0xc4, 0x01, 0x05, 0x01, 0x04,
    ]);
    for chunk_size in 1..=stream.len() {
        let mut router = ProtocolRouter::default();
        let mut events = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            events.extend(router.push(chunk));
        }
        assert_eq!(events.len(), 4, "chunk size {chunk_size}");
        assert!(matches!(events[1], RouterEvent::Heartbeat(_)));
        assert!(matches!(
            events[2],
            RouterEvent::DlmsApdu {
                apdu: Apdu::EventNotification(_),
                ..
            }
        ));
        assert!(matches!(
            events[3],
            RouterEvent::DlmsApdu {
                apdu: Apdu::GetResponse { .. },
                ..
            }
        ));
    }
}
