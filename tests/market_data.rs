//! End-to-end exercise of the public API on a market-data template set.

use fastwire::{Decimal, Decoder, DynamicError, Encoder, Error, Field, Message, Value};

const TEMPLATES: &str = include_str!("templates.xml");

fn heartbeat(seq: u32, time: u64) -> Message {
    Message::new(1, vec![Field::scalar(seq), Field::scalar(time)])
}

fn entry(action: u32, entry_type: &str, symbol: &str, px: Decimal, size: Option<i32>) -> Vec<Field> {
    vec![
        Field::scalar(action),
        Field::ascii(entry_type),
        Field::ascii(symbol),
        Field::Scalar(Some(Value::Decimal(px))),
        Field::Scalar(size.map(Value::Int32)),
    ]
}

fn refresh(seq: u32, time: u64, entries: Vec<Vec<Field>>) -> Message {
    Message::new(
        2,
        vec![
            Field::scalar(seq),
            Field::scalar(time),
            Field::Sequence(Some(entries)),
        ],
    )
}

#[test]
fn feed_roundtrip() {
    let mut encoder = Encoder::new_from_xml(TEMPLATES).unwrap();
    let mut decoder = Decoder::new_from_xml(TEMPLATES).unwrap();

    let messages = vec![
        heartbeat(1, 20240606000000000),
        refresh(
            2,
            20240606000010000,
            vec![
                entry(0, "0", "ESM6", Decimal::new(-2, 942755), Some(25)),
                entry(1, "1", "ESM6", Decimal::new(-2, 942760), Some(10)),
            ],
        ),
        // same shapes again: most fields ride on the dictionary now
        heartbeat(3, 20240606000020000),
        refresh(
            4,
            20240606000030000,
            vec![
                entry(0, "0", "ESM6", Decimal::new(-2, 942750), Some(26)),
                entry(1, "1", "ESM6", Decimal::new(-2, 942765), None),
            ],
        ),
        Message::new(
            3,
            vec![
                Field::scalar(5u32),
                Field::scalar(20240606000040000u64),
                Field::Scalar(None),
            ],
        ),
    ];

    for msg in &messages {
        let raw = encoder.encode_vec(msg, false).unwrap();
        let decoded = decoder.decode_vec(raw).unwrap();
        assert_eq!(&decoded, msg);
    }
}

#[test]
fn repeated_messages_shrink_on_the_wire() {
    let mut encoder = Encoder::new_from_xml(TEMPLATES).unwrap();

    let first = encoder
        .encode_vec(&refresh(
            1,
            20240606000000000,
            vec![entry(0, "0", "ESM6", Decimal::new(-2, 942755), Some(25))],
        ), false)
        .unwrap();
    let second = encoder
        .encode_vec(&refresh(
            2,
            20240606000000001,
            vec![entry(0, "0", "ESM6", Decimal::new(-2, 942756), Some(26))],
        ), false)
        .unwrap();

    // the second refresh rides on the dictionary for everything but the deltas
    // and the raw timestamp
    assert!(second.len() < first.len(), "{} vs {}", second.len(), first.len());
}

#[test]
fn fixed_buffer_encoding() {
    let mut encoder = Encoder::new_from_xml(TEMPLATES).unwrap();
    let msg = heartbeat(1, 20240606000000000);

    let expected = encoder.encode_vec(&msg, true).unwrap();

    let mut buf = [0u8; 64];
    let size = encoder.encode_buffer(&msg, &mut buf, true).unwrap();
    assert_eq!(&buf[..size], expected.as_slice());

    let mut small = [0u8; 3];
    assert!(matches!(
        encoder.encode_buffer(&msg, &mut small, true),
        Err(Error::CapacityExceeded)
    ));
}

#[test]
fn template_lookup() {
    let encoder = Encoder::new_from_xml(TEMPLATES).unwrap();
    assert_eq!(encoder.template_with_id(2).unwrap().name(), "MDIncRefresh");
    assert!(encoder.template_with_id(42).is_none());
}

#[test]
fn unknown_template_id() {
    let mut encoder = Encoder::new_from_xml(TEMPLATES).unwrap();
    let msg = Message::new(42, vec![]);
    match encoder.encode_vec(&msg, false) {
        Err(Error::Dynamic(DynamicError::UnknownTemplate { template_id })) => {
            assert_eq!(template_id, 42);
        }
        other => panic!("expected an unknown-template error, got {other:?}"),
    }
}

#[test]
fn decoding_resumes_across_stream_boundaries() {
    let mut encoder = Encoder::new_from_xml(TEMPLATES).unwrap();
    let mut decoder = Decoder::new_from_xml(TEMPLATES).unwrap();

    let mut stream = Vec::new();
    let m1 = heartbeat(1, 20240606000000000);
    let m2 = heartbeat(2, 20240606000010000);
    stream.extend(encoder.encode_vec(&m1, false).unwrap());
    stream.extend(encoder.encode_vec(&m2, false).unwrap());

    let mut raw = bytes::Bytes::from(stream);
    assert_eq!(decoder.decode_bytes(&mut raw).unwrap(), m1);
    assert_eq!(decoder.decode_bytes(&mut raw).unwrap(), m2);
    assert!(raw.is_empty());
}
