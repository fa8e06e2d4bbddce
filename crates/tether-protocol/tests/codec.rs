//! Streaming decoder behaviour over realistic byte streams.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tether_protocol::{
    encode_frame, Exit, Frame, FrameCodec, FrameType, Hello, Message, ProtocolError,
    ProtocolVersion, Resize, Signal, SignalRequest, Spawn, Welcome, MAX_PAYLOAD_LEN,
};
use tokio_util::codec::{Decoder, Encoder};

fn one_of_each() -> Vec<Message> {
    let mut env = BTreeMap::new();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    vec![
        Message::Hello(Hello::default()),
        Message::Welcome(Welcome {
            protocol_version: ProtocolVersion::CURRENT,
            pid: 100,
            start_time: 987_654,
            child_pid: Some(101),
            cols: 120,
            rows: 40,
        }),
        Message::Data(Bytes::from_static(b"ls -la\r")),
        Message::Resize(Resize { cols: 200, rows: 50 }),
        Message::Signal(SignalRequest::new(Signal::Int)),
        Message::Exit(Exit {
            code: None,
            signal: Some(9),
        }),
        Message::Replay(Bytes::from_static(b"\x1b[32mok\x1b[0m\r\n")),
        Message::Ping(Bytes::from_static(b"\x00\x01\x02")),
        Message::Pong(Bytes::from_static(b"\x00\x01\x02")),
        Message::Spawn(Spawn {
            command: "bash".to_string(),
            args: vec!["-l".to_string()],
            cwd: Some("/tmp".to_string()),
            env,
        }),
    ]
}

fn encode_all(messages: &[Message]) -> BytesMut {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    for msg in messages {
        codec.encode(msg.clone(), &mut buf).unwrap();
    }
    buf
}

fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(buf).unwrap() {
        frames.push(frame);
    }
    frames
}

#[test]
fn every_frame_type_survives_the_wire() {
    let messages = one_of_each();
    let mut buf = encode_all(&messages);

    let frames = decode_all(&mut FrameCodec::new(), &mut buf);
    let types: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
    assert_eq!(types, FrameType::ALL.to_vec());

    let decoded: Vec<Message> = frames
        .into_iter()
        .map(|f| Message::from_frame(f).unwrap())
        .collect();
    assert_eq!(decoded, messages);
    assert!(buf.is_empty());
}

#[test]
fn byte_at_a_time_delivery_yields_same_frames() {
    let messages = one_of_each();
    let wire = encode_all(&messages).freeze();

    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();
    for byte in wire.iter() {
        buf.put_u8(*byte);
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            decoded.push(Message::from_frame(frame).unwrap());
        }
    }
    assert_eq!(decoded, messages);
}

#[test]
fn uneven_chunks_yield_same_frames() {
    let messages = one_of_each();
    let wire = encode_all(&messages).freeze();

    for chunk_size in [2, 3, 7, 64] {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut count = 0;
        for chunk in wire.chunks(chunk_size) {
            buf.extend_from_slice(chunk);
            count += decode_all(&mut codec, &mut buf).len();
        }
        assert_eq!(count, messages.len(), "chunk size {chunk_size}");
    }
}

#[test]
fn oversized_frame_errors_once_then_parsing_resumes() {
    let declared = MAX_PAYLOAD_LEN + 1;
    let mut buf = BytesMut::new();
    buf.put_u8(FrameType::Data.as_u8());
    buf.put_u32(declared as u32);

    let mut codec = FrameCodec::new();
    let err = codec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, ProtocolError::FrameTooLarge { len, .. } if len == declared));

    // The bogus payload arrives in pieces, followed by a valid frame.
    let junk = vec![0xAAu8; 1024 * 1024];
    let mut remaining = declared;
    while remaining > 0 {
        let n = remaining.min(junk.len());
        buf.extend_from_slice(&junk[..n]);
        remaining -= n;
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
    buf.extend_from_slice(&encode_frame(FrameType::Data, b"after").unwrap());

    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(frame.frame_type, FrameType::Data);
    assert_eq!(&frame.payload[..], b"after");
}

#[test]
fn unknown_frame_types_are_skipped() {
    let mut buf = BytesMut::new();
    buf.put_u8(0x42);
    buf.put_u32(3);
    buf.put_slice(b"???");
    buf.extend_from_slice(&encode_frame(FrameType::Ping, b"p").unwrap());
    buf.put_u8(0xFF);
    buf.put_u32(0);

    let frames = decode_all(&mut FrameCodec::new(), &mut buf);
    assert_eq!(frames, vec![Frame::new(FrameType::Ping, Bytes::from_static(b"p"))]);
    assert!(buf.is_empty());
}
