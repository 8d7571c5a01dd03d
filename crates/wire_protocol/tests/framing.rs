use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use wire_protocol::{
    CipherKey, ConnError, Endianness, FrameConfig, FrameDecoder, FrameError, MessageProcessor,
    MessageSink, SendQueue,
};

fn processor(min_compress_size: usize, encrypt: bool) -> MessageProcessor {
    MessageProcessor::new(FrameConfig {
        min_compress_size,
        encrypt,
        ..FrameConfig::default()
    })
}

fn decode_all(
    processor: &MessageProcessor,
    bytes: &[u8],
    key: Option<&CipherKey>,
) -> Vec<(u32, Vec<u8>)> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(bytes);
    let mut out = Vec::new();
    while processor
        .decode_batch(&mut decoder, key, |id, body| {
            out.push((id, body.to_vec()));
            true
        })
        .unwrap()
        > 0
    {}
    out
}

#[test]
fn bodies_survive_every_compression_and_encryption_combination() {
    let key = CipherKey::generate();
    let bodies: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"short".to_vec(),
        b"a fairly repetitive body, a fairly repetitive body, a fairly repetitive body".to_vec(),
        (0..=255u8).collect(),
    ];

    for compress_at in [0usize, 1, 32] {
        for encrypt in [false, true] {
            let processor = processor(compress_at, encrypt);
            let mut stream = Vec::new();
            for (id, body) in bodies.iter().enumerate() {
                stream.extend_from_slice(&processor.encode(id as u32, body, Some(&key)).unwrap());
            }
            let decoded = decode_all(&processor, &stream, Some(&key));
            let expected: Vec<(u32, Vec<u8>)> = bodies
                .iter()
                .enumerate()
                .map(|(id, body)| (id as u32, body.clone()))
                .collect();
            assert_eq!(decoded, expected, "compress_at={compress_at} encrypt={encrypt}");
        }
    }
}

#[test]
fn byte_at_a_time_matches_all_at_once() {
    let processor = MessageProcessor::new(FrameConfig {
        header_len_size: 2,
        endianness: Endianness::Big,
        min_compress_size: 16,
        ..FrameConfig::default()
    });
    let mut stream = Vec::new();
    for id in 0..10u32 {
        let body = format!("message number {id} ").repeat(id as usize + 1);
        stream.extend_from_slice(&processor.encode(id, body.as_bytes(), None).unwrap());
    }

    let all_at_once = decode_all(&processor, &stream, None);

    let mut decoder = FrameDecoder::new();
    let mut trickled = Vec::new();
    for byte in &stream {
        decoder.extend(std::slice::from_ref(byte));
        processor
            .decode_batch(&mut decoder, None, |id, body| {
                trickled.push((id, body.to_vec()));
                true
            })
            .unwrap();
    }

    assert_eq!(all_at_once.len(), 10);
    assert_eq!(trickled, all_at_once);
    assert_eq!(decoder.buffered(), 0);
}

#[test]
fn compression_needs_threshold_and_a_strictly_smaller_result() {
    let processor = processor(64, false);

    let compressible = vec![b'z'; 64];
    let (body, compressed) = processor.compress_body(1, &compressible).unwrap();
    assert!(compressed, "a body exactly at the threshold is eligible");
    assert!(body.len() < 64);

    let (body, compressed) = processor.compress_body(1, &compressible[..63]).unwrap();
    assert!(!compressed);
    assert_eq!(body.len(), 63);

    // High-entropy input does not shrink, so it goes out uncompressed.
    let noise: Vec<u8> = CipherKey::generate().encrypt(&[0u8; 200]);
    let (body, compressed) = processor.compress_body(1, &noise).unwrap();
    assert!(!compressed);
    assert_eq!(body, noise);

    let disabled = self::processor(0, false);
    assert!(!disabled.compress_body(1, &compressible).unwrap().1);
}

#[test]
fn encryption_without_a_key_is_an_error() {
    let processor = processor(0, true);
    assert!(matches!(processor.encode(1, b"secret", None), Err(FrameError::MissingKey)));

    let key = CipherKey::generate();
    let frame = processor.encode(1, b"secret", Some(&key)).unwrap();
    let mut decoder = FrameDecoder::new();
    decoder.extend(&frame);
    let result = processor.decode_batch(&mut decoder, None, |_, _| true);
    assert!(matches!(result, Err(FrameError::MissingKey)));
}

#[test]
fn dispatch_is_capped_per_read() {
    let processor = processor(0, false);
    let mut decoder = FrameDecoder::new();
    for id in 0..40u32 {
        decoder.extend(&processor.encode(id, b"x", None).unwrap());
    }

    let mut seen = Vec::new();
    let first = processor
        .decode_batch(&mut decoder, None, |id, _| {
            seen.push(id);
            true
        })
        .unwrap();
    assert_eq!(first, 16);
    assert_eq!(seen, (0..16).collect::<Vec<_>>());

    let mut rest = 0;
    loop {
        let n = processor.decode_batch(&mut decoder, None, |_, _| true).unwrap();
        if n == 0 {
            break;
        }
        rest += n;
    }
    assert_eq!(rest, 24);
}

#[test]
fn handler_rejection_stops_the_batch() {
    let processor = processor(0, false);
    let mut decoder = FrameDecoder::new();
    decoder.extend(&processor.encode(3, b"one", None).unwrap());
    decoder.extend(&processor.encode(4, b"two", None).unwrap());
    let result = processor.decode_batch(&mut decoder, None, |id, _| id != 3);
    assert!(matches!(result, Err(FrameError::HandlerRejected { msg_id: 3 })));
}

#[test]
fn oversized_outgoing_body_is_rejected() {
    let processor = MessageProcessor::new(FrameConfig {
        max_body_len: 8,
        ..FrameConfig::default()
    });
    assert!(matches!(
        processor.encode(1, b"way more than eight bytes", None),
        Err(FrameError::BodyTooLong { max: 8, .. })
    ));
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Chat {
    room: u32,
    text: String,
}

#[tokio::test]
async fn messages_travel_through_a_send_queue_and_back() {
    let processor = processor(8, true);
    let key = CipherKey::generate();
    let (client, mut server) = tokio::io::duplex(4096);
    let (queue, writer) = SendQueue::spawn("duplex", client, 16);

    let chat = Chat {
        room: 7,
        text: "hello ".repeat(20),
    };
    processor.write_message(queue.as_ref(), 100, &chat, Some(&key)).unwrap();

    let (body, compressed) = processor.compress_message(101, &chat).unwrap();
    assert!(compressed);
    processor
        .write_precompressed(queue.as_ref(), 101, &body, compressed, Some(&key))
        .unwrap();
    queue.close();
    assert!(matches!(
        processor.write_body(queue.as_ref(), 102, b"late", Some(&key)),
        Err(FrameError::Send(ConnError::Closed))
    ));
    writer.await.unwrap();

    let mut decoder = FrameDecoder::new();
    let mut received = Vec::new();
    loop {
        match processor
            .read_from(&mut server, &mut decoder, Some(&key), |id, body: Bytes| {
                received.push((id, serde_json::from_slice::<Chat>(&body).unwrap()));
                true
            })
            .await
        {
            Ok(_) => continue,
            Err(FrameError::ConnectionClosed) => break,
            Err(other) => panic!("unexpected {other}"),
        }
    }
    assert_eq!(received.len(), 2);
    assert_eq!(received[0], (100, Chat { room: 7, text: chat.text.clone() }));
    assert_eq!(received[1].0, 101);
    assert_eq!(received[1].1, chat);
}

#[tokio::test]
async fn read_from_reports_framing_violations() {
    let processor = processor(0, false);
    let (mut client, mut server) = tokio::io::duplex(64);
    client.write_all(&[0u8, 1, 2, 3]).await.unwrap();
    let mut decoder = FrameDecoder::new();
    let result = processor.read_from(&mut server, &mut decoder, None, |_, _| true).await;
    assert!(matches!(result, Err(FrameError::HeaderTooShort { len: 0, .. })));
}

#[tokio::test]
async fn read_from_drains_a_burst_without_waiting_for_more_input() {
    let processor = processor(0, false);
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);
    let mut burst = Vec::new();
    for id in 0..40u32 {
        burst.extend_from_slice(&processor.encode(id, b"x", None).unwrap());
    }
    // One write, and the writer stays open so no further bytes ever arrive.
    client.write_all(&burst).await.unwrap();

    let mut decoder = FrameDecoder::new();
    let mut seen = Vec::new();
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while seen.len() < 40 {
            processor
                .read_from(&mut server, &mut decoder, None, |id, _| {
                    seen.push(id);
                    true
                })
                .await
                .unwrap();
        }
    })
    .await
    .expect("buffered packets must be served without another read");
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
    drop(client);
}
