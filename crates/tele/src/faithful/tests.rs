use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::frame;
use super::frame::Frame;
use super::*;
use crate::carrier::sieve::Sieve;
use crate::chain::ChainConn;
use crate::chain::ChainWriter;
use crate::chain::Delivery;
use crate::chain::SequentialIds;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    Config::default()
        .with_redial(Duration::from_millis(5), Duration::from_millis(5))
        .with_linger(Duration::from_millis(50))
        .with_handshake_timeout(Duration::from_secs(1))
}

/// The listener is returned so redials keep being accepted.
async fn connect(sieve: &Sieve, config: Config) -> (FaithfulConn, FaithfulConn, Listener) {
    let carrier: Arc<dyn Carrier> = Arc::new(sieve.clone());
    let mut listener = Listener::bind(carrier.clone(), "server", config.clone()).await.unwrap();
    let client = Dialer::new(carrier, config, Arc::new(SequentialIds::new(1))).unwrap().dial("server");
    let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    (client, server, listener)
}

/// A faithful client against a raw chain, so tests can speak frames by hand.
async fn connect_raw(sieve: &Sieve, config: Config) -> (FaithfulConn, ChainConn, ChainWriter, chain::Listener) {
    let carrier: Arc<dyn Carrier> = Arc::new(sieve.clone());
    let mut listener = chain::Listener::bind(carrier.clone(), "raw", config.clone()).await.unwrap();
    let client = Dialer::new(carrier, config, Arc::new(SequentialIds::new(1))).unwrap().dial("raw");
    let mut raw = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let Delivery::Stitch(stitch) = timeout(WAIT, raw.read()).await.unwrap().unwrap() else {
        panic!("a new chain starts with a stitch");
    };
    (client, raw, stitch.writer, listener)
}

async fn read_frame(raw: &mut ChainConn) -> Frame {
    loop {
        match timeout(WAIT, raw.read()).await.unwrap().unwrap() {
            Delivery::Chunk(bytes) => return Frame::decode(&bytes).unwrap(),
            Delivery::Stitch(_) => panic!("unexpected stitch"),
        }
    }
}

async fn read_all(conn: &mut FaithfulConn) -> Vec<Vec<u8>> {
    let mut got = Vec::new();
    while let Some(chunk) = timeout(WAIT, conn.read()).await.unwrap().unwrap() {
        got.push(chunk);
    }
    got
}

#[tokio::test]
async fn test_round_trip_then_end_of_stream() {
    let sieve = Sieve::new();
    let (mut client, mut server, _listener) = connect(&sieve, test_config()).await;

    client.write(b"ping").await.unwrap();
    client.close().unwrap();
    assert_eq!(read_all(&mut server).await, vec![b"ping".to_vec()]);
    assert_eq!(server.read().await.unwrap(), None);

    server.write(b"pong").await.unwrap();
    server.close().unwrap();
    assert_eq!(read_all(&mut client).await, vec![b"pong".to_vec()]);
}

#[tokio::test]
async fn test_write_after_close_and_empty_chunk() {
    let sieve = Sieve::new();
    let (client, _server, _listener) = connect(&sieve, test_config()).await;

    assert_eq!(client.write(b"").await, Err(Error::EmptyChunk));
    client.close().unwrap();
    client.close().unwrap();
    assert_eq!(client.write(b"late").await, Err(Error::Closed));
}

#[tokio::test]
async fn test_oversized_chunk_refused_before_numbering() {
    let sieve = Sieve::new();
    let (mut client, mut server, _listener) = connect(&sieve, test_config().with_max_frame_len(64)).await;
    let max = 64 - frame::CHUNK_HEADER_LEN_MAX;

    assert_eq!(
        client.write(&[7; 1000]).await,
        Err(Error::ChunkTooLarge { len: 1000, max })
    );
    // The refused chunk took no sequence number, so the stream carries on.
    client.write(&vec![1; max]).await.unwrap();
    client.close().unwrap();
    assert_eq!(read_all(&mut server).await, vec![vec![1; max]]);

    server.close().unwrap();
    assert_eq!(read_all(&mut client).await, Vec::<Vec<u8>>::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_order_survives_cuts() {
    const N: usize = 300;
    let sieve = Sieve::new();
    let (client, mut server, _listener) = connect(&sieve, test_config()).await;

    let (_reader, writer) = client.split();
    let cutter = sieve.clone();
    let producer = tokio::spawn(async move {
        for i in 0..N {
            writer.write(format!("chunk-{}", i).as_bytes()).await.unwrap();
            if i % 40 == 20 {
                cutter.cut_all();
                tokio::task::yield_now().await;
            }
        }
        writer.close().unwrap();
        writer
    });

    let got = read_all(&mut server).await;
    let want: Vec<Vec<u8>> = (0..N).map(|i| format!("chunk-{}", i).into_bytes()).collect();
    assert_eq!(got, want);
    timeout(WAIT, producer).await.unwrap().unwrap();
    assert!(sieve.dials() > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_order_survives_random_link_failures() {
    const N: usize = 200;
    let sieve = Sieve::new().with_link_failures(0x5eed, 0.02);
    let (client, mut server, _listener) = connect(&sieve, test_config()).await;

    let (_reader, writer) = client.split();
    let producer = tokio::spawn(async move {
        for i in 0..N {
            writer.write(&(i as u32).to_le_bytes()).await.unwrap();
        }
        writer.close().unwrap();
        writer
    });

    let got = read_all(&mut server).await;
    let want: Vec<Vec<u8>> = (0..N as u32).map(|i| i.to_le_bytes().to_vec()).collect();
    assert_eq!(got, want);
    timeout(WAIT, producer).await.unwrap().unwrap();
    sieve.heal();
}

#[tokio::test]
async fn test_full_buffer_blocks_writer_until_ack() {
    let sieve = Sieve::new();
    let config = test_config().with_buffer_capacity(4).with_ack_frequency(4);
    let (client, _raw, mut peer, _listener) = connect_raw(&sieve, config).await;

    for i in 1..=4u8 {
        timeout(WAIT, client.write(&[i])).await.unwrap().unwrap();
    }
    let blocked = timeout(Duration::from_millis(100), client.write(&[5])).await;
    assert!(blocked.is_err(), "fifth write must wait for an ACK");

    peer.write(&Frame::Ack(1).encode()).await.unwrap();
    timeout(WAIT, client.write(&[5])).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicates_dropped_and_gap_resynced() {
    let sieve = Sieve::new();
    let (mut client, mut raw, mut peer, _listener) = connect_raw(&sieve, test_config()).await;

    // The client opens with a SYNC saying it holds nothing.
    assert_eq!(read_frame(&mut raw).await, Frame::Sync(0));

    let chunk = |seq: u64, payload: &[u8]| Frame::Chunk { seq, payload: payload.to_vec() }.encode();
    peer.write(&chunk(0, b"a")).await.unwrap();
    peer.write(&chunk(0, b"a")).await.unwrap();
    peer.write(&chunk(2, b"c")).await.unwrap();
    peer.write(&chunk(3, b"d")).await.unwrap();
    assert_eq!(read_frame(&mut raw).await, Frame::Sync(1));

    peer.write(&chunk(1, b"b")).await.unwrap();
    peer.write(&chunk(2, b"c")).await.unwrap();
    peer.write(&chunk(3, b"")).await.unwrap();

    assert_eq!(read_all(&mut client).await, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    // The end marker is acknowledged at once; a single gap produced a single SYNC.
    assert_eq!(read_frame(&mut raw).await, Frame::Ack(4));
}

#[tokio::test]
async fn test_ack_beyond_written_is_fatal() {
    let sieve = Sieve::new();
    let (mut client, _raw, mut peer, _listener) = connect_raw(&sieve, test_config()).await;

    client.write(b"one").await.unwrap();
    peer.write(&Frame::Ack(5).encode()).await.unwrap();

    let err = timeout(WAIT, client.read()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)), "{:?}", err);
    assert!(matches!(client.write(b"two").await, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_unknown_frame_kind_is_fatal() {
    let sieve = Sieve::new();
    let (mut client, _raw, mut peer, _listener) = connect_raw(&sieve, test_config()).await;

    peer.write(&[0x09, 0x00]).await.unwrap();
    let err = timeout(WAIT, client.read()).await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)), "{:?}", err);
}

#[tokio::test]
async fn test_killed_peer_orphans_server() {
    let sieve = Sieve::new();
    let config = test_config().with_orphan_timeout(Some(Duration::from_millis(100)));
    let (client, mut server, _listener) = connect(&sieve, config).await;

    client.kill();
    let err = timeout(WAIT, server.read()).await.unwrap().unwrap_err();
    assert_eq!(err, Error::Chain(chain::Error::Orphaned));
}

#[tokio::test]
async fn test_both_closed_lingers_then_finishes() {
    let sieve = Sieve::new();
    let (mut client, mut server, _listener) = connect(&sieve, test_config()).await;

    client.close().unwrap();
    server.close().unwrap();
    assert!(read_all(&mut server).await.is_empty());
    assert!(read_all(&mut client).await.is_empty());

    assert_eq!(timeout(WAIT, server.closed()).await.unwrap(), Error::Closed);
}
