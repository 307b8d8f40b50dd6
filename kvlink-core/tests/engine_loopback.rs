use std::time::Duration;

use futures::{SinkExt, StreamExt};
use kvlink_core::engine::{EngineConfig, TransferEngine};
use kvlink_core::protocol::{ConnectInfo, Frame, FrameCodec, Message};
use kvlink_core::types::{MemDesc, MemType, TransferOp, TransferOpDesc, TransferStatus};
use kvlink_core::TransferError;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const TIMEOUT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn listening_engine(config: EngineConfig) -> (TransferEngine, String) {
    let engine = TransferEngine::new(config);
    let addr = format!("127.0.0.1:{}", free_port());
    engine.initialize(&addr).await.unwrap();
    (engine, addr)
}

fn register(engine: &TransferEngine, buf: &mut [u8]) -> u64 {
    let addr = buf.as_mut_ptr() as u64;
    unsafe {
        engine
            .register_mem(MemDesc::new(addr, buf.len() as u64), MemType::Host)
            .unwrap();
    }
    addr
}

#[tokio::test]
async fn write_and_read_between_engines() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();

    let mut remote = vec![0u8; 4096];
    let mut local: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let remote_addr = register(&server, &mut remote);
    let local_addr = register(&client, &mut local);

    client.connect(&server_addr, TIMEOUT).await.unwrap();
    assert!(client.is_connected(&server_addr));
    assert!(matches!(
        client.connect(&server_addr, TIMEOUT).await,
        Err(TransferError::AlreadyConnected(_))
    ));

    let descs = [
        TransferOpDesc::new(local_addr, remote_addr, 1024),
        TransferOpDesc::new(local_addr + 2048, remote_addr + 3072, 1024),
    ];
    client
        .transfer_sync(&server_addr, TransferOp::Write, &descs, TIMEOUT)
        .await
        .unwrap();

    let mut back = vec![0u8; 2048];
    let back_addr = register(&client, &mut back);
    let read = [TransferOpDesc::new(back_addr, remote_addr + 3072, 1024)];
    client
        .transfer_sync(&server_addr, TransferOp::Read, &read, TIMEOUT)
        .await
        .unwrap();

    server.finalize().await;
    client.finalize().await;
    assert_eq!(&remote[..1024], &local[..1024]);
    assert_eq!(&remote[3072..], &local[2048..3072]);
    assert_eq!(&back[..1024], &local[2048..3072]);
    assert!(remote[1024..3072].iter().all(|b| *b == 0));
}

#[tokio::test]
async fn invalid_transfers_are_rejected_without_breaking_the_channel() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();

    let mut remote = vec![0u8; 256];
    let mut local = vec![7u8; 256];
    let remote_addr = register(&server, &mut remote);
    let local_addr = register(&client, &mut local);
    client.connect(&server_addr, TIMEOUT).await.unwrap();

    let null = [TransferOpDesc::new(local_addr, 0, 8)];
    assert!(matches!(
        client
            .transfer_sync(&server_addr, TransferOp::Write, &null, TIMEOUT)
            .await,
        Err(TransferError::InvalidArgument(_))
    ));

    let outside = [TransferOpDesc::new(local_addr, remote_addr + 200, 100)];
    assert!(matches!(
        client
            .transfer_sync(&server_addr, TransferOp::Write, &outside, TIMEOUT)
            .await,
        Err(TransferError::InvalidArgument(_))
    ));

    let unregistered_local = [TransferOpDesc::new(0x1000, remote_addr, 8)];
    assert!(matches!(
        client
            .transfer_sync(&server_addr, TransferOp::Read, &unregistered_local, TIMEOUT)
            .await,
        Err(TransferError::InvalidArgument(_))
    ));

    // Channel still usable.
    let ok = [TransferOpDesc::new(local_addr, remote_addr, 256)];
    client
        .transfer_sync(&server_addr, TransferOp::Write, &ok, TIMEOUT)
        .await
        .unwrap();
    assert!(client
        .transfer_sync(&server_addr, TransferOp::Write, &[], TIMEOUT)
        .await
        .is_ok());

    server.finalize().await;
    client.finalize().await;
    assert!(remote.iter().all(|b| *b == 7));
}

#[tokio::test]
async fn memory_registered_after_connect_is_reachable() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();

    let mut local = vec![3u8; 64];
    let local_addr = register(&client, &mut local);
    client.connect(&server_addr, TIMEOUT).await.unwrap();

    let mut late = vec![0u8; 64];
    let late_addr = register(&server, &mut late);
    let descs = [TransferOpDesc::new(local_addr, late_addr, 64)];
    client
        .transfer_sync(&server_addr, TransferOp::Write, &descs, TIMEOUT)
        .await
        .unwrap();

    server.finalize().await;
    client.finalize().await;
    assert!(late.iter().all(|b| *b == 3));
}

#[tokio::test]
async fn small_batches_still_move_everything() {
    let config = EngineConfig {
        max_ops_per_batch: 4,
        max_batch_bytes: 1000,
        ..EngineConfig::default()
    };
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    let client = TransferEngine::new(config);
    client.initialize("127.0.0.1").await.unwrap();

    let mut remote = vec![0u8; 64 * 512];
    let mut local: Vec<u8> = (0..64 * 512u32).map(|i| (i % 253) as u8).collect();
    let remote_addr = register(&server, &mut remote);
    let local_addr = register(&client, &mut local);
    client.connect(&server_addr, TIMEOUT).await.unwrap();

    // Reverse block order so every desc is its own run.
    let descs: Vec<_> = (0..64u64)
        .map(|i| TransferOpDesc::new(local_addr + i * 512, remote_addr + (63 - i) * 512, 512))
        .collect();
    client
        .transfer_sync(&server_addr, TransferOp::Write, &descs, TIMEOUT)
        .await
        .unwrap();

    server.finalize().await;
    client.finalize().await;
    for i in 0..64usize {
        let src = &local[i * 512..(i + 1) * 512];
        let dst = &remote[(63 - i) * 512..(64 - i) * 512];
        assert_eq!(src, dst, "block {i}");
    }
}

#[tokio::test]
async fn async_transfer_completes() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();

    let mut remote = vec![9u8; 128];
    let mut local = vec![0u8; 128];
    let remote_addr = register(&server, &mut remote);
    let local_addr = register(&client, &mut local);
    client.connect(&server_addr, TIMEOUT).await.unwrap();

    let req = client
        .transfer_async(
            &server_addr,
            TransferOp::Read,
            vec![TransferOpDesc::new(local_addr, remote_addr, 128)],
            TIMEOUT,
        )
        .await
        .unwrap();

    let mut status = TransferStatus::Waiting;
    for _ in 0..500 {
        status = client.get_transfer_status(req).unwrap();
        if status != TransferStatus::Waiting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, TransferStatus::Completed);
    // Forgotten once reported.
    assert!(matches!(
        client.get_transfer_status(req),
        Err(TransferError::InvalidArgument(_))
    ));

    server.finalize().await;
    client.finalize().await;
    assert!(local.iter().all(|b| *b == 9));
}

#[tokio::test]
async fn disconnect_and_peer_shutdown() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();

    let mut remote = vec![0u8; 64];
    let mut local = vec![1u8; 64];
    let remote_addr = register(&server, &mut remote);
    let local_addr = register(&client, &mut local);
    let descs = [TransferOpDesc::new(local_addr, remote_addr, 64)];

    client.connect(&server_addr, TIMEOUT).await.unwrap();
    client.disconnect(&server_addr, TIMEOUT).await.unwrap();
    assert!(matches!(
        client
            .transfer_sync(&server_addr, TransferOp::Write, &descs, TIMEOUT)
            .await,
        Err(TransferError::NotConnected(_))
    ));

    // Reconnect, then lose the peer.
    client.connect(&server_addr, TIMEOUT).await.unwrap();
    server.finalize().await;
    assert!(client
        .transfer_sync(&server_addr, TransferOp::Write, &descs, TIMEOUT)
        .await
        .is_err());
    assert!(matches!(
        client
            .transfer_sync(&server_addr, TransferOp::Write, &descs, TIMEOUT)
            .await,
        Err(TransferError::NotConnected(_))
    ));
    assert!(!client.is_connected(&server_addr));
    // A poisoned channel is dropped locally without a round trip.
    client.disconnect(&server_addr, TIMEOUT).await.unwrap();
    client.finalize().await;
}

#[tokio::test]
async fn connect_to_nothing_fails_cleanly() {
    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();
    let target = format!("127.0.0.1:{}", free_port());
    assert!(client.connect(&target, Duration::from_millis(500)).await.is_err());
    assert!(!client.is_connected(&target));
    // Nothing left behind: a second attempt fails the same way, not with AlreadyConnected.
    assert!(!matches!(
        client.connect(&target, Duration::from_millis(500)).await,
        Err(TransferError::AlreadyConnected(_))
    ));
    client.finalize().await;
}

#[tokio::test]
async fn idle_channels_expire_and_heartbeats_keep_them_alive() {
    let server_config = EngineConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..EngineConfig::default()
    };
    let (server, server_addr) = listening_engine(server_config).await;

    let mut remote = vec![0u8; 16];
    let remote_addr = register(&server, &mut remote);

    // Silent client: heartbeat far beyond the server timeout.
    let silent = TransferEngine::new(EngineConfig {
        heartbeat_interval: Duration::from_secs(60),
        ..EngineConfig::default()
    });
    silent.initialize("127.0.0.1").await.unwrap();
    let mut a = vec![5u8; 16];
    let a_addr = register(&silent, &mut a);
    silent.connect(&server_addr, TIMEOUT).await.unwrap();

    // Chatty client: heartbeat well within the timeout.
    let chatty = TransferEngine::new(EngineConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    });
    chatty.initialize("127.0.0.1").await.unwrap();
    let mut b = vec![6u8; 16];
    let b_addr = register(&chatty, &mut b);
    chatty.connect(&server_addr, TIMEOUT).await.unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;

    let silent_result = silent
        .transfer_sync(
            &server_addr,
            TransferOp::Write,
            &[TransferOpDesc::new(a_addr, remote_addr, 16)],
            TIMEOUT,
        )
        .await;
    assert!(silent_result.is_err());

    chatty
        .transfer_sync(
            &server_addr,
            TransferOp::Write,
            &[TransferOpDesc::new(b_addr, remote_addr, 16)],
            TIMEOUT,
        )
        .await
        .unwrap();

    silent.finalize().await;
    chatty.finalize().await;
    server.finalize().await;
    assert!(remote.iter().all(|v| *v == 6));
}

#[tokio::test]
async fn metadata_is_served_to_connected_peers() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    server.publish_metadata("table", b"v1".to_vec()).unwrap();

    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();
    assert!(matches!(
        client.fetch_metadata(&server_addr, "table", TIMEOUT).await,
        Err(TransferError::NotConnected(_))
    ));

    client.connect(&server_addr, TIMEOUT).await.unwrap();
    assert_eq!(
        client.fetch_metadata(&server_addr, "table", TIMEOUT).await.unwrap(),
        Some(b"v1".to_vec())
    );
    assert_eq!(
        client.fetch_metadata(&server_addr, "missing", TIMEOUT).await.unwrap(),
        None
    );

    // Republishing replaces the value seen by later fetches.
    server.publish_metadata("table", b"v2".to_vec()).unwrap();
    assert_eq!(
        client.fetch_metadata(&server_addr, "table", TIMEOUT).await.unwrap(),
        Some(b"v2".to_vec())
    );

    server.finalize().await;
    client.finalize().await;
}

#[tokio::test]
async fn connect_replaces_a_poisoned_channel() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    let client = TransferEngine::default();
    client.initialize("127.0.0.1").await.unwrap();

    let mut local = vec![9u8; 64];
    let local_addr = register(&client, &mut local);
    let mut first = vec![0u8; 64];
    let first_addr = register(&server, &mut first);

    client.connect(&server_addr, TIMEOUT).await.unwrap();
    server.finalize().await;
    let descs = [TransferOpDesc::new(local_addr, first_addr, 64)];
    assert!(client
        .transfer_sync(&server_addr, TransferOp::Write, &descs, TIMEOUT)
        .await
        .is_err());
    assert!(!client.is_connected(&server_addr));

    // Same listen address, fresh engine behind it.
    let restarted = TransferEngine::default();
    restarted.initialize(&server_addr).await.unwrap();
    let mut second = vec![0u8; 64];
    let second_addr = register(&restarted, &mut second);

    client.connect(&server_addr, TIMEOUT).await.unwrap();
    assert!(client.is_connected(&server_addr));
    client
        .transfer_sync(
            &server_addr,
            TransferOp::Write,
            &[TransferOpDesc::new(local_addr, second_addr, 64)],
            TIMEOUT,
        )
        .await
        .unwrap();

    restarted.finalize().await;
    client.finalize().await;
    assert!(second.iter().all(|b| *b == 9));
}

async fn handshake(server_addr: &str, channel_id: &str) -> Framed<TcpStream, FrameCodec> {
    let stream = TcpStream::connect(server_addr).await.unwrap();
    let mut conn = Framed::new(stream, FrameCodec::new());
    conn.send(Frame::new(Message::Connect(ConnectInfo {
        channel_id: channel_id.to_string(),
        comm_res: String::new(),
        timeout_ms: 120_000,
        segments: Vec::new(),
    })))
    .await
    .unwrap();
    let reply = conn.next().await.unwrap().unwrap();
    assert!(matches!(reply.message, Message::Connected(_)));
    conn
}

#[tokio::test]
async fn second_handshake_with_same_id_closes_the_first_channel() {
    let (server, server_addr) = listening_engine(EngineConfig::default()).await;
    server.publish_metadata("table", b"v1".to_vec()).unwrap();

    let mut old = handshake(&server_addr, "10.0.0.9#peer").await;
    let mut new = handshake(&server_addr, "10.0.0.9#peer").await;

    // The server drops the replaced connection without replying.
    match tokio::time::timeout(TIMEOUT, old.next()).await.unwrap() {
        None | Some(Err(_)) => {}
        Some(Ok(frame)) => panic!("replaced channel still delivered {:?}", frame.message),
    }

    // The replacement keeps working after the old one has been torn down.
    new.send(Frame::new(Message::GetMetadata {
        key: "table".to_string(),
    }))
    .await
    .unwrap();
    let reply = new.next().await.unwrap().unwrap();
    assert_eq!(
        reply.message,
        Message::Metadata {
            value: Some(b"v1".to_vec())
        }
    );

    server.finalize().await;
}
