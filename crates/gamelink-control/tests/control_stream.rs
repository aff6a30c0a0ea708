//! Drives a `ControlStream` against an in-process mock host socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use gamelink_control::packet::{
    config_payload, read_packet, write_packet, PTYPE_CONFIG, PTYPE_HEARTBEAT, PTYPE_HELLO,
    PTYPE_JITTER, PTYPE_KEEPALIVE, PTYPE_PROBE, PTYPE_RESYNC,
};
use gamelink_control::{ControlEvent, ControlState, ControlStream};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

#[tokio::test]
async fn handshake_heartbeat_jitter_and_resync() -> anyhow::Result<()> {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let (events_tx, _events_rx) = mpsc::channel(4);
    let stream = Arc::new(ControlStream::connect("127.0.0.1", port, events_tx).await?);
    assert_eq!(stream.state(), ControlState::Disconnected);

    let (host_socket, _) = listener.accept().await?;
    let (mut rd, mut wr) = host_socket.into_split();

    let handshaker = Arc::clone(&stream);
    let start_task = tokio::spawn(async move { handshaker.start().await });

    // HELLO: fixed four-byte payload.
    let hello = read_packet(&mut rd).await?;
    assert_eq!(hello.ptype, PTYPE_HELLO);
    assert_eq!(hello.payload, vec![0x00, 0x05, 0x00, 0x00]);

    // CONFIG declares a length of 4 but carries the full table; drain the
    // remainder past the framing layer exactly like a real host does.
    let expected_config = config_payload();
    let config = read_packet(&mut rd).await?;
    assert_eq!(config.ptype, PTYPE_CONFIG);
    assert_eq!(config.payload, expected_config[..4].to_vec());
    let mut table_rest = vec![0u8; expected_config.len() - 4];
    rd.read_exact(&mut table_rest).await?;
    assert_eq!(table_rest, expected_config[4..].to_vec());

    // Keepalive ping/pong.
    let keepalive = read_packet(&mut rd).await?;
    assert_eq!(keepalive.ptype, PTYPE_KEEPALIVE);
    assert!(keepalive.payload.is_empty());
    write_packet(&mut wr, PTYPE_KEEPALIVE, 0, &[]).await?;

    // Post-handshake probe.
    let probe = read_packet(&mut rd).await?;
    assert_eq!(probe.ptype, PTYPE_PROBE);
    write_packet(&mut wr, PTYPE_PROBE, 0, &[]).await?;

    start_task.await??;
    assert_eq!(stream.state(), ControlState::Established);

    // The heartbeat task sends its first beat immediately.
    let heartbeat = read_packet(&mut rd).await?;
    assert_eq!(heartbeat.ptype, PTYPE_HEARTBEAT);

    // Jitter probes only start on explicit request, sequence-numbered by two.
    stream.start_jitter_packets();
    let jitter = loop {
        let packet = read_packet(&mut rd).await?;
        if packet.ptype != PTYPE_HEARTBEAT {
            break packet;
        }
    };
    assert_eq!(jitter.ptype, PTYPE_JITTER);
    assert_eq!(jitter.payload.len(), 16);
    assert_eq!(jitter.payload[4..8], 77u32.to_le_bytes());
    assert_eq!(jitter.payload[8..12], 888u32.to_le_bytes());
    assert_eq!(jitter.payload[12..16], 2u32.to_le_bytes());

    // Resync: the host answers the request; heartbeat/jitter frames keep
    // flowing around it.
    let host_task = tokio::spawn(async move {
        loop {
            let packet = read_packet(&mut rd).await.expect("host read");
            if packet.ptype == PTYPE_RESYNC {
                assert_eq!(packet.payload[..8], 0u64.to_le_bytes());
                assert_eq!(packet.payload[8..16], 0xFFFFu64.to_le_bytes());
                write_packet(&mut wr, PTYPE_RESYNC, 0, &[])
                    .await
                    .expect("host write");
                return;
            }
        }
    });

    let reply = stream.request_resync().await?;
    assert_eq!(reply.ptype, PTYPE_RESYNC);
    host_task.await?;

    // Abort is idempotent.
    stream.abort().await;
    assert_eq!(stream.state(), ControlState::Closed);
    stream.abort().await;
    assert_eq!(stream.state(), ControlState::Closed);

    Ok(())
}

#[tokio::test]
async fn heartbeat_failure_terminates_the_session() -> anyhow::Result<()> {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let (events_tx, mut events_rx) = mpsc::channel(4);
    let stream = Arc::new(ControlStream::connect("127.0.0.1", port, events_tx).await?);

    let (host_socket, _) = listener.accept().await?;
    let (mut rd, mut wr) = host_socket.into_split();

    let handshaker = Arc::clone(&stream);
    let start_task = tokio::spawn(async move { handshaker.start().await });

    // Service the handshake, then hang up on the client.
    let expected_config_len = config_payload().len();
    read_packet(&mut rd).await?; // hello
    read_packet(&mut rd).await?; // config header + declared payload
    let mut rest = vec![0u8; expected_config_len - 4];
    rd.read_exact(&mut rest).await?;
    read_packet(&mut rd).await?; // keepalive
    write_packet(&mut wr, PTYPE_KEEPALIVE, 0, &[]).await?;
    read_packet(&mut rd).await?; // probe
    write_packet(&mut wr, PTYPE_PROBE, 0, &[]).await?;
    start_task.await??;

    drop(rd);
    drop(wr);

    // A later heartbeat hits the dead socket; the failure is reported to the
    // session owner instead of being retried.
    let event = tokio::time::timeout(Duration::from_secs(20), events_rx.recv())
        .await
        .expect("termination report in time")
        .expect("event channel open");
    assert!(matches!(event, ControlEvent::ConnectionTerminated(_)));

    Ok(())
}
