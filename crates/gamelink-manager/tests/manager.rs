//! End-to-end manager test against an in-process HTTP host.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use gamelink_core::{AddressTuple, PairState, State};
use gamelink_manager::{ComputerManager, ManagerEvent};

const HOST_UUID: &str = "7c3ad5b2-1234-5678-9abc-def012345678";

fn server_info_xml() -> String {
    format!(
        "<root status_code=\"200\">\
             <hostname>LivingRoomPC</hostname>\
             <uniqueid>{HOST_UUID}</uniqueid>\
             <mac>aa:bb:cc:dd:ee:ff</mac>\
             <LocalIP>127.0.0.1</LocalIP>\
             <appversion>7.1.431.0</appversion>\
             <state>GS_APP_FREE</state>\
             <currentgame>0</currentgame>\
             <PairStatus>1</PairStatus>\
         </root>"
    )
}

/// Minimal HTTP/1.1 responder: serves `body` for every GET until dropped.
async fn spawn_http_host(body: String) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => return,
                        Ok(n) => {
                            request.extend_from_slice(&buf[..n]);
                            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn manual_add_polls_merges_and_persists() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let host_addr = spawn_http_host(server_info_xml()).await;

    let (manager, mut events) = ComputerManager::open(dir.path()).await?;

    let address = AddressTuple::new("127.0.0.1", host_addr.port())?;
    assert!(manager.add_computer_manually(address.clone()).await?);

    // The blocking first poll already merged the host's identity.
    let tracked = manager.computer(HOST_UUID).expect("host is tracked");
    assert_eq!(tracked.name, "LivingRoomPC");
    assert_eq!(tracked.state, State::Online);
    assert_eq!(tracked.mac_address, Some("aa:bb:cc:dd:ee:ff".to_owned()));
    assert_eq!(tracked.manual_address, Some(address));
    // The answering address is recorded as active.
    assert!(tracked.active_address.is_some());
    // The host claims PairStatus=1, but there is no pinned certificate on
    // our side, so the claim is worthless and we must report unpaired.
    assert_eq!(tracked.pair_state, Some(PairState::NotPaired));
    assert_eq!(tracked.running_game_id, 0);

    // The successful poll was reported to the listener.
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await?
        .expect("event stream open");
    match event {
        ManagerEvent::ComputerUpdated(details) => {
            assert_eq!(details.uuid.as_deref(), Some(HOST_UUID));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    manager.shutdown().await;

    // Identity survived in the store: a fresh manager knows the host before
    // any network traffic.
    let (manager, _events) = ComputerManager::open(dir.path()).await?;
    let reloaded = manager.computer(HOST_UUID).expect("host reloaded");
    assert_eq!(reloaded.name, "LivingRoomPC");
    assert_eq!(reloaded.state, State::Unknown);
    manager.shutdown().await;

    Ok(())
}

#[tokio::test]
async fn unreachable_manual_add_reports_failure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (manager, _events) = ComputerManager::open(dir.path()).await?;

    // A port nobody listens on: the add must fail cleanly, not hang or crash.
    let address = AddressTuple::new("127.0.0.1", 1)?;
    assert!(!manager.add_computer_manually(address).await?);
    assert!(manager.computers().is_empty());

    manager.shutdown().await;
    Ok(())
}
