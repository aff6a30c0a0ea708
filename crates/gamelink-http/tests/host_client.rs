//! Drives `HostClient` against in-process mock hosts: a TLS listener that
//! presents a pinnable certificate for the HTTPS surface, and a plain
//! listener for the HTTP fallback path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use gamelink_core::AddressTuple;
use gamelink_http::{ClientIdentity, HostClient, HttpError};

/// RSA keygen is slow enough to share one client identity across the tests.
fn identity() -> Arc<ClientIdentity> {
    static IDENTITY: OnceLock<Arc<ClientIdentity>> = OnceLock::new();
    IDENTITY
        .get_or_init(|| Arc::new(ClientIdentity::generate().expect("client identity")))
        .clone()
}

fn ok_xml(fields: &str) -> String {
    format!(r#"<root status_code="200">{fields}</root>"#)
}

fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

async fn read_request_path(socket: &mut (impl AsyncReadExt + Unpin)) -> Option<String> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => {
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    let first_line = String::from_utf8_lossy(&request);
    let target = first_line.split_whitespace().nth(1)?;
    Some(target.split('?').next().unwrap_or(target).to_owned())
}

/// TLS mock host with a fresh self-signed certificate; returns the address
/// and the DER certificate for the client to pin.
async fn spawn_tls_host(routes: HashMap<&'static str, String>) -> (SocketAddr, Vec<u8>) {
    // Install ring crypto provider (ignored if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let key_pair = rcgen::KeyPair::generate().expect("host key");
    let cert = rcgen::CertificateParams::default()
        .self_signed(&key_pair)
        .expect("host cert");
    let cert_der = cert.der().to_vec();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
        )
        .expect("server TLS config");
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let routes = routes.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(socket).await else {
                    return;
                };
                let Some(path) = read_request_path(&mut tls).await else {
                    return;
                };
                if let Some(body) = routes.get(path.as_str()) {
                    let _ = tls.write_all(http_response(body).as_bytes()).await;
                }
                let _ = tls.shutdown().await;
            });
        }
    });

    (addr, cert_der)
}

/// Plain-HTTP mock host for the unauthenticated fallback surface.
async fn spawn_plain_host(routes: HashMap<&'static str, String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            tokio::spawn(async move {
                let Some(path) = read_request_path(&mut socket).await else {
                    return;
                };
                if let Some(body) = routes.get(path.as_str()) {
                    let _ = socket.write_all(http_response(body).as_bytes()).await;
                }
            });
        }
    });

    addr
}

fn pinned_client(tls_addr: SocketAddr, cert_der: Vec<u8>) -> HostClient {
    // HTTP and HTTPS share the mock's port here; only HTTPS is exercised.
    let address = AddressTuple::new("127.0.0.1", tls_addr.port()).expect("address");
    HostClient::new(&address, tls_addr.port(), Some(cert_der), identity()).expect("client")
}

#[tokio::test]
async fn quit_succeeds_when_no_game_survives() -> anyhow::Result<()> {
    let routes = HashMap::from([
        ("/cancel", ok_xml("<cancel>1</cancel>")),
        (
            "/serverinfo",
            ok_xml("<appversion>7.1.431.0</appversion><state>GS_APP_FREE</state><currentgame>7</currentgame>"),
        ),
    ]);
    let (addr, cert) = spawn_tls_host(routes).await;

    assert!(pinned_client(addr, cert).quit_app().await?);
    Ok(())
}

#[tokio::test]
async fn quit_of_foreign_session_reports_not_authorized() -> anyhow::Result<()> {
    // The host claims the cancel worked, but a session is still running:
    // someone else's stream, which we are not allowed to kill.
    let routes = HashMap::from([
        ("/cancel", ok_xml("<cancel>1</cancel>")),
        (
            "/serverinfo",
            ok_xml("<appversion>7.1.431.0</appversion><state>GS_APP_SERVER_BUSY</state><currentgame>7</currentgame>"),
        ),
    ]);
    let (addr, cert) = spawn_tls_host(routes).await;

    match pinned_client(addr, cert).quit_app().await {
        Err(HttpError::QuitNotAuthorized) => {}
        other => panic!("expected QuitNotAuthorized, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn quit_refused_by_host_is_plain_failure() -> anyhow::Result<()> {
    let routes = HashMap::from([("/cancel", ok_xml("<cancel>0</cancel>"))]);
    let (addr, cert) = spawn_tls_host(routes).await;

    assert!(!pinned_client(addr, cert).quit_app().await?);
    Ok(())
}

#[tokio::test]
async fn server_info_drops_to_http_on_certificate_mismatch() -> anyhow::Result<()> {
    let tls_routes = HashMap::from([(
        "/serverinfo",
        ok_xml("<appversion>7.1.431.0</appversion><hostname>tls-host</hostname>"),
    )]);
    let (tls_addr, _real_cert) = spawn_tls_host(tls_routes).await;

    let http_routes = HashMap::from([(
        "/serverinfo",
        ok_xml("<appversion>7.1.431.0</appversion><hostname>http-host</hostname>"),
    )]);
    let http_addr = spawn_plain_host(http_routes).await;

    // Pin a certificate the TLS host does not present: its identity has
    // "changed", which must route us to HTTP so the user can re-pair.
    let address = AddressTuple::new("127.0.0.1", http_addr.port())?;
    let client = HostClient::new(
        &address,
        tls_addr.port(),
        Some(vec![0x30, 0x03, 0x0A, 0x01, 0x00]),
        identity(),
    )?;

    let info = client.server_info().await?;
    assert!(info.contains("http-host"));
    Ok(())
}

#[tokio::test]
async fn pair_state_trusts_the_host_only_with_a_pin() -> anyhow::Result<()> {
    let routes = HashMap::from([(
        "/serverinfo",
        ok_xml("<appversion>7.1.431.0</appversion><PairStatus>1</PairStatus>"),
    )]);
    let (addr, cert) = spawn_tls_host(routes).await;

    let client = pinned_client(addr, cert);
    assert_eq!(client.pair_state().await?, gamelink_core::PairState::Paired);

    // Same claim without a pinned certificate reads as not paired.
    let client = HostClient::new(
        &AddressTuple::new("127.0.0.1", addr.port())?,
        addr.port(),
        None,
        identity(),
    )?;
    let claimed = ok_xml("<appversion>7.1.431.0</appversion><PairStatus>1</PairStatus>");
    assert_eq!(
        client.pair_state_from(&claimed)?,
        gamelink_core::PairState::NotPaired
    );
    Ok(())
}

#[tokio::test]
async fn launch_reports_host_refusal() -> anyhow::Result<()> {
    let routes = HashMap::from([("/launch", ok_xml("<gamesession>0</gamesession>"))]);
    let (addr, cert) = spawn_tls_host(routes).await;

    let session = pinned_client(addr, cert)
        .launch_app(
            &gamelink_core::StreamConfiguration::default(),
            42,
            &gamelink_core::SessionKeyMaterial::generate(),
        )
        .await?;
    assert!(session.is_none());
    Ok(())
}

#[tokio::test]
async fn launch_returns_session_url() -> anyhow::Result<()> {
    let routes = HashMap::from([(
        "/launch",
        ok_xml("<gamesession>1</gamesession><sessionUrl0>rtsp://192.0.2.1:48010</sessionUrl0>"),
    )]);
    let (addr, cert) = spawn_tls_host(routes).await;

    let session = pinned_client(addr, cert)
        .launch_app(
            &gamelink_core::StreamConfiguration::default(),
            42,
            &gamelink_core::SessionKeyMaterial::generate(),
        )
        .await?
        .expect("session started");
    assert_eq!(
        session.rtsp_session_url.as_deref(),
        Some("rtsp://192.0.2.1:48010")
    );
    Ok(())
}
