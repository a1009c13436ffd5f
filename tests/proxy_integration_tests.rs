//! End-to-end tests over real sockets: plaintext and TLS relay,
//! redaction, reload semantics, upstream refusal, capture output.

use flagwall::capture::CaptureWriter;
use flagwall::config::{Config, ProxyConfig, TlsConfig};
use flagwall::net::{run_accept_loop, Listener};
use flagwall::state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const FLAG: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ01234=";

fn base_config(upstream_port: u16) -> Config {
    Config {
        proxy: ProxyConfig {
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            upstream_host: "127.0.0.1".into(),
            upstream_port,
            backlog: 8,
            fd_limit: 16384,
            idle_timeout_secs: None,
            log_level: "info".into(),
        },
        tls: None,
        capture: Default::default(),
        filters: Default::default(),
    }
}

async fn start_proxy(cfg: Config, config_path: Option<PathBuf>) -> (Arc<AppState>, SocketAddr) {
    let (reload_tx, reload_rx) = mpsc::channel(4);
    let capture = if cfg.capture.enabled {
        Some(Arc::new(CaptureWriter::new(&cfg.capture).unwrap()))
    } else {
        None
    };
    let state =
        Arc::new(AppState::new(cfg.clone(), capture, reload_tx, config_path, None).unwrap());
    let listener = Listener::build(&cfg).unwrap();
    let addr = listener.local_addr();
    tokio::spawn(run_accept_loop(listener, state.clone(), reload_rx));
    (state, addr)
}

/// Scripted backend: answers every read with the same canned response.
async fn start_upstream(response: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let response = response.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if sock.write_all(&response).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn exchange(stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin), req: &[u8]) -> Vec<u8> {
    stream.write_all(req).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("response timed out")
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn flag_in_response_is_redacted_end_to_end() {
    let mut response = b"the secret is ".to_vec();
    response.extend_from_slice(FLAG);
    response.extend_from_slice(b" done\n");
    let upstream = start_upstream(response).await;

    let (_state, addr) = start_proxy(base_config(upstream.port()), None).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let got = exchange(&mut client, b"GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(got, b"the secret is FLAG_REDACTED done\n");
}

#[tokio::test]
async fn reload_leaves_active_connections_on_old_filters() {
    let mut response = Vec::from(&b"flag "[..]);
    response.extend_from_slice(FLAG);
    response.push(b'\n');
    let upstream = start_upstream(response).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flagwall.toml");
    let write_config = |replacement: &str| {
        std::fs::write(
            &path,
            format!(
                r#"
[proxy]
listenHost = "127.0.0.1"
listenPort = 0
upstreamHost = "127.0.0.1"
upstreamPort = {}

[filters]
flagReplacement = "{replacement}"
"#,
                upstream.port()
            ),
        )
        .unwrap();
    };
    write_config("FIRST_GONE");

    let cfg = flagwall::config::load_from_path(&path).await.unwrap();
    let (state, addr) = start_proxy(cfg, Some(path.clone())).await;

    let mut old_conn = TcpStream::connect(addr).await.unwrap();
    let got = exchange(&mut old_conn, b"one").await;
    assert_eq!(got, b"flag FIRST_GONE\n");

    write_config("SECOND_GONE");
    state.reload().await.unwrap();
    state.reload_tx.send(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The pre-reload connection keeps its snapshot.
    let got = exchange(&mut old_conn, b"two").await;
    assert_eq!(got, b"flag FIRST_GONE\n");

    // A fresh connection sees the new filters; the port never closed.
    let mut new_conn = TcpStream::connect(addr).await.unwrap();
    let got = exchange(&mut new_conn, b"three").await;
    assert_eq!(got, b"flag SECOND_GONE\n");
}

#[tokio::test]
async fn refused_upstream_closes_inbound_and_spares_others() {
    // Grab a port that nothing listens on.
    let dead_port = {
        let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        tmp.local_addr().unwrap().port()
    };

    let (_state, addr) = start_proxy(base_config(dead_port), None).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("close timed out");
    assert!(matches!(result, Ok(0) | Err(_)));

    // The listener survives and serves the next client.
    let upstream = start_upstream(b"ok\n".to_vec()).await;
    let (_state2, addr2) = start_proxy(base_config(upstream.port()), None).await;
    let mut client2 = TcpStream::connect(addr2).await.unwrap();
    assert_eq!(exchange(&mut client2, b"hi").await, b"ok\n");
}

#[tokio::test]
async fn tls_terminated_relay_redacts() {
    use rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    let mut response = Vec::from(&b"tls "[..]);
    response.extend_from_slice(FLAG);
    response.push(b'\n');
    let upstream = start_upstream(response).await;

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

    let mut cfg = base_config(upstream.port());
    cfg.tls = Some(TlsConfig {
        cert_path,
        key_path,
        ca_path: None,
        alpn_protocols: vec!["http/1.1".into()],
        upstream_tls: false,
    });
    let (_state, addr) = start_proxy(cfg, None).await;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    let client_cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_cfg));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut stream = connector.connect(name, tcp).await.unwrap();

    let got = exchange(&mut stream, b"GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(got, b"tls FLAG_REDACTED\n");
}

#[tokio::test]
async fn capture_records_the_decrypted_exchange() {
    use pcap_file::pcap::PcapReader;

    let upstream = start_upstream(b"pong\n".to_vec()).await;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_config(upstream.port());
    cfg.capture.enabled = true;
    cfg.capture.directory = dir.path().to_path_buf();
    cfg.capture.service_name = "e2e".into();
    let (state, addr) = start_proxy(cfg, None).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(exchange(&mut client, b"ping\n").await, b"pong\n");
    drop(client);

    // Give the handler a moment to flush the FIN teardown.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let path = state.capture.as_ref().unwrap().rotate().unwrap();
    let mut reader = PcapReader::new(std::fs::File::open(&path).unwrap()).unwrap();
    let mut payloads = Vec::new();
    let mut count = 0;
    while let Some(pkt) = reader.next_packet() {
        let pkt = pkt.unwrap();
        payloads.extend_from_slice(&pkt.data);
        count += 1;
    }
    // Handshake, two data segments, teardown.
    assert!(count >= 8, "expected a full synthetic session, got {count}");
    let haystack = payloads.windows(5).any(|w| w == b"ping\n");
    assert!(haystack, "request payload missing from capture");
}
