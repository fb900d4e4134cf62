//! Integration tests for the capture service: plain HTTP endpoints, the
//! close behavior of rejected capture requests, and (where the environment
//! permits switching network namespaces) full end-to-end captures against a
//! fake capture program.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capwire::api::create_router;
use capwire::config::Config;
use capwire::state::AppState;
use futures::{SinkExt, StreamExt};
use nix::sched::CloneFlags;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Serves the capture service on an ephemeral port.
async fn serve(config: Config) -> SocketAddr {
    let app = create_router(AppState::new(config));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Percent-encodes a query parameter value.
fn encode(value: &str) -> String {
    let mut out = String::new();
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Reads frames until the server's close frame arrives, returning its code
/// and reason plus all binary payload received on the way.
async fn read_until_close(ws: &mut WsStream) -> (u16, String, Vec<u8>) {
    let mut payload = Vec::new();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(15), ws.next())
            .await
            .expect("timed out waiting for close frame")
            .expect("connection ended without close frame")
            .expect("websocket error before close frame");
        match msg {
            Message::Binary(data) => payload.extend(data),
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((1005, String::new()));
                return (code, reason, payload);
            }
            _ => {}
        }
    }
}

async fn connect(addr: SocketAddr, query: &str) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/capture?{query}"))
        .await
        .expect("websocket upgrade failed");
    ws
}

/// Whether this environment may switch network namespaces at all; probed on
/// a scratch thread so nothing else is affected.
fn can_setns() -> bool {
    std::thread::spawn(|| {
        let own = std::fs::File::open("/proc/self/ns/net")?;
        nix::sched::setns(&own, CloneFlags::CLONE_NEWNET)
            .map_err(|err| std::io::Error::other(err.to_string()))
    })
    .join()
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

fn own_netns_inode() -> u64 {
    nix::sys::stat::stat("/proc/self/ns/net").unwrap().st_ino
}

/// Drops a fake capture program into `dir` and returns its path.
fn fake_capture_program(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("fake-dumpcap");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// ── Plain HTTP ──────────────────────────────────────────────────

#[tokio::test]
async fn test_version_endpoint() {
    let addr = serve(Config::default()).await;
    let json: serde_json::Value = reqwest::get(format!("http://{addr}/version"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["name"], "capwire");
    assert!(json["version"].as_str().is_some());
}

// ── Rejected capture requests ───────────────────────────────────

#[tokio::test]
async fn test_mutually_exclusive_parameters_close_reason() {
    let addr = serve(Config::default()).await;
    let query = format!("container={}&netns=42", encode("{}"));
    let mut ws = connect(addr, &query).await;
    let (code, reason, _) = read_until_close(&mut ws).await;
    assert_eq!(code, 1011);
    assert_eq!(
        reason,
        "container and netns query parameters are mutually exclusive"
    );
}

#[tokio::test]
async fn test_unknown_namespace_close_reason() {
    let addr = serve(Config::default()).await;
    let mut ws = connect(addr, "netns=42").await;
    let (code, reason, _) = read_until_close(&mut ws).await;
    assert_eq!(code, 1011);
    assert_eq!(reason, "could not locate network namespace for container");
}

#[tokio::test]
async fn test_header_mirror_merges_into_parameters() {
    // A container header plus a netns query parameter must trip the mutual
    // exclusion check, proving the header mirror is honored.
    let addr = serve(Config::default()).await;
    let mut request = format!("ws://{addr}/capture?netns=42")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("clustershark-container", "{}".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();
    let (_, reason, _) = read_until_close(&mut ws).await;
    assert_eq!(
        reason,
        "container and netns query parameters are mutually exclusive"
    );
}

#[tokio::test]
async fn test_stale_target_consults_discovery() {
    // A vanished witness pid forces a discovery refresh; with no discovery
    // service reachable the session must fail loudly instead of capturing
    // from the stale inode.
    let config = Config {
        discovery_port: 1,
        ..Config::default()
    };
    let addr = serve(config).await;
    let container = r#"{"netns":4026532000,"pid":999999999,"starttime":5,"name":"web"}"#;
    let query = format!("container={}", encode(container));
    let mut ws = connect(addr, &query).await;
    let (code, reason, _) = read_until_close(&mut ws).await;
    assert_eq!(code, 1011);
    assert!(
        reason.starts_with("cannot update container meta data:"),
        "unexpected reason: {reason}"
    );
}

// ── End-to-end captures (need namespace switching) ──────────────

#[tokio::test]
async fn test_capture_streams_child_output_and_closes_normally() {
    if !can_setns() {
        eprintln!("skipping: cannot switch network namespaces here");
        return;
    }
    let tmp = tempfile::TempDir::new().unwrap();
    let program = fake_capture_program(tmp.path(), "printf 'ABCDE'\nexit 0");
    let addr = serve(Config {
        capture_program: program,
        ..Config::default()
    })
    .await;

    let mut ws = connect(addr, &format!("netns={}", own_netns_inode())).await;
    let (code, reason, payload) = read_until_close(&mut ws).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "capture process terminated");
    assert_eq!(payload, b"ABCDE");
}

#[tokio::test]
async fn test_capture_passes_arguments_and_promiscuity_opt_out() {
    if !can_setns() {
        eprintln!("skipping: cannot switch network namespaces here");
        return;
    }
    let tmp = tempfile::TempDir::new().unwrap();
    let args_file = tmp.path().join("argv");
    let program = fake_capture_program(
        tmp.path(),
        &format!("echo \"$@\" > {}\nexit 0", args_file.display()),
    );
    let addr = serve(Config {
        capture_program: program,
        ..Config::default()
    })
    .await;

    let query = format!(
        "netns={}&chaste=1&nif=eth0/eth1&filter={}",
        own_netns_inode(),
        encode("tcp port 80")
    );
    let mut ws = connect(addr, &query).await;
    let (_, reason, _) = read_until_close(&mut ws).await;
    assert_eq!(reason, "capture process terminated");

    let argv = std::fs::read_to_string(&args_file).unwrap();
    assert_eq!(argv.trim(), "-w - -n -q -p -i eth0 -i eth1 -f tcp port 80");
}

#[tokio::test]
async fn test_capture_process_error_is_surfaced_in_close_reason() {
    if !can_setns() {
        eprintln!("skipping: cannot switch network namespaces here");
        return;
    }
    let tmp = tempfile::TempDir::new().unwrap();
    let program = fake_capture_program(
        tmp.path(),
        "echo \"dumpcap: Interface 'eth9' does not exist\" >&2\nexit 1",
    );
    let addr = serve(Config {
        capture_program: program,
        ..Config::default()
    })
    .await;

    let mut ws = connect(addr, &format!("netns={}", own_netns_inode())).await;
    let (code, reason, _) = read_until_close(&mut ws).await;
    assert_eq!(code, 1011);
    assert_eq!(reason, "Interface 'eth9' does not exist");
}

#[tokio::test]
async fn test_client_initiated_close_terminates_capture() {
    if !can_setns() {
        eprintln!("skipping: cannot switch network namespaces here");
        return;
    }
    let tmp = tempfile::TempDir::new().unwrap();
    let program = fake_capture_program(
        tmp.path(),
        "trap 'exit 0' TERM\nwhile true; do printf x; sleep 0.1; done",
    );
    let addr = serve(Config {
        capture_program: program,
        ..Config::default()
    })
    .await;

    let mut ws = connect(addr, &format!("netns={}", own_netns_inode())).await;

    // Wait for the capture to actually stream before closing it.
    let first = tokio::time::timeout(Duration::from_secs(15), ws.next())
        .await
        .expect("timed out waiting for capture data")
        .unwrap()
        .unwrap();
    assert!(matches!(first, Message::Binary(_)));

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    })))
    .await
    .unwrap();

    // The server acknowledges the close and terminates the capture process;
    // the acknowledgement carries the client's close code back.
    let mut acked = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(15), ws.next())
            .await
            .expect("timed out waiting for close acknowledgement")
        {
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1005);
                assert_eq!(code, 1000);
                acked = true;
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }
    assert!(acked, "no close acknowledgement received");
}
