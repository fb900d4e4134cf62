//! The `/capture` endpoint: upgrades the connection to a websocket, resolves
//! the capture target, and couples a freshly spawned capture process inside
//! the target's network namespace to the websocket until either side ends
//! the session.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use caps::Capability;
use nix::sched::CloneFlags;

use crate::conn::{CaptureConn, CLOSE_FAILURE, CLOSE_NORMAL};
use crate::diag::DiagnosticCollector;
use crate::error::CaptureError;
use crate::netns::{netns_path, NetnsPin};
use crate::params::{self, CaptureArgs};
use crate::pcapng::StreamEditor;
use crate::sink::FrameSink;
use crate::state::AppState;

/// Handles the websocket upgrade on `/capture`. The capture parameters may
/// arrive as query parameters or as their header mirrors; both are handed to
/// the parameter resolver once the upgrade went through.
pub async fn capture_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_session(state, socket, params, headers))
}

/// One full capture session, from upgrade to joined teardown.
async fn run_session(
    state: Arc<AppState>,
    socket: WebSocket,
    params: HashMap<String, String>,
    headers: HeaderMap,
) {
    let started = Instant::now();
    let (conn, stream) = CaptureConn::new(socket);
    tracing::debug!(conn = %conn.id, "capture session started");

    let args = match params::resolve(&state, params, &headers).await {
        Ok(args) => args,
        Err(err) => {
            tracing::error!(conn = %conn.id, error = %err, "capture parameters rejected");
            conn.gracefully_close(stream, CLOSE_FAILURE, &err.close_reason())
                .await;
            return;
        }
    };
    let target = &args.target;
    tracing::debug!(
        conn = %conn.id,
        kind = %target.kind,
        name = %target.qualified_name(),
        interfaces = ?target.network_interfaces,
        filter = ?args.filter,
        "capture target resolved"
    );

    let Some(path) = netns_path(target.netns, &state.config.proc_root) else {
        let err = CaptureError::NamespaceNotFound;
        tracing::error!(conn = %conn.id, netns = target.netns, "{err}");
        conn.gracefully_close(stream, CLOSE_FAILURE, &err.close_reason())
            .await;
        return;
    };
    tracing::debug!(conn = %conn.id, netns = target.netns, path = %path.display(), "network namespace referenced");

    // Pin the target network namespace before anything else happens, so it
    // cannot vanish between validation and the namespace switch. The pin
    // lives to the end of the session.
    let pin = match NetnsPin::open(target, &path, &state.config.proc_root) {
        Ok(pin) => pin,
        Err(err) => {
            tracing::error!(conn = %conn.id, netns = target.netns, error = %err, "cannot pin network namespace");
            conn.gracefully_close(stream, CLOSE_FAILURE, &err.close_reason())
                .await;
            return;
        }
    };

    let argv = capture_argv(&args);
    tracing::debug!(conn = %conn.id, ?argv, "starting capture process");
    let mut child = match spawn_in_netns(&conn.id, &pin, &state.config.capture_program, &argv).await
    {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(conn = %conn.id, error = %err, "capture process start failed");
            conn.initiate_graceful_close(CLOSE_FAILURE, &err.close_reason())
                .await;
            conn.watch(stream).await;
            return;
        }
    };
    conn.attach_child(child.id());

    // Wire the capture process's stdout through the pcap-ng metadata editor
    // into the websocket, and its stderr into the diagnostic collector. The
    // pipe reads are blocking, so each pump runs off the async runtime.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let sink = Arc::new(FrameSink::new(Arc::clone(&conn)));
    let mut editor = StreamEditor::new(target, args.filter.as_deref(), args.no_promiscuous);

    let (data_tx, mut data_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    let stdout_pump = tokio::task::spawn_blocking(move || {
        let Some(mut stdout) = stdout else { return };
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let out = editor.feed(&buf[..n]);
                    if !out.is_empty() && data_tx.blocking_send(out).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    let sink_task = tokio::spawn({
        let sink = Arc::clone(&sink);
        async move {
            while let Some(data) = data_rx.recv().await {
                sink.write(data).await;
            }
        }
    });
    let stderr_pump = tokio::task::spawn_blocking({
        let mut collector = DiagnosticCollector::new(conn.id.clone());
        move || {
            let Some(mut stderr) = stderr else {
                return collector;
            };
            let mut buf = vec![0u8; 4 * 1024];
            loop {
                match stderr.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => collector.write(&buf[..n]),
                    Err(_) => break,
                }
            }
            collector
        }
    });

    // The watcher runs until the websocket is fully closed, gracefully or
    // not, and terminates the capture process on its way out if nothing else
    // has done so before.
    let watcher = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move { conn.watch(stream).await }
    });

    // The waiter: wait for the capture process to exit, drain its streams,
    // then initiate a graceful close reporting the termination cause. The
    // close is a no-op if the websocket is already closing or closed.
    let status = tokio::task::spawn_blocking(move || child.wait()).await;
    let _ = stdout_pump.await;
    let _ = sink_task.await;
    let collector = stderr_pump
        .await
        .unwrap_or_else(|_| DiagnosticCollector::new(conn.id.clone()));

    match status {
        Ok(Ok(status)) if status.success() => {
            tracing::debug!(conn = %conn.id, "capture process terminated successfully");
            conn.initiate_graceful_close(CLOSE_NORMAL, "capture process terminated")
                .await;
        }
        status => {
            match &status {
                Ok(Ok(status)) => {
                    tracing::error!(conn = %conn.id, %status, "capture process failure")
                }
                Ok(Err(err)) => {
                    tracing::error!(conn = %conn.id, error = %err, "capture process wait failed")
                }
                Err(err) => {
                    tracing::error!(conn = %conn.id, error = %err, "capture process waiter died")
                }
            }
            let mut reason = collector.reason();
            if reason.is_empty() && !sink.failed() {
                reason = "capture process failed".into();
            }
            if reason.is_empty() {
                // The websocket is broken anyway; a generic goodbye is all
                // that is left to say.
                conn.initiate_graceful_close(CLOSE_NORMAL, "ciao").await;
            } else {
                conn.initiate_graceful_close(CLOSE_FAILURE, &reason).await;
            }
        }
    }

    let _ = watcher.await;
    tracing::debug!(conn = %conn.id, elapsed = ?started.elapsed(), "capture session finished");
}

/// Assembles the capture program's argument vector: stream to stdout, no
/// name resolution, quiet, optionally non-promiscuous, one `-i` per
/// interface and finally the optional capture filter.
fn capture_argv(args: &CaptureArgs) -> Vec<String> {
    let mut argv: Vec<String> = vec!["-w".into(), "-".into(), "-n".into(), "-q".into()];
    if args.no_promiscuous {
        // Applies to all interfaces, so it has to come before the list.
        argv.push("-p".into());
    }
    for nif in &args.target.network_interfaces {
        argv.push("-i".into());
        argv.push(nif.clone());
    }
    if let Some(filter) = &args.filter {
        argv.push("-f".into());
        argv.push(filter.clone());
    }
    argv
}

/// Starts the capture program attached to the pinned network namespace.
///
/// The namespace switch happens on a dedicated thread spawned straight from
/// the operating system: runtime worker threads are shared between tasks and
/// must never change their network namespace. The thread switches, promotes
/// the capture capabilities into its ambient set, spawns the child (which
/// inherits namespace and ambient set across fork and exec), and exits.
async fn spawn_in_netns(
    conn_id: &str,
    pin: &NetnsPin,
    program: &Path,
    argv: &[String],
) -> Result<std::process::Child, CaptureError> {
    let fd = pin
        .dup_fd()
        .map_err(|err| CaptureError::NamespaceSwitch(err.to_string()))?;
    let inode = pin.inode();
    let conn_id = conn_id.to_string();
    let program = program.to_path_buf();
    let argv = argv.to_vec();
    tokio::task::spawn_blocking(move || {
        std::thread::spawn(move || {
            nix::sched::setns(&fd, CloneFlags::CLONE_NEWNET)
                .map_err(|err| CaptureError::NamespaceSwitch(err.to_string()))?;
            tracing::debug!(conn = %conn_id, netns = inode, "spawn thread switched into target network stack");
            crate::ambient::raise_ambient(&[Capability::CAP_NET_ADMIN, Capability::CAP_NET_RAW])?;
            std::process::Command::new(&program)
                .args(&argv)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| CaptureError::Spawn(err.to_string()))
        })
        .join()
        .unwrap_or_else(|_| Err(CaptureError::Spawn("spawn thread panicked".into())))
    })
    .await
    .map_err(|err| CaptureError::Spawn(err.to_string()))?
}
