//! Wraps a server-side websocket connection with its own human-readable id
//! and the close state machine of a capture session.
//!
//! Three independent actors can end a session: the capture process (it
//! terminates or fails to start), the websocket peer (it closes or breaks),
//! and the data path (a write error). The state machine reconciles them:
//!
//! 1. Capture process terminates while the websocket is open: initiate a
//!    graceful close carrying the termination reason, wait for the client's
//!    close acknowledgement in the watcher, then close the socket.
//! 2. Client closes while the websocket is open: acknowledge with a generic
//!    close, terminate the capture process, close the socket.
//! 3. Websocket read error: terminate the capture process, close the socket.
//! 4. Websocket write error on the data path: latched by the frame sink; the
//!    resulting read error drives the actual closure (see 3).
//!
//! The underlying websocket write path is not safe against concurrent
//! writers, so data frames and close frames are serialized through one
//! mutex. The terminate signal for the capture process is one-shot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::seq::SliceRandom;

use crate::config::CLOSING_DEADLINE;
use crate::error::truncate_reason;

/// Close code for a cleanly ended capture.
pub const CLOSE_NORMAL: u16 = close_code::NORMAL;

/// Close code for failed captures. RFC 6455 reserves the abnormal-closure
/// code 1006 for local consumption, and peers reject it on the wire, so
/// failures are reported as a server error instead.
pub const CLOSE_FAILURE: u16 = close_code::ERROR;

/// Lifecycle of the websocket connection, with one-way transitions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Connection is up; data and close frames may still be sent.
    Open,
    /// A close frame went out; awaiting the peer's acknowledgement.
    Closing,
    /// Fully closed; nothing is read or written anymore.
    Closed,
}

/// One-shot terminate latch for the capture process: however many actors ask
/// for termination, the signal is delivered at most once.
#[derive(Debug, Default)]
struct TerminateOnce {
    pid: OnceLock<i32>,
    fired: AtomicBool,
}

impl TerminateOnce {
    fn arm(&self, pid: i32) {
        let _ = self.pid.set(pid);
    }

    /// Returns the armed pid exactly once; `None` before arming and on
    /// every call after the first.
    fn fire(&self) -> Option<i32> {
        let pid = *self.pid.get()?;
        (!self.fired.swap(true, Ordering::SeqCst)).then_some(pid)
    }
}

struct Shared {
    state: ConnState,
    sink: SplitSink<WebSocket, Message>,
}

/// A websocket connection wrapper carrying a unique, human-friendly id, so
/// multiple concurrent capture sessions stay distinguishable in the logs.
/// Owns the write half and the close state; the read half goes to the
/// watcher.
pub struct CaptureConn {
    pub id: String,
    shared: tokio::sync::Mutex<Shared>,
    terminate: TerminateOnce,
}

impl CaptureConn {
    /// Wraps a freshly upgraded websocket. Returns the connection handle and
    /// the read half for [`CaptureConn::watch`].
    pub fn new(socket: WebSocket) -> (Arc<Self>, SplitStream<WebSocket>) {
        let (sink, stream) = socket.split();
        let conn = Arc::new(Self {
            id: generate_id(),
            shared: tokio::sync::Mutex::new(Shared {
                state: ConnState::Open,
                sink,
            }),
            terminate: TerminateOnce::default(),
        });
        (conn, stream)
    }

    /// Associates the spawned capture process with this connection. Its
    /// lifetime is bounded by the connection from here on.
    pub fn attach_child(&self, pid: u32) {
        self.terminate.arm(pid as i32);
    }

    /// Signals the capture process to terminate. Idempotent: the signal is
    /// sent at most once per connection, and not at all while no process is
    /// attached. Returns whether a signal was actually sent.
    pub fn terminate(&self) -> bool {
        let Some(pid) = self.terminate.fire() else {
            return false;
        };
        tracing::debug!(conn = %self.id, pid, "signalling capture process to terminate");
        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(conn = %self.id, pid, error = %err, "capture process already gone");
        }
        true
    }

    /// Sends one chunk of capture data as a single binary message. Returns
    /// `Err` when the connection no longer accepts data frames or the write
    /// failed.
    pub(crate) async fn send_binary(&self, data: Vec<u8>) -> Result<(), ()> {
        let mut shared = self.shared.lock().await;
        if shared.state == ConnState::Closed {
            return Err(());
        }
        shared.sink.send(Message::Binary(data)).await.map_err(|err| {
            tracing::debug!(conn = %self.id, error = %err, "websocket broken");
        })
    }

    /// Watches the websocket for any sign of closing or failure, handling
    /// the close handshake in both directions. Returns once the socket is
    /// fully closed; on the way out the capture process is signalled (at
    /// most once) to terminate.
    pub async fn watch(&self, mut stream: SplitStream<WebSocket>) {
        tracing::debug!(conn = %self.id, "watching websocket connection");
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (f.code, f.reason.into_owned()))
                        .unwrap_or((CLOSE_NORMAL, String::new()));
                    let mut shared = self.shared.lock().await;
                    match shared.state {
                        ConnState::Open => {
                            // Client-initiated close: acknowledge it.
                            shared.state = ConnState::Closed;
                            tracing::debug!(
                                conn = %self.id, code, %reason,
                                "capture client closing"
                            );
                            tracing::debug!(conn = %self.id, "acknowledging close (ciao!)");
                            let ack = Message::Close(Some(CloseFrame {
                                code,
                                reason: "ciao".into(),
                            }));
                            let _ =
                                tokio::time::timeout(CLOSING_DEADLINE, shared.sink.send(ack)).await;
                        }
                        ConnState::Closing => {
                            // The final acknowledgement of our own close.
                            shared.state = ConnState::Closed;
                            tracing::debug!(
                                conn = %self.id, code, %reason,
                                "capture client acknowledged close"
                            );
                        }
                        ConnState::Closed => {}
                    }
                    break;
                }
                // Whatever else the client sends is ignored; we only keep
                // reading to process incoming control messages.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(conn = %self.id, error = %err, "websocket read failed");
                    break;
                }
                None => break,
            }
        }
        // Any way out of the loop means we are done with this connection:
        // release the capture process and the socket.
        self.terminate();
        let mut shared = self.shared.lock().await;
        shared.state = ConnState::Closed;
        let _ = shared.sink.close().await;
        tracing::debug!(conn = %self.id, "websocket closed");
    }

    /// Kicks off a graceful close handshake and returns immediately. The
    /// watcher then finishes the handshake when the client acknowledges. If
    /// already closing or closed, this is a no-op; if the close frame cannot
    /// be sent, the connection is forced closed and the capture process
    /// terminated.
    pub async fn initiate_graceful_close(&self, code: u16, reason: &str) {
        let mut shared = self.shared.lock().await;
        if shared.state != ConnState::Open {
            return;
        }
        let reason = truncate_reason(reason);
        tracing::debug!(conn = %self.id, code, %reason, "beginning graceful websocket close");
        shared.state = ConnState::Closing;
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }));
        let sent = tokio::time::timeout(CLOSING_DEADLINE, shared.sink.send(frame)).await;
        if !matches!(sent, Ok(Ok(()))) {
            tracing::error!(conn = %self.id, "sending graceful close control message failed");
            shared.state = ConnState::Closed;
            let _ = shared.sink.close().await;
            drop(shared);
            self.terminate();
        }
    }

    /// Runs a complete graceful close handshake and only returns once it
    /// has finished (or failed outright). For the early error paths where
    /// no capture process exists yet and nobody else watches the socket.
    pub async fn gracefully_close(&self, stream: SplitStream<WebSocket>, code: u16, reason: &str) {
        if self.state().await != ConnState::Open {
            return;
        }
        self.initiate_graceful_close(code, reason).await;
        self.watch(stream).await;
    }

    pub async fn state(&self) -> ConnState {
        self.shared.lock().await.state
    }
}

/// Generates a random, human-friendly two-word connection id. Not unique by
/// construction and not meant to be: it only has to keep a handful of
/// concurrent sessions apart in the logs.
fn generate_id() -> String {
    const FIRST: &[&str] = &[
        "amber", "brisk", "calm", "dapper", "eager", "fuzzy", "gentle", "humble", "ivory", "jolly",
        "keen", "lively", "mellow", "nimble", "opal", "plucky", "quiet", "rustic", "snug", "tidy",
        "vivid", "wispy", "young", "zesty",
    ];
    const SECOND: &[&str] = &[
        "badger", "crane", "dingo", "eland", "ferret", "gecko", "heron", "ibis", "jackal", "koala",
        "lemur", "marten", "newt", "otter", "pelican", "quail", "raven", "shrew", "tapir", "urchin",
        "vole", "wombat", "yak", "zebu",
    ];
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        FIRST.choose(&mut rng).unwrap(),
        SECOND.choose(&mut rng).unwrap()
    )
}
