//! Pipes the packet capture data stream into the websocket connection as
//! binary messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::conn::CaptureConn;

/// Writes capture output chunks to the websocket, one binary message per
/// chunk. Write errors are never surfaced to the producer: the socket is
/// already beyond saving at that point and the close state machine handles
/// the cleanup, so the sink merely latches the failure and keeps swallowing
/// data until the capture process gets terminated.
pub struct FrameSink {
    conn: Arc<CaptureConn>,
    failed: AtomicBool,
}

impl FrameSink {
    pub fn new(conn: Arc<CaptureConn>) -> Self {
        Self {
            conn,
            failed: AtomicBool::new(false),
        }
    }

    /// Sends one non-empty chunk as a single binary message. The chunk
    /// always counts as fully written, even on failure.
    pub async fn write(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if self.conn.send_binary(data).await.is_err() {
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    /// Whether any data frame write has failed so far. The orchestrator
    /// uses this to attribute a subsequent capture process termination to
    /// the broken socket instead of the process itself.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
