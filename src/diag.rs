//! Collects the stderr output of the capture process and distills it into a
//! short reason text fit for a websocket close frame.
//!
//! The capture program prefixes its actual error messages with a well-known
//! literal and mixes them with assorted chatter. The first prefixed line
//! freezes the reason; everything else is only logged for debugging.

use crate::config::STDERR_CAPTURE_PREFIX;

/// Line-assembles stderr chunks from the capture process and records the
/// first authoritative error line as the failure reason.
#[derive(Debug)]
pub struct DiagnosticCollector {
    /// Connection id, purely for log correlation.
    conn_id: String,
    /// The line being assembled, or the frozen reason once complete.
    line: String,
    /// No more reason gathering once a prefixed line has completed.
    frozen: bool,
}

impl DiagnosticCollector {
    pub fn new(conn_id: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            line: String::new(),
            frozen: false,
        }
    }

    /// Consumes one chunk of stderr output. Chunks may split lines at
    /// arbitrary points; carriage returns are discarded since the line feed
    /// alone terminates a line.
    pub fn write(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk).replace('\r', "");
        let mut rest = text.as_str();
        while let Some(i) = rest.find('\n') {
            if self.frozen {
                // Reason already frozen; all further lines are mumbling.
                tracing::debug!(conn = %self.conn_id, "capture process mumble: {}", &rest[..i]);
            } else {
                self.line.push_str(&rest[..i]);
                if self.line.starts_with(STDERR_CAPTURE_PREFIX) {
                    // First complete error line; freeze it as the reason.
                    self.frozen = true;
                    tracing::error!(conn = %self.conn_id, "capture process: {}", self.line);
                } else {
                    // Just chatter, throw it away and keep looking.
                    tracing::debug!(conn = %self.conn_id, "capture process: {}", self.line);
                    self.line.clear();
                }
            }
            rest = &rest[i + 1..];
        }
        if !self.frozen {
            self.line.push_str(rest);
        }
    }

    /// The reason why the capture process failed, with the well-known prefix
    /// stripped to keep it short; empty when no authoritative error line was
    /// ever seen. Callers may truncate further for close frames.
    pub fn reason(&self) -> String {
        if !self.frozen {
            return String::new();
        }
        self.line
            .strip_prefix(STDERR_CAPTURE_PREFIX)
            .unwrap_or(&self.line)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> DiagnosticCollector {
        DiagnosticCollector::new("test-conn")
    }

    #[test]
    fn test_reason_from_single_chunk() {
        let mut c = collector();
        c.write(b"dumpcap: Interface 'eth9' does not exist\n");
        assert_eq!(c.reason(), "Interface 'eth9' does not exist");
    }

    #[test]
    fn test_reason_reassembled_across_chunks() {
        let mut c = collector();
        c.write(b"dumpcap: Interf");
        c.write(b"ace 'eth9' does ");
        c.write(b"not exist\nmore noise\n");
        assert_eq!(c.reason(), "Interface 'eth9' does not exist");
    }

    #[test]
    fn test_noise_lines_are_discarded() {
        let mut c = collector();
        c.write(b"Capturing on 'eth0'\n");
        c.write(b"File: -\n");
        assert_eq!(c.reason(), "");
        c.write(b"dumpcap: The capture session could not be initiated\n");
        assert_eq!(c.reason(), "The capture session could not be initiated");
    }

    #[test]
    fn test_first_prefixed_line_wins() {
        let mut c = collector();
        c.write(b"dumpcap: first error\ndumpcap: second error\n");
        assert_eq!(c.reason(), "first error");
    }

    #[test]
    fn test_carriage_returns_stripped() {
        let mut c = collector();
        c.write(b"dumpcap: permission denied\r\n");
        assert_eq!(c.reason(), "permission denied");
    }

    #[test]
    fn test_unterminated_tail_not_recorded() {
        let mut c = collector();
        c.write(b"dumpcap: still going");
        assert_eq!(c.reason(), "");
        c.write(b"\n");
        assert_eq!(c.reason(), "still going");
    }

    #[test]
    fn test_noise_then_split_reason() {
        let mut c = collector();
        c.write(b"Capturing on 'any'\ndumpcap: cap");
        c.write(b"ture filter invalid\n");
        assert_eq!(c.reason(), "capture filter invalid");
    }

    #[test]
    fn test_empty_input() {
        let mut c = collector();
        c.write(b"");
        assert_eq!(c.reason(), "");
    }
}
