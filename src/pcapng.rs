//! Interposes between the capture process's stdout and the websocket frame
//! sink, injecting capture-target metadata into the pcap-ng stream.
//!
//! Every section header and interface description block passing through
//! gets a comment option describing the capture target (kind, name, prefix,
//! filter, promiscuity), so the stream a client records stays
//! self-describing. All other bytes pass through verbatim and block framing
//! is preserved exactly.
//!
//! Feeding anything that is not a pcap-ng stream is a programming error on
//! the producer's side, never a runtime failure: the editor turns itself
//! transparent and forwards everything unchanged.

use crate::types::Target;

/// Block type of the section header block; its byte sequence reads the same
/// in both byte orders.
const SHB_TYPE: u32 = 0x0A0D_0D0A;

/// Block type of the interface description block.
const IDB_TYPE: u32 = 0x0000_0001;

/// Byte-order magic inside the section header body.
const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;

/// Option code of `opt_comment`, valid in every block type.
const OPT_COMMENT: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            Self::Little => u32::from_le_bytes(raw),
            Self::Big => u32::from_be_bytes(raw),
        }
    }

    fn put_u32(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    fn put_u16(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

/// An incremental pcap-ng stream rewriter. Chunks fed in may split blocks
/// at arbitrary byte boundaries; output is emitted in whole blocks.
pub struct StreamEditor {
    metadata: String,
    buf: Vec<u8>,
    endian: Option<Endian>,
    transparent: bool,
}

impl StreamEditor {
    pub fn new(target: &Target, filter: Option<&str>, no_promiscuous: bool) -> Self {
        let metadata = serde_json::json!({
            "type": target.kind,
            "name": target.name,
            "prefix": target.prefix,
            "filter": filter,
            "non-promiscuous": no_promiscuous,
        })
        .to_string();
        Self {
            metadata,
            buf: Vec::new(),
            endian: None,
            transparent: false,
        }
    }

    /// Consumes one chunk of capture output and returns the (possibly
    /// rewritten) bytes ready for the wire.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.transparent {
            return chunk.to_vec();
        }
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buf.len() < 12 {
                break;
            }
            // The section header's type is byte-order independent; it also
            // (re)determines the endianness of everything that follows.
            if u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) == SHB_TYPE
            {
                match self.detect_endian() {
                    Some(endian) => self.endian = Some(endian),
                    None => return self.go_transparent(out),
                }
            }
            let Some(endian) = self.endian else {
                // Stream does not start with a section header: not pcap-ng.
                return self.go_transparent(out);
            };
            let total_len = endian.u32(&self.buf[4..8]) as usize;
            if total_len < 12 || total_len % 4 != 0 {
                return self.go_transparent(out);
            }
            if self.buf.len() < total_len {
                break;
            }
            let block: Vec<u8> = self.buf.drain(..total_len).collect();
            match endian.u32(&block[0..4]) {
                SHB_TYPE => out.extend(self.inject(&block, 24, endian)),
                IDB_TYPE => out.extend(self.inject(&block, 16, endian)),
                _ => out.extend(block),
            }
        }
        out
    }

    /// Reads the byte-order magic of the section header currently at the
    /// start of the buffer.
    fn detect_endian(&self) -> Option<Endian> {
        let magic = &self.buf[8..12];
        if u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]) == BYTE_ORDER_MAGIC {
            Some(Endian::Little)
        } else if u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]) == BYTE_ORDER_MAGIC {
            Some(Endian::Big)
        } else {
            None
        }
    }

    /// Switches into pass-through mode, flushing whatever is buffered.
    fn go_transparent(&mut self, mut out: Vec<u8>) -> Vec<u8> {
        tracing::error!("capture output is not a pcap-ng stream, passing through unmodified");
        self.transparent = true;
        out.append(&mut self.buf);
        out
    }

    /// Rebuilds a block with a metadata comment option inserted at the
    /// start of its options area (`opts_start` is the offset of that area
    /// within the block). Both total-length fields are rewritten; all other
    /// bytes stay exactly as they were.
    fn inject(&self, block: &[u8], opts_start: usize, endian: Endian) -> Vec<u8> {
        let total_len = block.len();
        if opts_start > total_len - 4 {
            // Malformed fixed part; leave the block alone.
            return block.to_vec();
        }
        let mut option = Vec::with_capacity(4 + self.metadata.len() + 3);
        option.extend(endian.put_u16(OPT_COMMENT));
        option.extend(endian.put_u16(self.metadata.len() as u16));
        option.extend(self.metadata.as_bytes());
        while option.len() % 4 != 0 {
            option.push(0);
        }
        let had_options = opts_start < total_len - 4;
        let new_len =
            (total_len + option.len() + if had_options { 0 } else { 4 }) as u32;

        let mut out = Vec::with_capacity(new_len as usize);
        out.extend(&block[0..4]);
        out.extend(endian.put_u32(new_len));
        out.extend(&block[8..opts_start]);
        out.extend(&option);
        if had_options {
            // The existing options area keeps its own end-of-options
            // terminator.
            out.extend(&block[opts_start..total_len - 4]);
        } else {
            // A previously option-less block now needs the terminator.
            out.extend([0u8; 4]);
        }
        out.extend(endian.put_u32(new_len));
        out
    }
}
