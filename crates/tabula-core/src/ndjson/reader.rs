//! Line reassembly for chunked NDJSON bodies.
//!
//! Network chunks do not respect record boundaries: a record may arrive split
//! across several chunks and one chunk may carry several records. The
//! reassembler keeps the trailing partial record between calls and only ever
//! yields complete lines.

use tracing::warn;

/// Accumulates raw bytes and yields complete newline-terminated lines.
///
/// The retained partial record is bounded by `max_bytes`. When a chunk pushes
/// it past the cap the partial record is dropped and counted as an overflow;
/// reassembly continues with the next clean line.
#[derive(Debug)]
pub struct LineReassembler {
    buf: Vec<u8>,
    max_bytes: usize,
    overflows: u64,
}

impl LineReassembler {
    pub const fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
            overflows: 0,
        }
    }

    /// Feed one chunk and return every line it completed, in order.
    ///
    /// Lines are stripped of `\n` (and a preceding `\r`); blank lines are
    /// skipped. Invalid UTF-8 is replaced rather than rejected so the parser
    /// reports it as a malformed record.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        if let Some(pos) = self.buf[scan_from..].iter().rposition(|b| *b == b'\n') {
            let complete: Vec<u8> = self.buf.drain(..=scan_from + pos).collect();
            lines.extend(
                complete
                    .split(|b| *b == b'\n')
                    .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
                    .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
                    .map(|line| String::from_utf8_lossy(line).into_owned()),
            );
        }

        if self.buf.len() > self.max_bytes {
            warn!(
                buffered = self.buf.len(),
                max = self.max_bytes,
                "NDJSON buffer exceeded cap, dropping partial record"
            );
            self.buf.clear();
            self.overflows += 1;
        }

        lines
    }

    /// Bytes currently held for an incomplete record.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Number of times the cap was breached.
    pub const fn overflow_count(&self) -> u64 {
        self.overflows
    }

    /// Consume the reassembler, returning the incomplete trailing record if
    /// any bytes were left over.
    pub fn finish(self) -> Option<String> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}
