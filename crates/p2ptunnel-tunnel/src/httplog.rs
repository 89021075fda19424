//! Diagnostic tap that echoes an HTTP-style header block
//!
//! Bytes are copied to the writer until the first `\r\n\r\n`; everything after
//! it (the body) is swallowed. A header split across several `print` calls is
//! handled, and lines ending in a bare `\n` never end the scan.

use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Start,
    Cr,
    CrLf,
    CrLfCr,
    Done,
}

impl ScanState {
    fn advance(self, byte: u8) -> Self {
        match (self, byte) {
            (ScanState::Start, b'\r') => ScanState::Cr,
            (ScanState::Cr, b'\n') => ScanState::CrLf,
            (ScanState::CrLf, b'\r') => ScanState::CrLfCr,
            (ScanState::CrLfCr, b'\n') => ScanState::Done,
            _ => ScanState::Start,
        }
    }
}

#[derive(Debug)]
pub struct HttpHeaderTap<W: Write> {
    out: W,
    state: ScanState,
}

impl<W: Write> HttpHeaderTap<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            state: ScanState::Start,
        }
    }

    /// Start scanning for a new header block
    pub fn reset(&mut self) {
        self.state = ScanState::Start;
    }

    /// Whether the end of the header block has been seen
    pub fn is_done(&self) -> bool {
        self.state == ScanState::Done
    }

    pub fn print(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.is_done() {
            return Ok(());
        }

        let mut end = buf.len();
        for (i, &byte) in buf.iter().enumerate() {
            self.state = self.state.advance(byte);
            if self.is_done() {
                end = i + 1;
                break;
            }
        }

        self.out.write_all(&buf[..end])
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Header block collected in memory, for one direction of one exchange
pub type HeaderCapture = HttpHeaderTap<Vec<u8>>;

impl HeaderCapture {
    pub fn capture() -> Self {
        Self::new(Vec::new())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.out).into_owned()
    }
}
