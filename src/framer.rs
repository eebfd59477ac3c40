//! Reassembles discrete JSON messages from an arbitrarily fragmented byte
//! stream.
//!
//! TCP gives no message boundaries, so the peer's writes can arrive glued
//! together or split mid-token. The framer scans bytes with a brace-depth
//! counter, tracking string literals and escapes so braces inside strings
//! (including base64 payloads and file names) never confuse the count.
//! Every time the depth returns to zero a complete object has been seen
//! and is handed to the protocol decoder.

use tracing::{debug, error, warn};

use crate::protocol::{self, Message, MAX_MESSAGE_SIZE};

#[derive(Default)]
pub struct MessageFramer {
    buf: Vec<u8>,
    /// Scan cursor: bytes before this offset have already been examined.
    pos: usize,
    /// Offset of the `{` opening the message currently being scanned.
    start: usize,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered but not yet emitted as messages.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append freshly read bytes and return every message completed by them.
    ///
    /// A frame that fails to decode is logged and dropped; scanning resumes
    /// at the next byte, so one bad frame never corrupts its successors.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Message> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            if self.escaped {
                self.escaped = false;
            } else if self.in_string {
                match b {
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' => {
                        if self.depth == 0 {
                            self.start = self.pos;
                        }
                        self.depth += 1;
                    }
                    b'}' => {
                        if self.depth > 0 {
                            self.depth -= 1;
                            if self.depth == 0 {
                                let frame = &self.buf[self.start..=self.pos];
                                match protocol::decode(frame) {
                                    Ok(Some(msg)) => out.push(msg),
                                    Ok(None) => debug!("ignoring message with unknown event"),
                                    Err(e) => {
                                        warn!(error = %e, len = frame.len(), "dropping undecodable frame")
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            self.pos += 1;
        }

        self.compact();
        out
    }

    /// Drop consumed bytes. With the scanner at depth zero everything seen
    /// so far is either emitted or inter-message filler; otherwise keep the
    /// partial message from its opening brace.
    fn compact(&mut self) {
        if self.depth == 0 {
            self.buf.clear();
            self.pos = 0;
            self.start = 0;
            self.in_string = false;
            self.escaped = false;
        } else {
            if self.start > 0 {
                self.buf.drain(..self.start);
                self.pos -= self.start;
                self.start = 0;
            }
            if self.buf.len() > MAX_MESSAGE_SIZE {
                error!(
                    buffered = self.buf.len(),
                    "partial message exceeds size cap, resetting stream scanner"
                );
                self.buf.clear();
                self.pos = 0;
                self.start = 0;
                self.depth = 0;
                self.in_string = false;
                self.escaped = false;
            }
        }
    }
}
