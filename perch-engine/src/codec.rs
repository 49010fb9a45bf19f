//! Line codec: frames a TCP byte stream into IRC lines.
//!
//! Splits on `\r\n`, decodes each line as UTF-8 with lossy replacement, and
//! writes outgoing lines with exactly one `\r\n` terminator.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest line we buffer while waiting for `\r\n`.
/// RFC 2812 says 512 bytes. IRCv3 `message-tags` can push this to 8191.
pub const MAX_LINE_LENGTH: usize = 8191;

#[derive(Debug, Default)]
pub struct LineCodec {
    /// Set after an oversized line was dropped; the remainder up to the next
    /// `\r\n` belongs to it and is skipped too.
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.windows(2).position(|w| w == b"\r\n") else {
                if src.len() > MAX_LINE_LENGTH {
                    if !self.discarding {
                        tracing::warn!(len = src.len(), "dropping oversized IRC line");
                    }
                    // Keep a trailing '\r' in case its '\n' is in the next read.
                    let keep = usize::from(src.last() == Some(&b'\r'));
                    src.advance(src.len() - keep);
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = src.split_to(pos);
            src.advance(2);

            if self.discarding {
                self.discarding = false;
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                // Unterminated tail at EOF.
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // One call is one line on the wire: anything after an embedded
        // CR or LF is not sent.
        let line = line.split(['\r', '\n']).next().unwrap_or_default();
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
