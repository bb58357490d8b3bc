//! NDJSON framing for worker stdio streams.
//!
//! Inbound: one line per response, capped at [`MAX_LINE_BYTES`]. Blank
//! keep-alive lines a worker may print between responses are consumed here
//! and never reach the reader. Outbound: one request per line; a request
//! carrying a raw newline would split into two frames and is refused.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line framing for one worker connection.
///
/// An oversized inbound line decodes to [`AppError::Protocol`]; the rest of it
/// is discarded and decoding resumes at the next newline, so the reader can
/// skip it and carry on. I/O failures become [`AppError::Io`].
#[derive(Debug)]
pub struct WorkerCodec {
    lines: LinesCodec,
}

impl WorkerCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }

    fn next_frame(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<String>> {
        loop {
            let line = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };
            match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(frame) => return Ok(frame),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Err(AppError::Protocol(format!(
                        "worker line too long: exceeded {MAX_LINE_BYTES} bytes"
                    )));
                }
                Err(LinesCodecError::Io(err)) => return Err(AppError::Io(err.to_string())),
            }
        }
    }
}

impl Default for WorkerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WorkerCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        self.next_frame(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        self.next_frame(src, true)
    }
}

impl Encoder<String> for WorkerCodec {
    type Error = AppError;

    fn encode(&mut self, request: String, dst: &mut BytesMut) -> Result<()> {
        if request.contains(['\n', '\r']) {
            return Err(AppError::Protocol("worker request contains a line break".into()));
        }
        dst.reserve(request.len() + 1);
        dst.put_slice(request.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
