//! Exec stream demultiplexing.
//!
//! The wire format is a sequence of frames: an 8-byte header (stream tag, three
//! reserved bytes, big-endian payload length) followed by the payload. Frames may
//! be split across chunks arbitrarily.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;

use crate::{
    error::{Error, Result},
    runtime::types::{ByteStream, FRAME_HEADER_LEN, RuntimeError, StreamTag},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    fn route(&mut self, tag: StreamTag, payload: &[u8]) {
        match tag {
            StreamTag::Stderr => self.stderr.extend_from_slice(payload),
            StreamTag::Stdout | StreamTag::Stdin => self.stdout.extend_from_slice(payload),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<(StreamTag, Bytes)>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let tag = StreamTag::from_byte(self.buf[0])
            .ok_or_else(|| Error::StreamError(format!("unknown stream tag {}", self.buf[0])))?;
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some((tag, self.buf.split_to(len).freeze())))
    }

    /// Fails if the stream ended partway through a frame.
    pub fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::StreamError(format!(
                "stream ended inside a frame, {} bytes left over",
                self.buf.len()
            )))
        }
    }
}

pub fn demux(wire: &[u8]) -> Result<ExecOutput> {
    let mut reader = FrameReader::new();
    let mut output = ExecOutput::default();
    reader.push(wire);
    while let Some((tag, payload)) = reader.next_frame()? {
        output.route(tag, &payload);
    }
    reader.finish()?;
    Ok(output)
}

/// Read an exec stream to the end. Going `stall` without a chunk is a timeout.
pub async fn read_exec(mut stream: ByteStream, stall: Duration) -> Result<ExecOutput> {
    let mut reader = FrameReader::new();
    let mut output = ExecOutput::default();
    loop {
        let chunk = match tokio::time::timeout(stall, stream.next()).await {
            Err(_) => return Err(Error::Timeout(stall)),
            Ok(None) => break,
            Ok(Some(Err(err))) => return Err(Error::StreamError(err.to_string())),
            Ok(Some(Ok(chunk))) => chunk,
        };
        reader.push(&chunk);
        while let Some((tag, payload)) = reader.next_frame()? {
            output.route(tag, &payload);
        }
    }
    reader.finish()?;
    Ok(output)
}

/// Collect a raw byte stream, refusing to buffer more than `limit` bytes.
pub async fn read_bytes(
    mut stream: ByteStream,
    stall: Duration,
    limit: u64,
    on_error: impl Fn(RuntimeError) -> Error,
) -> Result<Vec<u8>> {
    let mut collected = Vec::new();
    loop {
        match tokio::time::timeout(stall, stream.next()).await {
            Err(_) => return Err(Error::Timeout(stall)),
            Ok(None) => return Ok(collected),
            Ok(Some(Err(err))) => return Err(on_error(err)),
            Ok(Some(Ok(chunk))) => {
                collected.extend_from_slice(&chunk);
                if collected.len() as u64 > limit {
                    return Err(Error::PayloadTooLarge {
                        size: collected.len() as u64,
                        limit,
                    });
                }
            }
        }
    }
}
