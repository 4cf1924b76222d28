//! Decoding of `Transfer-Encoding: chunked` request bodies.
use std::io;
use std::io::prelude::*;

use thiserror::Error;

use crate::io::LineRead;

const MAX_SIZE_LINE: u64 = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("invalid chunk header")]
    InvalidSize,
    #[error("negative chunk length not allowed")]
    NegativeSize,
    #[error("missing chunk terminating newline")]
    MissingTerminator,
    #[error("chunk truncated, {0} bytes missing")]
    Truncated(u64),
}

impl From<ChunkedError> for io::Error {
    fn from(err: ChunkedError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Reads a chunked body as a plain byte stream. A read returning 0 marks
/// the end of the body (the zero-length chunk and its terminator have been
/// consumed).
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    /// Payload bytes left in the current chunk.
    remaining: u64,
    /// The current chunk's payload is consumed but its line terminator is
    /// still unread.
    terminator_pending: bool,
    done: bool,
}

impl<R: LineRead> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            terminator_pending: false,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_chunk_len(&mut self) -> io::Result<u64> {
        let mut line = vec![];
        self.inner.read_line_limited(&mut line, MAX_SIZE_LINE)?;
        let line = String::from_utf8_lossy(&line);
        // Extensions after `;` carry nothing we use.
        let size = line.split(';').next().unwrap_or("").trim();
        if let Some(digits) = size.strip_prefix('-') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ChunkedError::NegativeSize.into());
            }
        }
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChunkedError::InvalidSize.into());
        }
        u64::from_str_radix(size, 16).map_err(|_| ChunkedError::InvalidSize.into())
    }

    fn read_terminator(&mut self) -> io::Result<()> {
        let mut line = vec![];
        self.inner.read_line_limited(&mut line, 2)?;
        match &line[..] {
            b"\r\n" | b"\n" | b"\r" => Ok(()),
            _ => Err(ChunkedError::MissingTerminator.into()),
        }
    }
}

impl<R: LineRead> Read for ChunkedReader<R> {
    /// Reads from at most one chunk per call, so bytes already placed in
    /// `buf` are never followed by a failing read of the next chunk header.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            if self.terminator_pending {
                self.read_terminator()?;
                self.terminator_pending = false;
            }
            self.remaining = self.read_chunk_len()?;
            if self.remaining == 0 {
                self.read_terminator()?;
                self.done = true;
                return Ok(0);
            }
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(ChunkedError::Truncated(self.remaining).into());
        }
        self.remaining -= n as u64;
        self.terminator_pending = self.remaining == 0;
        Ok(n)
    }
}
