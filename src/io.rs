//! I/O utilities.
use std::cell::RefCell;
use std::io;
use std::io::prelude::*;
use std::io::BufReader;
use std::rc::Rc;

/// Line-oriented reads that never consume bytes past the line terminator.
///
/// Request heads and chunk-size lines are read through this trait so the
/// bytes that follow them stay in the connection buffer for the body.
pub trait LineRead: Read {
    /// Read up to and including the next `\n`, at most `limit` bytes.
    /// Returns the number of bytes appended to `out`, 0 at end of stream.
    fn read_line_limited(&mut self, out: &mut Vec<u8>, limit: u64) -> io::Result<usize>;
}

impl<R: BufRead> LineRead for R {
    fn read_line_limited(&mut self, out: &mut Vec<u8>, limit: u64) -> io::Result<usize> {
        self.by_ref().take(limit).read_until(b'\n', out)
    }
}

/// A buffered connection stream shared between the request body reader and
/// the response writer of a single connection.
///
/// Clones refer to the same stream. Every operation borrows the stream only
/// for its own duration, so readers and writers can be interleaved freely on
/// one thread.
pub struct SharedStream<S> {
    inner: Rc<RefCell<BufReader<S>>>,
}

impl<S: Read> SharedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BufReader::new(stream))),
        }
    }
}

impl<S> SharedStream<S> {
    /// Number of bytes read from the socket but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.inner.borrow().buffer().len()
    }
}

impl<S> Clone for SharedStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: Read> Read for SharedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.borrow_mut().read(buf)
    }
}

impl<S: Read> LineRead for SharedStream<S> {
    fn read_line_limited(&mut self, out: &mut Vec<u8>, limit: u64) -> io::Result<usize> {
        self.inner
            .borrow_mut()
            .by_ref()
            .take(limit)
            .read_until(b'\n', out)
    }
}

impl<S: Write> Write for SharedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.borrow_mut().get_mut().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.borrow_mut().get_mut().flush()
    }
}

/// Combine a read-only stream and a write-only stream into one read-write stream.
pub struct ReadWriteAdapter<R: Read, W: Write> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> ReadWriteAdapter<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: Read, W: Write> Read for ReadWriteAdapter<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, std::io::Error> {
        self.reader.read(buf)
    }
}
impl<R: Read, W: Write> Write for ReadWriteAdapter<R, W> {
    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, std::io::Error> {
        self.writer.write(buf)
    }
    fn flush(&mut self) -> std::result::Result<(), std::io::Error> {
        self.writer.flush()
    }
}
