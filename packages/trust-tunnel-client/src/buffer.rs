//! Blocking byte buffer backing the client's stdout/stderr assembly.
//!
//! A pair of buffers is swapped on drain so a reader never contends with the
//! decode loop for the bytes it is currently consuming. Reads block until
//! data arrives; after [`BlockingBuffer::close`] a reader observes EOF only
//! once both buffers are empty, which is what keeps terminal output ordered
//! through shutdown.

use std::io;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner {
    read_buf: Vec<u8>,
    // Read cursor into `read_buf`; bytes before it are already consumed.
    read_pos: usize,
    write_buf: Vec<u8>,
    closed: bool,
}

impl Inner {
    fn read_remaining(&self) -> usize {
        self.read_buf.len() - self.read_pos
    }

    fn drained(&self) -> bool {
        self.read_remaining() == 0 && self.write_buf.is_empty()
    }
}

pub struct BlockingBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
}

impl BlockingBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                read_buf: Vec::new(),
                read_pos: 0,
                write_buf: Vec::new(),
                closed: false,
            }),
            readable: Condvar::new(),
        }
    }

    /// Reads into `p`, blocking while the buffer is empty. Returns `Ok(0)`
    /// only after the buffer has been closed and fully drained.
    pub fn read(&self, p: &mut [u8]) -> io::Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer lock poisoned"))?;

        loop {
            if inner.read_remaining() > 0 {
                let n = p.len().min(inner.read_remaining());
                let start = inner.read_pos;
                p[..n].copy_from_slice(&inner.read_buf[start..start + n]);
                inner.read_pos += n;
                return Ok(n);
            }

            if !inner.write_buf.is_empty() {
                // Read side drained: the write buffer becomes the read buffer
                // and a fresh write buffer takes its place.
                inner.read_buf = std::mem::take(&mut inner.write_buf);
                inner.read_pos = 0;
                continue;
            }

            if inner.closed {
                return Ok(0);
            }

            inner = self
                .readable
                .wait(inner)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer lock poisoned"))?;
        }
    }

    /// Appends `p` and wakes any blocked reader. Fails once closed.
    pub fn write(&self, p: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer lock poisoned"))?;

        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "buffer closed"));
        }

        inner.write_buf.extend_from_slice(p);
        self.readable.notify_one();

        Ok(p.len())
    }

    /// Marks the buffer closed, waiting first for every written byte to be
    /// read. Blocking here is deliberate: callers close after the remote side
    /// is done, and readers must see all output before EOF.
    pub fn close(&self) {
        loop {
            {
                let mut inner = match self.inner.lock() {
                    Ok(inner) => inner,
                    Err(_) => return,
                };

                if inner.drained() {
                    inner.closed = true;
                    self.readable.notify_all();
                    return;
                }
            }

            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Default for BlockingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn read_returns_written_bytes() {
        let bb = BlockingBuffer::new();
        let expected = b"testdata";
        bb.write(expected).unwrap();

        let mut out = vec![0u8; expected.len()];
        let n = bb.read(&mut out).unwrap();

        assert_eq!(n, expected.len());
        assert_eq!(&out[..n], expected);
    }

    #[test]
    fn read_write_close_roundtrip() {
        let bb = BlockingBuffer::new();
        let expected = b"testdata";

        let n = bb.write(expected).unwrap();
        assert_eq!(n, expected.len());

        let mut out = vec![0u8; expected.len()];
        let n = bb.read(&mut out).unwrap();
        assert_eq!(n, expected.len());
        assert_eq!(&out[..n], expected);

        bb.close();

        let n = bb.read(&mut out).unwrap();
        assert_eq!(n, 0, "expected EOF after close");
    }

    #[test]
    fn close_waits_for_drain() {
        let bb = Arc::new(BlockingBuffer::new());
        bb.write(b"pending").unwrap();

        let closer = {
            let bb = bb.clone();
            std::thread::spawn(move || bb.close())
        };

        // The closer must not complete until this read drains the buffer.
        std::thread::sleep(Duration::from_millis(150));
        assert!(!closer.is_finished());

        let mut out = [0u8; 16];
        let n = bb.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"pending");

        closer.join().unwrap();

        let n = bb.read(&mut out).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let bb = Arc::new(BlockingBuffer::new());

        let reader = {
            let bb = bb.clone();
            std::thread::spawn(move || {
                let mut out = [0u8; 4];
                let n = bb.read(&mut out).unwrap();
                out[..n].to_vec()
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        bb.write(b"ping").unwrap();

        assert_eq!(reader.join().unwrap(), b"ping");
    }

    #[test]
    fn write_after_close_fails() {
        let bb = BlockingBuffer::new();
        bb.close();
        assert!(bb.write(b"late").is_err());
    }
}
