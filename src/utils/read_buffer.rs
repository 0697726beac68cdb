use futures::prelude::*;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Buffer for a fixed number of bytes to be read.
///
/// The buffer is filled from an [AsyncRead] using [ReadBuffer::poll_read]. Once the expected
/// number of bytes are read the buffer data is returned.
#[derive(Debug)]
pub struct ReadBuffer {
    data: Vec<u8>,
    read_count: usize,
}

impl ReadBuffer {
    pub fn new(size: usize) -> Self {
        ReadBuffer {
            data: vec![0u8; size],
            read_count: 0,
        }
    }

    // Read bytes from `reader` into the buffer.
    pub fn poll_read(
        &mut self,
        mut reader: Pin<&mut impl AsyncRead>,
        cx: &mut Context,
    ) -> Poll<io::Result<Vec<u8>>> {
        loop {
            let buf = &mut self.data[self.read_count..];
            let read_count_current = futures::ready!(reader.as_mut().poll_read(cx, buf))?;
            if read_count_current == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }

            self.read_count += read_count_current;
            if self.read_count == self.data.len() {
                return Poll::Ready(Ok(self.finish()));
            }
        }
    }

    /// Returns `true` if no bytes have been read yet.
    pub fn is_empty(&self) -> bool {
        self.read_count == 0
    }

    /// Number of bytes the buffer expects in total.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    fn finish(&mut self) -> Vec<u8> {
        self.read_count = 0;
        std::mem::replace(&mut self.data, Vec::new())
    }
}
