use futures::prelude::*;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::FrameError;
use crate::crypto::Cipher;
use crate::utils::ReadBuffer;

/// A [Stream] of `Vec<u8>` that reads frames from `Reader` and decrypts them.
///
/// The stream ends when the reader is exhausted at a frame boundary. If the reader ends within a
/// frame an [std::io::ErrorKind::UnexpectedEof] error is emitted.
#[pin_project::pin_project]
pub struct FrameReader<Reader> {
    #[pin]
    reader: Reader,
    cipher: Arc<dyn Cipher>,
    state: ReadState,
}

impl<Reader: AsyncRead> FrameReader<Reader> {
    pub fn new(reader: Reader, cipher: Arc<dyn Cipher>) -> Self {
        FrameReader {
            reader,
            cipher,
            state: ReadState::init(),
        }
    }

    /// Use `cipher` for all subsequent frames.
    pub fn set_cipher(&mut self, cipher: Arc<dyn Cipher>) {
        self.cipher = cipher;
    }
}

impl<Reader> std::fmt::Debug for FrameReader<Reader> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("cipher", &self.cipher)
            .finish()
    }
}

enum ReadState {
    Closed,
    ReadingLength { buffer: ReadBuffer },
    ReadingBody { buffer: ReadBuffer },
}

impl ReadState {
    fn init() -> Self {
        ReadState::ReadingLength {
            buffer: ReadBuffer::new(super::LENGTH_PREFIX_SIZE),
        }
    }
}

impl<Reader: AsyncRead> Stream for FrameReader<Reader> {
    type Item = Result<Vec<u8>, FrameError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        let result = futures::ready!(self.as_mut().poll_next_inner(cx));
        match result {
            Some(Err(_)) | None => *self.project().state = ReadState::Closed,
            _ => (),
        }
        Poll::Ready(result)
    }
}

impl<Reader: AsyncRead> FrameReader<Reader> {
    fn poll_next_inner(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<Result<Vec<u8>, FrameError>>> {
        loop {
            let mut this = self.as_mut().project();
            match &mut this.state {
                ReadState::Closed => return Poll::Ready(None),
                ReadState::ReadingLength { buffer } => {
                    let length = match futures::ready!(buffer.poll_read(this.reader.as_mut(), cx))
                    {
                        Ok(length) => length,
                        // The reader ended before the first byte of a length prefix.
                        Err(error)
                            if buffer.is_empty()
                                && error.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            return Poll::Ready(None)
                        }
                        Err(error) => return Poll::Ready(Some(Err(error.into()))),
                    };
                    let mut length_bytes = [0u8; super::LENGTH_PREFIX_SIZE];
                    length_bytes.copy_from_slice(&length);
                    let length = u32::from_be_bytes(length_bytes) as usize;
                    if length > super::MAX_FRAME_SIZE {
                        return Poll::Ready(Some(Err(FrameError::TooLarge(length))));
                    }
                    *this.state = ReadState::ReadingBody {
                        buffer: ReadBuffer::new(length),
                    };
                }
                ReadState::ReadingBody { buffer } => {
                    let sealed = if buffer.capacity() == 0 {
                        Vec::new()
                    } else {
                        futures::ready!(buffer.poll_read(this.reader.as_mut(), cx))?
                    };
                    let body = this.cipher.decrypt(&sealed)?;
                    *this.state = ReadState::init();
                    return Poll::Ready(Some(Ok(body)));
                }
            };
        }
    }
}
