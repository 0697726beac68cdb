use bytes::{Buf as _, BufMut as _};
use futures::prelude::*;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::FrameError;
use crate::crypto::Cipher;

/// A [Sink] for `Vec<u8>` that encrypts each item into a frame and writes it to `Writer`.
#[pin_project::pin_project]
pub struct FrameWriter<Writer> {
    #[pin]
    writer: Writer,
    cipher: Arc<dyn Cipher>,
    /// Encoded frame bytes to be written to the underlying `writer`.
    buffer: bytes::Bytes,
}

impl<Writer: AsyncWrite> FrameWriter<Writer> {
    pub fn new(writer: Writer, cipher: Arc<dyn Cipher>) -> Self {
        FrameWriter {
            writer,
            cipher,
            buffer: bytes::Bytes::new(),
        }
    }

    /// Use `cipher` for all subsequent frames.
    pub fn set_cipher(&mut self, cipher: Arc<dyn Cipher>) {
        self.cipher = cipher;
    }

    /// Largest item that still fits into a frame with the current cipher.
    pub fn max_item_size(&self) -> usize {
        super::MAX_FRAME_SIZE.saturating_sub(self.cipher.overhead())
    }

    fn poll_flush_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let mut this = self.project();
        loop {
            if this.buffer.is_empty() {
                return Poll::Ready(Ok(()));
            }
            let written = futures::ready!(this.writer.as_mut().poll_write(cx, &*this.buffer))?;
            if written == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            this.buffer.advance(written);
        }
    }
}

impl<Writer> std::fmt::Debug for FrameWriter<Writer> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("cipher", &self.cipher)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl<Writer: AsyncWrite> Sink<Vec<u8>> for FrameWriter<Writer> {
    type Error = FrameError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        futures::ready!(self.poll_flush_buffer(cx))?;
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, data: Vec<u8>) -> Result<(), Self::Error> {
        debug_assert!(self.buffer.is_empty());
        let this = self.project();
        let sealed = this.cipher.encrypt(&data)?;
        if sealed.len() > super::MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(sealed.len()));
        }
        let mut buffer = bytes::BytesMut::with_capacity(super::LENGTH_PREFIX_SIZE + sealed.len());
        buffer.put_u32(sealed.len() as u32);
        buffer.put_slice(&sealed);
        *this.buffer = buffer.freeze();
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        futures::ready!(self.as_mut().poll_flush_buffer(cx))?;
        futures::ready!(self.project().writer.poll_flush(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        futures::ready!(self.as_mut().poll_flush_buffer(cx))?;
        futures::ready!(self.project().writer.poll_close(cx))?;
        Poll::Ready(Ok(()))
    }
}
